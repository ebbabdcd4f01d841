use bytes::Bytes;
use std::{fmt, str::FromStr, sync::Arc};

/// Identifies the entity that owns a resource (e.g. a gateway).
///
/// Scoped resources are only visible to sessions whose proxy targets the same scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub namespace: Arc<str>,
    pub name: Arc<str>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid scope {0:?}: expected <namespace>/<name>")]
pub struct InvalidScope(String);

/// A named, versionless unit of configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub name: String,

    /// The encoded resource body. Its schema is determined by the resource's type.
    pub value: Bytes,

    pub scope: Option<Scope>,
}

// === impl Scope ===

impl Scope {
    pub fn new(namespace: impl Into<Arc<str>>, name: impl Into<Arc<str>>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the key under which a resource named `name` is stored for this scope.
    pub fn key(&self, name: &str) -> String {
        format!("{self}/{name}")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for Scope {
    type Err = InvalidScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidScope(s.to_string())),
        }
    }
}

// === impl Resource ===

impl Resource {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// The index key for this resource: its name, prefixed by its scope when it has one.
    pub fn key(&self) -> String {
        match &self.scope {
            Some(scope) => scope.key(&self.name),
            None => self.name.clone(),
        }
    }

    /// Indicates whether a session targeting `scope` may see this resource.
    ///
    /// Unscoped resources are visible to every session.
    pub fn is_visible_to(&self, scope: Option<&Scope>) -> bool {
        match &self.scope {
            None => true,
            Some(owner) => scope == Some(owner),
        }
    }

    /// The size of the encoded resource, in bytes.
    pub fn size(&self) -> usize {
        self.value.len()
    }
}
