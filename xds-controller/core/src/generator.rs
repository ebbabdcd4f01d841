//! Computes the resources to send to a proxy for a single watched type.

use crate::{HashMap, HashSet, PushRequest, Resource, Scope, TypeUrl, WatchedResource};
use std::{fmt, sync::Arc};


/// Provides point-in-time views of a collection of resources.
///
/// Implementations must apply scope filtering: scoped resources are only returned for the scope
/// that owns them.
pub trait DiscoverResources: Send + Sync + 'static {
    /// Returns every resource visible to `scope`.
    fn list(&self, scope: Option<&Scope>) -> Vec<Resource>;

    /// Looks up a single resource by name, if it is visible to `scope`.
    fn get(&self, scope: Option<&Scope>, name: &str) -> Option<Resource>;
}

/// Generates deltas for one type from a resource collection.
#[derive(Clone)]
pub struct Generator {
    type_url: TypeUrl,
    resources: Arc<dyn DiscoverResources>,
    track_names: bool,
}

/// The resources to add (or replace) and remove for one response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deltas {
    pub resources: Vec<Resource>,
    pub removed: Vec<String>,

    /// Set when only changed resources are included, rather than the full set.
    pub incremental: bool,
}

/// Maps type URLs to generators, preserving registration order as the push order.
#[derive(Clone, Default)]
pub struct Generators {
    by_type: HashMap<TypeUrl, Generator>,
    push_order: Vec<TypeUrl>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("a generator is already registered for {0}")]
    Duplicate(TypeUrl),
}

// === impl Generator ===

impl Generator {
    pub fn new(type_url: impl Into<TypeUrl>, resources: Arc<dyn DiscoverResources>) -> Self {
        Self {
            type_url: type_url.into(),
            resources,
            track_names: true,
        }
    }

    /// Configures the generator to not track resource names for wildcard subscriptions.
    ///
    /// This is intended for types with very large numbers of resources, where tracking every name
    /// for every proxy is prohibitively expensive. Removals are then only reported for resources
    /// that changed.
    pub fn without_name_tracking(mut self) -> Self {
        self.track_names = false;
        self
    }

    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    pub fn tracks_names(&self) -> bool {
        self.track_names
    }

    /// Computes the deltas to send for `watched`, or `None` if there is nothing to send.
    ///
    /// Responses to client requests that didn't change the subscription resync the full contents
    /// of the type. Responses to subscription changes include only the names that changed.
    /// Scheduled pushes include only the names updated by the push, or everything when the push
    /// doesn't name any changes.
    ///
    /// Subscriptions that are not wildcard subscriptions only ever see the names they track. When
    /// names are tracked, scheduled pushes only remove names the client holds or subscribed to.
    pub fn generate(
        &self,
        req: &PushRequest,
        watched: &WatchedResource,
        scope: Option<&Scope>,
    ) -> Option<Deltas> {
        let deltas = if req.is_full() {
            self.full(watched, scope)
        } else if req.is_request() {
            let subscribed = req.delta.subscribed.iter();
            let mut deltas = self.incremental(subscribed, scope);
            deltas.removed.extend(req.delta.unsubscribed.iter().cloned());
            deltas.removed.sort_unstable();
            deltas.removed.dedup();
            deltas
        } else {
            let updated = req.updated_names(&self.type_url)?;
            let watching = updated
                .iter()
                .filter(|name| watched.wildcard || watched.is_tracked(name));
            let mut deltas = self.incremental(watching, scope);
            // Clients can't be holding names that were never sent to them.
            if watched.resource_names.is_some() {
                deltas.removed.retain(|name| watched.is_tracked(name));
            }
            deltas
        };

        if deltas.resources.is_empty() && deltas.removed.is_empty() {
            return None;
        }
        Some(deltas)
    }

    fn full(&self, watched: &WatchedResource, scope: Option<&Scope>) -> Deltas {
        let mut resources = self
            .resources
            .list(scope)
            .into_iter()
            .filter(|r| r.is_visible_to(scope))
            .filter(|r| watched.wildcard || watched.is_tracked(&r.name))
            .collect::<Vec<_>>();
        resources.sort_by(|a, b| a.name.cmp(&b.name));

        let current = resources
            .iter()
            .map(|r| r.name.as_str())
            .collect::<HashSet<_>>();
        let mut removed = watched
            .tracked_names()
            .filter(|name| !current.contains(name.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        removed.sort_unstable();

        Deltas {
            resources,
            removed,
            incremental: false,
        }
    }

    fn incremental<'a>(
        &self,
        names: impl Iterator<Item = &'a String>,
        scope: Option<&Scope>,
    ) -> Deltas {
        let mut resources = Vec::new();
        let mut removed = Vec::new();
        for name in names {
            match self
                .resources
                .get(scope, name)
                .filter(|r| r.is_visible_to(scope))
            {
                Some(resource) => resources.push(resource),
                None => removed.push(name.clone()),
            }
        }
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        removed.sort_unstable();

        Deltas {
            resources,
            removed,
            incremental: true,
        }
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("type_url", &self.type_url)
            .field("track_names", &self.track_names)
            .finish_non_exhaustive()
    }
}

// === impl Generators ===

impl Generators {
    pub fn register(&mut self, generator: Generator) -> Result<(), RegisterError> {
        let type_url = generator.type_url.clone();
        if self.by_type.contains_key(&type_url) {
            return Err(RegisterError::Duplicate(type_url));
        }
        self.by_type.insert(type_url.clone(), generator);
        self.push_order.push(type_url);
        Ok(())
    }

    pub fn get(&self, type_url: &str) -> Option<&Generator> {
        self.by_type.get(type_url)
    }

    /// The order in which watched types are pushed to a proxy.
    pub fn push_order(&self) -> &[TypeUrl] {
        &self.push_order
    }

    pub fn len(&self) -> usize {
        self.push_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.push_order.is_empty()
    }
}

impl fmt::Debug for Generators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.push_order.iter()).finish()
    }
}
