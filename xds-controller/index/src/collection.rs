use crate::IndexMetrics;
use bytes::Bytes;
use delta_xds_controller_core::{DiscoverResources, HashMap, PushRequest, Resource, Scope, TypeUrl};
use parking_lot::RwLock;
use std::{collections::BTreeSet, fmt, sync::Arc};
use tokio::sync::mpsc;

#[cfg(test)]
mod tests;

/// Projects a typed object to the name and payload of a wire resource.
pub trait IntoResource: Send + Sync + 'static {
    fn resource_name(&self) -> String;

    fn encode(&self) -> Bytes;
}

/// A shared index of typed objects, keyed by resource key.
///
/// Clones share the same underlying index.
pub struct Collection<T> {
    type_url: TypeUrl,
    extract: Option<Arc<ExtractScope<T>>>,
    inner: Arc<RwLock<Inner>>,
    metrics: Option<IndexMetrics>,
}

type ExtractScope<T> = dyn Fn(&T) -> Option<Scope> + Send + Sync;

struct Inner {
    resources: HashMap<String, Resource>,
    push_tx: Option<mpsc::UnboundedSender<PushRequest>>,
}

// === impl Collection ===

impl<T: IntoResource> Collection<T> {
    /// Creates an empty, unscoped collection of resources of `type_url`.
    pub fn new(type_url: impl Into<TypeUrl>) -> Self {
        Self {
            type_url: type_url.into(),
            extract: None,
            inner: Arc::new(RwLock::new(Inner {
                resources: HashMap::default(),
                push_tx: None,
            })),
            metrics: None,
        }
    }

    /// Creates an empty collection whose objects are each owned by the scope `extract` returns.
    ///
    /// Objects for which `extract` returns `None` are visible to every session.
    pub fn scoped(
        type_url: impl Into<TypeUrl>,
        extract: impl Fn(&T) -> Option<Scope> + Send + Sync + 'static,
    ) -> Self {
        let mut collection = Self::new(type_url);
        collection.extract = Some(Arc::new(extract));
        collection
    }

    pub fn with_metrics(mut self, metrics: IndexMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Publishes a push request on `push_tx` whenever the collection changes.
    ///
    /// Changes made before registration are not published.
    pub fn register(&self, push_tx: mpsc::UnboundedSender<PushRequest>) {
        self.inner.write().push_tx = Some(push_tx);
    }

    /// Adds or replaces an object.
    ///
    /// Nothing is published when the projected resource is unchanged.
    pub fn apply(&self, obj: T) {
        let resource = self.project(&obj);
        let name = resource.name.clone();
        let (push_tx, size) = {
            let mut inner = self.inner.write();
            let key = resource.key();
            if inner.resources.get(&key) == Some(&resource) {
                tracing::trace!(type_url = %self.type_url, %key, "Unchanged");
                return;
            }
            inner.resources.insert(key, resource);
            (inner.push_tx.clone(), inner.resources.len())
        };
        if let Some(m) = self.metrics.as_ref() {
            m.applied(&self.type_url, size);
        }
        self.publish(push_tx, Some(name));
    }

    /// Removes the object stored under `key`.
    ///
    /// Returns false if no such object exists.
    pub fn delete(&self, key: &str) -> bool {
        let (removed, push_tx, size) = {
            let mut inner = self.inner.write();
            let removed = inner.resources.remove(key);
            (removed, inner.push_tx.clone(), inner.resources.len())
        };
        let Some(removed) = removed else {
            return false;
        };
        if let Some(m) = self.metrics.as_ref() {
            m.deleted(&self.type_url, size);
        }
        self.publish(push_tx, Some(removed.name));
        true
    }

    /// Replaces the entire contents of the collection.
    ///
    /// Every resource that was added, changed, or removed is published in a single push.
    pub fn reset(&self, objs: Vec<T>) {
        let mut resources = HashMap::with_capacity(objs.len());
        for obj in &objs {
            let resource = self.project(obj);
            resources.insert(resource.key(), resource);
        }

        let (changed, push_tx, size) = {
            let mut inner = self.inner.write();
            let mut changed = BTreeSet::new();
            for (key, resource) in &resources {
                if inner.resources.get(key) != Some(resource) {
                    changed.insert(resource.name.clone());
                }
            }
            for (key, resource) in &inner.resources {
                if !resources.contains_key(key) {
                    changed.insert(resource.name.clone());
                }
            }
            inner.resources = resources;
            (changed, inner.push_tx.clone(), inner.resources.len())
        };
        if let Some(m) = self.metrics.as_ref() {
            m.reset(&self.type_url, size);
        }
        tracing::debug!(type_url = %self.type_url, size, changed = changed.len(), "Reset");
        self.publish(push_tx, changed);
    }

    /// Returns every resource visible to `scope`.
    pub fn list(&self, scope: Option<&Scope>) -> Vec<Resource> {
        self.inner
            .read()
            .resources
            .values()
            .filter(|r| r.is_visible_to(scope))
            .cloned()
            .collect()
    }

    /// Looks up a resource by name as seen from `scope`.
    ///
    /// A resource owned by `scope` takes precedence over an unscoped resource with the same name.
    pub fn get(&self, scope: Option<&Scope>, name: &str) -> Option<Resource> {
        let inner = self.inner.read();
        scope
            .and_then(|s| inner.resources.get(&s.key(name)))
            .or_else(|| inner.resources.get(name).filter(|r| r.scope.is_none()))
            .filter(|r| r.is_visible_to(scope))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().resources.is_empty()
    }

    fn project(&self, obj: &T) -> Resource {
        let resource = Resource::new(obj.resource_name(), obj.encode());
        match self.extract.as_ref().and_then(|extract| extract(obj)) {
            Some(scope) => resource.with_scope(scope),
            None => resource,
        }
    }

    fn publish(
        &self,
        push_tx: Option<mpsc::UnboundedSender<PushRequest>>,
        names: impl IntoIterator<Item = String>,
    ) {
        let Some(push_tx) = push_tx else {
            return;
        };
        let names = names.into_iter().collect::<Vec<_>>();
        if names.is_empty() {
            return;
        }
        tracing::trace!(type_url = %self.type_url, ?names, "Publishing changes");
        if push_tx
            .send(PushRequest::updated(self.type_url.clone(), names))
            .is_err()
        {
            tracing::debug!(type_url = %self.type_url, "Push channel closed");
        }
    }
}

impl<T: IntoResource> DiscoverResources for Collection<T> {
    fn list(&self, scope: Option<&Scope>) -> Vec<Resource> {
        Collection::list(self, scope)
    }

    fn get(&self, scope: Option<&Scope>, name: &str) -> Option<Resource> {
        Collection::get(self, scope, name)
    }
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            type_url: self.type_url.clone(),
            extract: self.extract.clone(),
            inner: self.inner.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("type_url", &self.type_url)
            .field("scoped", &self.extract.is_some())
            .finish_non_exhaustive()
    }
}
