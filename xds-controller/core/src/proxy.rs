use crate::{HashMap, HashSet, Scope, TypeUrl, WatchedResource};
use parking_lot::RwLock;

/// A connected data-plane proxy and the resources it watches.
///
/// The watched resources are only modified by the proxy's connection, but they may be read
/// concurrently for introspection.
#[derive(Debug)]
pub struct Proxy {
    /// The node ID the proxy reported.
    pub id: String,

    /// The scope whose resources this proxy receives, if any.
    pub scope: Option<Scope>,

    watched: RwLock<HashMap<TypeUrl, WatchedResource>>,
}

impl Proxy {
    pub fn new(id: impl Into<String>, scope: Option<Scope>) -> Self {
        Self {
            id: id.into(),
            scope,
            watched: RwLock::new(HashMap::default()),
        }
    }

    /// Updates the watched resource for `type_url`.
    ///
    /// The update function receives the current state, if any; returning `None` removes it.
    pub fn update_watched_resource<T>(
        &self,
        type_url: &str,
        update: impl FnOnce(Option<WatchedResource>) -> (Option<WatchedResource>, T),
    ) -> T {
        let mut watched = self.watched.write();
        let current = watched.remove(type_url);
        let (updated, ret) = update(current);
        if let Some(updated) = updated {
            watched.insert(type_url.to_string(), updated);
        }
        ret
    }

    /// Modifies the watched resource for `type_url`, if it exists.
    pub fn modify_watched_resource<T>(
        &self,
        type_url: &str,
        modify: impl FnOnce(&mut WatchedResource) -> T,
    ) -> Option<T> {
        self.watched.write().get_mut(type_url).map(modify)
    }

    pub fn add_watched_resource(&self, watched: WatchedResource) {
        self.watched
            .write()
            .insert(watched.type_url.clone(), watched);
    }

    pub fn delete_watched_resource(&self, type_url: &str) {
        self.watched.write().remove(type_url);
    }

    pub fn watched_resource(&self, type_url: &str) -> Option<WatchedResource> {
        self.watched.read().get(type_url).cloned()
    }

    pub fn watched_resource_types(&self) -> HashSet<TypeUrl> {
        self.watched.read().keys().cloned().collect()
    }

    pub fn clone_watched_resources(&self) -> HashMap<TypeUrl, WatchedResource> {
        self.watched.read().clone()
    }

    /// Returns the watched resources ordered by `push_order`, followed by any types that are not
    /// part of the push order.
    pub fn watched_resources_by_order(&self, push_order: &[TypeUrl]) -> Vec<WatchedResource> {
        let mut watched = self.clone_watched_resources();
        let mut ordered = Vec::with_capacity(watched.len());
        for type_url in push_order {
            if let Some(w) = watched.remove(type_url) {
                ordered.push(w);
            }
        }
        let mut rest = watched.into_iter().map(|(_, w)| w).collect::<Vec<_>>();
        rest.sort_by(|a, b| a.type_url.cmp(&b.type_url));
        ordered.extend(rest);
        ordered
    }
}
