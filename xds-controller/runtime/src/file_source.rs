//! Serves resources read from a JSON file.
//!
//! The file holds an array of entries:
//!
//! ```json
//! [
//!   { "typeUrl": "type.googleapis.com/envoy.config.listener.v3.Listener",
//!     "name": "http", "scope": "default/gateway", "value": { "port": 80 } }
//! ]
//! ```
//!
//! Each entry's `value` is served as its compact JSON encoding. `scope` is only accepted for
//! scoped types; scoped entries without one are visible to every client.

use anyhow::{Context, Result};
use bytes::Bytes;
use delta_xds_controller_core::{HashMap, HashSet, Scope, TypeUrl};
use delta_xds_controller_index::{Collection, IndexMetrics, IntoResource};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};


/// A resource loaded from the resource file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileResource {
    name: String,
    scope: Option<Scope>,
    value: Bytes,
}

/// Mirrors the contents of a resource file into one collection per configured type.
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
    collections: HashMap<TypeUrl, Collection<FileResource>>,
    scoped: HashSet<TypeUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Entry {
    type_url: String,
    name: String,
    #[serde(default)]
    scope: Option<String>,
    value: serde_json::Value,
}

impl IntoResource for FileResource {
    fn resource_name(&self) -> String {
        self.name.clone()
    }

    fn encode(&self) -> Bytes {
        self.value.clone()
    }
}

// === impl FileSource ===

impl FileSource {
    pub fn new(
        path: impl Into<PathBuf>,
        types: impl IntoIterator<Item = TypeUrl>,
        scoped_types: impl IntoIterator<Item = TypeUrl>,
        metrics: IndexMetrics,
    ) -> Self {
        let scoped = scoped_types.into_iter().collect::<HashSet<_>>();
        let collections = types
            .into_iter()
            .chain(scoped.iter().cloned())
            .map(|type_url| {
                let collection = if scoped.contains(&type_url) {
                    Collection::scoped(type_url.clone(), |r: &FileResource| r.scope.clone())
                } else {
                    Collection::new(type_url.clone())
                };
                (type_url, collection.with_metrics(metrics.clone()))
            })
            .collect();
        Self {
            path: path.into(),
            collections,
            scoped,
        }
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection<FileResource>> {
        self.collections.values()
    }

    /// Reads the file and replaces the contents of every collection.
    ///
    /// Types that don't appear in the file are emptied. Returns the number of resources loaded.
    pub async fn load(&self) -> Result<usize> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        self.load_bytes(&bytes)
    }

    /// Reloads the file every `interval` until the drain signal fires.
    ///
    /// A file that fails to load leaves the previously loaded resources in place.
    pub async fn run(self, interval: Duration, drain: drain::Watch) {
        let mut last = tokio::fs::read(&self.path).await.ok();
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Stopping");
                    return;
                }
                _ = ticks.tick() => {}
            }

            let bytes = match tokio::fs::read(&self.path).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "Failed to read resources");
                    continue;
                }
            };
            if last.as_ref() == Some(&bytes) {
                continue;
            }
            match self.load_bytes(&bytes) {
                Ok(n) => info!(resources = n, "Reloaded resources"),
                Err(error) => warn!(path = %self.path.display(), %error, "Failed to load resources"),
            }
            last = Some(bytes);
        }
    }

    fn load_bytes(&self, bytes: &[u8]) -> Result<usize> {
        let entries = serde_json::from_slice::<Vec<Entry>>(bytes)
            .with_context(|| format!("invalid resource file {}", self.path.display()))?;

        let mut by_type = self
            .collections
            .keys()
            .map(|type_url| (type_url.clone(), HashMap::<String, FileResource>::default()))
            .collect::<HashMap<_, _>>();
        for entry in entries {
            let Some(resources) = by_type.get_mut(&entry.type_url) else {
                debug!(type_url = %entry.type_url, name = %entry.name, "Skipping resource of unserved type");
                continue;
            };
            let resource = match self.resource(&entry) {
                Ok(resource) => resource,
                Err(error) => {
                    warn!(type_url = %entry.type_url, name = %entry.name, %error, "Skipping invalid resource");
                    continue;
                }
            };
            let key = match resource.scope.as_ref() {
                Some(scope) => scope.key(&resource.name),
                None => resource.name.clone(),
            };
            if resources.insert(key, resource).is_some() {
                warn!(type_url = %entry.type_url, name = %entry.name, "Duplicate resource replaces an earlier entry");
            }
        }

        let mut loaded = 0;
        for (type_url, resources) in by_type {
            loaded += resources.len();
            if let Some(collection) = self.collections.get(&type_url) {
                collection.reset(resources.into_iter().map(|(_, r)| r).collect());
            }
        }
        Ok(loaded)
    }

    fn resource(&self, entry: &Entry) -> Result<FileResource> {
        if entry.name.is_empty() {
            anyhow::bail!("resource name must not be empty");
        }
        let scope = match entry.scope.as_deref() {
            None => None,
            Some(_) if !self.scoped.contains(&entry.type_url) => {
                anyhow::bail!("scope set on an unscoped type")
            }
            Some(scope) => Some(scope.parse::<Scope>()?),
        };
        let value = serde_json::to_vec(&entry.value)?;
        Ok(FileResource {
            name: entry.name.clone(),
            scope,
            value: value.into(),
        })
    }
}
