use crate::Connection;
use delta_xds_controller_core::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// The table of connected clients, keyed by connection ID.
#[derive(Clone, Debug, Default)]
pub struct Clients(Arc<RwLock<HashMap<String, Arc<Connection>>>>);

impl Clients {
    pub(crate) fn register(&self, con: Arc<Connection>) {
        self.0.write().insert(con.id().to_string(), con);
    }

    pub(crate) fn unregister(&self, id: &str) {
        if self.0.write().remove(id).is_none() {
            tracing::error!(connection = %id, "Removing unknown connection");
        }
    }

    /// Returns every registered connection, including those that are still initializing.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.0.read().values().cloned().collect()
    }

    /// Returns only the connections that have completed initialization.
    pub fn initialized(&self) -> Vec<Arc<Connection>> {
        self.0
            .read()
            .values()
            .filter(|con| con.is_initialized())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.0.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}
