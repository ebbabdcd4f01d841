use crate::Connection;
use delta_xds_controller_core::{HashMap, PushRequest};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{Notify, OwnedSemaphorePermit};

#[cfg(test)]
mod tests;

/// Schedules pushes to connections, with at most one push in flight per connection.
///
/// Pushes enqueued for a connection that already has a pending push are merged into it. Pushes
/// enqueued while the connection's push is being processed are held until that push is marked
/// done, and are then queued again.
#[derive(Debug, Default)]
pub(crate) struct PushQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Completes a dispatched push when dropped.
///
/// The connection's push is marked done before the dispatcher's permit is released, whether the
/// push was handled, the connection closed, or the event was never delivered.
#[derive(Debug)]
pub(crate) struct PushDone {
    queue: Arc<PushQueue>,
    id: String,
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Connections waiting to be dequeued, in order.
    order: VecDeque<String>,

    pending: HashMap<String, (Arc<Connection>, PushRequest)>,

    /// Connections with a push in flight, and any push merged in the meantime.
    processing: HashMap<String, (Arc<Connection>, Option<PushRequest>)>,

    shutdown: bool,
}

impl PushQueue {
    pub(crate) fn enqueue(&self, con: &Arc<Connection>, req: PushRequest) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }

        let id = con.id();
        if let Some((_, merged)) = inner.processing.get_mut(id) {
            *merged = Some(match merged.take() {
                Some(prior) => prior.merge(req),
                None => req,
            });
            return;
        }

        if let Some((con, prior)) = inner.pending.remove(id) {
            inner.pending.insert(id.to_string(), (con, prior.merge(req)));
            return;
        }

        inner
            .pending
            .insert(id.to_string(), (con.clone(), req));
        inner.order.push_back(id.to_string());
        drop(inner);
        self.notify.notify_one();
    }

    /// Waits for a connection with a pending push, or returns `None` once the queue is shut down.
    pub(crate) async fn dequeue(&self) -> Option<(Arc<Connection>, PushRequest)> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.shutdown {
                    return None;
                }
                while let Some(id) = inner.order.pop_front() {
                    if let Some((con, req)) = inner.pending.remove(&id) {
                        inner.processing.insert(id, (con.clone(), None));
                        return Some((con, req));
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Completes the in-flight push for `id`, queueing any push merged while it was in flight.
    pub(crate) fn mark_done(&self, id: &str) {
        let mut inner = self.inner.lock();
        let Some((con, merged)) = inner.processing.remove(id) else {
            return;
        };
        let Some(req) = merged else {
            return;
        };
        if inner.shutdown {
            return;
        }
        inner.pending.insert(id.to_string(), (con, req));
        inner.order.push_back(id.to_string());
        drop(inner);
        self.notify.notify_one();
    }

    /// Discards all state for a closed connection.
    pub(crate) fn remove(&self, id: &str) {
        let mut inner = self.inner.lock();
        if inner.pending.remove(id).is_some() {
            inner.order.retain(|queued| queued != id);
        }
        inner.processing.remove(id);
    }

    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        inner.order.clear();
        inner.pending.clear();
        inner.processing.clear();
        drop(inner);
        self.notify.notify_one();
    }

    /// The number of connections waiting to be dequeued.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.lock().order.len()
    }
}

// === impl PushDone ===

impl PushDone {
    pub(crate) fn new(
        queue: Arc<PushQueue>,
        id: impl Into<String>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            queue,
            id: id.into(),
            _permit: permit,
        }
    }
}

impl Drop for PushDone {
    fn drop(&mut self) {
        self.queue.mark_done(&self.id);
    }
}
