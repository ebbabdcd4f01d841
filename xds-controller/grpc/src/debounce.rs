use delta_xds_controller_core::PushRequest;
use futures::future;
use prometheus_client::metrics::counter::Counter;
use std::future::Future;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tracing::{debug, info};


#[derive(Copy, Clone, Debug)]
pub struct DebounceOptions {
    /// How long to wait after the most recent change before pushing. Each change extends the wait.
    pub debounce_after: Duration,

    /// The longest a change may be delayed while changes keep arriving.
    pub debounce_max: Duration,
}

/// Counts the change batches entering and leaving the debouncer.
#[derive(Clone, Debug, Default)]
pub struct DebounceMetrics {
    pub inbound_updates: Counter,
    pub committed_updates: Counter,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            debounce_after: Duration::from_millis(100),
            debounce_max: Duration::from_secs(10),
        }
    }
}

/// Coalesces change batches from `rx`, passing merged batches to `push`.
///
/// A push happens once no change has arrived for `debounce_after`, or once `debounce_max` has
/// elapsed since the first change of the batch. Only one push runs at a time; changes that arrive
/// while a push is running are merged into the next batch.
///
/// Returns when `rx` closes or the drain signal fires. Changes that have not been pushed by then
/// are discarded.
pub async fn debounce<F, P>(
    mut rx: mpsc::UnboundedReceiver<PushRequest>,
    drain: drain::Watch,
    opts: DebounceOptions,
    push: F,
    metrics: DebounceMetrics,
) where
    F: Fn(PushRequest) -> P,
    P: Future<Output = ()> + Send + 'static,
{
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    let (free_tx, mut free_rx) = mpsc::channel::<()>(1);
    let mut free = true;
    let mut timer: Option<Instant> = None;

    let mut req: Option<PushRequest> = None;
    let mut debounced = 0u64;
    let mut pushes = 0u64;
    let mut start_debounce = Instant::now();
    let mut last_update = Instant::now();

    loop {
        let deadline = timer;
        let fire = async move {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => future::pending().await,
            }
        };

        let run_worker = tokio::select! {
            _ = &mut shutdown => {
                debug!("Shutting down");
                return;
            }

            _ = free_rx.recv() => {
                free = true;
                true
            }

            update = rx.recv() => {
                let Some(update) = update else {
                    debug!("Change channel closed");
                    return;
                };
                metrics.inbound_updates.inc();
                last_update = Instant::now();
                if debounced == 0 {
                    timer = Some(last_update + opts.debounce_after);
                    start_debounce = last_update;
                }
                debounced += 1;
                req = Some(match req.take() {
                    Some(req) => req.merge(update),
                    None => update,
                });
                false
            }

            () = fire => {
                timer = None;
                free
            }
        };

        if !run_worker {
            continue;
        }

        let event_delay = start_debounce.elapsed();
        let quiet_time = last_update.elapsed();
        if event_delay >= opts.debounce_max || quiet_time >= opts.debounce_after {
            if let Some(req) = req.take() {
                pushes += 1;
                info!(
                    pushes,
                    events = debounced,
                    changes = req.num_updated(),
                    ?quiet_time,
                    ?event_delay,
                    "Push debounce stable",
                );
                free = false;
                let committed = metrics.committed_updates.clone();
                let events = std::mem::take(&mut debounced);
                let free_tx = free_tx.clone();
                let pushed = push(req);
                tokio::spawn(async move {
                    pushed.await;
                    committed.inc_by(events);
                    let _ = free_tx.send(()).await;
                });
            }
        } else {
            let quiet_at = Instant::now() + (opts.debounce_after - quiet_time);
            timer = Some(quiet_at.min(start_debounce + opts.debounce_max));
        }
    }
}
