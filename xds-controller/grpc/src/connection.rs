use crate::{
    api::{self, DeltaDiscoveryRequest, DeltaDiscoveryResponse},
    metrics::MessageCounters,
    queue::PushDone,
    server::Shared,
};
use delta_xds_controller_core::{
    nonce, Proxy, PushRequest, Resource, ResourceDelta, Scope, WatchedResource,
};
use futures::prelude::*;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant},
};
use tonic::Status;
use tracing::{debug, error, info, info_span, warn, Instrument};


/// Sent by some clients to probe the server before their first discovery request.
const HEALTH_PROBE_TYPE_URL: &str = "type.googleapis.com/istio.v1.HealthInformation";

static CONNECTIONS: AtomicU64 = AtomicU64::new(0);

/// A client stream, created once the client's first discovery request identifies its node.
#[derive(Debug)]
pub struct Connection {
    id: String,
    proxy: Arc<Proxy>,
    peer: Option<SocketAddr>,
    identities: Option<Vec<String>>,
    connected_at: Instant,
    initialized: AtomicBool,
    pub(crate) push_tx: mpsc::Sender<PushEvent>,
}

/// A push dispatched to a connection. The push is complete once `done` is dropped.
#[derive(Debug)]
pub(crate) struct PushEvent {
    pub(crate) request: PushRequest,
    pub(crate) done: PushDone,
}

/// Serializes a connection's requests and pushes.
struct Session {
    shared: Arc<Shared>,
    con: Arc<Connection>,
    rsp_tx: mpsc::Sender<DeltaDiscoveryResponse>,
    messages: MessageCounters,
}

/// How a request changed the state of the type it names.
#[derive(Debug)]
enum Decision {
    /// The first request for the type on this stream. Clients that reconnect report the resources
    /// they already hold.
    Init { reconnect: bool },

    /// The request acknowledges a response other than the most recent one.
    Expired { sent: String },

    Update {
        delta: ResourceDelta,
        changed: bool,
        ack: bool,
        forced: bool,
    },
}

enum Exit {
    RequestsClosed,
    Shutdown,
}

// === impl Connection ===

impl Connection {
    pub(crate) fn new(
        proxy: Arc<Proxy>,
        peer: Option<SocketAddr>,
        identities: Option<Vec<String>>,
    ) -> (Arc<Self>, mpsc::Receiver<PushEvent>) {
        let n = CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
        let (push_tx, push_rx) = mpsc::channel(1);
        let con = Arc::new(Self {
            id: format!("{}-{n}", proxy.id),
            proxy,
            peer,
            identities,
            connected_at: Instant::now(),
            initialized: AtomicBool::new(false),
            push_tx,
        });
        (con, push_rx)
    }

    /// The connection ID, of the form `<node id>-<counter>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The identities the client authenticated with, if any.
    pub fn identities(&self) -> Option<&[String]> {
        self.identities.as_deref()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

/// Runs a delta discovery stream until the client closes it, it fails, or the server shuts down.
///
/// Requests are read on a separate task. The first request that isn't a health probe must identify
/// the client's node; the connection is then registered and starts receiving pushes.
pub(crate) async fn serve<S>(
    shared: Arc<Shared>,
    requests: S,
    rsp_tx: mpsc::Sender<DeltaDiscoveryResponse>,
    peer: Option<SocketAddr>,
    identities: Option<Vec<String>>,
    messages: MessageCounters,
) -> Result<(), Status>
where
    S: Stream<Item = Result<DeltaDiscoveryRequest, Status>> + Send + 'static,
{
    let (req_tx, req_rx) = mpsc::channel(1);
    let (init_tx, init_rx) = oneshot::channel();
    let recv = tokio::spawn(receive(
        shared.clone(),
        requests,
        req_tx,
        init_tx,
        peer,
        identities,
        messages.clone(),
    ));

    let Ok((con, push_rx)) = init_rx.await else {
        // The stream ended before the client identified itself.
        return join(recv).await;
    };

    let span = info_span!("connection", id = %con.id());
    let session = Session {
        shared: shared.clone(),
        con: con.clone(),
        rsp_tx,
        messages,
    };
    let res = session.run(req_rx, push_rx).instrument(span).await;

    shared.clients.unregister(con.id());
    shared.queue.remove(con.id());
    info!(connection = %con.id(), "Connection closed");

    match res {
        Ok(Exit::RequestsClosed) => join(recv).await,
        Ok(Exit::Shutdown) => {
            recv.abort();
            Ok(())
        }
        Err(status) => {
            recv.abort();
            Err(status)
        }
    }
}

async fn receive<S>(
    shared: Arc<Shared>,
    requests: S,
    req_tx: mpsc::Sender<DeltaDiscoveryRequest>,
    init_tx: oneshot::Sender<(Arc<Connection>, mpsc::Receiver<PushEvent>)>,
    peer: Option<SocketAddr>,
    mut identities: Option<Vec<String>>,
    messages: MessageCounters,
) -> Result<(), Status>
where
    S: Stream<Item = Result<DeltaDiscoveryRequest, Status>> + Send + 'static,
{
    tokio::pin! {
        let requests = requests;
        let shutdown = shared.drain.clone().signaled();
    }

    let mut init_tx = Some(init_tx);
    loop {
        let req = tokio::select! {
            _ = &mut shutdown => {
                debug!(?peer, "Server shutting down");
                return Ok(());
            }

            req = requests.next() => match req {
                Some(Ok(req)) => req,
                Some(Err(status)) => {
                    info!(?peer, %status, "Stream failed");
                    return Err(status);
                }
                None => {
                    debug!(?peer, "Stream closed by client");
                    return Ok(());
                }
            },
        };
        messages.received();

        if let Some(tx) = init_tx.take() {
            if req.type_url == HEALTH_PROBE_TYPE_URL {
                warn!(?peer, "Health probe sent before the first discovery request");
                init_tx = Some(tx);
                continue;
            }

            let Some(node) = req.node.as_ref().filter(|node| !node.id.is_empty()) else {
                return Err(Status::invalid_argument("missing node information"));
            };
            let proxy = Proxy::new(node.id.clone(), parse_scope(&node.cluster));
            let (con, push_rx) = Connection::new(Arc::new(proxy), peer, identities.take());

            // Pushes enqueued between registration and initialization are held by the queue.
            shared.clients.register(con.clone());
            con.mark_initialized();
            info!(connection = %con.id(), ?peer, "New connection");
            if let Err((con, _)) = tx.send((con, push_rx)) {
                shared.clients.unregister(con.id());
                return Ok(());
            }
        }

        if req_tx.send(req).await.is_err() {
            return Ok(());
        }
    }
}

fn parse_scope(cluster: &str) -> Option<Scope> {
    if cluster.is_empty() {
        return None;
    }
    match cluster.parse() {
        Ok(scope) => Some(scope),
        Err(error) => {
            debug!(%error, "Client is not scoped");
            None
        }
    }
}

async fn join(task: JoinHandle<Result<(), Status>>) -> Result<(), Status> {
    match task.await {
        Ok(res) => res,
        Err(error) if error.is_cancelled() => Ok(()),
        Err(error) => {
            error!(%error, "Request stream task failed");
            Err(Status::internal("request stream failed"))
        }
    }
}

/// Indicates whether a push may produce a response for the proxy.
fn needs_push(proxy: &Proxy, req: &PushRequest) -> bool {
    if req.is_request() || req.configs_updated.is_empty() {
        return true;
    }
    let watched = proxy.watched_resource_types();
    req.configs_updated
        .keys()
        .any(|type_url| watched.contains(type_url))
}

// === impl Session ===

impl Session {
    async fn run(
        &self,
        mut requests: mpsc::Receiver<DeltaDiscoveryRequest>,
        mut pushes: mpsc::Receiver<PushEvent>,
    ) -> Result<Exit, Status> {
        tokio::pin! {
            let shutdown = self.shared.drain.clone().signaled();
        }

        loop {
            // Requests are handled before pushes.
            match requests.try_recv() {
                Ok(req) => {
                    self.process_request(req).await?;
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(Exit::RequestsClosed),
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            tokio::select! {
                biased;

                _ = &mut shutdown => return Ok(Exit::Shutdown),

                req = requests.recv() => match req {
                    Some(req) => self.process_request(req).await?,
                    None => return Ok(Exit::RequestsClosed),
                },

                Some(PushEvent { request, done }) = pushes.recv() => {
                    let res = self.push_connection(&request).await;
                    drop(done);
                    res?;
                }
            }
        }
    }

    async fn process_request(&self, req: DeltaDiscoveryRequest) -> Result<(), Status> {
        debug!(
            type_url = %req.type_url,
            subscribe = req.resource_names_subscribe.len(),
            unsubscribe = req.resource_names_unsubscribe.len(),
            nonce = %req.response_nonce,
            "Request",
        );

        let Some(delta) = self.should_respond(&req) else {
            return Ok(());
        };
        let Some(watched) = self.con.proxy().watched_resource(&req.type_url) else {
            return Ok(());
        };
        let push = PushRequest::from_request(self.shared.versions.next(), delta);
        self.push_xds(&watched, &push).await
    }

    /// Applies a request to the watched state of its type, returning the subscription changes to
    /// respond with, if a response is needed. An empty delta calls for a full resync.
    fn should_respond(&self, req: &DeltaDiscoveryRequest) -> Option<ResourceDelta> {
        let type_url = req.type_url.as_str();
        let proxy = self.con.proxy();

        if let Some(error) = req.error_detail.as_ref() {
            let code = tonic::Code::from_i32(error.code);
            warn!(
                %type_url,
                ?code,
                message = %error.message,
                nonce = %req.response_nonce,
                "Client rejected response",
            );
            self.shared.metrics.rejected(type_url, code);
            let force = self.shared.config.force_response_after_nack;
            proxy.modify_watched_resource(type_url, |watched| {
                watched.last_error = error.message.clone();
                watched.always_respond |= force;
            });
            return None;
        }

        let track_names = self
            .shared
            .generators
            .get(type_url)
            .map_or(true, |generator| generator.tracks_names());
        let initial = req.initial_resource_versions.keys();
        let decision = proxy.update_watched_resource(type_url, |current| {
            let Some(mut watched) = current else {
                let watched = WatchedResource::new(
                    type_url,
                    &req.resource_names_subscribe,
                    &req.resource_names_unsubscribe,
                    initial,
                    track_names,
                );
                let reconnect = !req.initial_resource_versions.is_empty();
                return (Some(watched), Decision::Init { reconnect });
            };

            if !req.response_nonce.is_empty() && req.response_nonce != watched.nonce_sent {
                let sent = watched.nonce_sent.clone();
                return (Some(watched), Decision::Expired { sent });
            }

            let (delta, changed) = watched.apply_subscriptions(
                &req.resource_names_subscribe,
                &req.resource_names_unsubscribe,
                initial,
            );
            let ack = !req.response_nonce.is_empty();
            if ack {
                watched.last_error.clear();
                watched.nonce_acked = req.response_nonce.clone();
            }
            let forced = std::mem::take(&mut watched.always_respond);
            let decision = Decision::Update {
                delta,
                changed,
                ack,
                forced,
            };
            (Some(watched), decision)
        });

        match decision {
            Decision::Init { reconnect: false } => {
                debug!(%type_url, "Initial request");
                Some(ResourceDelta::default())
            }

            Decision::Init { reconnect: true } => {
                debug!(
                    %type_url,
                    resources = req.initial_resource_versions.len(),
                    "Reconnected",
                );
                Some(ResourceDelta::default())
            }

            Decision::Expired { sent } => {
                debug!(%type_url, nonce = %req.response_nonce, %sent, "Expired nonce");
                self.shared.metrics.expired_nonce(type_url);
                None
            }

            Decision::Update {
                delta,
                changed,
                ack,
                forced,
            } => {
                // Spontaneous requests change subscriptions; acks don't.
                if ack == changed {
                    error!(%type_url, ack, changed, "Subscription change does not match request");
                    #[cfg(feature = "strict-assertions")]
                    panic!("{type_url}: subscription changed={changed} for ack={ack}");
                }

                if changed {
                    debug!(%type_url, "Subscription changed");
                    Some(delta)
                } else if forced {
                    info!(%type_url, "Forcing response");
                    Some(ResourceDelta::default())
                } else {
                    debug!(%type_url, nonce = %req.response_nonce, "Ack");
                    None
                }
            }
        }
    }

    /// Pushes every watched type, in the server's push order.
    async fn push_connection(&self, req: &PushRequest) -> Result<(), Status> {
        let proxy = self.con.proxy();
        if !needs_push(proxy, req) {
            debug!(changes = req.num_updated(), "No watched type changed");
            return Ok(());
        }

        for watched in proxy.watched_resources_by_order(self.shared.generators.push_order()) {
            self.push_xds(&watched, req).await?;
        }
        Ok(())
    }

    async fn push_xds(&self, watched: &WatchedResource, req: &PushRequest) -> Result<(), Status> {
        let type_url = watched.type_url.as_str();
        let Some(generator) = self.shared.generators.get(type_url) else {
            debug!(%type_url, "No generator registered");
            return Ok(());
        };
        let proxy = self.con.proxy();
        let Some(deltas) = generator.generate(req, watched, proxy.scope.as_ref()) else {
            return Ok(());
        };

        let size = deltas.resources.iter().map(Resource::size).sum::<usize>();
        let nonce = nonce(&req.version);
        let rsp = DeltaDiscoveryResponse {
            system_version_info: req.version.clone(),
            resources: deltas
                .resources
                .iter()
                .map(|res| api::Resource::from_core(type_url, &req.version, res))
                .collect(),
            type_url: type_url.to_string(),
            nonce: nonce.clone(),
            removed_resources: deltas.removed.clone(),
        };

        let metrics = &self.shared.metrics;
        match time::timeout(self.shared.config.send_timeout, self.rsp_tx.send(rsp)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(%type_url, "Response stream closed");
                metrics.push_failed(type_url);
                return Err(Status::cancelled("response stream closed"));
            }
            Err(_) => {
                info!(%type_url, timeout = ?self.shared.config.send_timeout, "Timed out sending response");
                metrics.write_timeout();
                metrics.push_failed(type_url);
                return Err(Status::deadline_exceeded("timed out sending response"));
            }
        }
        self.messages.sent();

        proxy.modify_watched_resource(type_url, |watched| {
            watched.record_sent(
                nonce.as_str(),
                deltas.resources.iter().map(|res| &res.name),
                &deltas.removed,
            )
        });
        metrics.pushed(type_url, deltas.incremental, size);
        info!(
            %type_url,
            reason = req.reason(),
            incremental = deltas.incremental,
            resources = deltas.resources.len(),
            removed = deltas.removed.len(),
            size,
            version = %req.version,
            latency = ?req.start.elapsed(),
            "Pushed",
        );
        Ok(())
    }
}
