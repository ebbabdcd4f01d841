use crate::{
    api::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer, DeltaDiscoveryRequest,
        DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    auth::{Authenticator, Unauthenticated},
    connection::{self, PushEvent},
    limit::RequestLimiter,
    metrics::{GrpcServerRPCMetrics, ServerMetrics, XdsMetrics},
    queue::{PushDone, PushQueue},
    Clients,
};
use delta_xds_controller_core::{Generators, PushRequest, PushVersion};
use futures::prelude::*;
use std::{
    fmt,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Duration,
};
use tonic::{metadata::MetadataMap, Status};
use tracing::{debug, info, info_span, warn, Instrument};

const SERVICE: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";

#[derive(Clone, Debug)]
pub struct Config {
    /// How long a response may wait to be written before its stream is closed.
    pub send_timeout: Duration,

    /// When set, a client that rejects a response receives a full resync of that type on its next
    /// request, even if the request looks like an ACK.
    pub force_response_after_nack: bool,

    /// The number of new streams accepted per second. Zero disables the limit.
    pub request_limit: f64,

    /// The maximum number of connections with a push in flight.
    pub concurrent_push_limit: usize,
}

/// State shared by the server and every connection.
pub(crate) struct Shared {
    pub(crate) generators: Generators,
    pub(crate) clients: Clients,
    pub(crate) queue: Arc<PushQueue>,
    pub(crate) versions: PushVersion,
    pub(crate) config: Config,
    pub(crate) metrics: XdsMetrics,
    pub(crate) drain: drain::Watch,
}

/// Serves the delta variant of the aggregated discovery service.
#[derive(Clone)]
pub struct DeltaDiscoveryServer {
    shared: Arc<Shared>,
    authenticator: Arc<dyn Authenticator>,
    limiter: Arc<RequestLimiter>,
    ready: Arc<AtomicBool>,
    rpc_metrics: GrpcServerRPCMetrics,
}

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

impl Default for Config {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            force_response_after_nack: true,
            request_limit: 100.0,
            concurrent_push_limit: 100,
        }
    }
}

// === impl DeltaDiscoveryServer ===

impl DeltaDiscoveryServer {
    pub fn new(
        generators: Generators,
        config: Config,
        metrics: &ServerMetrics,
        drain: drain::Watch,
    ) -> Self {
        let limiter = RequestLimiter::new(config.request_limit);
        let shared = Shared {
            generators,
            clients: Clients::default(),
            queue: Arc::new(PushQueue::default()),
            versions: PushVersion::default(),
            config,
            metrics: metrics.xds.clone(),
            drain,
        };
        Self {
            shared: Arc::new(shared),
            authenticator: Arc::new(Unauthenticated),
            limiter: Arc::new(limiter),
            ready: Arc::new(AtomicBool::new(false)),
            rpc_metrics: metrics
                .grpc
                .bidi_stream_rpc(SERVICE, "DeltaAggregatedResources"),
        }
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    /// Starts accepting streams. Until then, new streams fail as unavailable.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn clients(&self) -> Clients {
        self.shared.clients.clone()
    }

    /// Schedules a push of `req` to every connected client.
    ///
    /// The push is stamped with a new version. Pushes to a client that has a push in flight are
    /// merged and sent once that push completes.
    pub fn push(&self, mut req: PushRequest) {
        req.version = self.shared.versions.next();
        let clients = self.shared.clients.snapshot();
        debug!(
            version = %req.version,
            changes = req.num_updated(),
            clients = clients.len(),
            "Scheduling push",
        );
        for con in &clients {
            self.shared.queue.enqueue(con, req.clone());
        }
    }

    /// Delivers scheduled pushes to connections until the server shuts down.
    ///
    /// At most `concurrent_push_limit` connections have a push in flight at once.
    pub async fn send_pushes(self) {
        let permits = Arc::new(Semaphore::new(
            self.shared.config.concurrent_push_limit.max(1),
        ));
        tokio::pin! {
            let shutdown = self.shared.drain.clone().signaled();
        }

        loop {
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                next = self.shared.queue.dequeue() => next,
            };
            let Some((con, request)) = next else {
                break;
            };

            let done = PushDone::new(self.shared.queue.clone(), con.id(), Some(permit));
            tokio::spawn(
                async move {
                    let event = PushEvent { request, done };
                    if con.push_tx.send(event).await.is_err() {
                        debug!(connection = %con.id(), "Connection closed before push was delivered");
                    }
                }
                .in_current_span(),
            );
        }

        self.shared.queue.shutdown();
        debug!("Push dispatcher stopped");
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Stops scheduling pushes.
    pub fn shutdown(&self) {
        self.shared.queue.shutdown();
    }

    /// Checks that a new stream may be served, returning the client's identities.
    async fn admit(
        &self,
        peer: Option<SocketAddr>,
        metadata: &MetadataMap,
    ) -> Result<Option<Vec<String>>, Status> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(Status::unavailable("server is not ready"));
        }

        let identities = self.authenticator.authenticate(peer, metadata).map_err(|error| {
            info!(?peer, %error, "Failed to authenticate client");
            Status::unauthenticated(error.to_string())
        })?;

        if let Err(error) = self.limiter.wait().await {
            warn!(?peer, %error, "Rejecting stream");
            return Err(Status::resource_exhausted("request rate limit exceeded"));
        }

        Ok(identities)
    }
}

impl fmt::Debug for DeltaDiscoveryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaDiscoveryServer")
            .field("generators", &self.shared.generators)
            .field("config", &self.shared.config)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl AggregatedDiscoveryService for DeltaDiscoveryServer {
    type StreamAggregatedResourcesStream = BoxStream<DiscoveryResponse>;

    async fn stream_aggregated_resources(
        &self,
        _req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxStream<DiscoveryResponse>>, Status> {
        Err(Status::unimplemented(
            "only the delta discovery protocol is supported",
        ))
    }

    type DeltaAggregatedResourcesStream = BoxStream<DeltaDiscoveryResponse>;

    async fn delta_aggregated_resources(
        &self,
        req: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxStream<DeltaDiscoveryResponse>>, Status> {
        let observer = self.rpc_metrics.start();
        let peer = req.remote_addr();
        let identities = match self.admit(peer, req.metadata()).await {
            Ok(identities) => identities,
            Err(status) => {
                observer.end(status.code());
                return Err(status);
            }
        };

        let (rsp_tx, mut rsp_rx) = mpsc::channel(1);
        let session = tokio::spawn(
            connection::serve(
                self.shared.clone(),
                req.into_inner(),
                rsp_tx,
                peer,
                identities,
                observer.messages(),
            )
            .instrument(info_span!("xds", ?peer)),
        );

        Ok(tonic::Response::new(Box::pin(async_stream::try_stream! {
            while let Some(rsp) = rsp_rx.recv().await {
                yield rsp;
            }

            let res = match session.await {
                Ok(res) => res,
                Err(error) => Err(Status::internal(format!("session failed: {error}"))),
            };
            match res {
                Ok(()) => observer.end(tonic::Code::Ok),
                Err(status) => {
                    observer.end(status.code());
                    Err::<(), Status>(status)?;
                }
            }
        })))
    }
}
