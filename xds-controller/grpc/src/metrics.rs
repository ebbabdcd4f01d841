use crate::Clients;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{
        counter::Counter,
        family::Family,
        gauge::ConstGauge,
        histogram::{exponential_buckets, Histogram},
        MetricType,
    },
    registry::{Registry, Unit},
};
use tokio::time;


/// Metrics for the discovery server, registered once per process.
#[derive(Clone, Debug)]
pub struct ServerMetrics {
    pub(crate) grpc: GrpcServerMetricsFamily,
    pub(crate) xds: XdsMetrics,
}

#[derive(Clone, Debug)]
pub(crate) struct GrpcServerMetricsFamily {
    started: Family<Labels, Counter>,
    handling: Family<Labels, Histogram>,
    handled: Family<CodeLabels, Counter>,
    msg_received: Family<Labels, Counter>,
    msg_sent: Family<Labels, Counter>,
}

#[derive(Clone, Debug)]
pub(crate) struct GrpcServerRPCMetrics {
    started: Counter,
    msg_received: Counter,
    msg_sent: Counter,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    labels: Labels,
}

/// Observes a single streaming RPC, recording its outcome when it ends or is dropped.
pub(crate) struct ResponseObserver {
    messages: MessageCounters,
    handled: Option<ResponseHandle>,
}

/// Counts the messages exchanged on a single stream.
#[derive(Clone, Debug, Default)]
pub(crate) struct MessageCounters {
    received: Counter,
    sent: Counter,
}

struct ResponseHandle {
    start: time::Instant,
    durations: Histogram,
    codes: Family<CodeLabels, Counter>,
    labels: Labels,
}

/// Delta discovery protocol metrics.
#[derive(Clone, Debug)]
pub(crate) struct XdsMetrics {
    pushes: Family<PushLabels, Counter>,
    push_errors: Family<TypeLabels, Counter>,
    push_size: Family<TypeLabels, Histogram>,
    rejects: Family<RejectLabels, Counter>,
    expired_nonces: Family<TypeLabels, Counter>,
    write_timeouts: Counter,
    inbound_updates: Counter,
    committed_updates: Counter,
}

#[derive(Debug)]
struct ClientsCollector(Clients);

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
    grpc_code: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    type_url: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PushLabels {
    type_url: String,
    kind: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RejectLabels {
    type_url: String,
    code: &'static str,
}

/// Registers a collector reporting the number of connected clients.
pub fn register_clients(reg: &mut Registry, clients: Clients) {
    reg.register_collector(Box::new(ClientsCollector(clients)));
}

// === impl ServerMetrics ===

impl ServerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let grpc = GrpcServerMetricsFamily::register(reg.sub_registry_with_prefix("grpc_server"));
        let xds = XdsMetrics::register(reg.sub_registry_with_prefix("xds"));
        Self { grpc, xds }
    }

    /// Counts the raw change batches received by the debouncer.
    pub fn inbound_updates(&self) -> Counter {
        self.xds.inbound_updates.clone()
    }

    /// Counts the change batches that have been pushed to clients.
    pub fn committed_updates(&self) -> Counter {
        self.xds.committed_updates.clone()
    }
}

// === impl GrpcServerMetricsFamily ===

impl GrpcServerMetricsFamily {
    fn register(reg: &mut Registry) -> Self {
        let started = Family::<Labels, Counter>::default();
        reg.register(
            "started",
            "Total number of RPCs started on the server",
            started.clone(),
        );

        let msg_received = Family::<Labels, Counter>::default();
        reg.register(
            "msg_received",
            "Total number of RPC stream messages received on the server",
            msg_received.clone(),
        );

        let msg_sent = Family::<Labels, Counter>::default();
        reg.register(
            "msg_sent",
            "Total number of gRPC stream messages sent by the server",
            msg_sent.clone(),
        );

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "handled",
            "Total number of RPCs completed on the server, regardless of success or failure",
            handled.clone(),
        );

        let handling = Family::<Labels, Histogram>::new_with_constructor(|| {
            // Discovery streams are long-lived: proxies hold them open until they restart or
            // are rebalanced.
            Histogram::new([0.1, 1.0, 300.0, 3600.0, 86400.0])
        });
        reg.register_with_unit(
            "handling",
            "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server",
            Unit::Seconds,
            handling.clone(),
        );

        Self {
            started,
            msg_received,
            msg_sent,
            handled,
            handling,
        }
    }

    pub(crate) fn bidi_stream_rpc(
        &self,
        grpc_service: &'static str,
        grpc_method: &'static str,
    ) -> GrpcServerRPCMetrics {
        let labels = Labels {
            grpc_service,
            grpc_method,
            grpc_type: "bidi_stream",
        };
        GrpcServerRPCMetrics {
            started: self.started.get_or_create(&labels).clone(),
            msg_received: self.msg_received.get_or_create(&labels).clone(),
            msg_sent: self.msg_sent.get_or_create(&labels).clone(),
            handled: self.handled.clone(),
            handling: self.handling.get_or_create(&labels).clone(),
            labels,
        }
    }
}

// === impl GrpcServerRPCMetrics ===

impl GrpcServerRPCMetrics {
    pub(crate) fn start(&self) -> ResponseObserver {
        self.started.inc();

        // Pre-register OK
        let _ = self.handled.get_or_create(&CodeLabels {
            grpc_service: self.labels.grpc_service,
            grpc_method: self.labels.grpc_method,
            grpc_type: self.labels.grpc_type,
            grpc_code: code_str(tonic::Code::Ok),
        });

        ResponseObserver {
            messages: MessageCounters {
                received: self.msg_received.clone(),
                sent: self.msg_sent.clone(),
            },
            handled: Some(ResponseHandle {
                start: time::Instant::now(),
                durations: self.handling.clone(),
                codes: self.handled.clone(),
                labels: self.labels.clone(),
            }),
        }
    }
}

// === impl ResponseObserver ===

impl ResponseObserver {
    pub(crate) fn messages(&self) -> MessageCounters {
        self.messages.clone()
    }

    pub(crate) fn end(mut self, code: tonic::Code) {
        if let Some(handled) = self.handled.take() {
            handled.inc_end(code);
        }
    }
}

impl Drop for ResponseObserver {
    fn drop(&mut self) {
        if let Some(inner) = self.handled.take() {
            inner.inc_end(tonic::Code::Ok);
        }
    }
}

// === impl MessageCounters ===

impl MessageCounters {
    pub(crate) fn received(&self) {
        self.received.inc();
    }

    pub(crate) fn sent(&self) {
        self.sent.inc();
    }
}

// === impl ResponseHandle ===

impl ResponseHandle {
    #[inline]
    fn inc_end(self, code: tonic::Code) {
        let Self {
            start,
            durations,
            codes,
            labels,
        } = self;
        durations.observe(start.elapsed().as_secs_f64());
        codes
            .get_or_create(&CodeLabels {
                grpc_service: labels.grpc_service,
                grpc_method: labels.grpc_method,
                grpc_type: labels.grpc_type,
                grpc_code: code_str(code),
            })
            .inc();
    }
}

// === impl XdsMetrics ===

impl XdsMetrics {
    fn register(reg: &mut Registry) -> Self {
        let pushes = Family::default();
        reg.register(
            "pushes",
            "Total number of responses sent to clients",
            pushes.clone(),
        );

        let push_errors = Family::default();
        reg.register(
            "push_errors",
            "Total number of responses that could not be sent",
            push_errors.clone(),
        );

        let push_size = Family::<TypeLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(256.0, 4.0, 9))
        });
        reg.register_with_unit(
            "push_size",
            "Histogram of the encoded size of resources in each response",
            Unit::Bytes,
            push_size.clone(),
        );

        let rejects = Family::default();
        reg.register(
            "rejects",
            "Total number of responses rejected by clients",
            rejects.clone(),
        );

        let expired_nonces = Family::default();
        reg.register(
            "expired_nonces",
            "Total number of requests acknowledging a nonce other than the last one sent",
            expired_nonces.clone(),
        );

        let write_timeouts = Counter::default();
        reg.register(
            "write_timeouts",
            "Total number of responses that timed out while being sent",
            write_timeouts.clone(),
        );

        let inbound_updates = Counter::default();
        reg.register(
            "inbound_updates",
            "Total number of change batches received",
            inbound_updates.clone(),
        );

        let committed_updates = Counter::default();
        reg.register(
            "committed_updates",
            "Total number of change batches pushed to clients",
            committed_updates.clone(),
        );

        Self {
            pushes,
            push_errors,
            push_size,
            rejects,
            expired_nonces,
            write_timeouts,
            inbound_updates,
            committed_updates,
        }
    }

    pub(crate) fn pushed(&self, type_url: &str, incremental: bool, size: usize) {
        self.pushes
            .get_or_create(&PushLabels {
                type_url: type_url.to_string(),
                kind: if incremental { "incremental" } else { "full" },
            })
            .inc();
        self.push_size
            .get_or_create(&type_labels(type_url))
            .observe(size as f64);
    }

    pub(crate) fn push_failed(&self, type_url: &str) {
        self.push_errors.get_or_create(&type_labels(type_url)).inc();
    }

    pub(crate) fn rejected(&self, type_url: &str, code: tonic::Code) {
        self.rejects
            .get_or_create(&RejectLabels {
                type_url: type_url.to_string(),
                code: code_str(code),
            })
            .inc();
    }

    pub(crate) fn expired_nonce(&self, type_url: &str) {
        self.expired_nonces
            .get_or_create(&type_labels(type_url))
            .inc();
    }

    pub(crate) fn write_timeout(&self) {
        self.write_timeouts.inc();
    }
}

fn type_labels(type_url: &str) -> TypeLabels {
    TypeLabels {
        type_url: type_url.to_string(),
    }
}

// === impl ClientsCollector ===

impl Collector for ClientsCollector {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let clients = self.0.snapshot();

        let connected = encoder.encode_descriptor(
            "xds_clients",
            "The number of connected discovery clients",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(clients.len() as i64).encode(connected)?;

        let mut watching = encoder.encode_descriptor(
            "xds_client_watches",
            "The number of connected clients watching each type",
            None,
            MetricType::Gauge,
        )?;
        let mut by_type = std::collections::BTreeMap::<String, i64>::new();
        for con in &clients {
            for type_url in con.proxy().watched_resource_types() {
                *by_type.entry(type_url).or_default() += 1;
            }
        }
        for (type_url, n) in &by_type {
            let labels = vec![("type_url", type_url.as_str())];
            ConstGauge::new(*n).encode(watching.encode_family(&labels)?)?;
        }

        Ok(())
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}
