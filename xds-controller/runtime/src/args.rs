use crate::{
    core::{Generator, Generators},
    grpc::{self, DebounceMetrics, DebounceOptions, DeltaDiscoveryServer, ServerMetrics},
    index::IndexMetrics,
    FileSource,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{collections::HashSet, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};


#[derive(Debug, Parser)]
#[clap(name = "delta-xds", about = "A delta xDS configuration server")]
pub struct Args {
    #[clap(
        long,
        default_value = "delta_xds=info,warn",
        env = "DELTA_XDS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:15010")]
    grpc_addr: SocketAddr,

    /// How long to wait for changes to settle before pushing them.
    #[clap(long, default_value = "100", env = "DELTA_XDS_DEBOUNCE_AFTER_MS")]
    debounce_after_ms: u64,

    /// The longest a change may wait while other changes keep arriving.
    #[clap(long, default_value = "10000", env = "DELTA_XDS_DEBOUNCE_MAX_MS")]
    debounce_max_ms: u64,

    /// The maximum number of clients with a push in flight.
    #[clap(long, default_value = "100", env = "DELTA_XDS_PUSH_THROTTLE")]
    push_throttle: usize,

    /// The number of new streams accepted per second. Zero disables the limit.
    #[clap(long, default_value = "100", env = "DELTA_XDS_REQUEST_LIMIT")]
    request_limit: f64,

    #[clap(long, default_value = "5000", env = "DELTA_XDS_SEND_TIMEOUT_MS")]
    send_timeout_ms: u64,

    /// Sends a full resync to clients after they reject a response.
    #[clap(
        long,
        default_value = "true",
        action = clap::ArgAction::Set,
        env = "DELTA_XDS_FORCE_RESPONSE_AFTER_NACK"
    )]
    force_response_after_nack: bool,

    /// A JSON file listing the resources to serve.
    #[clap(long, env = "DELTA_XDS_RESOURCES_PATH")]
    resources_path: PathBuf,

    #[clap(long, default_value = "1000")]
    resources_poll_interval_ms: u64,

    /// Type URLs served to every client, in push order.
    #[clap(long, value_delimiter = ',', required = true)]
    resource_types: Vec<String>,

    /// Type URLs whose resources may be owned by a single gateway (`<namespace>/<name>`).
    #[clap(long, value_delimiter = ',')]
    scoped_types: Vec<String>,

    /// Type URLs for which the server doesn't track the names each client has received.
    ///
    /// Removals of these types are only sent to clients that subscribed to them by name.
    #[clap(long, value_delimiter = ',')]
    memory_sensitive_types: Vec<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin,
            grpc_addr,
            debounce_after_ms,
            debounce_max_ms,
            push_throttle,
            request_limit,
            send_timeout_ms,
            force_response_after_nack,
            resources_path,
            resources_poll_interval_ms,
            resource_types,
            scoped_types,
            memory_sensitive_types,
        } = self;

        log_format.try_init(log_level)?;

        if debounce_max_ms < debounce_after_ms {
            bail!("--debounce-max-ms must not be less than --debounce-after-ms");
        }
        if !request_limit.is_finite() || request_limit < 0.0 {
            bail!("--request-limit must be a non-negative number");
        }
        for type_url in scoped_types.iter().chain(&memory_sensitive_types) {
            if !resource_types.contains(type_url) {
                bail!("{type_url} is not listed in --resource-types");
            }
        }

        let mut prom = <Registry>::default();
        let server_metrics = ServerMetrics::register(&mut prom);
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));

        let source = FileSource::new(
            resources_path,
            resource_types.clone(),
            scoped_types,
            index_metrics,
        );
        let n = source.load().await?;
        info!(resources = n, "Loaded resources");

        // Register generators in the order types were configured so that pushes follow it.
        let memory_sensitive = memory_sensitive_types.into_iter().collect::<HashSet<_>>();
        let mut generators = Generators::default();
        let mut seen = HashSet::new();
        for type_url in resource_types {
            if !seen.insert(type_url.clone()) {
                continue;
            }
            let Some(collection) = source
                .collections()
                .find(|c| c.type_url() == type_url)
                .cloned()
            else {
                continue;
            };
            let generator = Generator::new(type_url.clone(), Arc::new(collection));
            let generator = if memory_sensitive.contains(&type_url) {
                generator.without_name_tracking()
            } else {
                generator
            };
            generators.register(generator)?;
        }

        let (shutdown, drain) = kubert::shutdown::sigint_or_sigterm()?;

        let server = DeltaDiscoveryServer::new(
            generators,
            grpc::Config {
                send_timeout: Duration::from_millis(send_timeout_ms),
                force_response_after_nack,
                request_limit,
                concurrent_push_limit: push_throttle,
            },
            &server_metrics,
            drain.clone(),
        );
        grpc::register_clients(&mut prom, server.clients());

        // Every collection publishes its changes to the debouncer, which schedules pushes.
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        for collection in source.collections() {
            collection.register(changes_tx.clone());
        }
        drop(changes_tx);

        let debounce_metrics = DebounceMetrics {
            inbound_updates: server_metrics.inbound_updates(),
            committed_updates: server_metrics.committed_updates(),
        };
        tokio::spawn(
            grpc::debounce(
                changes_rx,
                drain.clone(),
                DebounceOptions {
                    debounce_after: Duration::from_millis(debounce_after_ms),
                    debounce_max: Duration::from_millis(debounce_max_ms),
                },
                {
                    let server = server.clone();
                    move |req| {
                        server.push(req);
                        future::ready(())
                    }
                },
                debounce_metrics,
            )
            .instrument(info_span!("debounce")),
        );

        tokio::spawn(
            server
                .clone()
                .send_pushes()
                .instrument(info_span!("pushes")),
        );

        tokio::spawn(
            source
                .run(
                    Duration::from_millis(resources_poll_interval_ms),
                    drain.clone(),
                )
                .instrument(info_span!("resources")),
        );

        let admin = admin.into_builder().with_prometheus(prom).bind()?;
        let readiness = admin.readiness();
        let _admin = admin.spawn();

        tokio::spawn(grpc(grpc_addr, server.clone(), drain));

        server.mark_ready();
        readiness.set(true);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if shutdown.signaled().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(addr: SocketAddr, server: DeltaDiscoveryServer, drain: drain::Watch) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(server.clone().svc())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "delta xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            server.shutdown();
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
