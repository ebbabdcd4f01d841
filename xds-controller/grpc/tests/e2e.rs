use bytes::Bytes;
use delta_xds_controller_core::{Generator, Generators};
use delta_xds_controller_grpc::{
    api::{
        AggregatedDiscoveryServiceClient, DeltaDiscoveryRequest, DeltaDiscoveryResponse,
        DiscoveryRequest, Node,
    },
    debounce, AuthError, Config, DebounceMetrics, DebounceOptions, DeltaDiscoveryServer,
    ServerMetrics,
};
use delta_xds_controller_index::{Collection, IntoResource};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{self, Duration},
};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{
    metadata::MetadataMap,
    transport::{Channel, Endpoint, Server},
    Code, Streaming,
};

const TYPE: &str = "type.googleapis.com/test.Listener";

#[derive(Clone, Debug)]
struct Listener {
    name: String,
    port: u16,
}

impl IntoResource for Listener {
    fn resource_name(&self) -> String {
        self.name.clone()
    }

    fn encode(&self) -> Bytes {
        Bytes::from(self.port.to_be_bytes().to_vec())
    }
}

struct Running {
    server: DeltaDiscoveryServer,
    listeners: Collection<Listener>,
    addr: SocketAddr,
    _drain: drain::Signal,
}

struct Stream {
    tx: mpsc::Sender<DeltaDiscoveryRequest>,
    rsps: Streaming<DeltaDiscoveryResponse>,
}

fn listener(name: &str, port: u16) -> Listener {
    Listener {
        name: name.to_string(),
        port,
    }
}

async fn run(server: impl FnOnce(DeltaDiscoveryServer) -> DeltaDiscoveryServer) -> Running {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listeners = Collection::new(TYPE);
    listeners.apply(listener("http", 80));
    listeners.apply(listener("https", 443));
    let mut generators = Generators::default();
    generators
        .register(Generator::new(TYPE, Arc::new(listeners.clone())))
        .unwrap();

    let (drain, watch) = drain::channel();
    let metrics = ServerMetrics::register(&mut Registry::default());
    let server = server(DeltaDiscoveryServer::new(
        generators,
        Config::default(),
        &metrics,
        watch.clone(),
    ));

    let (push_tx, push_rx) = mpsc::unbounded_channel();
    listeners.register(push_tx);
    tokio::spawn(debounce(
        push_rx,
        watch,
        DebounceOptions {
            debounce_after: Duration::from_millis(10),
            debounce_max: Duration::from_millis(100),
        },
        {
            let server = server.clone();
            move |req| {
                server.push(req);
                futures::future::ready(())
            }
        },
        DebounceMetrics::default(),
    ));
    tokio::spawn(server.clone().send_pushes());

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(server.clone().svc())
            .serve_with_incoming(TcpListenerStream::new(tcp)),
    );

    Running {
        server,
        listeners,
        addr,
        _drain: drain,
    }
}

async fn client(addr: SocketAddr) -> AggregatedDiscoveryServiceClient<Channel> {
    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    AggregatedDiscoveryServiceClient::new(channel)
}

fn subscribe(names: &[&str], nonce: &str) -> DeltaDiscoveryRequest {
    DeltaDiscoveryRequest {
        type_url: TYPE.to_string(),
        resource_names_subscribe: names.iter().map(|n| n.to_string()).collect(),
        response_nonce: nonce.to_string(),
        ..Default::default()
    }
}

fn first(names: &[&str]) -> DeltaDiscoveryRequest {
    DeltaDiscoveryRequest {
        node: Some(Node {
            id: "gateway-1".to_string(),
            cluster: "default/gateway".to_string(),
            ..Default::default()
        }),
        ..subscribe(names, "")
    }
}

async fn open(
    client: &mut AggregatedDiscoveryServiceClient<Channel>,
    req: DeltaDiscoveryRequest,
) -> Result<Stream, tonic::Status> {
    let (tx, rx) = mpsc::channel(4);
    tx.send(req).await.unwrap();
    let rsps = client
        .delta_aggregated_resources(ReceiverStream::new(rx))
        .await?
        .into_inner();
    Ok(Stream { tx, rsps })
}

impl Stream {
    async fn recv(&mut self) -> DeltaDiscoveryResponse {
        time::timeout(Duration::from_secs(5), self.rsps.message())
            .await
            .expect("response must arrive")
            .expect("stream must not fail")
            .expect("stream must not end")
    }
}

fn names(rsp: &DeltaDiscoveryResponse) -> Vec<&str> {
    let mut names = rsp
        .resources
        .iter()
        .map(|r| r.name.as_str())
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread")]
async fn pushes_changes_to_subscribed_clients() {
    let running = run(|server| server).await;
    running.server.mark_ready();
    let mut client = client(running.addr).await;

    let mut stream = open(&mut client, first(&["*"])).await.unwrap();
    let rsp = stream.recv().await;
    assert_eq!(rsp.type_url, TYPE);
    assert_eq!(names(&rsp), vec!["http", "https"]);
    assert!(rsp.removed_resources.is_empty());
    stream.tx.send(subscribe(&[], &rsp.nonce)).await.unwrap();

    running.listeners.apply(listener("admin", 9901));
    let rsp = stream.recv().await;
    assert_eq!(names(&rsp), vec!["admin"]);
    assert_eq!(
        rsp.resources[0].resource.as_ref().unwrap().value,
        9901u16.to_be_bytes().to_vec()
    );
    stream.tx.send(subscribe(&[], &rsp.nonce)).await.unwrap();

    running.listeners.delete("http");
    let rsp = stream.recv().await;
    assert!(rsp.resources.is_empty());
    assert_eq!(rsp.removed_resources, vec!["http".to_string()]);

    let clients = running.server.clients();
    assert_eq!(clients.len(), 1);
    let con = &clients.snapshot()[0];
    assert_eq!(con.proxy().id, "gateway-1");
    assert!(con.is_initialized());

    drop(stream);
    time::timeout(Duration::from_secs(5), async {
        while !clients.is_empty() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection must unregister once the client goes away");
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_fail_until_ready() {
    let running = run(|server| server).await;
    let mut client = client(running.addr).await;

    let status = match open(&mut client, first(&["*"])).await {
        Ok(mut stream) => stream
            .rsps
            .message()
            .await
            .expect_err("stream must fail"),
        Err(status) => status,
    };
    assert_eq!(status.code(), Code::Unavailable);

    running.server.mark_ready();
    let mut stream = open(&mut client, first(&["http"])).await.unwrap();
    assert_eq!(names(&stream.recv().await), vec!["http"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn authenticates_clients() {
    let running = run(|server| {
        server.with_authenticator(
            |_: Option<SocketAddr>,
             metadata: &MetadataMap|
             -> Result<Option<Vec<String>>, AuthError> {
                let id = metadata
                    .get("x-client-identity")
                    .ok_or(AuthError::MissingCredentials)?
                    .to_str()
                    .map_err(|e| AuthError::Invalid(e.to_string()))?;
                Ok(Some(vec![id.to_string()]))
            },
        )
    })
    .await;
    running.server.mark_ready();
    let mut client = client(running.addr).await;

    let status = match open(&mut client, first(&["*"])).await {
        Ok(mut stream) => stream
            .rsps
            .message()
            .await
            .expect_err("stream must fail"),
        Err(status) => status,
    };
    assert_eq!(status.code(), Code::Unauthenticated);

    let (tx, rx) = mpsc::channel(4);
    tx.send(first(&["*"])).await.unwrap();
    let mut req = tonic::Request::new(ReceiverStream::new(rx));
    req.metadata_mut().insert(
        "x-client-identity",
        "spiffe://cluster.local/ns/default/sa/gateway".parse().unwrap(),
    );
    let rsps = client
        .delta_aggregated_resources(req)
        .await
        .unwrap()
        .into_inner();
    let mut stream = Stream { tx, rsps };
    assert_eq!(names(&stream.recv().await), vec!["http", "https"]);

    let con = running.server.clients().snapshot().pop().unwrap();
    assert_eq!(
        con.identities(),
        Some(&["spiffe://cluster.local/ns/default/sa/gateway".to_string()][..])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn state_of_the_world_is_unimplemented() {
    let running = run(|server| server).await;
    running.server.mark_ready();
    let mut client = client(running.addr).await;

    let (tx, rx) = mpsc::channel(1);
    tx.send(DiscoveryRequest {
        type_url: TYPE.to_string(),
        ..Default::default()
    })
    .await
    .unwrap();
    let status = match client
        .stream_aggregated_resources(ReceiverStream::new(rx))
        .await
    {
        Ok(rsp) => rsp
            .into_inner()
            .message()
            .await
            .expect_err("stream must fail"),
        Err(status) => status,
    };
    assert_eq!(status.code(), Code::Unimplemented);
}
