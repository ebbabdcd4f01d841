use tonic_build::manual::{Builder, Method, Service};

fn main() {
    let ads = Service::builder()
        .name("AggregatedDiscoveryService")
        .package("envoy.service.discovery.v3")
        .method(stream_method(
            "stream_aggregated_resources",
            "StreamAggregatedResources",
            "crate::api::DiscoveryRequest",
            "crate::api::DiscoveryResponse",
        ))
        .method(stream_method(
            "delta_aggregated_resources",
            "DeltaAggregatedResources",
            "crate::api::DeltaDiscoveryRequest",
            "crate::api::DeltaDiscoveryResponse",
        ))
        .build();

    Builder::new().build_transport(false).compile(&[ads]);
}

fn stream_method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build()
}
