//! Wire types for the aggregated discovery service.
//!
//! Field numbers match `envoy/service/discovery/v3/discovery.proto`, `envoy/config/core/v3/base.proto`,
//! and `google/rpc/status.proto`. Only the fields the server reads or writes are declared; unknown
//! fields are skipped when decoding.

use std::collections::HashMap;

#[allow(warnings)]
mod ads {
    include!(concat!(
        env!("OUT_DIR"),
        "/envoy.service.discovery.v3.AggregatedDiscoveryService.rs"
    ));
}

pub use self::ads::{
    aggregated_discovery_service_client::AggregatedDiscoveryServiceClient,
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
};

/// Identifies a data-plane proxy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,

    /// The cluster the proxy belongs to. Gateways report their `<namespace>/<name>` here.
    #[prost(string, tag = "2")]
    pub cluster: String,

    #[prost(message, optional, tag = "3")]
    pub metadata: Option<prost_types::Struct>,

    #[prost(string, tag = "6")]
    pub user_agent_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaDiscoveryRequest {
    #[prost(message, optional, tag = "1")]
    pub node: Option<Node>,

    #[prost(string, tag = "2")]
    pub type_url: String,

    #[prost(string, repeated, tag = "3")]
    pub resource_names_subscribe: Vec<String>,

    #[prost(string, repeated, tag = "4")]
    pub resource_names_unsubscribe: Vec<String>,

    #[prost(map = "string, string", tag = "5")]
    pub initial_resource_versions: HashMap<String, String>,

    #[prost(string, tag = "6")]
    pub response_nonce: String,

    #[prost(message, optional, tag = "7")]
    pub error_detail: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaDiscoveryResponse {
    #[prost(string, tag = "1")]
    pub system_version_info: String,

    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<Resource>,

    #[prost(string, tag = "4")]
    pub type_url: String,

    #[prost(string, tag = "5")]
    pub nonce: String,

    #[prost(string, repeated, tag = "6")]
    pub removed_resources: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resource {
    #[prost(string, tag = "1")]
    pub version: String,

    #[prost(message, optional, tag = "2")]
    pub resource: Option<prost_types::Any>,

    #[prost(string, tag = "3")]
    pub name: String,

    #[prost(string, repeated, tag = "4")]
    pub aliases: Vec<String>,
}

/// `google.rpc.Status`, as reported by clients that reject a response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,

    #[prost(string, tag = "2")]
    pub message: String,

    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryRequest {
    #[prost(string, tag = "1")]
    pub version_info: String,

    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,

    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,

    #[prost(string, tag = "4")]
    pub type_url: String,

    #[prost(string, tag = "5")]
    pub response_nonce: String,

    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,

    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<prost_types::Any>,

    #[prost(string, tag = "4")]
    pub type_url: String,

    #[prost(string, tag = "5")]
    pub nonce: String,
}

// === impl Resource ===

impl Resource {
    pub(crate) fn from_core(
        type_url: &str,
        version: &str,
        res: &delta_xds_controller_core::Resource,
    ) -> Self {
        Self {
            version: version.to_string(),
            resource: Some(prost_types::Any {
                type_url: type_url.to_string(),
                value: res.value.to_vec(),
            }),
            name: res.name.clone(),
            aliases: Vec::new(),
        }
    }
}
