//! A delta aggregated discovery service.
//!
//! [`DeltaDiscoveryServer`] serves `DeltaAggregatedResources` streams. Each stream becomes a
//! [`Connection`] once its first request identifies the client's node. Changes published by
//! resource collections are coalesced by [`debounce`], scheduled with
//! [`DeltaDiscoveryServer::push`], and delivered by [`DeltaDiscoveryServer::send_pushes`] with at
//! most one push in flight per connection.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod api;
mod auth;
mod clients;
mod connection;
mod debounce;
mod limit;
mod metrics;
mod queue;
mod server;

pub use self::{
    auth::{AuthError, Authenticator, Unauthenticated},
    clients::Clients,
    connection::Connection,
    debounce::{debounce, DebounceMetrics, DebounceOptions},
    limit::{RateLimitError, RequestLimiter},
    metrics::{register_clients, ServerMetrics},
    server::{Config, DeltaDiscoveryServer},
};
