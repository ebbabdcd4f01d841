//! Delta xDS controller core
//!
//! Protocol-agnostic types shared by the resource index and the discovery server:
//!
//! - A [`Resource`] is a named, opaque unit of configuration, optionally owned by a [`Scope`].
//! - A [`PushRequest`] describes a batch of changed resource names (or a response to a client
//!   request) and carries the version stamped onto every response it produces.
//! - A [`Proxy`] tracks one [`WatchedResource`] per type URL that its peer subscribes to.
//! - A [`Generator`] computes the resources to add and remove for a watched type, backed by any
//!   [`DiscoverResources`] implementation. [`Generators`] maps type URLs to generators.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod generator;
mod proxy;
mod push;
mod resource;
mod watch;

pub use self::{
    generator::{Deltas, DiscoverResources, Generator, Generators},
    proxy::Proxy,
    push::{nonce, PushRequest, PushVersion, ResourceDelta},
    resource::{InvalidScope, Resource, Scope},
    watch::{delta_watched_resources, WatchedResource, WILDCARD},
};

/// Identifies a class of resources, e.g. `type.googleapis.com/envoy.config.cluster.v3.Cluster`.
pub type TypeUrl = String;

pub type HashMap<K, V> = ahash::AHashMap<K, V>;
pub type HashSet<T> = ahash::AHashSet<T>;
