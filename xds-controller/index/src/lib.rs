//! Delta xDS resource index
//!
//! A [`Collection`] holds typed objects projected to wire [`Resource`]s. Readers (the discovery
//! server's generators) see point-in-time, scope-filtered views of the collection. Writers apply,
//! delete, or reset objects; every mutation that changes the projected resources publishes a
//! single [`PushRequest`] naming the resources that changed.
//!
//! Scoped collections assign each object to a [`Scope`] (e.g. the gateway that owns it). A scoped
//! resource is only visible to sessions whose proxy targets that scope, while unscoped resources
//! are visible to every session.
//!
//! [`Resource`]: delta_xds_controller_core::Resource
//! [`PushRequest`]: delta_xds_controller_core::PushRequest
//! [`Scope`]: delta_xds_controller_core::Scope

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod collection;
mod metrics;

pub use self::{
    collection::{Collection, IntoResource},
    metrics::IndexMetrics,
};
