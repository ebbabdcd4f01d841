#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use delta_xds_controller_core as core;
pub use delta_xds_controller_grpc as grpc;
pub use delta_xds_controller_index as index;

mod args;
mod file_source;

pub use self::{
    args::Args,
    file_source::{FileResource, FileSource},
};
