//! Namespace- and lease-scoped access to the container supervisor.
//!
//! [`SupervisorClient`] and its handle traits describe the native client
//! surface; [`SupervisorSpi`] is the facade the rest of the workspace talks
//! to.

mod client;
mod error;
mod grpc;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
mod lease;
mod mounter;
mod spi;
mod types;

pub use client::{
    EventStream, IoAttach, IoCreator, SupervisorClient, SupervisorContainer, SupervisorTask,
    TaskIo, io_future,
};
pub use error::{SupervisorError, is_connection_lost};
pub use grpc::{
    GrpcContainer, GrpcSupervisor, GrpcTask, LEASE_HEADER, NAMESPACE_HEADER, chain_ids,
    render_hosts_toml,
};
pub use lease::{DEFAULT_LEASE_ID, bootstrap_lease};
pub use mounter::{Mounter, SystemMounter};
pub use spi::{ROOTFS_NAME, SpiConfig, SupervisorSpi, snapshot_id};
pub use types::*;
