//! Container lifecycle on top of the supervisor: spec synthesis, the live
//! container cache with its exit watchers, OOM events, image expiry and the
//! [`ContainerdClient`] that ties them together.

mod cache;
mod client;
mod config;
mod devices;
mod error;
mod events;
mod expiry;
pub mod metrics;
mod resources;
mod runtime;
pub mod spec;
mod types;

pub use cache::{Cleanup, ContainerCache, ContainerInfo, ExitEvent, ExitHook};
pub use client::ContainerdClient;
pub use config::{
    ClientConfig, DEFAULT_IMAGE_EXPIRY_SECS, DEFAULT_NAMESPACE, DEFAULT_SNAPSHOTTER,
    ValidatedConfig,
};
pub use error::ContainerError;
pub use events::{oom_filter, spawn_event_processor};
pub use expiry::{ExpiryHandler, ResourcesWatcher};
pub use resources::{memory_limits, update_resources};
pub use runtime::{RuntimeKind, host_uses_systemd};
pub use types::*;

pub use berth_io::AttachConfig;
