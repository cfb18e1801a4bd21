mod client;
mod error;
pub mod platform;
mod reference;
mod resolver;
mod tls;
mod types;

pub use client::RemoteRepository;
pub use error::RegistryError;
pub use platform::{MatchComparer, Only, OnlyStrict};
pub use reference::{ImageReference, trim_tag_and_digest};
pub use resolver::{
    Authorizer, HostCapabilities, HostsResolver, RegistryHost, RegistryResolver, Scheme,
    StaticAuthorizer, TransportSettings,
};
pub use tls::{Credentials, RegistryConfig, TlsConfig};
pub use types::*;
