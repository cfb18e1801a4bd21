use berth_core::{CompoundError, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("unauthenticated: no credentials for host {0}")]
    Unauthenticated(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("no registry host for {0} supports resolving")]
    NoResolvableHost(String),

    #[error("invalid TLS configuration for registry {host}: {errors}")]
    InvalidTls { host: String, errors: CompoundError },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry error: {0}")]
    Registry(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::InvalidReference(_) | RegistryError::InvalidTls { .. } => {
                ErrorKind::Validation
            }
            RegistryError::Unauthenticated(_) | RegistryError::AuthFailed(_) => ErrorKind::Auth,
            RegistryError::ManifestNotFound(_) => ErrorKind::NotFound,
            RegistryError::NoResolvableHost(_) => ErrorKind::Config,
            RegistryError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            RegistryError::Http(_) => ErrorKind::Transport,
            _ => ErrorKind::Other,
        }
    }
}
