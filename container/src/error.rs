use berth_core::{Cancelled, ErrorKind, units::SizeError};
use berth_image::ImageError;
use berth_io::IoError;
use berth_remote::RegistryError;
use berth_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container already exists: {0}")]
    AlreadyExists(String),

    #[error("container not running: {0}")]
    NotRunning(String),

    #[error("snapshot of container {0} does not exist")]
    SnapshotMissing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported runtime {0:?}")]
    InvalidRuntime(String),

    #[error("container {container_id} did not stop after {signal}")]
    StopTimeout {
        container_id: String,
        signal: String,
    },

    #[error("unexpected metrics type {0:?}")]
    UnexpectedMetrics(String),

    #[error("image {0} is already watched for expiry")]
    AlreadyWatched(String),

    #[error("client has been disposed")]
    Disposed,

    #[error(transparent)]
    InvalidSize(#[from] SizeError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("oci spec error: {0}")]
    OciSpec(String),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("filesystem error: {0}")]
    Fs(#[from] std::io::Error),
}

impl From<oci_spec::OciSpecError> for ContainerError {
    fn from(e: oci_spec::OciSpecError) -> Self {
        ContainerError::OciSpec(e.to_string())
    }
}

impl ContainerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContainerError::NotFound(_) | ContainerError::SnapshotMissing(_) => {
                ErrorKind::NotFound
            }
            ContainerError::AlreadyExists(_) | ContainerError::AlreadyWatched(_) => {
                ErrorKind::AlreadyExists
            }
            ContainerError::InvalidConfig(_)
            | ContainerError::InvalidRuntime(_)
            | ContainerError::InvalidSize(_) => ErrorKind::Validation,
            ContainerError::StopTimeout { .. } => ErrorKind::Timeout,
            ContainerError::UnexpectedMetrics(_) => ErrorKind::Internal,
            ContainerError::Disposed => ErrorKind::Disposed,
            ContainerError::Cancelled(_) => ErrorKind::Cancelled,
            ContainerError::Supervisor(e) => e.kind(),
            ContainerError::Io(e) => e.kind(),
            ContainerError::Image(e) => e.kind(),
            ContainerError::Registry(e) => e.kind(),
            _ => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
