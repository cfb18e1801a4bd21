use berth_core::units::SizeError;
use berth_core::{Cancelled, CompoundError, ErrorKind};
use berth_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO for container {0} already exists")]
    AlreadyExists(String),

    #[error("no IO resources for container {0}")]
    NoResources(String),

    #[error("log driver is closed")]
    DriverClosed,

    #[error("invalid max buffer size: {0}")]
    InvalidBufferSize(#[from] SizeError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("fifo error: {0}")]
    Fifo(#[from] nix::Error),

    #[error(transparent)]
    Compound(#[from] CompoundError),
}

impl IoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IoError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            IoError::NoResources(_) => ErrorKind::NotFound,
            IoError::InvalidBufferSize(_) => ErrorKind::Validation,
            IoError::Cancelled(_) => ErrorKind::Cancelled,
            IoError::DriverClosed => ErrorKind::Disposed,
            _ => ErrorKind::Other,
        }
    }
}

impl From<IoError> for SupervisorError {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Io(e) => SupervisorError::Io(e),
            IoError::Cancelled(c) => SupervisorError::Cancelled(c),
            IoError::AlreadyExists(id) => SupervisorError::AlreadyExists(id),
            IoError::NoResources(id) => SupervisorError::NotFound(id),
            other => SupervisorError::Internal(other.to_string()),
        }
    }
}
