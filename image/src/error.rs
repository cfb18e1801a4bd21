use berth_core::{Cancelled, CompoundError, ErrorKind};
use berth_remote::RegistryError;
use berth_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("no manifest matching platform {0} in {1}")]
    NoPlatformMatch(String, String),

    #[error("invalid key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("unsupported hash function {0}")]
    UnsupportedHash(String),

    #[error("invalid decryption recipient {0}")]
    InvalidRecipient(String),

    #[error("not authorized to decrypt image {image}: {errors}")]
    Unauthorized { image: String, errors: CompoundError },

    #[error("signature verification of image {image} failed: {errors}")]
    VerificationFailed { image: String, errors: CompoundError },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid JWE: {0}")]
    InvalidJwe(String),

    #[error("notation verification of {reference} failed: {reason}")]
    Notation { reference: String, reason: String },

    #[error("invalid verifier configuration: {0}")]
    InvalidVerifierConfig(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::NoPlatformMatch(..) => ErrorKind::Internal,
            ImageError::InvalidKey { .. }
            | ImageError::UnsupportedHash(_)
            | ImageError::InvalidRecipient(_)
            | ImageError::InvalidVerifierConfig(_) => ErrorKind::Validation,
            ImageError::Unauthorized { .. }
            | ImageError::VerificationFailed { .. }
            | ImageError::InvalidSignature(_)
            | ImageError::InvalidJwe(_)
            | ImageError::Notation { .. } => ErrorKind::Auth,
            ImageError::Cancelled(_) => ErrorKind::Cancelled,
            ImageError::Supervisor(e) => e.kind(),
            ImageError::Registry(e) => e.kind(),
            _ => ErrorKind::Other,
        }
    }
}
