use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("mount of {target} failed: {reason}")]
    MountFailed { target: String, reason: String },

    #[error("unmount of {target} failed: {reason}")]
    UnmountFailed { target: String, reason: String },

    #[error("invalid mount specification: {0}")]
    InvalidSpec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
