use berth_core::{Cancelled, ErrorKind};
use berth_mount::MountError;
use berth_remote::RegistryError;
use thiserror::Error;
use tonic::Code;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Rpc(#[from] tonic::Status),

    #[error("unexpected number of mounts for container {container_id}: {count}")]
    MountShape { container_id: String, count: usize },

    #[error("could not reach the shim of container {0}")]
    ShimUnreachable(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("oci spec error: {0}")]
    OciSpec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl From<oci_spec::OciSpecError> for SupervisorError {
    fn from(e: oci_spec::OciSpecError) -> Self {
        SupervisorError::OciSpec(e.to_string())
    }
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::NotFound(_) => ErrorKind::NotFound,
            SupervisorError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SupervisorError::InvalidArgument(_) | SupervisorError::OciSpec(_) => {
                ErrorKind::Validation
            }
            SupervisorError::Rpc(status) => match status.code() {
                Code::NotFound => ErrorKind::NotFound,
                Code::AlreadyExists => ErrorKind::AlreadyExists,
                Code::InvalidArgument | Code::FailedPrecondition => ErrorKind::Validation,
                Code::Unauthenticated | Code::PermissionDenied => ErrorKind::Auth,
                Code::DeadlineExceeded => ErrorKind::Timeout,
                Code::Cancelled => ErrorKind::Cancelled,
                Code::Unavailable => ErrorKind::Transport,
                _ => ErrorKind::Internal,
            },
            SupervisorError::ShimUnreachable(_) => ErrorKind::Timeout,
            SupervisorError::Transport(_) => ErrorKind::Transport,
            SupervisorError::Cancelled(_) => ErrorKind::Cancelled,
            SupervisorError::Registry(e) => e.kind(),
            SupervisorError::MountShape { .. } | SupervisorError::Internal(_) => {
                ErrorKind::Internal
            }
            _ => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }
}

/// Whether an exit error reported by the supervisor means the RPC channel to
/// the shim broke, rather than the process itself failing.
pub fn is_connection_lost(status: &tonic::Status) -> bool {
    if status.code() == Code::Unavailable {
        return true;
    }
    let message = status.message();
    message.contains("rpc error") || message.contains("transport is closing")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_status_kinds() {
        let err = SupervisorError::from(tonic::Status::not_found("image busybox"));
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "rpc error: code = NotFound desc = image busybox"
        );

        let err = SupervisorError::from(tonic::Status::already_exists("lease"));
        assert!(err.is_already_exists());

        let err = SupervisorError::from(tonic::Status::unavailable("down"));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_connection_lost() {
        assert!(is_connection_lost(&tonic::Status::unavailable("")));
        assert!(is_connection_lost(&tonic::Status::unknown(
            "transport is closing"
        )));
        assert!(is_connection_lost(&tonic::Status::internal(
            "rpc error: code = Canceled"
        )));
        assert!(!is_connection_lost(&tonic::Status::internal(
            "process exited badly"
        )));
    }
}
