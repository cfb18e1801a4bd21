mod error;
mod rootfs;

pub use error::MountError;
pub use rootfs::{mount, unmount, unmount_force};

/// A single mount as reported by a snapshotter: type, source and options,
/// without a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn new(mount_type: &str, source: &str, options: Vec<String>) -> Self {
        Self {
            mount_type: mount_type.to_string(),
            source: source.to_string(),
            options,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}
