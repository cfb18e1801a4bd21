use crate::types::Mount;
use berth_mount::{MountError, MountSpec};
use std::path::Path;

/// Mounts snapshot roots on the host.
pub trait Mounter: Send + Sync {
    fn mount(&self, mount: &Mount, target: &Path) -> Result<(), MountError>;

    fn unmount(&self, target: &Path) -> Result<(), MountError>;
}

/// [`Mounter`] backed by the mount syscalls. Unmounts are forced.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, mount: &Mount, target: &Path) -> Result<(), MountError> {
        berth_mount::mount(&MountSpec::from(mount), target)
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        berth_mount::unmount_force(target)
    }
}
