use crate::MountSpec;
use crate::error::MountError;
use nix::mount::{MntFlags, MsFlags, umount2};
use std::path::Path;

/// Mounts `spec` at `target`, creating the target directory first.
///
/// Supports overlay mounts (options passed through as the data string) and
/// bind mounts (`ro`, `rbind` and propagation options are translated to
/// flags).
pub fn mount(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    std::fs::create_dir_all(target)?;

    match spec.mount_type.as_str() {
        "overlay" => mount_overlay(spec, target),
        "bind" | "rbind" => mount_bind(spec, target),
        other => Err(MountError::InvalidSpec(format!(
            "unsupported mount type: {}",
            other
        ))),
    }
}

fn mount_overlay(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    let (flags, data) = split_options(&spec.options);

    tracing::debug!(target = ?target, options = %data, "mounting overlay");

    nix::mount::mount(
        Some("overlay"),
        target,
        Some("overlay"),
        flags,
        Some(data.as_str()),
    )
    .map_err(|e| failed(target, e))?;

    tracing::info!(target = ?target, "mounted overlay filesystem");
    Ok(())
}

fn mount_bind(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    let source = Path::new(&spec.source);
    let (mut flags, _) = split_options(&spec.options);
    flags |= MsFlags::MS_BIND;
    if spec.mount_type == "rbind" {
        flags |= MsFlags::MS_REC;
    }

    tracing::debug!(source = ?source, target = ?target, flags = ?flags, "bind mounting");

    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        flags & !MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| failed(target, e))?;

    // MS_RDONLY is ignored on the initial bind, it needs a remount.
    if spec.is_readonly() {
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| failed(target, e))?;
    }

    tracing::info!(source = ?source, target = ?target, "bind mounted");
    Ok(())
}

/// Splits mount options into kernel flags and the remaining data string.
fn split_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "rbind" => flags |= MsFlags::MS_REC,
            "bind" => {}
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "private" => flags |= MsFlags::MS_PRIVATE,
            "rprivate" => flags |= MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

fn failed(target: &Path, err: nix::errno::Errno) -> MountError {
    MountError::MountFailed {
        target: target.display().to_string(),
        reason: err.to_string(),
    }
}

/// Lazily detaches the filesystem at `target`.
pub fn unmount(target: &Path) -> Result<(), MountError> {
    unmount_with(target, MntFlags::MNT_DETACH)
}

/// Forces the unmount of `target` even if it is busy.
pub fn unmount_force(target: &Path) -> Result<(), MountError> {
    unmount_with(target, MntFlags::MNT_FORCE)
}

fn unmount_with(target: &Path, flags: MntFlags) -> Result<(), MountError> {
    tracing::debug!(target = ?target, flags = ?flags, "unmounting");

    umount2(target, flags).map_err(|e| MountError::UnmountFailed {
        target: target.display().to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(target = ?target, "unmounted");
    Ok(())
}
