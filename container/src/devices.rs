use crate::error::ContainerError;
use crate::types::DeviceMapping;
use oci_spec::runtime::{
    LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType,
};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

const DEFAULT_PERMISSIONS: &str = "rwm";
const SKIPPED_DEV_DIRS: [&str; 7] = ["pts", "shm", "fd", "mqueue", ".lxc", ".lxd-mounts", ".udev"];

/// True when running in the initial user namespace.
pub fn in_root_user_namespace() -> bool {
    match fs::read_to_string("/proc/self/uid_map") {
        Ok(map) => {
            let fields: Vec<&str> = map.split_whitespace().collect();
            fields == ["0", "0", "4294967295"]
        }
        Err(_) => true,
    }
}

/// `path` as a device node seen at `container_path`, or `None` when it is
/// not a device.
pub fn device_from_path(
    path: &Path,
    container_path: &Path,
) -> Result<Option<LinuxDevice>, ContainerError> {
    let meta = fs::symlink_metadata(path)?;
    let ft = meta.file_type();
    let typ = if ft.is_char_device() {
        LinuxDeviceType::C
    } else if ft.is_block_device() {
        LinuxDeviceType::B
    } else {
        return Ok(None);
    };
    let rdev = meta.rdev();
    let device = LinuxDeviceBuilder::default()
        .path(container_path)
        .typ(typ)
        .major(nix::sys::stat::major(rdev) as i64)
        .minor(nix::sys::stat::minor(rdev) as i64)
        .file_mode(meta.mode() & 0o777)
        .uid(meta.uid())
        .gid(meta.gid())
        .build()?;
    Ok(Some(device))
}

pub fn cgroup_rule(device: &LinuxDevice, access: &str) -> Result<LinuxDeviceCgroup, ContainerError> {
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(device.typ())
        .major(device.major())
        .minor(device.minor())
        .access(access)
        .build()?)
}

/// Rule granting access to every device.
pub fn allow_all_rule() -> Result<LinuxDeviceCgroup, ContainerError> {
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .access(DEFAULT_PERMISSIONS)
        .build()?)
}

/// Every device node under `/dev`.
pub fn host_devices() -> Result<Vec<LinuxDevice>, ContainerError> {
    let mut devices = Vec::new();
    walk_devices(Path::new("/dev"), Path::new("/dev"), true, &mut devices)?;
    Ok(devices)
}

fn walk_devices(
    dir: &Path,
    container_dir: &Path,
    skip_special: bool,
    out: &mut Vec<LinuxDevice>,
) -> Result<(), ContainerError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let ft = entry.file_type()?;
        let path = entry.path();
        let target = container_dir.join(&name);
        if ft.is_dir() {
            if skip_special && SKIPPED_DEV_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            walk_devices(&path, &target, skip_special, out)?;
        } else if ft.is_symlink() {
            continue;
        } else if skip_special && path == Path::new("/dev/console") {
            continue;
        } else if let Some(device) = device_from_path(&path, &target)? {
            out.push(device);
        }
    }
    Ok(())
}

/// Resolves a configured mapping into device nodes and the cgroup rules
/// allowing them. Symlinks are followed and directories walked.
pub fn devices_for_mapping(
    mapping: &DeviceMapping,
) -> Result<(Vec<LinuxDevice>, Vec<LinuxDeviceCgroup>), ContainerError> {
    let access = if mapping.cgroup_permissions.is_empty() {
        DEFAULT_PERMISSIONS
    } else {
        mapping.cgroup_permissions.as_str()
    };
    let container_path = if mapping.path_in_container.is_empty() {
        PathBuf::from(&mapping.path_on_host)
    } else {
        PathBuf::from(&mapping.path_in_container)
    };
    let resolved = fs::canonicalize(&mapping.path_on_host)?;

    let mut devices = Vec::new();
    if resolved.is_dir() {
        walk_devices(&resolved, &container_path, false, &mut devices)?;
    } else {
        match device_from_path(&resolved, &container_path)? {
            Some(device) => devices.push(device),
            None => {
                return Err(ContainerError::InvalidConfig(format!(
                    "{} is not a device",
                    mapping.path_on_host
                )));
            }
        }
    }

    let rules = devices
        .iter()
        .map(|d| cgroup_rule(d, access))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((devices, rules))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_null_mapping() {
        let mapping = DeviceMapping {
            path_on_host: "/dev/null".to_string(),
            path_in_container: "/dev/mynull".to_string(),
            cgroup_permissions: "rw".to_string(),
        };
        let (devices, rules) = devices_for_mapping(&mapping).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path(), Path::new("/dev/mynull"));
        assert_eq!(devices[0].typ(), LinuxDeviceType::C);
        assert_eq!(devices[0].major(), 1);
        assert_eq!(devices[0].minor(), 3);
        assert_eq!(rules[0].access().as_deref(), Some("rw"));
        assert!(rules[0].allow());
    }

    #[test]
    fn test_symlink_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("null-link");
        std::os::unix::fs::symlink("/dev/null", &link).unwrap();
        let mapping = DeviceMapping {
            path_on_host: link.display().to_string(),
            ..Default::default()
        };
        let (devices, rules) = devices_for_mapping(&mapping).unwrap();
        assert_eq!(devices[0].path(), link.as_path());
        assert_eq!(devices[0].minor(), 3);
        assert_eq!(rules[0].access().as_deref(), Some("rwm"));
    }

    #[test]
    fn test_regular_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        let mapping = DeviceMapping {
            path_on_host: file.display().to_string(),
            ..Default::default()
        };
        assert!(matches!(
            devices_for_mapping(&mapping),
            Err(ContainerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_directory_without_devices() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file"), "x").unwrap();
        let mapping = DeviceMapping {
            path_on_host: dir.path().display().to_string(),
            path_in_container: "/dev/custom".to_string(),
            ..Default::default()
        };
        let (devices, rules) = devices_for_mapping(&mapping).unwrap();
        assert!(devices.is_empty());
        assert!(rules.is_empty());
    }

    #[test]
    fn test_host_devices_include_null() {
        let devices = host_devices().unwrap();
        assert!(devices.iter().any(|d| d.path() == Path::new("/dev/null")));
        assert!(!devices
            .iter()
            .any(|d| d.path().starts_with("/dev/pts")));
    }

    #[test]
    fn test_allow_all_rule() {
        let rule = allow_all_rule().unwrap();
        assert!(rule.allow());
        assert!(rule.typ().is_none());
        assert_eq!(rule.access().as_deref(), Some("rwm"));
    }
}
