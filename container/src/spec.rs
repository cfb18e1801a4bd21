//! OCI runtime spec synthesis for a container record.

use crate::devices::{allow_all_rule, devices_for_mapping, host_devices, in_root_user_namespace};
use crate::error::ContainerError;
use crate::resources::memory_limits;
use crate::types::{Container, DeviceMapping, HookStage, MountPoint};
use berth_remote::ContainerConfig as ImageProcess;
use berth_supervisor::{NewContainer, RuntimeInfo, snapshot_id};
use oci_spec::runtime::{
    Capability, Hook, HookBuilder, Hooks, HooksBuilder, LinuxBuilder, LinuxCapabilitiesBuilder,
    LinuxDevice, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxNamespace,
    LinuxNamespaceBuilder, LinuxNamespaceType, LinuxResourcesBuilder, Mount, MountBuilder,
    ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

const OCI_VERSION: &str = "1.0.2";
const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const SETKEY_HOOK_ARG: &str = "libnetwork-setkey";

const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// Inputs of [`generate_spec`] beyond the container record.
pub struct SpecContext<'a> {
    /// Process defaults from the image configuration.
    pub image: Option<&'a ImageProcess>,
    pub rootfs: &'a Path,
    /// Exec root handed to the network setkey hook.
    pub root_exec: &'a Path,
}

/// Builds the runtime spec for `container`.
pub fn generate_spec(container: &Container, ctx: &SpecContext<'_>) -> Result<Spec, ContainerError> {
    let host = &container.host_config;
    let (uid, gid) = parse_user(&user(container, ctx.image));

    let process = ProcessBuilder::default()
        .terminal(container.io_config.tty)
        .user(UserBuilder::default().uid(uid).gid(gid).build()?)
        .args(process_args(container, ctx.image))
        .env(process_env(container, ctx.image))
        .cwd(working_dir(container, ctx.image))
        .capabilities({
            let caps = capabilities(host.privileged, &host.cap_add)?;
            LinuxCapabilitiesBuilder::default()
                .bounding(caps.clone())
                .effective(caps.clone())
                .permitted(caps)
                .build()?
        })
        .no_new_privileges(!host.privileged)
        .build()?;

    let root = RootBuilder::default()
        .path(ctx.rootfs)
        .readonly(host.readonly_rootfs)
        .build()?;

    let (devices, mut rules) = devices(host.privileged, &host.devices)?;
    let mut resources = LinuxResourcesBuilder::default();
    if let Some(limits) = &host.resources {
        if let Some(memory) = memory_limits(limits)? {
            resources = resources.memory(memory);
        }
    }
    rules.insert(0, deny_all_rule()?);
    let resources = resources.devices(rules).build()?;

    let linux = LinuxBuilder::default()
        .namespaces(namespaces(container)?)
        .devices(devices)
        .resources(resources)
        .build()?;

    let spec = SpecBuilder::default()
        .version(OCI_VERSION)
        .root(root)
        .process(process)
        .hostname(hostname(container))
        .mounts(mounts(container)?)
        .hooks(hooks(container, ctx.root_exec)?)
        .linux(linux)
        .build()?;

    Ok(spec)
}

/// Registration request for `container` on top of its snapshot.
pub fn new_container(
    container: &Container,
    image: &str,
    snapshotter: &str,
    runtime: RuntimeInfo,
    spec: Spec,
) -> NewContainer {
    NewContainer {
        id: container.id.clone(),
        image: image.to_string(),
        snapshotter: snapshotter.to_string(),
        snapshot_key: snapshot_id(&container.id),
        runtime,
        spec,
        labels: container.config.labels.clone(),
    }
}

fn user(container: &Container, image: Option<&ImageProcess>) -> String {
    if !container.config.user.is_empty() {
        return container.config.user.clone();
    }
    image.map(|i| i.user.clone()).unwrap_or_default()
}

fn parse_user(user: &str) -> (u32, u32) {
    if user.is_empty() {
        return (0, 0);
    }

    let parts: Vec<&str> = user.split(':').collect();
    let uid = parts.first().and_then(|s| s.parse().ok()).unwrap_or(0);
    let gid = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(uid);

    (uid, gid)
}

fn process_args(container: &Container, image: Option<&ImageProcess>) -> Vec<String> {
    let cfg = &container.config;
    let args: Vec<String> = if !cfg.entrypoint.is_empty() {
        cfg.entrypoint.iter().chain(cfg.cmd.iter()).cloned().collect()
    } else if !cfg.cmd.is_empty() {
        image
            .map(|i| i.entrypoint.clone())
            .unwrap_or_default()
            .into_iter()
            .chain(cfg.cmd.iter().cloned())
            .collect()
    } else {
        image.map(|i| i.args()).unwrap_or_default()
    };

    if args.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        args
    }
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

fn set_env(env: &mut Vec<String>, entry: String) {
    match env.iter_mut().find(|e| env_key(e) == env_key(&entry)) {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

fn process_env(container: &Container, image: Option<&ImageProcess>) -> Vec<String> {
    let mut env = image.map(|i| i.env.clone()).unwrap_or_default();
    if env.is_empty() {
        env.push(DEFAULT_PATH_ENV.to_string());
    }
    for entry in &container.config.env {
        set_env(&mut env, entry.clone());
    }
    set_env(&mut env, format!("HOSTNAME={}", hostname(container)));
    if container.io_config.tty {
        set_env(&mut env, "TERM=xterm".to_string());
    }
    env
}

fn working_dir(container: &Container, image: Option<&ImageProcess>) -> String {
    if !container.config.working_dir.is_empty() {
        return container.config.working_dir.clone();
    }
    match image {
        Some(i) if !i.working_dir.is_empty() => i.working_dir.clone(),
        _ => "/".to_string(),
    }
}

fn hostname(container: &Container) -> String {
    if !container.config.hostname.is_empty() {
        return container.config.hostname.clone();
    }
    container.id.chars().take(12).collect()
}

fn mount(
    destination: &str,
    typ: &str,
    source: &str,
    options: &[&str],
) -> Result<Mount, ContainerError> {
    Ok(MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source)
        .options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>())
        .build()?)
}

fn default_mounts() -> Result<Vec<Mount>, ContainerError> {
    Ok(vec![
        mount("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"])?,
        mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        )?,
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        )?,
        mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        )?,
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])?,
        mount(
            "/run",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        )?,
    ])
}

fn bind_mount(point: &MountPoint) -> Result<Mount, ContainerError> {
    let propagation = if point.propagation.is_empty() {
        "rprivate"
    } else {
        point.propagation.as_str()
    };
    let mut options = vec!["rbind", propagation];
    if point.read_only {
        options.push("ro");
    }
    mount(&point.destination, "bind", &point.source, &options)
}

fn mounts(container: &Container) -> Result<Vec<Mount>, ContainerError> {
    let mut mounts = default_mounts()?;
    for point in &container.mounts {
        mounts.push(bind_mount(point)?);
    }

    let network = &container.host_config.network;
    let files = [
        (&network.resolv_conf_path, "/etc/resolv.conf"),
        (&network.hostname_path, "/etc/hostname"),
        (&network.hosts_path, "/etc/hosts"),
    ];
    let mut network_binds = Vec::new();
    for (source, destination) in files {
        if source.is_empty() {
            continue;
        }
        network_binds.push(mount(destination, "bind", source, &["rbind", "rprivate"])?);
    }
    if !network_binds.is_empty() {
        mounts.retain(|m| m.destination() != Path::new("/run"));
        mounts.extend(network_binds);
    }
    Ok(mounts)
}

fn namespace(typ: LinuxNamespaceType, path: Option<&str>) -> Result<LinuxNamespace, ContainerError> {
    let mut builder = LinuxNamespaceBuilder::default().typ(typ);
    if let Some(path) = path {
        builder = builder.path(PathBuf::from(path));
    }
    Ok(builder.build()?)
}

fn namespaces(container: &Container) -> Result<Vec<LinuxNamespace>, ContainerError> {
    let mut namespaces = vec![
        namespace(LinuxNamespaceType::Pid, None)?,
        namespace(LinuxNamespaceType::Ipc, None)?,
        namespace(LinuxNamespaceType::Uts, None)?,
        namespace(LinuxNamespaceType::Mount, None)?,
    ];

    let host = &container.host_config;
    if host.is_host_network() {
        let sandbox = host.network.sandbox_key.as_str();
        if !sandbox.is_empty() {
            namespaces.push(namespace(LinuxNamespaceType::Network, Some(sandbox))?);
        }
    } else {
        namespaces.push(namespace(LinuxNamespaceType::Network, None)?);
    }

    Ok(namespaces)
}

fn hook(path: &str, args: Vec<String>, env: Vec<String>, timeout: Option<i64>) -> Result<Hook, ContainerError> {
    let mut builder = HookBuilder::default().path(path).args(args);
    if !env.is_empty() {
        builder = builder.env(env);
    }
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    Ok(builder.build()?)
}

/// Prestart hook handing the new network namespace to the network
/// controller through this process's own binary.
fn setkey_hook(container: &Container, root_exec: &Path) -> Result<Hook, ContainerError> {
    let exe = format!("/proc/{}/exe", std::process::id());
    hook(
        &exe,
        vec![
            exe.clone(),
            SETKEY_HOOK_ARG.to_string(),
            format!("-exec-root={}", root_exec.display()),
            container.id.clone(),
            container.host_config.network.controller_id.clone(),
        ],
        Vec::new(),
        None,
    )
}

fn hooks(container: &Container, root_exec: &Path) -> Result<Hooks, ContainerError> {
    let mut prestart = Vec::new();
    let mut poststart = Vec::new();
    let mut poststop = Vec::new();

    if container.host_config.is_bridge_network() {
        prestart.push(setkey_hook(container, root_exec)?);
    }
    for h in &container.hooks {
        let built = hook(&h.path, h.args.clone(), h.env.clone(), h.timeout)?;
        match h.stage {
            HookStage::Prestart => prestart.push(built),
            HookStage::Poststart => poststart.push(built),
            HookStage::Poststop => poststop.push(built),
        }
    }

    Ok(HooksBuilder::default()
        .prestart(prestart)
        .poststart(poststart)
        .poststop(poststop)
        .build()?)
}

fn parse_capability(name: &str) -> Option<Capability> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    serde_json::from_str(&format!("\"{}\"", full)).ok()
}

fn capability_set(names: &[&str]) -> HashSet<Capability> {
    names.iter().filter_map(|n| parse_capability(n)).collect()
}

/// Capability set for the container process.
pub fn capabilities(
    privileged: bool,
    cap_add: &[String],
) -> Result<HashSet<Capability>, ContainerError> {
    if privileged || cap_add.iter().any(|c| c.eq_ignore_ascii_case("ALL")) {
        return Ok(capability_set(ALL_CAPABILITIES));
    }
    let mut caps = capability_set(DEFAULT_CAPABILITIES);
    for name in cap_add {
        match parse_capability(name) {
            Some(cap) => {
                caps.insert(cap);
            }
            None => {
                return Err(ContainerError::InvalidConfig(format!(
                    "unknown capability {:?}",
                    name
                )));
            }
        }
    }
    Ok(caps)
}

fn deny_all_rule() -> Result<LinuxDeviceCgroup, ContainerError> {
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(false)
        .access("rwm")
        .build()?)
}

/// Device nodes and cgroup rules for the container. A privileged container
/// in the initial user namespace gets every host device.
pub fn devices(
    privileged: bool,
    mappings: &[DeviceMapping],
) -> Result<(Vec<LinuxDevice>, Vec<LinuxDeviceCgroup>), ContainerError> {
    if privileged && in_root_user_namespace() {
        return Ok((host_devices()?, vec![allow_all_rule()?]));
    }
    if privileged {
        warn!("Privileged container outside the initial user namespace, host devices not added");
    }

    let mut devices = Vec::new();
    let mut rules = Vec::new();
    for mapping in mappings {
        let (d, r) = devices_for_mapping(mapping)?;
        devices.extend(d);
        rules.extend(r);
    }
    Ok((devices, rules))
}
