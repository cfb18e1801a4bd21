use berth_io::LogModeConfig;
use prost_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

pub const NETWORK_MODE_HOST: &str = "host";
pub const NETWORK_MODE_BRIDGE: &str = "bridge";
pub const NETWORK_MODE_NONE: &str = "none";

/// A container as defined by the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: ImageSpec,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub host_config: HostConfig,
    #[serde(default)]
    pub io_config: IoSettings,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub mounts: Vec<MountPoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSpec {
    pub reference: String,
    #[serde(default)]
    pub dec_keys: Vec<String>,
    #[serde(default)]
    pub dec_recipients: Vec<String>,
    #[serde(default)]
    pub verification_keys: Vec<String>,
}

/// Process settings that override the image configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub domainname: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Runtime override; empty selects the client default.
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub devices: Vec<DeviceMapping>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub log_config: LogConfig,
    #[serde(default)]
    pub network_mode: String,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub readonly_rootfs: bool,
}

impl HostConfig {
    pub fn is_host_network(&self) -> bool {
        self.network_mode == NETWORK_MODE_HOST
    }

    pub fn is_bridge_network(&self) -> bool {
        self.network_mode == NETWORK_MODE_BRIDGE
            || self.network_mode.is_empty()
            || self.network_mode == "default"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub path_on_host: String,
    #[serde(default)]
    pub path_in_container: String,
    #[serde(default)]
    pub cgroup_permissions: String,
}

/// Memory limits as size strings (`"200M"`); empty means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub memory_reservation: String,
    #[serde(default)]
    pub memory_swap: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `json-file`, `none`, or empty for the default driver.
    #[serde(default)]
    pub driver: String,
    #[serde(flatten)]
    pub mode: LogModeConfig,
    #[serde(default)]
    pub log_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Network namespace path joined in host or shared modes.
    #[serde(default)]
    pub sandbox_key: String,
    #[serde(default)]
    pub controller_id: String,
    #[serde(default)]
    pub resolv_conf_path: String,
    #[serde(default)]
    pub hostname_path: String,
    #[serde(default)]
    pub hosts_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSettings {
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub tty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStage {
    Prestart,
    Poststart,
    Poststop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub stage: HookStage,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub timeout: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub read_only: bool,
    /// Bind propagation such as `rprivate`; empty defaults to `rprivate`.
    #[serde(default)]
    pub propagation: String,
}

#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    pub signal: i32,
    pub timeout: Duration,
    pub force: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            signal: signals::SIGTERM,
            timeout: Duration::from_secs(10),
            force: true,
        }
    }
}

pub mod signals {
    pub const SIGKILL: i32 = nix::sys::signal::Signal::SIGKILL as i32;
    pub const SIGTERM: i32 = nix::sys::signal::Signal::SIGTERM as i32;
}

/// Human name of `signal`, falling back to the number.
pub fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}

/// How a task ended, as reported by its watcher.
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub code: u32,
    pub exited_at: Timestamp,
    pub error: Option<tonic::Status>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMetrics {
    pub used_ns: u64,
    pub system_total_ns: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMetrics {
    pub used: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoMetrics {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMetrics {
    pub cpu: Option<CpuMetrics>,
    pub memory: Option<MemoryMetrics>,
    pub io: Option<IoMetrics>,
    pub pids: Option<u64>,
    pub timestamp: SystemTime,
}
