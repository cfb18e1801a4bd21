use berth_mount::MountSpec;
use berth_remote::{Descriptor, HostsResolver, Platform};
use prost_types::{Any, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lease label carrying an expiry; leases with it are recreated at startup.
pub const GC_EXPIRE_LABEL: &str = "containerd.io/gc.expire";

pub const TASK_OOM_TOPIC: &str = "/tasks/oom";
pub const TASK_OOM_TYPE_URL: &str = "containerd.events.TaskOOM";

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub name: String,
    pub target: Descriptor,
    pub labels: HashMap<String, String>,
    pub created_at: SystemTime,
}

impl Image {
    pub fn new(name: &str, target: Descriptor) -> Self {
        Self {
            name: name.to_string(),
            target,
            labels: HashMap::new(),
            created_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseResource {
    pub id: String,
    pub resource_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    View,
    Active,
    Committed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub key: String,
    pub parent: Option<String>,
    pub kind: SnapshotKind,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl From<&Mount> for MountSpec {
    fn from(m: &Mount) -> Self {
        MountSpec::new(&m.mount_type, &m.source, m.options.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
    Unknown,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Created => write!(f, "created"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Paused => write!(f, "paused"),
            ProcessStatus::Pausing => write!(f, "pausing"),
            ProcessStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Exit information delivered once per task through its wait channel.
#[derive(Debug, Clone)]
pub struct ExitStatus {
    pub code: u32,
    pub exited_at: Timestamp,
    pub error: Option<tonic::Status>,
}

impl ExitStatus {
    pub fn new(code: u32, exited_at: Timestamp) -> Self {
        Self {
            code,
            exited_at,
            error: None,
        }
    }

    pub fn exited_now(code: u32) -> Self {
        Self::new(code, now_timestamp())
    }

    /// Status reported when the supervisor could not determine the exit.
    pub fn failed(error: tonic::Status) -> Self {
        Self {
            code: u32::MAX,
            exited_at: Timestamp::default(),
            error: Some(error),
        }
    }

    pub fn has_exit_time(&self) -> bool {
        !is_zero_time(&self.exited_at)
    }
}

pub fn is_zero_time(ts: &Timestamp) -> bool {
    ts.seconds == 0 && ts.nanos == 0
}

pub fn now_timestamp() -> Timestamp {
    to_timestamp(SystemTime::now())
}

pub fn to_timestamp(t: SystemTime) -> Timestamp {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    Timestamp {
        seconds: since.as_secs() as i64,
        nanos: since.subsec_nanos() as i32,
    }
}

pub fn from_timestamp(ts: &Timestamp) -> SystemTime {
    if ts.seconds < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::new(ts.seconds as u64, ts.nanos.max(0) as u32)
}

/// An event as delivered by the supervisor's event service.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub timestamp: Timestamp,
    pub namespace: String,
    pub topic: String,
    pub event: Option<Any>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskOom {
    #[prost(string, tag = "1")]
    pub container_id: String,
}

impl TaskOom {
    pub fn to_any(&self) -> Any {
        Any {
            type_url: TASK_OOM_TYPE_URL.to_string(),
            value: prost::Message::encode_to_vec(self),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub timestamp: Timestamp,
    pub id: String,
    pub data: Option<Any>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeInfo {
    pub name: String,
    pub options: Option<Any>,
}

/// Everything needed to register a container with the supervisor.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub id: String,
    pub image: String,
    pub snapshotter: String,
    pub snapshot_key: String,
    pub runtime: RuntimeInfo,
    pub spec: oci_spec::runtime::Spec,
    pub labels: HashMap<String, String>,
}

/// Key material handed to the supervisor's layer decryption.
#[derive(Clone, Default, PartialEq)]
pub struct DecryptPayload {
    pub parameters: HashMap<String, Vec<Vec<u8>>>,
}

impl fmt::Debug for DecryptPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.parameters.keys().collect();
        keys.sort();
        f.debug_struct("DecryptPayload")
            .field("parameters", &keys)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PullOptions {
    pub resolver: Option<HostsResolver>,
    pub platform: Platform,
    pub unpack: bool,
    pub snapshotter: String,
    pub decrypt: Option<DecryptPayload>,
}

#[derive(Debug, Clone)]
pub struct UnpackOptions {
    pub snapshotter: String,
    pub decrypt: Option<DecryptPayload>,
}

/// FIFO paths a task's IO is wired through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoConfig {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub terminal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversion() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 500);
        let ts = to_timestamp(t);
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.nanos, 500);
        assert_eq!(from_timestamp(&ts), t);
        assert!(is_zero_time(&Timestamp::default()));
        assert!(!ExitStatus::failed(tonic::Status::unavailable("")).has_exit_time());
    }

    #[test]
    fn test_task_oom_any() {
        let oom = TaskOom {
            container_id: "c1".to_string(),
        };
        let any = oom.to_any();
        assert_eq!(any.type_url, TASK_OOM_TYPE_URL);
        let decoded: TaskOom = prost::Message::decode(any.value.as_slice()).unwrap();
        assert_eq!(decoded.container_id, "c1");
    }

    #[test]
    fn test_decrypt_payload_debug_hides_keys() {
        let mut payload = DecryptPayload::default();
        payload
            .parameters
            .insert("privkeys".to_string(), vec![b"secret".to_vec()]);
        let debug = format!("{:?}", payload);
        assert!(debug.contains("privkeys"));
        assert!(!debug.contains("secret"));
    }
}
