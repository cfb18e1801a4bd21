use crate::error::ContainerError;
use berth_supervisor::RuntimeInfo;
use prost::Message;
use prost_types::Any;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const RUNC_V2_OPTIONS_TYPE: &str = "containerd.runc.v1.Options";
const RUNC_V1_OPTIONS_TYPE: &str = "containerd.linux.runc.RuncOptions";

/// Options understood by the runc v2 shims.
#[derive(Clone, PartialEq, Message)]
pub struct RuncOptions {
    #[prost(bool, tag = "1")]
    pub no_pivot_root: bool,
    #[prost(bool, tag = "2")]
    pub no_new_keyring: bool,
    #[prost(string, tag = "3")]
    pub shim_cgroup: String,
    #[prost(uint32, tag = "4")]
    pub io_uid: u32,
    #[prost(uint32, tag = "5")]
    pub io_gid: u32,
    #[prost(string, tag = "6")]
    pub binary_name: String,
    #[prost(string, tag = "7")]
    pub root: String,
    #[prost(string, tag = "8")]
    pub criu_path: String,
    #[prost(bool, tag = "9")]
    pub systemd_cgroup: bool,
}

/// Options understood by the legacy v1 linux runtime.
#[derive(Clone, PartialEq, Message)]
pub struct LegacyRuncOptions {
    #[prost(string, tag = "1")]
    pub runtime: String,
    #[prost(string, tag = "2")]
    pub runtime_root: String,
    #[prost(string, tag = "3")]
    pub criu_path: String,
    #[prost(bool, tag = "4")]
    pub systemd_cgroup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    RuncV1,
    RuncV2RuncV1,
    RuncV2RuncV2,
    RuncV2RunscV1,
    RuncV2KataV2,
}

impl RuntimeKind {
    /// Runtimes that may be configured as the client default.
    pub const CONFIGURABLE: [RuntimeKind; 3] = [
        RuntimeKind::RuncV1,
        RuntimeKind::RuncV2RuncV1,
        RuntimeKind::RuncV2RuncV2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::RuncV1 => "runc-v1",
            RuntimeKind::RuncV2RuncV1 => "runc-v2.runc.v1",
            RuntimeKind::RuncV2RuncV2 => "runc-v2.runc.v2",
            RuntimeKind::RuncV2RunscV1 => "runc-v2.runsc.v1",
            RuntimeKind::RuncV2KataV2 => "runc-v2.kata.v2",
        }
    }

    /// Name the supervisor knows the shim by.
    pub fn shim_name(&self) -> &'static str {
        match self {
            RuntimeKind::RuncV1 => "io.containerd.runtime.v1.linux",
            RuntimeKind::RuncV2RuncV1 => "io.containerd.runc.v1",
            RuntimeKind::RuncV2RuncV2 => "io.containerd.runc.v2",
            RuntimeKind::RuncV2RunscV1 => "io.containerd.runsc.v1",
            RuntimeKind::RuncV2KataV2 => "io.containerd.kata.v2",
        }
    }

    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::RuncV1 | RuntimeKind::RuncV2RuncV1 | RuntimeKind::RuncV2RuncV2 => "runc",
            RuntimeKind::RuncV2RunscV1 => "runsc",
            RuntimeKind::RuncV2KataV2 => "kata-runtime",
        }
    }

    pub fn parse_configurable(s: &str) -> Result<Self, ContainerError> {
        let kind: RuntimeKind = s.parse()?;
        if !Self::CONFIGURABLE.contains(&kind) {
            return Err(ContainerError::InvalidRuntime(s.to_string()));
        }
        Ok(kind)
    }

    /// Shim name plus encoded options for this runtime.
    pub fn runtime_info(&self, systemd_cgroup: bool) -> RuntimeInfo {
        let options = match self {
            RuntimeKind::RuncV1 => Some(Any {
                type_url: RUNC_V1_OPTIONS_TYPE.to_string(),
                value: LegacyRuncOptions {
                    runtime: self.binary().to_string(),
                    systemd_cgroup,
                    ..Default::default()
                }
                .encode_to_vec(),
            }),
            RuntimeKind::RuncV2RuncV1 | RuntimeKind::RuncV2RuncV2 => Some(Any {
                type_url: RUNC_V2_OPTIONS_TYPE.to_string(),
                value: RuncOptions {
                    binary_name: self.binary().to_string(),
                    systemd_cgroup,
                    ..Default::default()
                }
                .encode_to_vec(),
            }),
            RuntimeKind::RuncV2RunscV1 | RuntimeKind::RuncV2KataV2 => None,
        };
        RuntimeInfo {
            name: self.shim_name().to_string(),
            options,
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runc-v1" => Ok(RuntimeKind::RuncV1),
            "runc-v2.runc.v1" => Ok(RuntimeKind::RuncV2RuncV1),
            "runc-v2.runc.v2" => Ok(RuntimeKind::RuncV2RuncV2),
            "runc-v2.runsc.v1" => Ok(RuntimeKind::RuncV2RunscV1),
            "runc-v2.kata.v2" => Ok(RuntimeKind::RuncV2KataV2),
            other => Err(ContainerError::InvalidRuntime(other.to_string())),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the host is booted with systemd as init.
pub fn host_uses_systemd() -> bool {
    Path::new("/run/systemd/system").is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_runtimes() {
        for kind in [
            RuntimeKind::RuncV1,
            RuntimeKind::RuncV2RuncV1,
            RuntimeKind::RuncV2RuncV2,
            RuntimeKind::RuncV2RunscV1,
            RuntimeKind::RuncV2KataV2,
        ] {
            assert_eq!(kind.as_str().parse::<RuntimeKind>().unwrap(), kind);
        }
        assert!("crun".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_only_runc_configurable() {
        assert!(RuntimeKind::parse_configurable("runc-v2.runc.v2").is_ok());
        let err = RuntimeKind::parse_configurable("runc-v2.kata.v2").unwrap_err();
        assert!(matches!(err, ContainerError::InvalidRuntime(_)));
    }

    #[test]
    fn test_runc_v2_options() {
        let info = RuntimeKind::RuncV2RuncV2.runtime_info(true);
        assert_eq!(info.name, "io.containerd.runc.v2");
        let any = info.options.unwrap();
        assert_eq!(any.type_url, RUNC_V2_OPTIONS_TYPE);
        let opts = RuncOptions::decode(any.value.as_slice()).unwrap();
        assert!(opts.systemd_cgroup);
        assert_eq!(opts.binary_name, "runc");
    }

    #[test]
    fn test_legacy_options() {
        let info = RuntimeKind::RuncV1.runtime_info(false);
        let opts = LegacyRuncOptions::decode(info.options.unwrap().value.as_slice()).unwrap();
        assert_eq!(opts.runtime, "runc");
        assert!(!opts.systemd_cgroup);
    }

    #[test]
    fn test_sandboxed_runtimes_without_options() {
        let info = RuntimeKind::RuncV2KataV2.runtime_info(false);
        assert_eq!(info.name, "io.containerd.kata.v2");
        assert!(info.options.is_none());
    }
}
