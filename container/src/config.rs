use crate::error::ContainerError;
use crate::runtime::RuntimeKind;
use berth_image::{DecryptConfig, VerificationKey, VerifierKind, parse_verification_keys};
use berth_remote::RegistryConfig;
use berth_supervisor::DEFAULT_LEASE_ID;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "berth";
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";
pub const DEFAULT_IMAGE_EXPIRY_SECS: u64 = 31 * 24 * 60 * 60;

/// Everything the daemon hands the client at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub namespace: String,
    pub connection_path: PathBuf,
    pub root_exec: PathBuf,
    pub meta_path: PathBuf,
    pub snapshotter: String,
    pub registry_configs: HashMap<String, RegistryConfig>,
    pub image_dec_keys: Vec<String>,
    pub image_dec_recipients: Vec<String>,
    pub image_verification_keys: Vec<String>,
    pub runc_runtime: String,
    /// Retention of released images, in seconds.
    pub image_expiry: u64,
    pub image_expiry_disable: bool,
    pub lease_id: String,
    pub verifier_type: String,
    pub verifier_config: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            connection_path: PathBuf::from("/run/containerd/containerd.sock"),
            root_exec: PathBuf::from("/var/run/berth"),
            meta_path: PathBuf::from("/var/lib/berth"),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            registry_configs: HashMap::new(),
            image_dec_keys: Vec::new(),
            image_dec_recipients: Vec::new(),
            image_verification_keys: Vec::new(),
            runc_runtime: RuntimeKind::RuncV2RuncV2.as_str().to_string(),
            image_expiry: DEFAULT_IMAGE_EXPIRY_SECS,
            image_expiry_disable: false,
            lease_id: DEFAULT_LEASE_ID.to_string(),
            verifier_type: "none".to_string(),
            verifier_config: HashMap::new(),
        }
    }
}

/// Parsed form of the settings that can be rejected.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub runtime: RuntimeKind,
    pub verifier_kind: VerifierKind,
    pub verification_keys: Vec<VerificationKey>,
    pub decrypt: Option<DecryptConfig>,
}

impl ClientConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, ContainerError> {
        serde_json::from_slice(data).map_err(|e| ContainerError::InvalidConfig(e.to_string()))
    }

    pub fn fifo_root(&self) -> PathBuf {
        self.root_exec.join("fifo")
    }

    /// Registry host configuration handed to the daemon for pulls.
    pub fn hosts_root(&self) -> PathBuf {
        self.root_exec.join("hosts")
    }

    pub fn log_root(&self) -> PathBuf {
        self.meta_path.join("containers")
    }

    pub fn image_expiry(&self) -> Duration {
        Duration::from_secs(self.image_expiry)
    }

    pub fn validate(&self) -> Result<ValidatedConfig, ContainerError> {
        if self.namespace.is_empty() {
            return Err(ContainerError::InvalidConfig(
                "namespace must not be empty".to_string(),
            ));
        }
        let runtime = RuntimeKind::parse_configurable(&self.runc_runtime)?;
        let verifier_kind: VerifierKind = self.verifier_type.parse()?;
        let verification_keys = parse_verification_keys(&self.image_verification_keys)?;
        let decrypt = DecryptConfig::new(&self.image_dec_keys, &self.image_dec_recipients)?;
        for (host, cfg) in &self.registry_configs {
            cfg.validate(host)?;
        }
        Ok(ValidatedConfig {
            runtime,
            verifier_kind,
            verification_keys,
            decrypt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::ErrorKind;
    use berth_remote::TlsConfig;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.namespace, "berth");
        assert_eq!(cfg.snapshotter, "overlayfs");
        assert_eq!(cfg.lease_id, "container-management.lease");
        assert_eq!(cfg.fifo_root(), PathBuf::from("/var/run/berth/fifo"));
        assert_eq!(cfg.log_root(), PathBuf::from("/var/lib/berth/containers"));
        let validated = cfg.validate().unwrap();
        assert_eq!(validated.runtime, RuntimeKind::RuncV2RuncV2);
        assert_eq!(validated.verifier_kind, VerifierKind::None);
        assert!(validated.decrypt.is_none());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let cfg = ClientConfig::from_json(
            br#"{"namespace": "moby", "runc_runtime": "runc-v1", "image_expiry": 60,
                 "registry_configs": {"reg.test": {"insecure": true}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.namespace, "moby");
        assert_eq!(cfg.snapshotter, "overlayfs");
        assert_eq!(cfg.image_expiry(), Duration::from_secs(60));
        assert!(cfg.registry_configs["reg.test"].insecure);
        assert_eq!(cfg.validate().unwrap().runtime, RuntimeKind::RuncV1);
    }

    #[test]
    fn test_rejects_unknown_runtime() {
        let cfg = ClientConfig {
            runc_runtime: "runc-v2.kata.v2".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_rejects_unknown_verifier() {
        let cfg = ClientConfig {
            verifier_type: "cosign".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_rejects_bad_verification_key() {
        let cfg = ClientConfig {
            image_verification_keys: vec!["/missing/key.pub:sha1".to_string()],
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_rejects_invalid_tls() {
        let mut registry_configs = HashMap::new();
        registry_configs.insert(
            "reg.test".to_string(),
            RegistryConfig {
                insecure: false,
                credentials: None,
                transport: Some(TlsConfig {
                    root_ca: "relative/ca.crt".to_string(),
                    client_cert: "/missing/client.cert".to_string(),
                    client_key: "/missing/client.pem".to_string(),
                }),
            },
        );
        let cfg = ClientConfig {
            registry_configs,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("reg.test"));
    }
}
