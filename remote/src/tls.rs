use crate::error::RegistryError;
use berth_core::CompoundError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const ROOT_CA_EXT: &str = "crt";
const CLIENT_CERT_EXT: &str = "cert";
const CLIENT_KEY_EXT: &str = "key";

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Client-side TLS material for a registry. All three files are PEM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub root_ca: String,
    pub client_cert: String,
    pub client_key: String,
}

impl TlsConfig {
    /// Checks every file and reports all offending fields at once.
    pub fn validate(&self) -> Result<(), CompoundError> {
        let mut errs = CompoundError::new();
        for (field, path, ext) in [
            ("root_ca", &self.root_ca, ROOT_CA_EXT),
            ("client_cert", &self.client_cert, CLIENT_CERT_EXT),
            ("client_key", &self.client_key, CLIENT_KEY_EXT),
        ] {
            if let Err(e) = validate_file(path, ext) {
                errs.push(format!("{} '{}': {}", field, path, e));
            }
        }
        errs.into_result()
    }
}

fn validate_file(path: &str, ext: &str) -> Result<(), String> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err("path must be absolute".to_string());
    }
    if p.extension().and_then(|e| e.to_str()) != Some(ext) {
        return Err(format!("file extension must be .{}", ext));
    }
    let meta = std::fs::metadata(p).map_err(|e| e.to_string())?;
    if !meta.is_file() {
        return Err("not a regular file".to_string());
    }
    if meta.len() == 0 {
        return Err("file is empty".to_string());
    }
    Ok(())
}

/// Per-registry settings keyed by registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub transport: Option<TlsConfig>,
}

impl RegistryConfig {
    pub fn validate(&self, host: &str) -> Result<(), RegistryError> {
        match &self.transport {
            Some(tls) if !self.insecure => {
                tls.validate().map_err(|errors| RegistryError::InvalidTls {
                    host: host.to_string(),
                    errors,
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_valid_tls_config() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.crt");
        let cert = dir.path().join("client.cert");
        let key = dir.path().join("client.key");
        for f in [&ca, &cert, &key] {
            fs::write(f, "pem").unwrap();
        }

        let cfg = TlsConfig {
            root_ca: ca.display().to_string(),
            client_cert: cert.display().to_string(),
            client_key: key.display().to_string(),
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_every_offending_field_reported() {
        let dir = tempfile::tempdir().unwrap();
        let empty_key = dir.path().join("client.key");
        fs::write(&empty_key, "").unwrap();

        let cfg = TlsConfig {
            root_ca: "relative/ca.crt".to_string(),
            client_cert: dir.path().join("client.pem").display().to_string(),
            client_key: empty_key.display().to_string(),
        };
        let errs = cfg.validate().unwrap_err();
        assert_eq!(errs.size(), 3);
        assert!(errs.errors()[0].contains("absolute"));
        assert!(errs.errors()[1].contains(".cert"));
        assert!(errs.errors()[2].contains("empty"));
    }

    #[test]
    fn test_insecure_skips_tls_validation() {
        let cfg = RegistryConfig {
            insecure: true,
            credentials: None,
            transport: Some(TlsConfig::default()),
        };
        assert!(cfg.validate("reg.test").is_ok());

        let cfg = RegistryConfig {
            insecure: false,
            ..cfg
        };
        assert!(matches!(
            cfg.validate("reg.test"),
            Err(RegistryError::InvalidTls { .. })
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("user", "s3cret");
        assert!(!format!("{:?}", creds).contains("s3cret"));
    }
}
