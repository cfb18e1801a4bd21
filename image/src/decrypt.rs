use crate::error::ImageError;
use crate::jwe;
use crate::manifest::{platform_manifest, read_manifest};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use berth_core::{CompoundError, Context};
use berth_remote::{Platform, is_encrypted_layer};
use berth_supervisor::{DecryptPayload, Image, SupervisorSpi};
use p256::pkcs8::DecodePrivateKey;
use std::path::Path;
use tracing::debug;

pub const JWE_ANNOTATION: &str = "org.opencontainers.image.enc.keys.jwe";
pub const PKCS7_ANNOTATION: &str = "org.opencontainers.image.enc.keys.pkcs7";
pub const PGP_ANNOTATION: &str = "org.opencontainers.image.enc.keys.pgp";

const PASSWORD_SEPARATOR: &str = ":pass=";
const RECIPIENT_SCHEMES: [&str; 4] = ["jwe", "pkcs7", "pgp", "provider"];

#[derive(Clone)]
struct PrivateKey {
    source: String,
    pem: Vec<u8>,
    password: Option<Vec<u8>>,
    certificate: bool,
    ec: Option<p256::SecretKey>,
}

impl PrivateKey {
    fn parse(reference: &str) -> Result<Self, ImageError> {
        let (source, pem, password) = if reference.trim_start().starts_with("-----BEGIN") {
            ("<inline>".to_string(), reference.as_bytes().to_vec(), None)
        } else {
            let (path, password) = match reference.split_once(PASSWORD_SEPARATOR) {
                Some((path, pass)) => (path, Some(pass.as_bytes().to_vec())),
                None => (reference, None),
            };
            let pem = std::fs::read(Path::new(path)).map_err(|e| ImageError::InvalidKey {
                key: path.to_string(),
                reason: e.to_string(),
            })?;
            (path.to_string(), pem, password)
        };

        let text = String::from_utf8_lossy(&pem).into_owned();
        if !text.contains("-----BEGIN") {
            return Err(ImageError::InvalidKey {
                key: source,
                reason: "not a PEM document".to_string(),
            });
        }
        let certificate = text.contains("-----BEGIN CERTIFICATE");
        let ec = if password.is_none() && !certificate {
            p256::SecretKey::from_pkcs8_pem(&text)
                .ok()
                .or_else(|| p256::SecretKey::from_sec1_pem(&text).ok())
        } else {
            None
        };

        Ok(Self {
            source,
            pem,
            password,
            certificate,
            ec,
        })
    }
}

/// Key material used to unpack encrypted layers.
#[derive(Clone)]
pub struct DecryptConfig {
    keys: Vec<PrivateKey>,
    recipients: Vec<String>,
}

impl std::fmt::Debug for DecryptConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sources: Vec<&str> = self.keys.iter().map(|k| k.source.as_str()).collect();
        f.debug_struct("DecryptConfig")
            .field("keys", &sources)
            .field("recipients", &self.recipients)
            .finish()
    }
}

impl DecryptConfig {
    /// Builds a config from key references (`<path>[:pass=<password>]` or
    /// inline PEM) and `<scheme>:<value>` recipients. Returns `None` when
    /// both lists are empty.
    pub fn new(keys: &[String], recipients: &[String]) -> Result<Option<Self>, ImageError> {
        if keys.is_empty() && recipients.is_empty() {
            return Ok(None);
        }

        let keys = keys
            .iter()
            .map(|k| PrivateKey::parse(k))
            .collect::<Result<Vec<_>, _>>()?;

        for recipient in recipients {
            match recipient.split_once(':') {
                Some((scheme, value)) if RECIPIENT_SCHEMES.contains(&scheme) && !value.is_empty() => {}
                _ => return Err(ImageError::InvalidRecipient(recipient.clone())),
            }
        }

        Ok(Some(Self {
            keys,
            recipients: recipients.to_vec(),
        }))
    }

    /// Per-image material wins over the process defaults.
    pub fn resolve(
        overrides: Option<&DecryptConfig>,
        defaults: Option<&DecryptConfig>,
    ) -> Option<DecryptConfig> {
        overrides.or(defaults).cloned()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn to_payload(&self) -> DecryptPayload {
        let mut payload = DecryptPayload::default();
        for key in &self.keys {
            if key.certificate {
                payload
                    .parameters
                    .entry("x509s".to_string())
                    .or_default()
                    .push(key.pem.clone());
                continue;
            }
            payload
                .parameters
                .entry("privkeys".to_string())
                .or_default()
                .push(key.pem.clone());
            payload
                .parameters
                .entry("privkeys-passwords".to_string())
                .or_default()
                .push(key.password.clone().unwrap_or_default());
        }
        payload
    }

    fn ec_keys(&self) -> impl Iterator<Item = &p256::SecretKey> {
        self.keys.iter().filter_map(|k| k.ec.as_ref())
    }
}

/// Checks that `cfg` can open every encrypted layer of the platform
/// manifest of `image`.
pub async fn check_authorization(
    spi: &SupervisorSpi,
    ctx: &Context,
    image: &Image,
    cfg: &DecryptConfig,
) -> Result<(), ImageError> {
    let desc = platform_manifest(spi, ctx, &image.target, &Platform::current()).await?;
    let manifest = read_manifest(spi, ctx, &desc).await?;

    let mut errors = CompoundError::new();
    for layer in manifest
        .layers
        .iter()
        .filter(|l| is_encrypted_layer(&l.media_type))
    {
        if let Some(wrapped) = layer.annotations.get(JWE_ANNOTATION) {
            if !unwraps_any(wrapped, cfg) {
                errors.push(format!(
                    "layer {}: no configured key can unwrap it",
                    layer.digest
                ));
            }
        } else if layer.annotations.contains_key(PKCS7_ANNOTATION) {
            errors.push(format!(
                "layer {}: pkcs7 key wrapping is not supported",
                layer.digest
            ));
        } else if layer.annotations.contains_key(PGP_ANNOTATION) {
            errors.push(format!(
                "layer {}: pgp key wrapping is not supported",
                layer.digest
            ));
        } else {
            errors.push(format!("layer {}: no wrapped keys", layer.digest));
        }
    }

    errors.into_result().map_err(|errors| ImageError::Unauthorized {
        image: image.name.clone(),
        errors,
    })
}

fn unwraps_any(annotation: &str, cfg: &DecryptConfig) -> bool {
    for encoded in annotation.split(',').filter(|s| !s.is_empty()) {
        let raw = match STANDARD.decode(encoded) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Skipping undecodable wrapped key: {}", e);
                continue;
            }
        };
        for key in cfg.ec_keys() {
            match jwe::unwrap(&raw, key) {
                Ok(_) => return true,
                Err(e) => debug!("Key did not unwrap layer: {}", e),
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwe::tests::seal_for;
    use crate::manifest::tests::test_spi;
    use berth_remote::{
        Descriptor, ImageManifest, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_ENC,
        MEDIA_TYPE_OCI_MANIFEST,
    };
    use berth_supervisor::fake::FakeSupervisor;
    use p256::pkcs8::EncodePrivateKey;
    use std::sync::Arc;

    fn key_file(dir: &Path, name: &str, seed: u8) -> (String, p256::SecretKey) {
        let key = p256::SecretKey::from_slice(&[seed; 32]).unwrap();
        let pem = key.to_pkcs8_pem(p256::pkcs8::LineEnding::LF).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, pem.as_bytes()).unwrap();
        (path.to_string_lossy().into_owned(), key)
    }

    fn encrypted_image(fake: &FakeSupervisor, annotations: Vec<(&str, String)>) -> Image {
        let mut layer = Descriptor::new(MEDIA_TYPE_OCI_LAYER_ENC, "sha256:layer", 10);
        for (k, v) in annotations {
            layer.annotations.insert(k.to_string(), v);
        }
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, "sha256:config", 2),
            layers: vec![layer],
            annotations: Default::default(),
        };
        fake.add_blob("sha256:manifest", serde_json::to_vec(&manifest).unwrap());
        Image::new(
            "reg.test/enc:1",
            Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, "sha256:manifest", 100),
        )
    }

    #[test]
    fn test_empty_config_is_none() {
        assert!(DecryptConfig::new(&[], &[]).unwrap().is_none());
    }

    #[test]
    fn test_missing_key_file() {
        let err = DecryptConfig::new(&["/nonexistent/key.pem".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ImageError::InvalidKey { ref key, .. } if key == "/nonexistent/key.pem"));
    }

    #[test]
    fn test_non_pem_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, b"garbage").unwrap();
        let err = DecryptConfig::new(&[path.to_string_lossy().into_owned()], &[]).unwrap_err();
        assert!(err.to_string().contains("not a PEM document"));
    }

    #[test]
    fn test_recipients_validated() {
        assert!(DecryptConfig::new(&[], &["jwe:/keys/pub.pem".to_string()]).is_ok());
        let err = DecryptConfig::new(&[], &["smtp:someone".to_string()]).unwrap_err();
        assert!(matches!(err, ImageError::InvalidRecipient(_)));
        assert!(DecryptConfig::new(&[], &["pgp:".to_string()]).is_err());
    }

    #[test]
    fn test_payload_carries_passwords() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = key_file(dir.path(), "a.pem", 1);
        let cfg = DecryptConfig::new(&[format!("{}:pass=hunter2", path)], &[])
            .unwrap()
            .unwrap();

        let payload = cfg.to_payload();
        assert_eq!(payload.parameters["privkeys"].len(), 1);
        assert_eq!(payload.parameters["privkeys-passwords"], vec![b"hunter2".to_vec()]);
        assert!(!format!("{:?}", payload).contains("hunter2"));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let defaults = DecryptConfig::new(&[], &["pgp:a@b".to_string()]).unwrap();
        let overrides = DecryptConfig::new(&[], &["pgp:c@d".to_string()]).unwrap();
        let got = DecryptConfig::resolve(overrides.as_ref(), defaults.as_ref()).unwrap();
        assert_eq!(got.recipients(), ["pgp:c@d".to_string()]);
        let got = DecryptConfig::resolve(None, defaults.as_ref()).unwrap();
        assert_eq!(got.recipients(), ["pgp:a@b".to_string()]);
    }

    #[tokio::test]
    async fn test_authorized_with_matching_key() {
        let dir = tempfile::tempdir().unwrap();
        let (path, key) = key_file(dir.path(), "a.pem", 7);
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let wrapped = STANDARD.encode(seal_for(&key.public_key(), b"{}"));
        let image = encrypted_image(&fake, vec![(JWE_ANNOTATION, wrapped)]);

        let cfg = DecryptConfig::new(&[path], &[]).unwrap().unwrap();
        check_authorization(&spi, &Context::background(), &image, &cfg)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_with_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let (_, owner) = key_file(dir.path(), "owner.pem", 7);
        let (other, _) = key_file(dir.path(), "other.pem", 8);
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let wrapped = STANDARD.encode(seal_for(&owner.public_key(), b"{}"));
        let image = encrypted_image(&fake, vec![(JWE_ANNOTATION, wrapped)]);

        let cfg = DecryptConfig::new(&[other], &[]).unwrap().unwrap();
        let err = check_authorization(&spi, &Context::background(), &image, &cfg)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), berth_core::ErrorKind::Auth);
        match err {
            ImageError::Unauthorized { image, errors } => {
                assert_eq!(image, "reg.test/enc:1");
                assert_eq!(errors.size(), 1);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_pkcs7_layer_names_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = key_file(dir.path(), "a.pem", 7);
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let image = encrypted_image(&fake, vec![(PKCS7_ANNOTATION, "MIIB".to_string())]);

        let cfg = DecryptConfig::new(&[path], &[]).unwrap().unwrap();
        let err = check_authorization(&spi, &Context::background(), &image, &cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pkcs7"));
    }
}
