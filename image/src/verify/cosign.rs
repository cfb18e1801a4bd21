use super::VerificationKey;
use crate::error::ImageError;
use crate::manifest::{platform_manifest, read_manifest};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use berth_core::{CompoundError, Context};
use berth_remote::{HostsResolver, Platform, trim_tag_and_digest};
use berth_supervisor::{Image, SupervisorSpi};
use serde::Deserialize;
use tracing::{debug, warn};

pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";
const SIGNATURE_SUFFIX: &str = ".sig";

/// `<name>:<algo>-<hex>.sig` for the image `name` with manifest `digest`.
pub fn signature_reference(name: &str, digest: &str) -> Result<String, ImageError> {
    let (algo, hex) = digest
        .split_once(':')
        .ok_or_else(|| ImageError::InvalidSignature(format!("malformed digest {:?}", digest)))?;
    Ok(format!(
        "{}:{}-{}{}",
        trim_tag_and_digest(name),
        algo,
        hex,
        SIGNATURE_SUFFIX
    ))
}

#[derive(Debug, Deserialize)]
struct SimpleSigning {
    critical: Critical,
}

#[derive(Debug, Deserialize)]
struct Critical {
    image: CriticalImage,
}

#[derive(Debug, Deserialize)]
struct CriticalImage {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: String,
}

/// Checks inline signatures stored next to the image in the registry.
#[derive(Debug, Clone)]
pub struct CosignVerifier {
    keys: Vec<VerificationKey>,
}

impl CosignVerifier {
    pub fn new(keys: Vec<VerificationKey>) -> Self {
        Self { keys }
    }

    pub async fn verify(
        &self,
        ctx: &Context,
        spi: &SupervisorSpi,
        image: &Image,
        resolver: Option<HostsResolver>,
    ) -> Result<(), ImageError> {
        if !image.name.contains('@') {
            warn!(image = %image.name, "verifying signature of a tag reference");
        }
        let reference = signature_reference(&image.name, &image.target.digest)?;

        let sig_image = match spi.get_image(ctx, &reference).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => spi.fetch_image(ctx, &reference, resolver).await?,
            Err(e) => return Err(e.into()),
        };

        let desc = platform_manifest(spi, ctx, &sig_image.target, &Platform::current()).await?;
        let manifest = read_manifest(spi, ctx, &desc).await?;

        let mut signatures = Vec::new();
        for layer in &manifest.layers {
            let Some(encoded) = layer.annotations.get(SIGNATURE_ANNOTATION) else {
                continue;
            };
            let blob = spi.read_blob(ctx, layer).await?;
            signatures.push((blob, STANDARD.decode(encoded)?));
        }

        if signatures.is_empty() {
            warn!(image = %image.name, signature = %reference, "no signatures found, skipping verification");
            return Ok(());
        }

        let mut errors = CompoundError::new();
        for key in &self.keys {
            for (payload, signature) in &signatures {
                match check(key, payload, signature, &image.target.digest) {
                    Ok(()) => {
                        debug!(image = %image.name, key = %key.path().display(), "signature verified");
                        return Ok(());
                    }
                    Err(e) => errors.push(format!("{}: {}", key.path().display(), e)),
                }
            }
        }

        Err(ImageError::VerificationFailed {
            image: image.name.clone(),
            errors,
        })
    }
}

fn check(
    key: &VerificationKey,
    payload: &[u8],
    signature: &[u8],
    digest: &str,
) -> Result<(), ImageError> {
    key.verify(payload, signature)?;
    let signed: SimpleSigning = serde_json::from_slice(payload)?;
    if signed.critical.image.docker_manifest_digest != digest {
        return Err(ImageError::InvalidSignature(format!(
            "signature is for {}, not {}",
            signed.critical.image.docker_manifest_digest, digest
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::test_spi;
    use crate::verify::HashFunction;
    use crate::verify::tests::{sign, verification_key};
    use berth_remote::{
        Descriptor, ImageIndex, ImageManifest, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_OCI_MANIFEST,
    };
    use berth_supervisor::fake::FakeSupervisor;
    use std::sync::Arc;

    const IMAGE_DIGEST: &str = "sha256:aaaa";
    const SIG_REF: &str = "reg.test/app:sha256-aaaa.sig";

    fn payload(digest: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "critical": {
                "identity": {"docker-reference": "reg.test/app"},
                "image": {"docker-manifest-digest": digest},
                "type": "cosign container image signature",
            },
            "optional": null,
        }))
        .unwrap()
    }

    fn signature_manifest(fake: &FakeSupervisor, layers: Vec<(Vec<u8>, Vec<u8>)>) -> Descriptor {
        let mut descs = Vec::new();
        for (i, (blob, sig)) in layers.into_iter().enumerate() {
            let digest = format!("sha256:sig{}", i);
            fake.add_blob(&digest, blob);
            let mut d = Descriptor::new(
                "application/vnd.dev.cosign.simplesigning.v1+json",
                &digest,
                1,
            );
            d.annotations
                .insert(SIGNATURE_ANNOTATION.to_string(), STANDARD.encode(sig));
            descs.push(d);
        }
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, "sha256:cfg", 2),
            layers: descs,
            annotations: Default::default(),
        };
        fake.add_blob("sha256:sigmanifest", serde_json::to_vec(&manifest).unwrap());
        Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, "sha256:sigmanifest", 100)
    }

    fn image() -> Image {
        Image::new(
            "reg.test/app:1",
            Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, IMAGE_DIGEST, 10),
        )
    }

    #[test]
    fn test_signature_reference() {
        assert_eq!(
            signature_reference("reg.test/app:1", "sha256:abc").unwrap(),
            "reg.test/app:sha256-abc.sig"
        );
        assert_eq!(
            signature_reference("reg.test:5000/app@sha256:abc", "sha256:abc").unwrap(),
            "reg.test:5000/app:sha256-abc.sig"
        );
        assert!(signature_reference("reg.test/app", "nodigest").is_err());
    }

    #[tokio::test]
    async fn test_valid_signature_passes() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let body = payload(IMAGE_DIGEST);
        let sig = sign(1, HashFunction::Sha256, &body);
        let target = signature_manifest(&fake, vec![(body, sig)]);
        fake.add_image(Image::new(SIG_REF, target), false);

        let verifier = CosignVerifier::new(vec![
            verification_key(9, HashFunction::Sha256),
            verification_key(1, HashFunction::Sha256),
        ]);
        verifier
            .verify(&Context::background(), &spi, &image(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signature_image_pulled_on_miss() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let body = payload(IMAGE_DIGEST);
        let sig = sign(1, HashFunction::Sha256, &body);
        let target = signature_manifest(&fake, vec![(body, sig)]);
        fake.add_remote_image(Image::new(SIG_REF, target));

        CosignVerifier::new(vec![verification_key(1, HashFunction::Sha256)])
            .verify(&Context::background(), &spi, &image(), None)
            .await
            .unwrap();
        let pulls = fake.pulls();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].name, SIG_REF);
        assert!(!pulls[0].unpack);
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let body = payload("sha256:bbbb");
        let sig = sign(1, HashFunction::Sha256, &body);
        let target = signature_manifest(&fake, vec![(body, sig)]);
        fake.add_image(Image::new(SIG_REF, target), false);

        let err = CosignVerifier::new(vec![verification_key(1, HashFunction::Sha256)])
            .verify(&Context::background(), &spi, &image(), None)
            .await
            .unwrap_err();
        match err {
            ImageError::VerificationFailed { errors, .. } => {
                assert_eq!(errors.size(), 1);
                assert!(errors.errors()[0].contains("sha256:bbbb"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_failures_collected_per_key() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let body = payload(IMAGE_DIGEST);
        let sig = sign(1, HashFunction::Sha256, &body);
        let target = signature_manifest(&fake, vec![(body, sig)]);
        fake.add_image(Image::new(SIG_REF, target), false);

        let err = CosignVerifier::new(vec![
            verification_key(2, HashFunction::Sha256),
            verification_key(3, HashFunction::Sha256),
        ])
        .verify(&Context::background(), &spi, &image(), None)
        .await
        .unwrap_err();
        assert_eq!(err.kind(), berth_core::ErrorKind::Auth);
        assert!(matches!(err, ImageError::VerificationFailed { ref errors, .. } if errors.size() == 2));
    }

    #[tokio::test]
    async fn test_no_signatures_skips() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let target = signature_manifest(&fake, vec![]);
        fake.add_image(Image::new(SIG_REF, target), false);

        CosignVerifier::new(vec![verification_key(1, HashFunction::Sha256)])
            .verify(&Context::background(), &spi, &image(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_multi_arch_signature_uses_platform_manifest() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let body = payload(IMAGE_DIGEST);
        let sig = sign(1, HashFunction::Sha256, &body);
        let mut manifest = signature_manifest(&fake, vec![(body, sig)]);
        manifest.platform = Some(Platform::current());
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: vec![manifest],
        };
        fake.add_blob("sha256:sigindex", serde_json::to_vec(&index).unwrap());
        fake.add_image(
            Image::new(
                SIG_REF,
                Descriptor::new(MEDIA_TYPE_OCI_INDEX, "sha256:sigindex", 100),
            ),
            false,
        );

        CosignVerifier::new(vec![verification_key(1, HashFunction::Sha256)])
            .verify(&Context::background(), &spi, &image(), None)
            .await
            .unwrap();
    }
}
