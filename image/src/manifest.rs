use crate::error::ImageError;
use berth_core::Context;
use berth_remote::{
    Descriptor, ImageConfig, ImageIndex, ImageManifest, MatchComparer, Only, OnlyStrict, Platform,
    is_index,
};
use berth_supervisor::{Image, SupervisorSpi};

/// Picks the manifest for `platform` out of `desc`.
///
/// A plain manifest is returned as is. For an index the strict match wins;
/// otherwise the best manifest the platform can still run is taken.
pub async fn platform_manifest(
    spi: &SupervisorSpi,
    ctx: &Context,
    desc: &Descriptor,
    platform: &Platform,
) -> Result<Descriptor, ImageError> {
    if !is_index(&desc.media_type) {
        return Ok(desc.clone());
    }

    let index: ImageIndex = serde_json::from_slice(&spi.read_blob(ctx, desc).await?)?;

    let strict = OnlyStrict::new(platform);
    if let Some(m) = index
        .manifests
        .iter()
        .find(|m| m.platform.as_ref().is_some_and(|p| strict.matches(p)))
    {
        return Ok(m.clone());
    }

    let lenient = Only::new(platform);
    let mut candidates: Vec<(&Descriptor, &Platform)> = index
        .manifests
        .iter()
        .filter_map(|m| m.platform.as_ref().map(|p| (m, p)))
        .filter(|(_, p)| lenient.matches(p))
        .collect();
    candidates.sort_by(|(_, a), (_, b)| {
        if lenient.less(a, b) {
            std::cmp::Ordering::Less
        } else if lenient.less(b, a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });

    candidates
        .first()
        .map(|(m, _)| (*m).clone())
        .ok_or_else(|| {
            ImageError::NoPlatformMatch(platform_string(platform), desc.digest.clone())
        })
}

pub async fn read_manifest(
    spi: &SupervisorSpi,
    ctx: &Context,
    desc: &Descriptor,
) -> Result<ImageManifest, ImageError> {
    Ok(serde_json::from_slice(&spi.read_blob(ctx, desc).await?)?)
}

/// Reads the configuration blob of `image` for the current platform.
pub async fn image_config(
    spi: &SupervisorSpi,
    ctx: &Context,
    image: &Image,
) -> Result<ImageConfig, ImageError> {
    let desc = platform_manifest(spi, ctx, &image.target, &Platform::current()).await?;
    let manifest = read_manifest(spi, ctx, &desc).await?;
    Ok(serde_json::from_slice(
        &spi.read_blob(ctx, &manifest.config).await?,
    )?)
}

fn platform_string(platform: &Platform) -> String {
    match &platform.variant {
        Some(v) => format!("{}/{}/{}", platform.os, platform.architecture, v),
        None => format!("{}/{}", platform.os, platform.architecture),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use berth_remote::{MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST};
    use berth_supervisor::SpiConfig;
    use berth_supervisor::fake::{FakeSupervisor, RecordingMounter};
    use std::sync::Arc;

    pub(crate) async fn test_spi(fake: &Arc<FakeSupervisor>) -> SupervisorSpi {
        SupervisorSpi::new(
            &Context::background(),
            fake.clone(),
            Arc::new(RecordingMounter::default()),
            SpiConfig {
                namespace: "test".to_string(),
                snapshotter: "overlayfs".to_string(),
                meta_path: std::env::temp_dir(),
                lease_id: "test.lease".to_string(),
            },
        )
        .await
        .unwrap()
    }

    fn manifest_for(digest: &str, os: &str, arch: &str, variant: Option<&str>) -> Descriptor {
        let mut d = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, digest, 100);
        d.platform = Some(Platform::new(os, arch, variant));
        d
    }

    fn index_of(fake: &FakeSupervisor, manifests: Vec<Descriptor>) -> Descriptor {
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests,
        };
        fake.add_blob("sha256:index", serde_json::to_vec(&index).unwrap());
        Descriptor::new(MEDIA_TYPE_OCI_INDEX, "sha256:index", 100)
    }

    #[tokio::test]
    async fn test_plain_manifest_is_returned() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let desc = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, "sha256:m", 10);

        let got = platform_manifest(&spi, &Context::background(), &desc, &Platform::current())
            .await
            .unwrap();
        assert_eq!(got, desc);
    }

    #[tokio::test]
    async fn test_strict_match_preferred() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let index = index_of(
            &fake,
            vec![
                manifest_for("sha256:v7", "linux", "arm", Some("v7")),
                manifest_for("sha256:arm64", "linux", "arm64", None),
            ],
        );

        let target = Platform::new("linux", "arm64", None);
        let got = platform_manifest(&spi, &Context::background(), &index, &target)
            .await
            .unwrap();
        assert_eq!(got.digest, "sha256:arm64");
    }

    #[tokio::test]
    async fn test_lenient_match_picks_closest_variant() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let index = index_of(
            &fake,
            vec![
                manifest_for("sha256:v5", "linux", "arm", Some("v5")),
                manifest_for("sha256:v7", "linux", "arm", Some("v7")),
                manifest_for("sha256:amd64", "linux", "amd64", None),
            ],
        );

        let target = Platform::new("linux", "arm64", None);
        let got = platform_manifest(&spi, &Context::background(), &index, &target)
            .await
            .unwrap();
        assert_eq!(got.digest, "sha256:v7");
    }

    #[tokio::test]
    async fn test_image_config() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, "sha256:cfg", 10),
            layers: vec![],
            annotations: Default::default(),
        };
        fake.add_blob("sha256:m", serde_json::to_vec(&manifest).unwrap());
        fake.add_blob(
            "sha256:cfg",
            br#"{"architecture":"amd64","os":"linux","config":{"Cmd":["nginx"],"Env":["A=1"]}}"#
                .to_vec(),
        );
        let image = Image::new(
            "reg.test/app:1",
            Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, "sha256:m", 10),
        );

        let cfg = image_config(&spi, &Context::background(), &image)
            .await
            .unwrap();
        let process = cfg.config.unwrap();
        assert_eq!(process.args(), vec!["nginx".to_string()]);
        assert_eq!(process.env, vec!["A=1".to_string()]);
    }

    #[tokio::test]
    async fn test_no_platform_match() {
        let fake = Arc::new(FakeSupervisor::new());
        let spi = test_spi(&fake).await;
        let index = index_of(
            &fake,
            vec![manifest_for("sha256:win", "windows", "amd64", None)],
        );

        let err = platform_manifest(
            &spi,
            &Context::background(),
            &index,
            &Platform::new("linux", "amd64", None),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImageError::NoPlatformMatch(..)));
    }
}
