use crate::error::ImageError;
use async_trait::async_trait;
use berth_core::Context;
use berth_remote::{ImageReference, RegistryResolver, RemoteRepository};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const CONFIG_DIR_KEY: &str = "config_dir";
pub const LIBEXEC_DIR_KEY: &str = "libexec_dir";
const BINARY_KEY: &str = "binary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationLevel {
    Strict,
    Permissive,
    Audit,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationAction {
    Enforce,
    Log,
    Skip,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub check: String,
    pub action: ValidationAction,
    pub error: Option<String>,
}

/// Result of verifying the reference against one signature.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub level: VerificationLevel,
    pub results: Vec<ValidationResult>,
    pub error: Option<String>,
}

impl VerificationOutcome {
    pub fn passed(level: VerificationLevel) -> Self {
        Self {
            level,
            results: Vec::new(),
            error: None,
        }
    }
}

#[async_trait]
pub trait NotationRunner: Send + Sync {
    async fn verify(
        &self,
        ctx: &Context,
        reference: &str,
    ) -> Result<Vec<VerificationOutcome>, ImageError>;
}

/// Runs the `notation` binary with its configuration and plugin
/// directories taken from the verifier config.
#[derive(Debug, Clone)]
pub struct NotationCli {
    binary: PathBuf,
    config_dir: PathBuf,
    libexec_dir: PathBuf,
}

impl NotationCli {
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self, ImageError> {
        let dir = |key: &str| {
            config
                .get(key)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .ok_or_else(|| ImageError::InvalidVerifierConfig(format!("{} is required", key)))
        };
        Ok(Self {
            binary: config
                .get(BINARY_KEY)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("notation")),
            config_dir: dir(CONFIG_DIR_KEY)?,
            libexec_dir: dir(LIBEXEC_DIR_KEY)?,
        })
    }
}

#[async_trait]
impl NotationRunner for NotationCli {
    async fn verify(
        &self,
        ctx: &Context,
        reference: &str,
    ) -> Result<Vec<VerificationOutcome>, ImageError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("verify")
            .arg(reference)
            .env("NOTATION_CONFIG", &self.config_dir)
            .env("NOTATION_LIBEXEC", &self.libexec_dir)
            .kill_on_drop(true);
        debug!("Running {:?}", cmd);

        let output = ctx
            .run(async { cmd.output().await.map_err(ImageError::from) })
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Ok(vec![VerificationOutcome {
                level: VerificationLevel::Strict,
                results: Vec::new(),
                error: Some(stderr.trim().to_string()),
            }]);
        }

        let results = stderr
            .lines()
            .filter_map(|l| l.strip_prefix("Warning:"))
            .map(|w| ValidationResult {
                check: "notation".to_string(),
                action: ValidationAction::Log,
                error: Some(w.trim().to_string()),
            })
            .collect();
        Ok(vec![VerificationOutcome {
            level: VerificationLevel::Strict,
            results,
            error: None,
        }])
    }
}

/// Verifies detached signatures kept in the registry by an external
/// verifier.
#[derive(Clone)]
pub struct NotationVerifier {
    runner: Arc<dyn NotationRunner>,
    registry: Arc<RegistryResolver>,
}

impl NotationVerifier {
    pub fn new(runner: Arc<dyn NotationRunner>, registry: Arc<RegistryResolver>) -> Self {
        Self { runner, registry }
    }

    pub async fn verify(&self, ctx: &Context, image_ref: &str) -> Result<(), ImageError> {
        let reference = ImageReference::parse(image_ref)?;
        let digest = match &reference.digest {
            Some(digest) => digest.clone(),
            None => {
                warn!(image = %image_ref, "verifying a tag reference, resolving it to a digest first");
                let hosts = self.registry.hosts(reference.host())?;
                let repo = RemoteRepository::new(reference.clone(), hosts);
                ctx.run(async { repo.resolve().await.map_err(ImageError::from) })
                    .await?
                    .digest
            }
        };

        let artifact = format!("{}@{}", reference.name(), digest);
        let outcomes = self.runner.verify(ctx, &artifact).await?;
        evaluate(&artifact, &outcomes)
    }
}

fn evaluate(reference: &str, outcomes: &[VerificationOutcome]) -> Result<(), ImageError> {
    for outcome in outcomes {
        if outcome.level == VerificationLevel::Skip {
            info!(image = %reference, "signature verification skipped by trust policy");
            continue;
        }
        if let Some(err) = &outcome.error {
            return Err(ImageError::Notation {
                reference: reference.to_string(),
                reason: err.clone(),
            });
        }
        for result in &outcome.results {
            if result.action == ValidationAction::Log {
                if let Some(err) = &result.error {
                    warn!(image = %reference, check = %result.check, "{}", err);
                }
            }
        }
    }
    Ok(())
}
