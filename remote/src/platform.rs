//! Platform normalization and matching for multi-arch image indexes.

use crate::types::Platform;

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
            os_version: None,
        }
    }

    /// The platform this process runs on, normalized.
    pub fn current() -> Self {
        let variant = match std::env::consts::ARCH {
            "arm" => Some("v7"),
            _ => None,
        };
        Platform::new(std::env::consts::OS, std::env::consts::ARCH, variant).normalize()
    }

    /// Canonical OCI spelling of os, architecture and variant.
    pub fn normalize(&self) -> Self {
        let os = self.os.to_lowercase();
        let variant = self.variant.as_deref().unwrap_or("").to_lowercase();
        let (arch, variant) = match self.architecture.to_lowercase().as_str() {
            "i386" => ("386".to_string(), String::new()),
            "x86_64" | "x86-64" | "amd64" => {
                let v = if variant == "v1" { String::new() } else { variant };
                ("amd64".to_string(), v)
            }
            "aarch64" | "arm64" => {
                let v = match variant.as_str() {
                    "8" | "v8" | "v8.0" => String::new(),
                    _ => variant,
                };
                ("arm64".to_string(), v)
            }
            "armhf" => ("arm".to_string(), "v7".to_string()),
            "armel" => ("arm".to_string(), "v6".to_string()),
            "arm" => {
                let v = match variant.as_str() {
                    "" | "7" => "v7".to_string(),
                    "5" | "6" | "8" => format!("v{}", variant),
                    _ => variant,
                };
                ("arm".to_string(), v)
            }
            other => (other.to_string(), variant),
        };
        Platform::new(&os, &arch, Some(&variant))
    }
}

pub trait MatchComparer: Send + Sync {
    fn matches(&self, platform: &Platform) -> bool;

    /// True when `a` is preferred over `b`.
    fn less(&self, a: &Platform, b: &Platform) -> bool;
}

/// Matches exactly one normalized platform.
#[derive(Debug, Clone)]
pub struct OnlyStrict {
    platform: Platform,
}

impl OnlyStrict {
    pub fn new(platform: &Platform) -> Self {
        Self {
            platform: platform.normalize(),
        }
    }
}

impl MatchComparer for OnlyStrict {
    fn matches(&self, platform: &Platform) -> bool {
        platform.normalize() == self.platform
    }

    fn less(&self, a: &Platform, b: &Platform) -> bool {
        self.matches(a) && !self.matches(b)
    }
}

/// Matches a platform and every platform it can run, preferring the closest
/// one (e.g. arm64 also runs arm/v8 down to arm/v5).
#[derive(Debug, Clone)]
pub struct Only {
    compatible: Vec<Platform>,
}

impl Only {
    pub fn new(platform: &Platform) -> Self {
        Self {
            compatible: compatible_platforms(&platform.normalize()),
        }
    }

    fn rank(&self, platform: &Platform) -> Option<usize> {
        let normalized = platform.normalize();
        self.compatible.iter().position(|p| *p == normalized)
    }
}

impl MatchComparer for Only {
    fn matches(&self, platform: &Platform) -> bool {
        self.rank(platform).is_some()
    }

    fn less(&self, a: &Platform, b: &Platform) -> bool {
        match (self.rank(a), self.rank(b)) {
            (Some(ra), Some(rb)) => ra < rb,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

fn compatible_platforms(platform: &Platform) -> Vec<Platform> {
    let os = platform.os.as_str();
    let variant = platform.variant.as_deref().unwrap_or("");
    let mut vector = vec![platform.clone()];

    match platform.architecture.as_str() {
        "amd64" => {
            if let Some(level) = variant_level(variant) {
                for v in (2..level).rev() {
                    vector.push(Platform::new(os, "amd64", Some(&format!("v{}", v))));
                }
                vector.push(Platform::new(os, "amd64", None));
            }
            vector.push(Platform::new(os, "386", None));
        }
        "arm64" => {
            for v in (5..=8).rev() {
                vector.push(Platform::new(os, "arm", Some(&format!("v{}", v))));
            }
        }
        "arm" => {
            if let Some(level) = variant_level(variant) {
                for v in (5..level).rev() {
                    vector.push(Platform::new(os, "arm", Some(&format!("v{}", v))));
                }
            }
        }
        _ => {}
    }

    vector
}

fn variant_level(variant: &str) -> Option<u32> {
    variant.strip_prefix('v').and_then(|v| v.parse().ok())
}
