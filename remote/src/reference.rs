use crate::error::RegistryError;

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_REGISTRY_ENDPOINT: &str = "registry-1.docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, RegistryError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RegistryError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        let (reference, digest) = match reference.rfind('@') {
            Some(idx) => {
                let digest = &reference[idx + 1..];
                if !digest.contains(':') {
                    return Err(RegistryError::InvalidReference(format!(
                        "invalid digest in {}",
                        reference
                    )));
                }
                (&reference[..idx], Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (reference, tag) = match reference.rfind(':') {
            Some(idx) if !reference[idx + 1..].contains('/') => {
                (&reference[..idx], Some(reference[idx + 1..].to_string()))
            }
            _ => (reference, None),
        };

        let (registry, repository) = match reference.find('/') {
            Some(first_slash) => {
                let first_part = &reference[..first_slash];
                if first_part.contains('.') || first_part.contains(':') || first_part == "localhost"
                {
                    (
                        first_part.to_string(),
                        reference[first_slash + 1..].to_string(),
                    )
                } else {
                    (DEFAULT_REGISTRY.to_string(), reference.to_string())
                }
            }
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", reference)),
        };

        if repository.is_empty() {
            return Err(RegistryError::InvalidReference(format!(
                "missing repository in {}",
                reference
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// The tag or digest to request from the registry, digest preferred.
    pub fn reference(&self) -> String {
        match &self.digest {
            Some(digest) => digest.clone(),
            None => self.tag_or_default().to_string(),
        }
    }

    pub fn is_digested(&self) -> bool {
        self.digest.is_some()
    }

    /// Host part used to look up per-registry configuration.
    pub fn host(&self) -> &str {
        &self.registry
    }

    /// Host to talk HTTP to; Docker Hub is served from a different name than
    /// the one used in references.
    pub fn endpoint(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_ENDPOINT
        } else {
            &self.registry
        }
    }

    /// `registry/repository`, no tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn full_name(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.name(), digest),
            None => format!("{}:{}", self.name(), self.tag_or_default()),
        }
    }
}

/// Strips a trailing `@digest` and `:tag` from a reference string while
/// keeping the registry port, preserving the caller's spelling otherwise.
pub fn trim_tag_and_digest(reference: &str) -> &str {
    let reference = match reference.rfind('@') {
        Some(idx) => &reference[..idx],
        None => reference,
    };
    match reference.rfind(':') {
        Some(idx) if !reference[idx + 1..].contains('/') => &reference[..idx],
        _ => reference,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, None);
        assert_eq!(r.tag_or_default(), "latest");
        assert_eq!(r.endpoint(), "registry-1.docker.io");
    }

    #[test]
    fn test_parse_with_namespace() {
        let r = ImageReference::parse("myuser/myimage:v1").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myuser/myimage");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("reg.test:5000/team/app:1").unwrap();
        assert_eq!(r.registry, "reg.test:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("1"));
        assert_eq!(r.name(), "reg.test:5000/team/app");
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse("reg.test/app@sha256:abcd").unwrap();
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(r.tag, None);
        assert!(r.is_digested());
        assert_eq!(r.reference(), "sha256:abcd");
        assert_eq!(r.full_name(), "reg.test/app@sha256:abcd");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ImageReference::parse("  ").is_err());
        assert!(ImageReference::parse("reg.test/app@nodigest").is_err());
    }

    #[test]
    fn test_trim_tag_and_digest() {
        assert_eq!(trim_tag_and_digest("reg.test/app:1"), "reg.test/app");
        assert_eq!(trim_tag_and_digest("reg.test:5000/app"), "reg.test:5000/app");
        assert_eq!(
            trim_tag_and_digest("reg.test:5000/app:1@sha256:ff"),
            "reg.test:5000/app"
        );
        assert_eq!(trim_tag_and_digest("app"), "app");
    }
}
