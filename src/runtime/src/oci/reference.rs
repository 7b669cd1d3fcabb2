//! Image reference parsing.
//!
//! Parses references like `localhost:5000/app:v1` or `busybox@sha256:...` into
//! structured components. Validation is weak: registry hostnames are not
//! required to be fully qualified, and digests only need an `algorithm:hex` shape.

use strata_core::error::{Result, StrataError};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Host that actually serves the Docker Hub distribution API.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, optionally with port (e.g., "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/busybox")
    pub repository: String,
    /// Tag (e.g., "latest")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:915f...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `busybox` → docker.io/library/busybox:latest
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `busybox@sha256:abc...` → docker.io/library/busybox@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StrataError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest = &reference[at_pos + 1..];
                validate_digest(reference, digest)?;
                (&reference[..at_pos], Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry_repository(reference, name)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The digest if pinned, otherwise the tag.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Registry and repository without tag or digest.
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Host serving the distribution API for this registry.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY || self.registry == "index.docker.io" {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Whether both references name the same repository on the same registry.
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.context();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `name[:tag]`, where a colon in the first path segment followed only
/// by digits is a registry port rather than a tag.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    let last_segment = &name_tag[last_segment_start..];

    match last_segment.rfind(':') {
        Some(colon) => {
            let candidate = &last_segment[colon + 1..];
            let is_port = last_segment_start == 0
                && !candidate.is_empty()
                && candidate.chars().all(|c| c.is_ascii_digit());
            if is_port {
                (name_tag, None)
            } else {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(&name_tag[split + 1..]))
            }
        }
        None => (name_tag, None),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    let (registry, repository) = match name.find('/') {
        Some(slash_pos) => {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                (first.to_string(), name[slash_pos + 1..].to_string())
            } else {
                (DEFAULT_REGISTRY.to_string(), name.to_string())
            }
        }
        // Single name like "busybox" → "library/busybox" for Docker Hub
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
    };

    validate_repository(reference, &repository)?;
    Ok((registry, repository))
}

fn validate_repository(reference: &str, repository: &str) -> Result<()> {
    let valid = !repository.is_empty()
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component.chars().all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
                })
        });
    if valid {
        Ok(())
    } else {
        Err(StrataError::InvalidReference(format!(
            "Invalid repository '{}' in reference '{}'",
            repository, reference
        )))
    }
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StrataError::InvalidReference(format!(
            "Invalid tag '{}' in reference '{}'",
            tag, reference
        )))
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    match digest.split_once(':') {
        Some((algorithm, hex))
            if !algorithm.is_empty()
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Ok(())
        }
        _ => Err(StrataError::InvalidReference(format!(
            "Invalid digest format in reference '{}': expected algorithm:hex",
            reference
        ))),
    }
}
