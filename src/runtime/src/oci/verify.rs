//! Cross-backend reproducibility checks.
//!
//! Both images are observed through the registry protocol, so an image
//! built in a daemon has to be pushed before it can be compared.

use strata_core::error::{Result, StrataError};

use super::config::{ConfigFile, ImageManifest};
use super::layer::sha256_digest;
use super::reference::ImageReference;
use super::registry::Registry;

/// An image as served by a registry.
#[derive(Debug, Clone)]
pub struct ImageSnapshot {
    pub reference: ImageReference,
    pub manifest_digest: String,
    pub manifest: ImageManifest,
    /// Config digest, i.e. the image id
    pub config_digest: String,
    pub config: ConfigFile,
}

/// Fetch the manifest and config of `reference`.
pub async fn snapshot(registry: &dyn Registry, reference: &ImageReference) -> Result<ImageSnapshot> {
    let fetched = registry.fetch_manifest(reference).await?;
    let config_bytes = registry
        .fetch_blob(reference, &fetched.manifest.config)
        .await?;
    let config_digest = sha256_digest(&config_bytes);
    if config_digest != fetched.manifest.config.digest {
        return Err(StrataError::DigestMismatch {
            subject: format!("config of {}", reference),
            expected: fetched.manifest.config.digest.clone(),
            actual: config_digest,
        });
    }

    Ok(ImageSnapshot {
        reference: reference.clone(),
        manifest_digest: fetched.digest,
        manifest: fetched.manifest,
        config_digest,
        config: ConfigFile::from_slice(&config_bytes)?,
    })
}

/// Outcome of comparing two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReproducibilityReport {
    /// Configs equal once `created` is dropped
    pub config_equal: bool,
    pub image_ids_equal: bool,
    pub manifests_equal: bool,
    pub differences: Vec<String>,
}

impl ReproducibilityReport {
    /// Configs and image ids agree.
    pub fn is_reproducible(&self) -> bool {
        self.config_equal && self.image_ids_equal
    }
}

/// Compare two snapshots field by field.
pub fn compare(a: &ImageSnapshot, b: &ImageSnapshot) -> ReproducibilityReport {
    let mut differences = Vec::new();

    let left = a.config.without_created();
    let right = b.config.without_created();
    let config_equal = left == right;
    if !config_equal {
        if left.os != right.os || left.architecture != right.architecture {
            differences.push(format!(
                "platform: {}/{} != {}/{}",
                left.os, left.architecture, right.os, right.architecture
            ));
        }
        if left.rootfs != right.rootfs {
            differences.push(format!(
                "rootfs: {:?} != {:?}",
                left.rootfs.diff_ids, right.rootfs.diff_ids
            ));
        }
        if left.config != right.config {
            differences.push(format!(
                "config: {:?} != {:?}",
                left.config, right.config
            ));
        }
    }

    // Compared as instants so equal times in different notations agree.
    let (created_a, created_b) = (a.config.created_at(), b.config.created_at());
    if created_a != created_b {
        differences.push(format!(
            "created: {} != {}",
            a.config.created.as_deref().unwrap_or("-"),
            b.config.created.as_deref().unwrap_or("-")
        ));
    }

    let image_ids_equal = a.config_digest == b.config_digest;
    if !image_ids_equal {
        differences.push(format!(
            "image id: {} != {}",
            a.config_digest, b.config_digest
        ));
    }

    let manifests_equal = a.manifest_digest == b.manifest_digest;
    if !manifests_equal {
        differences.push(format!(
            "manifest digest: {} != {}",
            a.manifest_digest, b.manifest_digest
        ));
    }

    ReproducibilityReport {
        config_equal,
        image_ids_equal,
        manifests_equal,
        differences,
    }
}

/// Snapshot both references and fail unless they are reproductions of each other.
pub async fn verify_reproducible(
    registry: &dyn Registry,
    a: &ImageReference,
    b: &ImageReference,
) -> Result<ReproducibilityReport> {
    let left = snapshot(registry, a).await?;
    let right = snapshot(registry, b).await?;
    let report = compare(&left, &right);

    if !report.is_reproducible() {
        tracing::warn!(
            left = %a,
            right = %b,
            differences = ?report.differences,
            "Images are not reproducible"
        );
        return Err(StrataError::DigestMismatch {
            subject: format!("image {} reproduced as {}", a, b),
            expected: left.config_digest,
            actual: right.config_digest,
        });
    }

    tracing::info!(
        left = %a,
        right = %b,
        image_id = %left.config_digest,
        manifests_equal = report.manifests_equal,
        "Images are reproducible"
    );
    Ok(report)
}
