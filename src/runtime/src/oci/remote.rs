//! Registry-backed images.
//!
//! A [`RemoteImage`] resolves its base straight from a registry and saves
//! by uploading blobs and a manifest; nothing touches a container engine.
//! Base layers are copied into the target repository when the registry
//! does not already have them there.
//!
//! A save with several names uploads every blob first and only then points
//! the names at the manifest. If one name fails, names already pointed are
//! restored to the manifest they held before the save.

use std::sync::Arc;

use async_trait::async_trait;
use strata_core::error::{Result, StrataError};

use super::config::{ConfigFile, Descriptor, ImageManifest, MEDIA_TYPE_OCI_CONFIG};
use super::image::{stage_image, target_names, Image, ImageOptions, SavedImage};
use super::layer::sha256_digest;
use super::model::{BaseImage, BaseLayer, ImageModel};
use super::reference::ImageReference;
use super::registry::{RawManifest, Registry};

/// What a target name held before a save.
struct PriorManifest {
    manifest: Option<RawManifest>,
    /// Whether the new manifest digest already existed in the repository.
    digest_existed: bool,
}

/// A name the new manifest was written under, with the digest the registry stored.
struct Published<'a> {
    target: &'a ImageReference,
    prior: &'a PriorManifest,
    digest: String,
}

/// An image that saves to a registry.
pub struct RemoteImage {
    model: ImageModel,
    registry: Arc<dyn Registry>,
    options: ImageOptions,
}

impl RemoteImage {
    /// Create a handle for `name`, resolving `options.base` from the registry.
    pub async fn new(name: &str, registry: Arc<dyn Registry>, options: ImageOptions) -> Result<Self> {
        let name = ImageReference::parse(name)?;

        let model = match options.base_reference()? {
            Some(base) => {
                let (base, config) = resolve_base(registry.as_ref(), &base).await?;
                ImageModel::from_base(name, base, &config)
            }
            None => ImageModel::scratch(
                name,
                &options.platform.os,
                &options.platform.architecture,
            ),
        };

        tracing::debug!(
            image = %model.name(),
            base = ?model.base().map(|b| b.reference.to_string()),
            base_layers = model.base_layers().len(),
            "Created remote image"
        );

        Ok(Self {
            model,
            registry,
            options,
        })
    }

    /// Make sure every base layer is present in `target`'s repository.
    async fn copy_base_layers(&self, target: &ImageReference) -> Result<()> {
        let Some(base) = self.model.base() else {
            return Ok(());
        };

        for layer in &base.layers {
            let Some(descriptor) = &layer.descriptor else {
                continue;
            };
            if self.registry.blob_exists(target, &descriptor.digest).await? {
                continue;
            }

            let data = self
                .registry
                .fetch_blob(&base.reference, descriptor)
                .await
                .map_err(|e| StrataError::BaseResolutionFailed {
                    reference: base.reference.to_string(),
                    message: format!("Failed to fetch layer {}: {}", descriptor.digest, e),
                })?;
            let actual = sha256_digest(&data);
            if actual != descriptor.digest {
                return Err(StrataError::DigestMismatch {
                    subject: format!("base layer from {}", base.reference),
                    expected: descriptor.digest.clone(),
                    actual,
                });
            }

            tracing::debug!(
                image = %target,
                digest = %descriptor.digest,
                "Copying base layer"
            );
            self.push_blob(target, &data, &descriptor.digest).await?;
        }
        Ok(())
    }

    async fn push_blob_if_missing(&self, target: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        if self.registry.blob_exists(target, digest).await? {
            tracing::trace!(image = %target, digest, "Blob already present");
            return Ok(());
        }
        self.push_blob(target, data, digest).await
    }

    async fn push_blob(&self, target: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        self.registry
            .push_blob(target, data, digest)
            .await
            .map_err(|e| rejected(target, e))
    }

    async fn prior_manifest(&self, target: &ImageReference, digest: &str) -> Result<PriorManifest> {
        let manifest = self
            .registry
            .fetch_raw_manifest(target)
            .await
            .map_err(|e| rejected(target, e))?;
        let digest_existed = match &manifest {
            Some(m) if m.digest == digest => true,
            _ => self
                .registry
                .find_manifest_digest(&target.with_digest(digest))
                .await
                .map_err(|e| rejected(target, e))?
                .is_some(),
        };
        Ok(PriorManifest {
            manifest,
            digest_existed,
        })
    }

    /// Put every published name back the way it was before the save.
    async fn roll_back(&self, published: &[Published<'_>]) {
        for entry in published.iter().rev() {
            let result = match &entry.prior.manifest {
                Some(prior) if prior.digest == entry.digest => Ok(()),
                Some(prior) => self
                    .registry
                    .push_manifest(entry.target, &prior.bytes, &prior.media_type)
                    .await
                    .map(|_| ()),
                None if entry.prior.digest_existed => Ok(()),
                None => self
                    .registry
                    .delete_manifest(entry.target, &entry.digest)
                    .await,
            };
            match result {
                Ok(()) => tracing::info!(image = %entry.target, "Rolled back manifest"),
                Err(e) => tracing::warn!(
                    image = %entry.target,
                    error = %e,
                    "Failed to roll back manifest"
                ),
            }
        }
    }
}

fn rejected(target: &ImageReference, error: StrataError) -> StrataError {
    StrataError::PushRejected {
        reference: target.to_string(),
        message: error.to_string(),
    }
}

/// Fetch the base manifest and config; pair layer descriptors with diff ids.
async fn resolve_base(
    registry: &dyn Registry,
    reference: &ImageReference,
) -> Result<(BaseImage, ConfigFile)> {
    let failed = |message: String| StrataError::BaseResolutionFailed {
        reference: reference.to_string(),
        message,
    };

    let fetched = registry
        .fetch_manifest(reference)
        .await
        .map_err(|e| failed(e.to_string()))?;
    let config_bytes = registry
        .fetch_blob(reference, &fetched.manifest.config)
        .await
        .map_err(|e| failed(format!("Failed to fetch config: {}", e)))?;
    let config = ConfigFile::from_slice(&config_bytes)
        .map_err(|e| failed(format!("Invalid config: {}", e)))?;

    if config.rootfs.diff_ids.len() != fetched.manifest.layers.len() {
        return Err(failed(format!(
            "manifest has {} layers but config lists {} diff ids",
            fetched.manifest.layers.len(),
            config.rootfs.diff_ids.len()
        )));
    }

    let layers = fetched
        .manifest
        .layers
        .iter()
        .zip(&config.rootfs.diff_ids)
        .map(|(descriptor, diff_id)| BaseLayer {
            diff_id: diff_id.clone(),
            descriptor: Some(descriptor.clone()),
        })
        .collect();

    tracing::info!(
        base = %reference,
        digest = %fetched.digest,
        "Resolved base image from registry"
    );

    Ok((
        BaseImage {
            reference: reference.clone(),
            digest: Some(fetched.digest),
            layers,
        },
        config,
    ))
}

#[async_trait]
impl Image for RemoteImage {
    fn model(&self) -> &ImageModel {
        &self.model
    }

    fn model_mut(&mut self) -> &mut ImageModel {
        &mut self.model
    }

    async fn found(&self) -> Result<bool> {
        let digest = self.registry.find_manifest_digest(self.model.name()).await?;
        Ok(digest.is_some())
    }

    async fn identifier(&self) -> Result<String> {
        self.registry.manifest_digest(self.model.name()).await
    }

    async fn save_as(&mut self, additional_names: &[ImageReference]) -> Result<SavedImage> {
        let staged = stage_image(&self.model, &self.options).await?;

        let layers: Vec<Descriptor> = self
            .model
            .base_layers()
            .iter()
            .filter_map(|l| l.descriptor.clone())
            .chain(staged.layers.iter().map(|l| l.descriptor()))
            .collect();
        let config_descriptor = Descriptor::new(
            MEDIA_TYPE_OCI_CONFIG,
            staged.config_digest.clone(),
            staged.config_bytes.len() as u64,
        );
        let manifest = ImageManifest::new(config_descriptor, layers);
        let (manifest_bytes, manifest_digest) = manifest.encode()?;

        let names = target_names(self.model.name(), additional_names);
        for target in &names {
            self.copy_base_layers(target).await?;
            for layer in &staged.layers {
                self.push_blob_if_missing(target, &layer.read_blob().await?, &layer.digest)
                    .await?;
            }
            self.push_blob_if_missing(target, &staged.config_bytes, &staged.config_digest)
                .await?;
        }

        let mut priors = Vec::with_capacity(names.len());
        for target in &names {
            priors.push(self.prior_manifest(target, &manifest_digest).await?);
        }

        let mut published = Vec::with_capacity(names.len());
        for (target, prior) in names.iter().zip(&priors) {
            let failure = match self
                .registry
                .push_manifest(target, &manifest_bytes, manifest.content_type())
                .await
            {
                Ok(pushed) if pushed == manifest_digest => {
                    tracing::info!(
                        image = %target,
                        digest = %manifest_digest,
                        image_id = %staged.config_digest,
                        "Saved image to registry"
                    );
                    published.push(Published {
                        target,
                        prior,
                        digest: pushed,
                    });
                    continue;
                }
                Ok(pushed) => {
                    published.push(Published {
                        target,
                        prior,
                        digest: pushed.clone(),
                    });
                    StrataError::DigestMismatch {
                        subject: format!("manifest {}", target),
                        expected: manifest_digest.clone(),
                        actual: pushed,
                    }
                }
                Err(e) => rejected(target, e),
            };

            self.roll_back(&published).await;
            return Err(failure);
        }

        self.model.mark_clean();
        Ok(SavedImage {
            name: self.model.name().clone(),
            additional_names: names.iter().skip(1).cloned().collect(),
            image_id: staged.config_digest,
            digest: Some(manifest_digest),
            config: staged.config,
        })
    }
}
