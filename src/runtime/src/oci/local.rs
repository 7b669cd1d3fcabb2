//! Daemon-backed images.
//!
//! A [`LocalImage`] resolves its base from a container engine, pulling it
//! when absent, and saves by loading a `docker save` archive. Base layers go
//! into the archive as placeholders since the engine already holds them.
//!
//! When tagging one of several names fails, names already tagged go back to
//! the image they pointed at before, and a freshly loaded image is removed.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use strata_core::error::{Result, StrataError};

use super::archive::{read_docker_archive, write_docker_archive, ArchiveLayer, LayerContent};
use super::config::ConfigFile;
use super::daemon::Daemon;
use super::image::{stage_image, target_names, Image, ImageOptions, SavedImage};
use super::layer::{decompress_layer, is_gzip, sha256_digest, LayerStore};
use super::model::{BaseImage, BaseLayer, ImageModel};
use super::reference::ImageReference;

/// An image that saves into a container engine.
pub struct LocalImage {
    model: ImageModel,
    daemon: Arc<dyn Daemon>,
    options: ImageOptions,
}

impl LocalImage {
    /// Create a handle for `name`, resolving `options.base` through the engine.
    pub async fn new(name: &str, daemon: Arc<dyn Daemon>, options: ImageOptions) -> Result<Self> {
        let name = ImageReference::parse(name)?;

        let model = match options.base_reference()? {
            Some(base) => {
                let (base, config) = resolve_base(daemon.as_ref(), &base).await?;
                ImageModel::from_base(name, base, &config)
            }
            None => {
                let info = daemon.info().await?;
                let os = non_empty_or(&info.os, &options.platform.os);
                let architecture = non_empty_or(&info.architecture, &options.platform.architecture);
                ImageModel::scratch(name, os, architecture)
            }
        };

        tracing::debug!(
            image = %model.name(),
            base = ?model.base().map(|b| b.reference.to_string()),
            base_layers = model.base_layers().len(),
            "Created local image"
        );

        Ok(Self {
            model,
            daemon,
            options,
        })
    }

    /// Remove the image stored under the name from the engine.
    pub async fn delete(&self) -> Result<()> {
        self.daemon.remove(&self.model.name().to_string()).await
    }

    /// Uncompressed tar of a layer, looked up by diff id among the appended
    /// layers and then the base.
    pub async fn get_layer(&self, diff_id: &str) -> Result<Vec<u8>> {
        for pending in self.model.layers() {
            let raw = tokio::fs::read(&pending.source).await?;
            let tar = if is_gzip(&raw) { decompress_layer(&raw)? } else { raw };
            if sha256_digest(&tar) == diff_id {
                return Ok(tar);
            }
        }

        let not_found = || {
            StrataError::Other(format!(
                "Layer {} not found in image {}",
                diff_id,
                self.model.name()
            ))
        };
        let base = self.model.base().ok_or_else(not_found)?;
        let position = base
            .layers
            .iter()
            .position(|l| l.diff_id == diff_id)
            .ok_or_else(not_found)?;

        let scratch = LayerStore::new(self.options.temp_dir.as_deref(), self.options.compression_level)?;
        let archive_path = scratch.path().join("base.tar");
        let source = base
            .digest
            .clone()
            .unwrap_or_else(|| base.reference.to_string());
        self.daemon.save_archive(&source, &archive_path).await?;

        let mut archive = tokio::task::spawn_blocking(move || read_docker_archive(&archive_path))
            .await
            .map_err(|e| StrataError::Other(format!("Archive read task failed: {}", e)))??;
        if position >= archive.layers.len() {
            return Err(not_found());
        }
        Ok(archive.layers.swap_remove(position))
    }

    /// Id of the image `name` points at, if any.
    async fn current_id(&self, name: &str) -> Result<Option<String>> {
        if !self.daemon.image_exists(name).await? {
            return Ok(None);
        }
        Ok(Some(self.daemon.inspect(name).await?.id))
    }

    async fn restore_tags(&self, names: &[ImageReference], priors: &[Option<String>], loaded: &str) {
        for (name, prior) in names.iter().zip(priors).rev() {
            let name = name.to_string();
            let result = match prior {
                Some(id) if id == loaded => Ok(()),
                Some(id) => self.daemon.tag(id, &name).await,
                None => self.daemon.remove(&name).await,
            };
            if let Err(e) = result {
                tracing::warn!(image = %name, error = %e, "Failed to restore tag");
            }
        }
    }

    async fn discard(&self, id: &str) {
        match self.daemon.image_exists(id).await {
            Ok(false) => {}
            _ => {
                if let Err(e) = self.daemon.remove(id).await {
                    tracing::warn!(image_id = %id, error = %e, "Failed to remove loaded image");
                }
            }
        }
    }
}

/// Make the base present in the engine and read its layer chain and config.
async fn resolve_base(
    daemon: &dyn Daemon,
    reference: &ImageReference,
) -> Result<(BaseImage, ConfigFile)> {
    let failed = |message: String| StrataError::BaseResolutionFailed {
        reference: reference.to_string(),
        message,
    };
    let name = reference.to_string();

    let present = daemon
        .image_exists(&name)
        .await
        .map_err(|e| failed(e.to_string()))?;
    if !present {
        tracing::info!(base = %name, "Base image not in daemon, pulling");
        daemon.pull(&name).await.map_err(|e| failed(e.to_string()))?;
    }

    let image = daemon
        .inspect(&name)
        .await
        .map_err(|e| failed(e.to_string()))?;

    let layers = image
        .diff_ids()
        .iter()
        .map(|diff_id| BaseLayer {
            diff_id: diff_id.clone(),
            descriptor: None,
        })
        .collect();

    tracing::info!(base = %name, image_id = %image.id, "Resolved base image from daemon");

    let config = image.to_config_file();
    Ok((
        BaseImage {
            reference: reference.clone(),
            digest: Some(image.id),
            layers,
        },
        config,
    ))
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[async_trait]
impl Image for LocalImage {
    fn model(&self) -> &ImageModel {
        &self.model
    }

    fn model_mut(&mut self) -> &mut ImageModel {
        &mut self.model
    }

    async fn found(&self) -> Result<bool> {
        self.daemon.image_exists(&self.model.name().to_string()).await
    }

    async fn identifier(&self) -> Result<String> {
        Ok(self.daemon.inspect(&self.model.name().to_string()).await?.id)
    }

    async fn save_as(&mut self, additional_names: &[ImageReference]) -> Result<SavedImage> {
        let staged = stage_image(&self.model, &self.options).await?;
        let archive_path = staged.store.path().join("image.tar");

        let base: Vec<String> = self
            .model
            .base_layers()
            .iter()
            .map(|l| l.diff_id.clone())
            .collect();
        let appended: Vec<(String, PathBuf)> = staged
            .layers
            .iter()
            .map(|l| (l.diff_id.clone(), l.tar_path.clone()))
            .collect();
        let (config_bytes, config_digest) = (staged.config_bytes.clone(), staged.config_digest.clone());
        let output = archive_path.clone();
        tokio::task::spawn_blocking(move || {
            let layers: Vec<ArchiveLayer<'_>> = base
                .iter()
                .map(|diff_id| ArchiveLayer {
                    diff_id: diff_id.as_str(),
                    content: LayerContent::Placeholder,
                })
                .chain(appended.iter().map(|(diff_id, path)| ArchiveLayer {
                    diff_id: diff_id.as_str(),
                    content: LayerContent::File(path.as_path()),
                }))
                .collect();
            write_docker_archive(&output, &config_bytes, &config_digest, &layers, &[])
        })
        .await
        .map_err(|e| StrataError::Other(format!("Archive write task failed: {}", e)))??;

        let names = target_names(self.model.name(), additional_names);
        let existed = self.daemon.image_exists(&staged.config_digest).await?;
        let mut priors = Vec::with_capacity(names.len());
        for name in &names {
            priors.push(self.current_id(&name.to_string()).await?);
        }

        let loaded = self.daemon.load(&archive_path).await?;
        if loaded != staged.config_digest {
            let untagged = match self.daemon.inspect(&loaded).await {
                Ok(image) => image.repo_tags.map_or(true, |tags| tags.is_empty()),
                Err(_) => false,
            };
            if untagged {
                self.discard(&loaded).await;
            }
            return Err(StrataError::DigestMismatch {
                subject: format!("image loaded for {}", self.model.name()),
                expected: staged.config_digest,
                actual: loaded,
            });
        }

        for (tagged, name) in names.iter().enumerate() {
            if let Err(e) = self.daemon.tag(&loaded, &name.to_string()).await {
                self.restore_tags(&names[..tagged], &priors, &loaded).await;
                if !existed {
                    self.discard(&loaded).await;
                }
                return Err(e);
            }
            tracing::info!(image = %name, image_id = %loaded, "Saved image to daemon");
        }

        self.model.mark_clean();
        Ok(SavedImage {
            name: self.model.name().clone(),
            additional_names: names.into_iter().skip(1).collect(),
            image_id: loaded,
            digest: None,
            config: staged.config,
        })
    }
}
