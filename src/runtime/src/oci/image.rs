//! The backend-neutral image handle.
//!
//! [`Image`] is what callers mutate and save. Both backends hold an
//! [`ImageModel`] and share the setters below; they differ only in how the
//! base is resolved and where [`Image::save_as`] commits the result.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use strata_core::config::{PlatformConfig, StrataConfig};
use strata_core::error::{Result, StrataError};

use super::config::ConfigFile;
use super::layer::{LayerStore, StagedLayer};
use super::model::ImageModel;
use super::mutate::{self, Mutation};
use super::reference::ImageReference;

/// Options for creating an image handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageOptions {
    /// Base image reference; scratch when `None`
    pub base: Option<String>,
    /// Platform for scratch images and index resolution
    pub platform: PlatformConfig,
    /// gzip level for new layers
    pub compression_level: u32,
    /// Parent directory for layer staging
    pub temp_dir: Option<PathBuf>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self::from_config(&StrataConfig::default())
    }
}

impl ImageOptions {
    pub fn from_config(config: &StrataConfig) -> Self {
        Self {
            base: None,
            platform: config.platform.clone(),
            compression_level: config.layers.compression_level,
            temp_dir: config.temp_dir.clone(),
        }
    }

    /// Derive from `reference` instead of starting from scratch.
    pub fn from_base_image(mut self, reference: impl Into<String>) -> Self {
        self.base = Some(reference.into());
        self
    }

    pub(crate) fn base_reference(&self) -> Result<Option<ImageReference>> {
        self.base.as_deref().map(ImageReference::parse).transpose()
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    /// Primary name the image was saved under
    pub name: ImageReference,
    /// Extra names written alongside the primary one
    pub additional_names: Vec<ImageReference>,
    /// Config digest
    pub image_id: String,
    /// Manifest digest, for registry saves
    pub digest: Option<String>,
    /// The committed config
    pub config: ConfigFile,
}

impl SavedImage {
    /// Manifest digest when known, otherwise the image id.
    pub fn identifier(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.image_id)
    }
}

/// A mutable image bound to one backend.
#[async_trait]
pub trait Image: Send {
    fn model(&self) -> &ImageModel;

    fn model_mut(&mut self) -> &mut ImageModel;

    fn name(&self) -> &ImageReference {
        self.model().name()
    }

    /// Point subsequent saves at `name`.
    fn rename(&mut self, name: &str) -> Result<()> {
        let name = ImageReference::parse(name)?;
        self.model_mut().rename(name);
        Ok(())
    }

    fn apply(&mut self, mutation: Mutation) -> Result<()> {
        mutate::apply(self.model_mut(), mutation)
    }

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        self.apply(Mutation::AddLayer(path.to_path_buf()))
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        self.apply(Mutation::AddLayerWithDiffId {
            path: path.to_path_buf(),
            diff_id: diff_id.to_string(),
        })
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(Mutation::SetLabel {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn remove_label(&mut self, key: &str) -> Result<()> {
        self.apply(Mutation::RemoveLabel(key.to_string()))
    }

    fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(Mutation::SetEnv {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn set_entrypoint(&mut self, args: &[&str]) -> Result<()> {
        self.apply(Mutation::SetEntrypoint(to_owned_args(args)))
    }

    fn set_cmd(&mut self, args: &[&str]) -> Result<()> {
        self.apply(Mutation::SetCmd(to_owned_args(args)))
    }

    fn set_working_dir(&mut self, dir: &str) -> Result<()> {
        self.apply(Mutation::SetWorkingDir(dir.to_string()))
    }

    fn add_exposed_port(&mut self, port: &str) -> Result<()> {
        self.apply(Mutation::AddExposedPort(port.to_string()))
    }

    /// Whether an image already exists under [`name`](Self::name).
    async fn found(&self) -> Result<bool>;

    /// Content identifier of the image currently stored under the name.
    async fn identifier(&self) -> Result<String>;

    /// Commit the model under its name and every one of `additional_names`.
    async fn save_as(&mut self, additional_names: &[ImageReference]) -> Result<SavedImage>;

    /// Commit the model under its name.
    async fn save(&mut self) -> Result<SavedImage> {
        self.save_as(&[]).await
    }
}

fn to_owned_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Layers and config produced from a model, ready to commit.
pub(crate) struct StagedImage {
    /// Owns the staging directory
    pub store: LayerStore,
    /// New layers, in model order
    pub layers: Vec<StagedLayer>,
    pub config: ConfigFile,
    pub config_bytes: Vec<u8>,
    /// Image id
    pub config_digest: String,
}

/// Stage every pending layer and render the canonical config.
///
/// Hashing and compression run on the blocking pool.
pub(crate) async fn stage_image(model: &ImageModel, options: &ImageOptions) -> Result<StagedImage> {
    let model = model.clone();
    let options = options.clone();
    tokio::task::spawn_blocking(move || stage_blocking(&model, &options))
        .await
        .map_err(|e| StrataError::Other(format!("Layer staging task failed: {}", e)))?
}

fn stage_blocking(model: &ImageModel, options: &ImageOptions) -> Result<StagedImage> {
    let mut store = LayerStore::new(options.temp_dir.as_deref(), options.compression_level)?;

    let mut layers = Vec::with_capacity(model.layers().len());
    for pending in model.layers() {
        let staged = store.stage(&pending.source)?;
        if let Some(expected) = &pending.diff_id {
            if expected != &staged.diff_id {
                return Err(StrataError::DigestMismatch {
                    subject: format!("layer {}", pending.source.display()),
                    expected: expected.clone(),
                    actual: staged.diff_id,
                });
            }
        }
        layers.push(staged);
    }

    let diff_ids: Vec<String> = layers.iter().map(|l| l.diff_id.clone()).collect();
    let config = model.render_config(&diff_ids);
    let (config_bytes, config_digest) = config.encode()?;

    tracing::debug!(
        image = %model.name(),
        image_id = %config_digest,
        base_layers = model.base_layers().len(),
        new_layers = layers.len(),
        "Rendered image config"
    );

    Ok(StagedImage {
        store,
        layers,
        config,
        config_bytes,
        config_digest,
    })
}

/// The primary name followed by any additional names, without duplicates.
pub(crate) fn target_names(
    name: &ImageReference,
    additional: &[ImageReference],
) -> Vec<ImageReference> {
    let mut names = vec![name.clone()];
    for extra in additional {
        if !names.contains(extra) {
            names.push(extra.clone());
        }
    }
    names
}
