//! In-memory [`Registry`] and [`Daemon`] implementations.
//!
//! Both keep everything in process and follow the observable rules of their
//! real counterparts closely enough to exercise the backends without a
//! network or a container engine: blobs are scoped per repository, manifest
//! pushes require their blobs, and `load` matches placeholder layers against
//! layers the daemon already holds.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::Compression;
use parking_lot::Mutex;
use strata_core::error::{Result, StrataError};

use super::archive::{read_docker_archive, write_docker_archive, ArchiveLayer, LayerContent};
use super::config::{
    ConfigFile, Descriptor, ImageManifest, MEDIA_TYPE_DOCKER_CONFIG, MEDIA_TYPE_DOCKER_LAYER_GZIP,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP,
    MEDIA_TYPE_OCI_MANIFEST,
};
use super::daemon::{Daemon, DaemonImage, DaemonInfo, DaemonRootFs};
use super::layer::{compress_layer, decompress_layer, is_gzip, sha256_digest};
use super::reference::ImageReference;
use super::registry::{FetchedManifest, RawManifest, Registry};

#[derive(Debug, Clone)]
struct StoredManifest {
    bytes: Vec<u8>,
    media_type: String,
    digest: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    /// repository context → digest → blob
    blobs: HashMap<String, HashMap<String, Vec<u8>>>,
    /// repository context → tag or digest → manifest
    manifests: HashMap<String, HashMap<String, StoredManifest>>,
    /// repository contexts refusing manifest pushes
    denied_manifests: HashSet<String>,
}

/// Registry held in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
    read_only: AtomicBool,
    unavailable: AtomicBool,
    reencode_manifests: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent write.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Fail every manifest read as an unreachable registry would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Store pushed manifests pretty-printed instead of byte-for-byte, the
    /// way registries that convert manifests on upload do.
    pub fn set_reencode_manifests(&self, reencode: bool) {
        self.reencode_manifests.store(reencode, Ordering::SeqCst);
    }

    /// Refuse manifest pushes into `reference`'s repository; blobs are still accepted.
    pub fn deny_manifests(&self, reference: &ImageReference) {
        self.state.lock().denied_manifests.insert(reference.context());
    }

    /// Store an image the way a public registry serves it: Docker media
    /// types and pretty-printed JSON. Returns the manifest digest.
    pub fn seed_image(
        &self,
        reference: &ImageReference,
        config: &ConfigFile,
        layer_tars: &[Vec<u8>],
    ) -> Result<String> {
        let context = reference.context();
        let mut state = self.state.lock();
        let blobs = state.blobs.entry(context.clone()).or_default();

        let mut layers = Vec::with_capacity(layer_tars.len());
        for tar in layer_tars {
            let blob = compress_layer(tar, Compression::best())?;
            let descriptor = Descriptor::for_bytes(MEDIA_TYPE_DOCKER_LAYER_GZIP, &blob);
            blobs.insert(descriptor.digest.clone(), blob);
            layers.push(descriptor);
        }

        let config_bytes = serde_json::to_vec_pretty(config)?;
        let config_descriptor = Descriptor::for_bytes(MEDIA_TYPE_DOCKER_CONFIG, &config_bytes);
        blobs.insert(config_descriptor.digest.clone(), config_bytes);

        let manifest = ImageManifest {
            media_type: Some(MEDIA_TYPE_DOCKER_MANIFEST.to_string()),
            ..ImageManifest::new(config_descriptor, layers)
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        let digest = sha256_digest(&bytes);

        let stored = StoredManifest {
            bytes,
            media_type: MEDIA_TYPE_DOCKER_MANIFEST.to_string(),
            digest: digest.clone(),
        };
        let manifests = state.manifests.entry(context).or_default();
        if let Some(tag) = &reference.tag {
            manifests.insert(tag.clone(), stored.clone());
        }
        manifests.insert(digest.clone(), stored);
        Ok(digest)
    }

    /// Whether `digest` is stored in `reference`'s repository.
    pub fn has_blob(&self, reference: &ImageReference, digest: &str) -> bool {
        self.state
            .lock()
            .blobs
            .get(&reference.context())
            .map_or(false, |b| b.contains_key(digest))
    }

    /// Number of blobs in `reference`'s repository.
    pub fn blob_count(&self, reference: &ImageReference) -> usize {
        self.state
            .lock()
            .blobs
            .get(&reference.context())
            .map_or(0, HashMap::len)
    }

    fn lookup(&self, reference: &ImageReference) -> Result<Option<StoredManifest>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StrataError::RegistryError {
                registry: reference.registry.clone(),
                message: "service unavailable".to_string(),
            });
        }
        Ok(self
            .state
            .lock()
            .manifests
            .get(&reference.context())
            .and_then(|m| m.get(reference.identifier()))
            .cloned())
    }

    fn require(&self, reference: &ImageReference) -> Result<StoredManifest> {
        self.lookup(reference)?
            .ok_or_else(|| StrataError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("manifest unknown: {}", reference),
            })
    }

    fn check_writable(&self, reference: &ImageReference) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StrataError::RegistryError {
                registry: reference.registry.clone(),
                message: "denied: requested access to the resource is denied".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<FetchedManifest> {
        let stored = self.require(reference)?;
        Ok(FetchedManifest {
            manifest: serde_json::from_slice(&stored.bytes)?,
            digest: stored.digest,
        })
    }

    async fn find_manifest_digest(&self, reference: &ImageReference) -> Result<Option<String>> {
        Ok(self.lookup(reference)?.map(|m| m.digest))
    }

    async fn fetch_raw_manifest(&self, reference: &ImageReference) -> Result<Option<RawManifest>> {
        Ok(self.lookup(reference)?.map(|m| RawManifest {
            bytes: m.bytes,
            media_type: m.media_type,
            digest: m.digest,
        }))
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        self.state
            .lock()
            .blobs
            .get(&reference.context())
            .and_then(|b| b.get(&descriptor.digest))
            .cloned()
            .ok_or_else(|| StrataError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("blob unknown: {}", descriptor.digest),
            })
    }

    async fn blob_exists(&self, reference: &ImageReference, digest: &str) -> Result<bool> {
        Ok(self.has_blob(reference, digest))
    }

    async fn push_blob(&self, reference: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        self.check_writable(reference)?;
        let actual = sha256_digest(data);
        if actual != digest {
            return Err(StrataError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("digest invalid: expected {}, got {}", digest, actual),
            });
        }
        self.state
            .lock()
            .blobs
            .entry(reference.context())
            .or_default()
            .insert(actual, data.to_vec());
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<String> {
        self.check_writable(reference)?;
        let parsed: ImageManifest = serde_json::from_slice(manifest)?;
        let context = reference.context();

        let mut state = self.state.lock();
        if state.denied_manifests.contains(&context) {
            return Err(StrataError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("denied: manifest push to {} is not allowed", context),
            });
        }
        let blobs = state.blobs.get(&context);
        for descriptor in std::iter::once(&parsed.config).chain(parsed.layers.iter()) {
            if !blobs.map_or(false, |b| b.contains_key(&descriptor.digest)) {
                return Err(StrataError::RegistryError {
                    registry: reference.registry.clone(),
                    message: format!("blob unknown: {}", descriptor.digest),
                });
            }
        }

        let bytes = if self.reencode_manifests.load(Ordering::SeqCst) {
            serde_json::to_vec_pretty(&serde_json::from_slice::<serde_json::Value>(manifest)?)?
        } else {
            manifest.to_vec()
        };
        let digest = sha256_digest(&bytes);
        let stored = StoredManifest {
            bytes,
            media_type: media_type.to_string(),
            digest: digest.clone(),
        };
        let manifests = state.manifests.entry(context).or_default();
        if let Some(tag) = &reference.tag {
            manifests.insert(tag.clone(), stored.clone());
        }
        manifests.insert(digest.clone(), stored);
        Ok(digest)
    }

    async fn delete_manifest(&self, reference: &ImageReference, digest: &str) -> Result<()> {
        self.check_writable(reference)?;
        if let Some(manifests) = self.state.lock().manifests.get_mut(&reference.context()) {
            manifests.retain(|_, m| m.digest != digest);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct DaemonStoredImage {
    config: Vec<u8>,
    diff_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct DaemonState {
    /// image id → image
    images: HashMap<String, DaemonStoredImage>,
    /// full reference → image id
    tags: HashMap<String, String>,
    /// diff id → uncompressed tar
    layers: HashMap<String, Vec<u8>>,
    /// diff id → descriptor and blob as pulled
    distributable: HashMap<String, (Descriptor, Vec<u8>)>,
    /// full references `tag` refuses
    denied_tags: HashSet<String>,
}

/// Container engine held in memory; pulls from and pushes to a [`MemoryRegistry`].
pub struct MemoryDaemon {
    state: Mutex<DaemonState>,
    registry: Arc<MemoryRegistry>,
    info: DaemonInfo,
    compression: Compression,
}

impl MemoryDaemon {
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        Self {
            state: Mutex::new(DaemonState::default()),
            registry,
            info: DaemonInfo {
                os: "linux".to_string(),
                architecture: "amd64".to_string(),
                server_version: None,
            },
            compression: Compression::new(6),
        }
    }

    /// Number of images held.
    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Make `tag` fail for `reference`.
    pub fn deny_tags(&self, reference: &str) {
        if let Ok(parsed) = ImageReference::parse(reference) {
            self.state.lock().denied_tags.insert(parsed.full_reference());
        }
    }

    /// Image id for an id or a reference.
    fn resolve(&self, state: &DaemonState, reference: &str) -> Option<String> {
        if state.images.contains_key(reference) {
            return Some(reference.to_string());
        }
        let parsed = ImageReference::parse(reference).ok()?;
        state.tags.get(&parsed.full_reference()).cloned()
    }

    fn not_found(step: &'static str, reference: &str) -> StrataError {
        StrataError::daemon(step, format!("No such image: {}", reference))
    }
}

#[async_trait]
impl Daemon for MemoryDaemon {
    async fn info(&self) -> Result<DaemonInfo> {
        Ok(self.info.clone())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(self.resolve(&state, reference).is_some())
    }

    async fn pull(&self, reference: &str) -> Result<()> {
        let parsed = ImageReference::parse(reference)?;
        let pull_error = |e: StrataError| StrataError::daemon("pull", e.to_string());

        let fetched = self.registry.fetch_manifest(&parsed).await.map_err(pull_error)?;
        let config_bytes = self
            .registry
            .fetch_blob(&parsed, &fetched.manifest.config)
            .await
            .map_err(pull_error)?;
        let config = ConfigFile::from_slice(&config_bytes)?;
        if config.rootfs.diff_ids.len() != fetched.manifest.layers.len() {
            return Err(StrataError::daemon(
                "pull",
                format!("{}: layer count does not match config", reference),
            ));
        }

        let mut pulled = Vec::with_capacity(fetched.manifest.layers.len());
        for (descriptor, diff_id) in fetched.manifest.layers.iter().zip(&config.rootfs.diff_ids) {
            let blob = self
                .registry
                .fetch_blob(&parsed, descriptor)
                .await
                .map_err(pull_error)?;
            let tar = if is_gzip(&blob) {
                decompress_layer(&blob)?
            } else {
                blob.clone()
            };
            if &sha256_digest(&tar) != diff_id {
                return Err(StrataError::daemon(
                    "pull",
                    format!("layer {} does not match diff id {}", descriptor.digest, diff_id),
                ));
            }
            pulled.push((diff_id.clone(), tar, descriptor.clone(), blob));
        }

        let id = sha256_digest(&config_bytes);
        let mut state = self.state.lock();
        for (diff_id, tar, descriptor, blob) in pulled {
            state.layers.insert(diff_id.clone(), tar);
            state.distributable.insert(diff_id, (descriptor, blob));
        }
        state.images.insert(
            id.clone(),
            DaemonStoredImage {
                config: config_bytes,
                diff_ids: config.rootfs.diff_ids,
            },
        );
        state.tags.insert(parsed.full_reference(), id);
        Ok(())
    }

    async fn inspect(&self, reference: &str) -> Result<DaemonImage> {
        let state = self.state.lock();
        let id = self
            .resolve(&state, reference)
            .ok_or_else(|| Self::not_found("inspect", reference))?;
        let image = state
            .images
            .get(&id)
            .ok_or_else(|| Self::not_found("inspect", reference))?;
        let config = ConfigFile::from_slice(&image.config)?;

        let mut repo_tags: Vec<String> = state
            .tags
            .iter()
            .filter(|(_, v)| **v == id)
            .map(|(k, _)| k.clone())
            .collect();
        repo_tags.sort();

        Ok(DaemonImage {
            id: id.clone(),
            repo_tags: Some(repo_tags),
            os: config.os,
            architecture: config.architecture,
            variant: config.variant,
            os_version: config.os_version,
            config: Some(config.config),
            rootfs: DaemonRootFs {
                layers: Some(image.diff_ids.clone()),
            },
        })
    }

    async fn load(&self, archive: &Path) -> Result<String> {
        let archive = read_docker_archive(archive)?;
        let config = ConfigFile::from_slice(&archive.config)?;
        let diff_ids = config.rootfs.diff_ids;
        if diff_ids.len() != archive.layers.len() {
            return Err(StrataError::daemon(
                "load",
                "layer count does not match config".to_string(),
            ));
        }

        let mut state = self.state.lock();
        for (diff_id, tar) in diff_ids.iter().zip(archive.layers) {
            if tar.is_empty() {
                if !state.layers.contains_key(diff_id) {
                    return Err(StrataError::daemon(
                        "load",
                        format!("layer {} is not present", diff_id),
                    ));
                }
                continue;
            }
            let actual = sha256_digest(&tar);
            if &actual != diff_id {
                return Err(StrataError::daemon(
                    "load",
                    format!("layer content {} does not match diff id {}", actual, diff_id),
                ));
            }
            state.layers.insert(actual, tar);
        }

        let id = sha256_digest(&archive.config);
        state.images.insert(
            id.clone(),
            DaemonStoredImage {
                config: archive.config,
                diff_ids,
            },
        );
        for tag in archive.repo_tags {
            let parsed = ImageReference::parse(&tag)?;
            state.tags.insert(parsed.full_reference(), id.clone());
        }
        Ok(id)
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let target = ImageReference::parse(target)?;
        let mut state = self.state.lock();
        if state.denied_tags.contains(&target.full_reference()) {
            return Err(StrataError::daemon(
                "tag",
                format!("denied: cannot tag {}", target),
            ));
        }
        let id = self
            .resolve(&state, source)
            .ok_or_else(|| Self::not_found("tag", source))?;
        state.tags.insert(target.full_reference(), id);
        Ok(())
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.images.remove(reference).is_some() {
            state.tags.retain(|_, id| id.as_str() != reference);
            return Ok(());
        }
        let key = ImageReference::parse(reference)
            .map(|r| r.full_reference())
            .map_err(|_| Self::not_found("remove", reference))?;
        let id = state
            .tags
            .remove(&key)
            .ok_or_else(|| Self::not_found("remove", reference))?;
        if !state.tags.values().any(|v| *v == id) {
            state.images.remove(&id);
        }
        Ok(())
    }

    async fn save_archive(&self, reference: &str, output: &Path) -> Result<()> {
        let state = self.state.lock();
        let id = self
            .resolve(&state, reference)
            .ok_or_else(|| Self::not_found("save", reference))?;
        let image = state
            .images
            .get(&id)
            .ok_or_else(|| Self::not_found("save", reference))?;

        let mut layers = Vec::with_capacity(image.diff_ids.len());
        for diff_id in &image.diff_ids {
            let tar = state.layers.get(diff_id).ok_or_else(|| {
                StrataError::daemon("save", format!("layer {} is not present", diff_id))
            })?;
            layers.push(ArchiveLayer {
                diff_id,
                content: LayerContent::Bytes(tar),
            });
        }
        write_docker_archive(output, &image.config, &id, &layers, &[])
    }

    async fn push(&self, reference: &str) -> Result<()> {
        let parsed = ImageReference::parse(reference)?;

        let (config, blobs) = {
            let state = self.state.lock();
            let id = self
                .resolve(&state, reference)
                .ok_or_else(|| Self::not_found("push", reference))?;
            let image = state
                .images
                .get(&id)
                .ok_or_else(|| Self::not_found("push", reference))?;

            let mut blobs = Vec::with_capacity(image.diff_ids.len());
            for diff_id in &image.diff_ids {
                match state.distributable.get(diff_id) {
                    Some(pulled) => blobs.push(pulled.clone()),
                    None => {
                        let tar = state.layers.get(diff_id).ok_or_else(|| {
                            StrataError::daemon("push", format!("layer {} is not present", diff_id))
                        })?;
                        let blob = compress_layer(tar, self.compression)?;
                        blobs.push((Descriptor::for_bytes(MEDIA_TYPE_OCI_LAYER_GZIP, &blob), blob));
                    }
                }
            }
            (image.config.clone(), blobs)
        };

        let push_error = |e: StrataError| StrataError::daemon("push", e.to_string());
        let mut layers = Vec::with_capacity(blobs.len());
        for (descriptor, blob) in blobs {
            if !self.registry.has_blob(&parsed, &descriptor.digest) {
                self.registry
                    .push_blob(&parsed, &blob, &descriptor.digest)
                    .await
                    .map_err(push_error)?;
            }
            layers.push(descriptor);
        }

        let config_descriptor = Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, &config);
        self.registry
            .push_blob(&parsed, &config, &config_descriptor.digest)
            .await
            .map_err(push_error)?;

        let (manifest, _) = ImageManifest::new(config_descriptor, layers).encode()?;
        self.registry
            .push_manifest(&parsed, &manifest, MEDIA_TYPE_OCI_MANIFEST)
            .await
            .map_err(push_error)?;
        Ok(())
    }
}
