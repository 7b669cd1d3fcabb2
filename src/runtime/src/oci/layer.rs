//! Content layer store.
//!
//! Stages caller-supplied layer tars into content-addressed blobs. Each staged
//! layer carries two digests: the `diff_id` (sha256 of the uncompressed tar)
//! recorded in the image config, and the blob `digest` (sha256 of the gzip
//! stream) referenced from the manifest. Compression is deterministic: no
//! timestamp or filename in the gzip header, fixed level.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use strata_core::error::{Result, StrataError};
use tempfile::TempDir;

use super::config::{Descriptor, MEDIA_TYPE_OCI_LAYER_GZIP};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A layer staged for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLayer {
    /// Caller-supplied tar path
    pub source: PathBuf,
    /// sha256 of the uncompressed tar (`sha256:<hex>`)
    pub diff_id: String,
    /// sha256 of the compressed blob (`sha256:<hex>`)
    pub digest: String,
    /// Compressed size in bytes
    pub size: u64,
    /// Blob media type
    pub media_type: String,
    /// Uncompressed tar inside the staging directory
    pub tar_path: PathBuf,
    /// Compressed blob inside the staging directory
    pub blob_path: PathBuf,
}

impl StagedLayer {
    /// Manifest descriptor for this layer.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.media_type.clone(), self.digest.clone(), self.size)
    }

    /// Read the compressed blob.
    pub async fn read_blob(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.blob_path).await?)
    }
}

/// Scoped, content-addressed staging area for layer blobs.
///
/// Everything lives under a temporary directory removed on drop.
pub struct LayerStore {
    dir: TempDir,
    compression: Compression,
    staged: HashMap<String, StagedLayer>,
}

impl LayerStore {
    /// Create a store under `temp_root` (system temp dir when `None`).
    pub fn new(temp_root: Option<&Path>, compression_level: u32) -> Result<Self> {
        let dir = match temp_root {
            Some(root) => tempfile::Builder::new().prefix("strata-layers-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("strata-layers-").tempdir(),
        }
        .map_err(|e| StrataError::Other(format!("Failed to create layer staging directory: {}", e)))?;

        for sub in ["blobs", "diffs"] {
            std::fs::create_dir_all(dir.path().join(sub))?;
        }

        Ok(Self {
            dir,
            compression: Compression::new(compression_level.min(9)),
            staged: HashMap::new(),
        })
    }

    /// Root of the staging directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Number of distinct staged blobs.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Stage a tar (plain or gzip) from `source`.
    ///
    /// Staging the same content twice returns the first staged layer with the
    /// new source path.
    pub fn stage(&mut self, source: &Path) -> Result<StagedLayer> {
        let invalid = |message: String| StrataError::InvalidLayerSource {
            path: source.to_path_buf(),
            message,
        };

        let raw = std::fs::read(source).map_err(|e| invalid(e.to_string()))?;
        let tar_bytes = if is_gzip(&raw) {
            decompress_layer(&raw).map_err(|e| invalid(format!("Bad gzip stream: {}", e)))?
        } else {
            raw
        };
        validate_tar(&tar_bytes).map_err(|e| invalid(format!("Not a tar archive: {}", e)))?;

        let diff_id = sha256_digest(&tar_bytes);
        let blob = compress_layer(&tar_bytes, self.compression)?;
        let digest = sha256_digest(&blob);

        if let Some(existing) = self.staged.get(&digest) {
            tracing::debug!(digest = %digest, source = %source.display(), "Layer already staged");
            return Ok(StagedLayer {
                source: source.to_path_buf(),
                ..existing.clone()
            });
        }

        let tar_path = self.dir.path().join("diffs").join(digest_hex(&diff_id));
        let blob_path = self.dir.path().join("blobs").join(digest_hex(&digest));
        std::fs::write(&tar_path, &tar_bytes)?;
        std::fs::write(&blob_path, &blob)?;

        let layer = StagedLayer {
            source: source.to_path_buf(),
            diff_id,
            digest: digest.clone(),
            size: blob.len() as u64,
            media_type: MEDIA_TYPE_OCI_LAYER_GZIP.to_string(),
            tar_path,
            blob_path,
        };

        tracing::debug!(
            source = %source.display(),
            diff_id = %layer.diff_id,
            digest = %layer.digest,
            size = layer.size,
            "Staged layer"
        );

        self.staged.insert(digest, layer.clone());
        Ok(layer)
    }
}

/// Whether `data` starts with the gzip magic bytes.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

/// Gzip `tar` with a header free of timestamps and file names.
pub fn compress_layer(tar: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), level);
    encoder.write_all(tar)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip layer blob.
pub fn decompress_layer(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Walk every entry header of a tar archive.
fn validate_tar(data: &[u8]) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        entry?;
    }
    Ok(())
}

/// Build a tar holding one regular file with fixed metadata.
pub fn single_file_tar(path: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, path.trim_start_matches('/'), contents)?;
    Ok(builder.into_inner()?)
}

/// Strip the `sha256:` prefix.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Compute the prefixed SHA256 digest of raw bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(data))
}

/// Compute the SHA256 digest of raw bytes as hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the prefixed SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    Ok(sha256_digest(&data))
}
