//! `docker save` / `docker load` archive format.
//!
//! ```text
//! image.tar
//! ├── <config-hex>.json
//! ├── <diff-id-hex>/layer.tar   (one per distinct layer)
//! └── manifest.json             ([{"Config", "RepoTags", "Layers"}])
//! ```
//!
//! Layers the daemon already holds may be written as zero-byte placeholders;
//! the daemon matches them by chain id and never reads the content.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};

use super::layer::digest_hex;

const MANIFEST_PATH: &str = "manifest.json";

/// One entry of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Where a layer's uncompressed tar comes from.
#[derive(Debug, Clone, Copy)]
pub enum LayerContent<'a> {
    /// Zero-byte entry for a layer the daemon already holds
    Placeholder,
    File(&'a Path),
    Bytes(&'a [u8]),
}

/// A layer to write into an archive.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLayer<'a> {
    pub diff_id: &'a str,
    pub content: LayerContent<'a>,
}

/// Archive contents read back into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerArchive {
    pub config: Vec<u8>,
    pub repo_tags: Vec<String>,
    /// Layer tars in manifest order; placeholders are empty
    pub layers: Vec<Vec<u8>>,
}

/// Path of a layer inside the archive.
pub fn layer_path(diff_id: &str) -> String {
    format!("{}/layer.tar", digest_hex(diff_id))
}

/// Write a single-image archive to `output`.
pub fn write_docker_archive(
    output: &Path,
    config: &[u8],
    image_id: &str,
    layers: &[ArchiveLayer<'_>],
    repo_tags: &[String],
) -> Result<()> {
    let file = File::create(output)?;
    let mut builder = tar::Builder::new(file);

    let config_name = format!("{}.json", digest_hex(image_id));
    append_bytes(&mut builder, &config_name, config)?;

    let mut written = HashSet::new();
    let mut layer_names = Vec::with_capacity(layers.len());
    for layer in layers {
        let name = layer_path(layer.diff_id);
        if written.insert(name.clone()) {
            match layer.content {
                LayerContent::Placeholder => append_bytes(&mut builder, &name, &[])?,
                LayerContent::File(path) => append_bytes(&mut builder, &name, &std::fs::read(path)?)?,
                LayerContent::Bytes(data) => append_bytes(&mut builder, &name, data)?,
            }
        }
        layer_names.push(name);
    }

    let manifest = vec![ArchiveManifest {
        config: config_name,
        repo_tags: Some(repo_tags.to_vec()).filter(|t| !t.is_empty()),
        layers: layer_names,
    }];
    append_bytes(&mut builder, MANIFEST_PATH, &serde_json::to_vec(&manifest)?)?;

    builder.into_inner()?;
    Ok(())
}

/// Read the first image of an archive.
pub fn read_docker_archive(path: &Path) -> Result<DockerArchive> {
    let invalid = |message: String| {
        StrataError::SerializationError(format!(
            "Invalid image archive {}: {}",
            path.display(),
            message
        ))
    };

    let mut entries: HashMap<String, Vec<u8>> = HashMap::new();
    let mut archive = tar::Archive::new(File::open(path)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.insert(name, data);
    }

    let manifest_bytes = entries
        .get(MANIFEST_PATH)
        .ok_or_else(|| invalid("missing manifest.json".to_string()))?;
    let manifests: Vec<ArchiveManifest> = serde_json::from_slice(manifest_bytes)?;
    let manifest = manifests
        .into_iter()
        .next()
        .ok_or_else(|| invalid("empty manifest.json".to_string()))?;

    let config = entries
        .get(&manifest.config)
        .cloned()
        .ok_or_else(|| invalid(format!("missing config {}", manifest.config)))?;

    let layers = manifest
        .layers
        .iter()
        .map(|name| {
            entries
                .get(name)
                .cloned()
                .ok_or_else(|| invalid(format!("missing layer {}", name)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DockerArchive {
        config,
        repo_tags: manifest.repo_tags.unwrap_or_default(),
        layers,
    })
}

/// Append a regular file with fixed metadata.
fn append_bytes<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}
