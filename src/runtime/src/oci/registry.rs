//! Registry access for reading and writing image artifacts.
//!
//! [`Registry`] is the narrow blob/manifest surface the remote backend and
//! the verifier need. [`OciRegistry`] implements it on top of the
//! `oci-distribution` crate (Docker Hub, GHCR, a local `registry:2`, ...).

use std::sync::Arc;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::{Client, Reference, RegistryOperation};
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use strata_core::config::StrataConfig;
use strata_core::error::{Result, StrataError};

use super::config::{
    Descriptor, ImageManifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_MANIFEST,
};
use super::credentials::Keychain;
use super::layer::sha256_digest;
use super::reference::ImageReference;

/// A manifest together with the digest the registry reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedManifest {
    pub manifest: ImageManifest,
    pub digest: String,
}

/// Manifest bytes exactly as a registry stores them under a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub digest: String,
}

/// Media types accepted when reading a manifest back verbatim.
const RAW_MANIFEST_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST,
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Blob and manifest operations against a registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch a single-platform manifest, resolving indexes for the configured platform.
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<FetchedManifest>;

    /// Digest of the manifest `reference` points at, `None` when the
    /// registry reports the manifest or repository as unknown. Any other
    /// failure is an error.
    async fn find_manifest_digest(&self, reference: &ImageReference) -> Result<Option<String>>;

    /// Digest of the manifest `reference` currently points at.
    async fn manifest_digest(&self, reference: &ImageReference) -> Result<String> {
        self.find_manifest_digest(reference)
            .await?
            .ok_or_else(|| StrataError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("manifest unknown: {}", reference),
            })
    }

    /// The stored manifest bytes for `reference`, if any.
    async fn fetch_raw_manifest(&self, reference: &ImageReference) -> Result<Option<RawManifest>>;

    /// Fetch a blob from `reference`'s repository.
    async fn fetch_blob(&self, reference: &ImageReference, descriptor: &Descriptor)
        -> Result<Vec<u8>>;

    /// Whether `digest` is present in `reference`'s repository.
    async fn blob_exists(&self, reference: &ImageReference, digest: &str) -> Result<bool>;

    /// Upload a blob to `reference`'s repository.
    async fn push_blob(&self, reference: &ImageReference, data: &[u8], digest: &str)
        -> Result<()>;

    /// Upload manifest bytes under `reference`; returns the digest the
    /// registry stored them under.
    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<String>;

    /// Delete the manifest `digest` from `reference`'s repository, along
    /// with every tag pointing at it.
    async fn delete_manifest(&self, reference: &ImageReference, digest: &str) -> Result<()>;
}

/// Registry client backed by `oci-distribution`.
pub struct OciRegistry {
    client: Client,
    http: reqwest::Client,
    keychain: Arc<dyn Keychain>,
    insecure: Vec<String>,
}

impl OciRegistry {
    /// Create a client using the configured platform and insecure registries.
    pub fn new(config: &StrataConfig, keychain: Arc<dyn Keychain>) -> Self {
        let insecure = config.registry.insecure.clone();
        let protocol = if insecure.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure.clone())
        };

        let os = config.platform.os.clone();
        let architecture = config.platform.architecture.clone();
        let client_config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(move |manifests: &[ImageIndexEntry]| {
                resolve_platform(manifests, &os, &architecture)
            })),
            ..Default::default()
        };

        Self {
            client: Client::new(client_config),
            http: reqwest::Client::new(),
            keychain,
            insecure,
        }
    }

    fn registry_error(reference: &ImageReference, message: String) -> StrataError {
        StrataError::RegistryError {
            registry: reference.registry.clone(),
            message,
        }
    }

    /// Authenticate for `operation` and return the oci-distribution auth value.
    async fn authenticate(
        &self,
        oci_ref: &Reference,
        reference: &ImageReference,
        operation: RegistryOperation,
    ) -> Result<oci_distribution::secrets::RegistryAuth> {
        let auth = self.keychain.resolve(&reference.registry).to_oci_auth();
        self.client
            .auth(oci_ref, &auth, operation)
            .await
            .map_err(|e| {
                Self::registry_error(reference, format!("Authentication failed: {}", e))
            })?;
        Ok(auth)
    }

    fn blob_url(&self, reference: &ImageReference, digest: &str) -> String {
        self.api_url(reference, "blobs", digest)
    }

    fn api_url(&self, reference: &ImageReference, kind: &str, digest: &str) -> String {
        let scheme = if self.insecure.iter().any(|r| r == &reference.registry) {
            "http"
        } else {
            "https"
        };
        format!(
            "{}://{}/v2/{}/{}/{}",
            scheme,
            reference.api_host(),
            reference.repository,
            kind,
            digest
        )
    }

    fn with_basic_auth(
        &self,
        reference: &ImageReference,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match self
            .keychain
            .resolve(&reference.registry)
            .basic_credentials()
        {
            Some((username, password)) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<FetchedManifest> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.keychain.resolve(&reference.registry).to_oci_auth();

        let (oci_manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| {
                Self::registry_error(reference, format!("Failed to pull manifest: {}", e))
            })?;

        let manifest: ImageManifest = serde_json::from_slice(&serde_json::to_vec(&oci_manifest)?)?;

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            layers = manifest.layers.len(),
            "Fetched manifest"
        );

        Ok(FetchedManifest { manifest, digest })
    }

    async fn find_manifest_digest(&self, reference: &ImageReference) -> Result<Option<String>> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.keychain.resolve(&reference.registry).to_oci_auth();

        match self.client.fetch_manifest_digest(&oci_ref, &auth).await {
            Ok(digest) => Ok(Some(digest)),
            Err(e) if is_manifest_unknown(&e) => Ok(None),
            Err(e) => Err(Self::registry_error(
                reference,
                format!("Failed to resolve manifest digest: {}", e),
            )),
        }
    }

    async fn fetch_raw_manifest(&self, reference: &ImageReference) -> Result<Option<RawManifest>> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.keychain.resolve(&reference.registry).to_oci_auth();

        let (bytes, digest) = match self
            .client
            .pull_manifest_raw(&oci_ref, &auth, RAW_MANIFEST_TYPES)
            .await
        {
            Ok(pulled) => pulled,
            Err(e) if is_manifest_unknown(&e) => return Ok(None),
            Err(e) => {
                return Err(Self::registry_error(
                    reference,
                    format!("Failed to pull manifest: {}", e),
                ))
            }
        };

        let media_type = serde_json::from_slice::<serde_json::Value>(&bytes)?
            .get("mediaType")
            .and_then(|v| v.as_str())
            .unwrap_or(MEDIA_TYPE_OCI_MANIFEST)
            .to_string();
        Ok(Some(RawManifest {
            bytes,
            media_type,
            digest,
        }))
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        self.authenticate(&oci_ref, reference, RegistryOperation::Pull)
            .await?;

        let oci_descriptor = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: descriptor.size as i64,
            ..Default::default()
        };

        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &oci_descriptor, &mut data)
            .await
            .map_err(|e| {
                Self::registry_error(
                    reference,
                    format!("Failed to pull blob {}: {}", descriptor.digest, e),
                )
            })?;

        let actual = sha256_digest(&data);
        if actual != descriptor.digest {
            return Err(StrataError::DigestMismatch {
                subject: format!("blob from {}", reference.context()),
                expected: descriptor.digest.clone(),
                actual,
            });
        }
        Ok(data)
    }

    /// A HEAD on the blob URL. Only 200 counts as present; any other status
    /// (including 401 from registries that refuse anonymous probes) means the
    /// blob gets uploaded.
    async fn blob_exists(&self, reference: &ImageReference, digest: &str) -> Result<bool> {
        let url = self.blob_url(reference, digest);
        let request = self.with_basic_auth(reference, self.http.head(&url));

        let response = request.send().await.map_err(|e| {
            Self::registry_error(reference, format!("Blob probe {} failed: {}", url, e))
        })?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                tracing::debug!(url = %url, status = %status, "Blob probe inconclusive");
                Ok(false)
            }
        }
    }

    async fn push_blob(&self, reference: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        self.authenticate(&oci_ref, reference, RegistryOperation::Push)
            .await?;

        self.client
            .push_blob(&oci_ref, data, digest)
            .await
            .map_err(|e| {
                Self::registry_error(reference, format!("Failed to push blob {}: {}", digest, e))
            })?;

        tracing::debug!(reference = %reference, digest, size = data.len(), "Pushed blob");
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        self.authenticate(&oci_ref, reference, RegistryOperation::Push)
            .await?;

        let content_type = HeaderValue::from_str(media_type).map_err(|e| {
            Self::registry_error(reference, format!("Invalid media type {}: {}", media_type, e))
        })?;

        let url = self
            .client
            .push_manifest_raw(&oci_ref, manifest.to_vec(), content_type)
            .await
            .map_err(|e| {
                Self::registry_error(reference, format!("Failed to push manifest: {}", e))
            })?;

        // Report what the registry serves for the name, not a hash of the bytes sent.
        let digest = self.find_manifest_digest(reference).await?.ok_or_else(|| {
            Self::registry_error(reference, format!("Pushed manifest not found at {}", url))
        })?;
        tracing::debug!(reference = %reference, digest = %digest, url = %url, "Pushed manifest");
        Ok(digest)
    }

    async fn delete_manifest(&self, reference: &ImageReference, digest: &str) -> Result<()> {
        let url = self.api_url(reference, "manifests", digest);
        let request = self.with_basic_auth(reference, self.http.delete(&url));

        let response = request.send().await.map_err(|e| {
            Self::registry_error(reference, format!("Manifest delete {} failed: {}", url, e))
        })?;

        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => {
                tracing::debug!(url = %url, status = %status, "Deleted manifest");
                Ok(())
            }
            status => Err(Self::registry_error(
                reference,
                format!("Manifest delete {} returned {}", url, status),
            )),
        }
    }
}

/// Whether the registry answered that the manifest or repository does not exist.
fn is_manifest_unknown(error: &OciDistributionError) -> bool {
    match error {
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            e.code == OciErrorCode::ManifestUnknown || e.code == OciErrorCode::NameUnknown
        }),
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        _ => false,
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
pub(crate) fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        StrataError::InvalidReference(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Pick the index entry matching `os`/`architecture`.
fn resolve_platform(manifests: &[ImageIndexEntry], os: &str, architecture: &str) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == os && p.architecture == architecture)
        })
        .map(|entry| entry.digest.clone())
}
