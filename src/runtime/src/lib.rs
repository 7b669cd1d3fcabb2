//! Strata Runtime - reproducible container image construction.
//!
//! Images are built on top of a base image, mutated with layers and config
//! changes, and saved either into a local container engine or straight to a
//! registry. Both paths produce identical image configs for identical inputs.

#![allow(clippy::result_large_err)]

pub mod oci;

// Re-export common types
pub use oci::{BaseImage, ImageConfig, ImageModel, Mutation, PendingLayer};
pub use oci::{CredentialStore, Keychain, RegistryAuth};
pub use oci::{Daemon, DockerCli, MemoryDaemon, MemoryRegistry, OciRegistry, Registry};
pub use oci::{Image, ImageOptions, ImageReference, LocalImage, RemoteImage, SavedImage};
pub use oci::{verify_reproducible, ReproducibilityReport};

/// Strata Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
