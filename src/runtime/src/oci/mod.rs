//! Reproducible OCI image construction.
//!
//! An image is created from a base (or from scratch) through one of two
//! backends, mutated through the shared [`Image`] setters, and committed
//! with [`Image::save`]. Given equal bases and equal mutation sequences both
//! backends produce the same config bytes and therefore the same image id.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │   Image (mutate + save)      │
//!                 │   ImageModel / Mutation      │
//!                 └──────────────┬───────────────┘
//!                      stage_image (LayerStore,
//!                      canonical ConfigFile)
//!              ┌─────────────────┴─────────────────┐
//!   ┌──────────▼──────────┐             ┌──────────▼──────────┐
//!   │     LocalImage      │             │     RemoteImage     │
//!   │  docker-archive +   │             │  blobs + manifest   │
//!   │  load / tag         │             │  push               │
//!   └──────────┬──────────┘             └──────────┬──────────┘
//!        dyn Daemon                          dyn Registry
//!   (DockerCli, MemoryDaemon)         (OciRegistry, MemoryRegistry)
//! ```

mod archive;
pub mod config;
pub mod credentials;
pub mod daemon;
mod image;
pub mod layer;
mod local;
pub mod memory;
mod model;
mod mutate;
pub mod reference;
pub mod registry;
mod remote;
pub mod verify;

pub use archive::{read_docker_archive, write_docker_archive, ArchiveLayer, DockerArchive, LayerContent};
pub use config::{ConfigFile, ContainerConfig, Descriptor, HealthConfig, ImageManifest, RootFs};
pub use credentials::{
    AnonymousKeychain, CredentialStore, EnvKeychain, Keychain, RegistryAuth, StaticKeychain,
};
pub use daemon::{Daemon, DaemonImage, DaemonInfo, DockerCli};
pub use image::{Image, ImageOptions, SavedImage};
pub use layer::{LayerStore, StagedLayer};
pub use local::LocalImage;
pub use memory::{MemoryDaemon, MemoryRegistry};
pub use model::{BaseImage, BaseLayer, ImageConfig, ImageModel, PendingLayer};
pub use mutate::{apply, apply_all, Mutation};
pub use reference::ImageReference;
pub use registry::{FetchedManifest, OciRegistry, RawManifest, Registry};
pub use remote::RemoteImage;
pub use verify::{compare, snapshot, verify_reproducible, ImageSnapshot, ReproducibilityReport};
