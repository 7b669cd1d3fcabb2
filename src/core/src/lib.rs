//! Strata Core - Foundational Types
//!
//! Error, configuration and logging types shared by the strata crates.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{DaemonConfig, LayerConfig, LogLevel, PlatformConfig, RegistryConfig, StrataConfig};
pub use error::{Result, StrataError};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
