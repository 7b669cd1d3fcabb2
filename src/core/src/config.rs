use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Strata configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Registry transport settings
    pub registry: RegistryConfig,

    /// Local container engine settings
    pub daemon: DaemonConfig,

    /// Platform used for scratch images and image index resolution
    pub platform: PlatformConfig,

    /// Layer staging settings
    pub layers: LayerConfig,

    /// Root directory for temporary staging (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            daemon: DaemonConfig::default(),
            platform: PlatformConfig::default(),
            layers: LayerConfig::default(),
            temp_dir: None,
            log_level: LogLevel::Info,
        }
    }
}

impl StrataConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StrataError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: StrataConfig = serde_yaml::from_str(&data)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `STRATA_DOCKER`, `DOCKER_HOST` and `STRATA_INSECURE_REGISTRIES`.
    pub fn apply_env(&mut self) {
        if let Ok(binary) = std::env::var("STRATA_DOCKER") {
            if !binary.is_empty() {
                self.daemon.binary = PathBuf::from(binary);
            }
        }
        if self.daemon.host.is_none() {
            self.daemon.host = std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty());
        }
        if let Ok(list) = std::env::var("STRATA_INSECURE_REGISTRIES") {
            for host in list.split(',').map(str::trim).filter(|h| !h.is_empty()) {
                if !self.registry.insecure.iter().any(|h| h == host) {
                    self.registry.insecure.push(host.to_string());
                }
            }
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.layers.compression_level > 9 {
            return Err(StrataError::ConfigError(format!(
                "layers.compression_level must be 0-9, got {}",
                self.layers.compression_level
            )));
        }
        if self.platform.os.is_empty() || self.platform.architecture.is_empty() {
            return Err(StrataError::ConfigError(
                "platform.os and platform.architecture must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry hosts (with port) reached over plain HTTP
    pub insecure: Vec<String>,
}

impl RegistryConfig {
    /// Whether the given registry host is reached over plain HTTP.
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure.iter().any(|h| h == registry)
    }
}

/// Container engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path or name of the engine CLI
    pub binary: PathBuf,

    /// Engine endpoint, exported as `DOCKER_HOST`
    pub host: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            host: None,
        }
    }
}

/// Target platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub os: String,
    pub architecture: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
        }
    }
}

/// Layer staging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Gzip level for layer blobs (0-9)
    pub compression_level: u32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
