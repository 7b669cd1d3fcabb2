//! Registry credentials and keychains.
//!
//! A [`Keychain`] maps a registry host to the credentials used for it.
//! [`CredentialStore`] persists per-registry entries at
//! `~/.strata/auth/credentials.json` using atomic writes (write tmp, rename).

use std::collections::HashMap;
use std::path::PathBuf;

use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};

/// Environment variable holding the registry username.
pub const USERNAME_ENV: &str = "REGISTRY_USERNAME";
/// Environment variable holding the registry password.
pub const PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    ///
    /// Falls back to anonymous unless both are set.
    pub fn from_env() -> Self {
        match (std::env::var(USERNAME_ENV), std::env::var(PASSWORD_ENV)) {
            (Ok(username), Ok(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    /// `(username, password)` for basic auth.
    pub fn basic_credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// Convert to oci-distribution auth type.
    pub(crate) fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Resolves credentials per registry host.
pub trait Keychain: Send + Sync {
    fn resolve(&self, registry: &str) -> RegistryAuth;
}

/// Always anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousKeychain;

impl Keychain for AnonymousKeychain {
    fn resolve(&self, _registry: &str) -> RegistryAuth {
        RegistryAuth::anonymous()
    }
}

/// Same credentials from the environment for every registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvKeychain;

impl Keychain for EnvKeychain {
    fn resolve(&self, _registry: &str) -> RegistryAuth {
        RegistryAuth::from_env()
    }
}

/// Fixed per-registry credentials held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticKeychain {
    entries: HashMap<String, RegistryAuth>,
}

impl StaticKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, registry: &str, auth: RegistryAuth) -> Self {
        self.entries.insert(normalize_registry(registry), auth);
        self
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, registry: &str) -> RegistryAuth {
        self.entries
            .get(&normalize_registry(registry))
            .cloned()
            .unwrap_or_else(RegistryAuth::anonymous)
    }
}

/// Per-registry credential entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

/// Persistent credential file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: HashMap<String, CredentialEntry>,
}

/// Persistent credential store for container registries.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a credential store at the default path (`~/.strata/auth/credentials.json`).
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            StrataError::ConfigError(
                "Cannot determine home directory for credential store".to_string(),
            )
        })?;
        Ok(Self {
            path: home.join(".strata").join("auth").join("credentials.json"),
        })
    }

    /// Create a credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store credentials for a registry. Overwrites existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// Get credentials for a registry. Returns `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        Ok(file
            .registries
            .get(&normalize_registry(registry))
            .map(|e| (e.username.clone(), e.password.clone())))
    }

    /// Remove credentials for a registry. Returns true if entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file
            .registries
            .remove(&normalize_registry(registry))
            .is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            StrataError::ConfigError(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            StrataError::ConfigError(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            StrataError::ConfigError(format!(
                "Failed to rename credential store {} -> {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// Stored entries first, then the environment, then anonymous.
impl Keychain for CredentialStore {
    fn resolve(&self, registry: &str) -> RegistryAuth {
        match self.get(registry) {
            Ok(Some((username, password))) => RegistryAuth::basic(username, password),
            Ok(None) => RegistryAuth::from_env(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                RegistryAuth::from_env()
            }
        }
    }
}

/// Normalize registry names (e.g., "docker.io" and "index.docker.io" → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("credentials.json"))
    }

    #[test]
    fn test_registry_auth_variants() {
        assert!(RegistryAuth::anonymous().is_anonymous());
        let auth = RegistryAuth::basic("user", "pass");
        assert!(!auth.is_anonymous());
        assert_eq!(auth.basic_credentials(), Some(("user", "pass")));
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
    }

    #[test]
    fn test_store_and_resolve() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("localhost:5000", "user1", "pass1").unwrap();
        assert_eq!(
            store.get("localhost:5000").unwrap(),
            Some(("user1".to_string(), "pass1".to_string()))
        );
        assert_eq!(
            store.resolve("localhost:5000"),
            RegistryAuth::basic("user1", "pass1")
        );
    }

    #[test]
    fn test_overwrite_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        store.store("ghcr.io", "user2", "pass2").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user2".to_string(), "pass2".to_string()))
        );
        assert!(store.remove("ghcr.io").unwrap());
        assert!(!store.remove("ghcr.io").unwrap());
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_docker_io_normalization() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("docker.io", "user", "pass").unwrap();
        let expected = Some(("user".to_string(), "pass".to_string()));
        assert_eq!(store.get("index.docker.io").unwrap(), expected);
        assert_eq!(store.get("registry-1.docker.io").unwrap(), expected);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        CredentialStore::new(path.clone())
            .store("ghcr.io", "user", "pass")
            .unwrap();
        let creds = CredentialStore::new(path).get("ghcr.io").unwrap();
        assert_eq!(creds, Some(("user".to_string(), "pass".to_string())));
    }

    #[test]
    fn test_static_keychain() {
        let keychain =
            StaticKeychain::new().with("localhost:5000", RegistryAuth::basic("u", "p"));
        assert_eq!(keychain.resolve("LOCALHOST:5000"), RegistryAuth::basic("u", "p"));
        assert!(keychain.resolve("ghcr.io").is_anonymous());
        assert!(AnonymousKeychain.resolve("ghcr.io").is_anonymous());
    }

    #[test]
    fn test_env_keychain_same_for_every_registry() {
        let keychain = EnvKeychain;
        let expected = RegistryAuth::from_env();
        for registry in ["docker.io", "ghcr.io", "localhost:5000"] {
            let auth = keychain.resolve(registry);
            assert_eq!(auth.is_anonymous(), expected.is_anonymous());
            assert_eq!(auth.basic_credentials(), expected.basic_credentials());
        }
    }
}
