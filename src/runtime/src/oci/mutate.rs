//! Mutation engine.
//!
//! Every change to an [`ImageModel`] goes through [`apply`]. Mutations are
//! pure edits of the model; the only filesystem access is the check that an
//! appended layer path can be opened.

use std::fmt;
use std::path::{Path, PathBuf};

use strata_core::error::{Result, StrataError};

use super::model::{ImageModel, PendingLayer};

/// Protocols accepted for exposed ports.
const PORT_PROTOCOLS: [&str; 3] = ["tcp", "udp", "sctp"];

/// A single change to an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Append a layer tar
    AddLayer(PathBuf),
    /// Append a layer tar whose diff id is known up front
    AddLayerWithDiffId { path: PathBuf, diff_id: String },
    /// Insert or overwrite a label
    SetLabel { key: String, value: String },
    RemoveLabel(String),
    /// Insert or overwrite an environment variable
    SetEnv { key: String, value: String },
    /// Replace the entrypoint; empty clears it
    SetEntrypoint(Vec<String>),
    /// Replace the command; empty clears it
    SetCmd(Vec<String>),
    /// Replace the working directory; empty clears it
    SetWorkingDir(String),
    /// Expose `port[/proto]`, tcp by default
    AddExposedPort(String),
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::AddLayer(path) => write!(f, "AddLayer({})", path.display()),
            Mutation::AddLayerWithDiffId { path, diff_id } => {
                write!(f, "AddLayerWithDiffId({}, {})", path.display(), diff_id)
            }
            Mutation::SetLabel { key, .. } => write!(f, "SetLabel({})", key),
            Mutation::RemoveLabel(key) => write!(f, "RemoveLabel({})", key),
            Mutation::SetEnv { key, .. } => write!(f, "SetEnv({})", key),
            Mutation::SetEntrypoint(args) => write!(f, "SetEntrypoint({:?})", args),
            Mutation::SetCmd(args) => write!(f, "SetCmd({:?})", args),
            Mutation::SetWorkingDir(dir) => write!(f, "SetWorkingDir({})", dir),
            Mutation::AddExposedPort(port) => write!(f, "AddExposedPort({})", port),
        }
    }
}

/// Apply one mutation. On error the model is left unchanged.
pub fn apply(model: &mut ImageModel, mutation: Mutation) -> Result<()> {
    tracing::trace!(image = %model.name(), mutation = %mutation, "Applying mutation");

    match mutation {
        Mutation::AddLayer(path) => {
            check_layer_source(&path)?;
            model.push_layer(PendingLayer {
                source: path,
                diff_id: None,
            });
        }
        Mutation::AddLayerWithDiffId { path, diff_id } => {
            check_layer_source(&path)?;
            if !is_sha256_digest(&diff_id) {
                return Err(StrataError::InvalidLayerSource {
                    path,
                    message: format!("diff id '{}' is not a sha256 digest", diff_id),
                });
            }
            model.push_layer(PendingLayer {
                source: path,
                diff_id: Some(diff_id),
            });
        }
        Mutation::SetLabel { key, value } => {
            check_key("SetLabel", &key)?;
            model.config_mut().labels.insert(key, value);
        }
        Mutation::RemoveLabel(key) => {
            check_key("RemoveLabel", &key)?;
            model.config_mut().labels.remove(&key);
        }
        Mutation::SetEnv { key, value } => {
            check_key("SetEnv", &key)?;
            if key.contains('=') {
                return Err(StrataError::InvalidKey(format!(
                    "SetEnv: key '{}' must not contain '='",
                    key
                )));
            }
            let env = &mut model.config_mut().env;
            match env.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = Some(value),
                None => env.push((key, Some(value))),
            }
        }
        Mutation::SetEntrypoint(args) => {
            model.config_mut().entrypoint = Some(args).filter(|a| !a.is_empty());
        }
        Mutation::SetCmd(args) => {
            model.config_mut().cmd = Some(args).filter(|a| !a.is_empty());
        }
        Mutation::SetWorkingDir(dir) => {
            model.config_mut().working_dir = Some(dir).filter(|d| !d.is_empty());
        }
        Mutation::AddExposedPort(port) => {
            let port = normalize_port(&port)?;
            model.config_mut().exposed_ports.insert(port);
        }
    }
    Ok(())
}

/// Apply mutations in order, stopping at the first failure.
pub fn apply_all<I>(model: &mut ImageModel, mutations: I) -> Result<()>
where
    I: IntoIterator<Item = Mutation>,
{
    for mutation in mutations {
        apply(model, mutation)?;
    }
    Ok(())
}

fn check_key(op: &str, key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StrataError::InvalidKey(format!("{}: key must not be empty", op)));
    }
    Ok(())
}

fn check_layer_source(path: &Path) -> Result<()> {
    let invalid = |message: String| StrataError::InvalidLayerSource {
        path: path.to_path_buf(),
        message,
    };
    let file = std::fs::File::open(path).map_err(|e| invalid(e.to_string()))?;
    let metadata = file.metadata().map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }
    Ok(())
}

fn is_sha256_digest(digest: &str) -> bool {
    digest
        .strip_prefix("sha256:")
        .map_or(false, |hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// `8080` → `8080/tcp`; the protocol is lowercased.
fn normalize_port(port: &str) -> Result<String> {
    let (number, protocol) = match port.split_once('/') {
        Some((n, p)) => (n, p.to_ascii_lowercase()),
        None => (port, "tcp".to_string()),
    };
    let valid = number.parse::<u16>().map_or(false, |n| n > 0)
        && PORT_PROTOCOLS.contains(&protocol.as_str());
    if !valid {
        return Err(StrataError::InvalidKey(format!(
            "AddExposedPort: invalid port '{}'",
            port
        )));
    }
    Ok(format!("{}/{}", number, protocol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::reference::ImageReference;
    use tempfile::TempDir;

    fn model() -> ImageModel {
        ImageModel::scratch(
            ImageReference::parse("localhost:5000/app").unwrap(),
            "linux",
            "amd64",
        )
    }

    fn label(key: &str, value: &str) -> Mutation {
        Mutation::SetLabel {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn env(key: &str, value: &str) -> Mutation {
        Mutation::SetEnv {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_label_last_write_wins() {
        let mut m = model();
        apply_all(&mut m, [label("a", "1"), label("b", "2"), label("a", "3")]).unwrap();
        assert_eq!(m.label("a"), Some("3"));
        assert_eq!(m.label("b"), Some("2"));
        assert!(m.is_dirty());
    }

    #[test]
    fn test_remove_label() {
        let mut m = model();
        apply_all(
            &mut m,
            [label("a", "1"), Mutation::RemoveLabel("a".to_string())],
        )
        .unwrap();
        assert_eq!(m.label("a"), None);
        apply(&mut m, Mutation::RemoveLabel("missing".to_string())).unwrap();
    }

    #[test]
    fn test_env_upserts_in_place() {
        let mut m = model();
        apply_all(&mut m, [env("A", "1"), env("B", "2"), env("A", "3")]).unwrap();
        assert_eq!(
            m.env_vars(),
            &[
                ("A".to_string(), Some("3".to_string())),
                ("B".to_string(), Some("2".to_string()))
            ]
        );
    }

    #[test]
    fn test_empty_keys_rejected() {
        let mut m = model();
        let before = m.clone();
        assert!(matches!(
            apply(&mut m, label("", "x")),
            Err(StrataError::InvalidKey(_))
        ));
        assert!(matches!(
            apply(&mut m, env("", "x")),
            Err(StrataError::InvalidKey(_))
        ));
        assert!(matches!(
            apply(&mut m, env("A=B", "x")),
            Err(StrataError::InvalidKey(_))
        ));
        assert_eq!(m, before);
    }

    #[test]
    fn test_zero_args_unset() {
        let mut m = model();
        apply(&mut m, Mutation::SetEntrypoint(vec!["some-entrypoint".to_string()])).unwrap();
        apply(&mut m, Mutation::SetCmd(vec!["some".to_string(), "cmd".to_string()])).unwrap();
        assert_eq!(m.cmd().map(<[String]>::len), Some(2));

        apply(&mut m, Mutation::SetEntrypoint(vec![])).unwrap();
        apply(&mut m, Mutation::SetCmd(vec![])).unwrap();
        assert_eq!(m.entrypoint(), None);
        assert_eq!(m.cmd(), None);
    }

    #[test]
    fn test_working_dir_idempotent() {
        let mut once = model();
        let mut twice = model();
        apply(&mut once, Mutation::SetWorkingDir("/workspace".to_string())).unwrap();
        apply_all(
            &mut twice,
            [
                Mutation::SetWorkingDir("/workspace".to_string()),
                Mutation::SetWorkingDir("/workspace".to_string()),
            ],
        )
        .unwrap();
        assert_eq!(once, twice);

        apply(&mut once, Mutation::SetWorkingDir(String::new())).unwrap();
        assert_eq!(once.working_dir(), None);
    }

    #[test]
    fn test_exposed_ports() {
        let mut m = model();
        apply_all(
            &mut m,
            [
                Mutation::AddExposedPort("8080".to_string()),
                Mutation::AddExposedPort("53/UDP".to_string()),
                Mutation::AddExposedPort("8080/tcp".to_string()),
            ],
        )
        .unwrap();
        let ports: Vec<&str> = m.exposed_ports().iter().map(String::as_str).collect();
        assert_eq!(ports, vec!["53/udp", "8080/tcp"]);

        assert!(apply(&mut m, Mutation::AddExposedPort("http".to_string())).is_err());
        assert!(apply(&mut m, Mutation::AddExposedPort("80/icmp".to_string())).is_err());
        assert!(apply(&mut m, Mutation::AddExposedPort("0".to_string())).is_err());
    }

    #[test]
    fn test_add_layer_order_and_validation() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tar");
        let b = dir.path().join("b.tar");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let mut m = model();
        apply_all(
            &mut m,
            [Mutation::AddLayer(a.clone()), Mutation::AddLayer(b.clone())],
        )
        .unwrap();
        let sources: Vec<&PathBuf> = m.layers().iter().map(|l| &l.source).collect();
        assert_eq!(sources, vec![&a, &b]);

        let missing = apply(&mut m, Mutation::AddLayer(dir.path().join("missing.tar")));
        assert!(matches!(missing, Err(StrataError::InvalidLayerSource { .. })));

        let directory = apply(&mut m, Mutation::AddLayer(dir.path().to_path_buf()));
        assert!(matches!(directory, Err(StrataError::InvalidLayerSource { .. })));
        assert_eq!(m.layers().len(), 2);
    }

    #[test]
    fn test_add_layer_with_diff_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tar");
        std::fs::write(&path, b"a").unwrap();
        let diff_id = format!("sha256:{}", "a".repeat(64));

        let mut m = model();
        apply(
            &mut m,
            Mutation::AddLayerWithDiffId {
                path: path.clone(),
                diff_id: diff_id.clone(),
            },
        )
        .unwrap();
        assert_eq!(m.layers()[0].diff_id.as_deref(), Some(diff_id.as_str()));

        for diff_id in ["md5:abc", "", "sha256:short"] {
            let bad = apply(
                &mut m,
                Mutation::AddLayerWithDiffId {
                    path: path.clone(),
                    diff_id: diff_id.to_string(),
                },
            );
            match bad {
                Err(StrataError::InvalidLayerSource { path: p, .. }) => assert_eq!(p, path),
                other => panic!("expected InvalidLayerSource for '{}', got {:?}", diff_id, other),
            }
        }
        assert_eq!(m.layers().len(), 1);
    }

    #[test]
    fn test_display_names_mutation() {
        assert_eq!(label("k", "v").to_string(), "SetLabel(k)");
        assert_eq!(
            Mutation::SetWorkingDir("/w".to_string()).to_string(),
            "SetWorkingDir(/w)"
        );
    }
}
