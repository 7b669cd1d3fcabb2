//! Local container engine access.
//!
//! [`Daemon`] is the set of engine operations the local backend relies on.
//! [`DockerCli`] implements it by driving the `docker` CLI; images move in
//! and out of the engine as `docker save` archives (see [`super::archive`]).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use strata_core::config::DaemonConfig;
use strata_core::error::{Result, StrataError};
use tokio::process::Command;

use super::config::{ConfigFile, ContainerConfig, RootFs};

/// Engine platform facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonInfo {
    pub os: String,
    pub architecture: String,
    pub server_version: Option<String>,
}

/// Layer chain reported by `image inspect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DaemonRootFs {
    #[serde(rename = "Layers", default)]
    pub layers: Option<Vec<String>>,
}

/// Image metadata as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DaemonImage {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Os", default)]
    pub os: String,
    #[serde(rename = "Architecture", default)]
    pub architecture: String,
    #[serde(rename = "Variant", default)]
    pub variant: Option<String>,
    #[serde(rename = "OsVersion", default)]
    pub os_version: Option<String>,
    #[serde(rename = "Config", default)]
    pub config: Option<ContainerConfig>,
    #[serde(rename = "RootFS", default)]
    pub rootfs: DaemonRootFs,
}

impl DaemonImage {
    pub fn diff_ids(&self) -> &[String] {
        self.rootfs.layers.as_deref().unwrap_or(&[])
    }

    /// The image config as far as the engine exposes it.
    pub fn to_config_file(&self) -> ConfigFile {
        ConfigFile {
            architecture: self.architecture.clone(),
            config: self.config.clone().unwrap_or_default(),
            created: None,
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            rootfs: RootFs {
                diff_ids: self.diff_ids().to_vec(),
                ..RootFs::default()
            },
            variant: self.variant.clone(),
        }
    }
}

/// Operations on a local container engine.
///
/// References are passed in the engine's own string form
/// (`registry/repo:tag`, `repo@digest`, or an image id).
#[async_trait]
pub trait Daemon: Send + Sync {
    async fn info(&self) -> Result<DaemonInfo>;

    async fn image_exists(&self, reference: &str) -> Result<bool>;

    async fn pull(&self, reference: &str) -> Result<()>;

    async fn inspect(&self, reference: &str) -> Result<DaemonImage>;

    /// Load a `docker save` archive; returns the loaded image id.
    async fn load(&self, archive: &Path) -> Result<String>;

    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    async fn remove(&self, reference: &str) -> Result<()>;

    /// Export an image as a `docker save` archive.
    async fn save_archive(&self, reference: &str, output: &Path) -> Result<()>;

    /// Push a tagged image to its registry.
    async fn push(&self, reference: &str) -> Result<()>;
}

/// [`Daemon`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    host: Option<String>,
}

impl DockerCli {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            host: config.host.clone(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(host) = &self.host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd
    }

    /// Run a command to completion; non-zero exit becomes an error carrying stderr.
    async fn run(&self, step: &'static str, args: &[&str]) -> Result<String> {
        let output = self.output(step, args).await?;
        if !output.status.success() {
            return Err(StrataError::daemon(step, stderr_message(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn output(&self, step: &'static str, args: &[&str]) -> Result<std::process::Output> {
        tracing::debug!(binary = %self.binary.display(), ?args, "Running engine command");
        self.command(args).output().await.map_err(|e| {
            StrataError::daemon(
                step,
                format!("Failed to execute {}: {}", self.binary.display(), e),
            )
        })
    }
}

#[derive(Deserialize)]
struct RawInfo {
    #[serde(rename = "OSType", default)]
    os_type: String,
    #[serde(rename = "Architecture", default)]
    architecture: String,
    #[serde(rename = "ServerVersion", default)]
    server_version: Option<String>,
}

#[async_trait]
impl Daemon for DockerCli {
    async fn info(&self) -> Result<DaemonInfo> {
        let stdout = self.run("info", &["info", "--format", "{{json .}}"]).await?;
        let raw: RawInfo = serde_json::from_str(stdout.trim())
            .map_err(|e| StrataError::daemon("info", format!("Unexpected output: {}", e)))?;
        Ok(DaemonInfo {
            os: raw.os_type,
            architecture: normalize_architecture(&raw.architecture),
            server_version: raw.server_version,
        })
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let output = self
            .output("inspect", &["image", "inspect", "--format", "{{.Id}}", reference])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let message = stderr_message(&output);
        if message.to_lowercase().contains("no such image") {
            Ok(false)
        } else {
            Err(StrataError::daemon("inspect", message))
        }
    }

    async fn pull(&self, reference: &str) -> Result<()> {
        tracing::info!(reference, "Pulling image into daemon");
        self.run("pull", &["pull", "--quiet", reference]).await?;
        Ok(())
    }

    async fn inspect(&self, reference: &str) -> Result<DaemonImage> {
        let stdout = self.run("inspect", &["image", "inspect", reference]).await?;
        let images: Vec<DaemonImage> = serde_json::from_str(&stdout)
            .map_err(|e| StrataError::daemon("inspect", format!("Unexpected output: {}", e)))?;
        images
            .into_iter()
            .next()
            .ok_or_else(|| StrataError::daemon("inspect", format!("No such image: {}", reference)))
    }

    async fn load(&self, archive: &Path) -> Result<String> {
        let path = archive.to_string_lossy();
        let stdout = self.run("load", &["load", "--input", &*path]).await?;
        match parse_load_output(&stdout) {
            Some(LoadedImage::Id(id)) => Ok(id),
            Some(LoadedImage::Name(name)) => Ok(self.inspect(&name).await?.id),
            None => Err(StrataError::daemon(
                "load",
                format!("Unexpected output: {}", stdout.trim()),
            )),
        }
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run("tag", &["tag", source, target]).await?;
        Ok(())
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        self.run("remove", &["image", "rm", reference]).await?;
        Ok(())
    }

    async fn save_archive(&self, reference: &str, output: &Path) -> Result<()> {
        let path = output.to_string_lossy();
        self.run("save", &["save", "--output", &*path, reference]).await?;
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<()> {
        tracing::info!(reference, "Pushing image from daemon");
        self.run("push", &["push", "--quiet", reference]).await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LoadedImage {
    Id(String),
    Name(String),
}

/// Last image reported by `docker load`.
fn parse_load_output(stdout: &str) -> Option<LoadedImage> {
    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("Loaded image ID:") {
            Some(LoadedImage::Id(id.trim().to_string()))
        } else {
            line.strip_prefix("Loaded image:")
                .map(|name| LoadedImage::Name(name.trim().to_string()))
        }
    })
}

fn stderr_message(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

/// Map engine architecture names (`x86_64`) to OCI ones (`amd64`).
pub fn normalize_architecture(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
    .to_string()
}
