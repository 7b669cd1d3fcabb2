//! Backend-agnostic in-memory image model.
//!
//! An [`ImageModel`] holds everything a save needs: the target name, the
//! resolved base image, the layers appended since, and the image config.
//! It performs no I/O; backends resolve the base and commit the result.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::config::{
    ConfigFile, ContainerConfig, Descriptor, EmptyObject, HealthConfig, RootFs, NORMALIZED_CREATED,
};
use super::reference::ImageReference;

/// Base image resolved when the model was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    /// Reference the base was resolved from
    pub reference: ImageReference,
    /// Manifest digest (registry) or image id (daemon)
    pub digest: Option<String>,
    /// Base layers, bottom to top
    pub layers: Vec<BaseLayer>,
}

/// A layer inherited from the base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLayer {
    /// sha256 of the uncompressed layer
    pub diff_id: String,
    /// Registry descriptor, when the base came from a registry
    pub descriptor: Option<Descriptor>,
}

/// A layer appended to the model, staged at save time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLayer {
    /// Caller-owned tar path
    pub source: PathBuf,
    /// Expected diff id, checked when staged
    pub diff_id: Option<String>,
}

/// Mutable image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub labels: BTreeMap<String, String>,
    /// Declaration order is preserved. A name without a value is an entry
    /// the base declared without `=`.
    pub env: Vec<(String, Option<String>)>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    /// Normalized as `port/proto`
    pub exposed_ports: BTreeSet<String>,
    // Inherited from the base, never mutated.
    pub user: Option<String>,
    pub healthcheck: Option<HealthConfig>,
    pub on_build: Option<Vec<String>>,
    pub shell: Option<Vec<String>>,
    pub stop_signal: Option<String>,
    pub volumes: BTreeSet<String>,
}

impl ImageConfig {
    /// Normalize a config read from a registry or daemon.
    ///
    /// Empty strings and empty lists read as unset.
    pub fn from_container_config(config: &ContainerConfig) -> Self {
        let env = config
            .env
            .iter()
            .flatten()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (entry.clone(), None),
            })
            .collect();

        Self {
            labels: config.labels.clone().unwrap_or_default(),
            env,
            entrypoint: config.entrypoint.clone().filter(|e| !e.is_empty()),
            cmd: config.cmd.clone().filter(|c| !c.is_empty()),
            working_dir: config.working_dir.clone().filter(|w| !w.is_empty()),
            exposed_ports: config
                .exposed_ports
                .iter()
                .flat_map(|ports| ports.keys().cloned())
                .collect(),
            user: config.user.clone().filter(|u| !u.is_empty()),
            healthcheck: config.healthcheck.clone().filter(|h| *h != HealthConfig::default()),
            on_build: config.on_build.clone().filter(|o| !o.is_empty()),
            shell: config.shell.clone().filter(|s| !s.is_empty()),
            stop_signal: config.stop_signal.clone().filter(|s| !s.is_empty()),
            volumes: config
                .volumes
                .iter()
                .flat_map(|volumes| volumes.keys().cloned())
                .collect(),
        }
    }

    /// Render the canonical `config` section.
    pub fn to_container_config(&self) -> ContainerConfig {
        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect();

        ContainerConfig {
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            env: Some(env).filter(|e| !e.is_empty()),
            exposed_ports: empty_object_map(&self.exposed_ports),
            healthcheck: self.healthcheck.clone(),
            labels: Some(self.labels.clone()).filter(|l| !l.is_empty()),
            on_build: self.on_build.clone(),
            shell: self.shell.clone(),
            stop_signal: self.stop_signal.clone(),
            user: self.user.clone(),
            volumes: empty_object_map(&self.volumes),
            working_dir: self.working_dir.clone(),
        }
    }
}

fn empty_object_map(keys: &BTreeSet<String>) -> Option<BTreeMap<String, EmptyObject>> {
    if keys.is_empty() {
        return None;
    }
    Some(keys.iter().map(|k| (k.clone(), EmptyObject {})).collect())
}

/// In-memory image owned by one caller between creation and save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageModel {
    name: ImageReference,
    base: Option<BaseImage>,
    os: String,
    os_version: Option<String>,
    architecture: String,
    variant: Option<String>,
    layers: Vec<PendingLayer>,
    config: ImageConfig,
    dirty: bool,
}

impl ImageModel {
    /// Empty image with no base layers.
    pub fn scratch(name: ImageReference, os: &str, architecture: &str) -> Self {
        Self {
            name,
            base: None,
            os: os.to_string(),
            os_version: None,
            architecture: architecture.to_string(),
            variant: None,
            layers: Vec::new(),
            config: ImageConfig::default(),
            dirty: false,
        }
    }

    /// Image derived from `base`, inheriting its config, OS and architecture.
    pub fn from_base(name: ImageReference, base: BaseImage, base_config: &ConfigFile) -> Self {
        Self {
            name,
            base: Some(base),
            os: base_config.os.clone(),
            os_version: base_config.os_version.clone().filter(|v| !v.is_empty()),
            architecture: base_config.architecture.clone(),
            variant: base_config.variant.clone().filter(|v| !v.is_empty()),
            layers: Vec::new(),
            config: ImageConfig::from_container_config(&base_config.config),
            dirty: false,
        }
    }

    pub fn name(&self) -> &ImageReference {
        &self.name
    }

    pub fn rename(&mut self, name: ImageReference) {
        self.name = name;
    }

    pub fn base(&self) -> Option<&BaseImage> {
        self.base.as_ref()
    }

    /// Base layers, bottom to top.
    pub fn base_layers(&self) -> &[BaseLayer] {
        self.base.as_ref().map(|b| b.layers.as_slice()).unwrap_or(&[])
    }

    /// Layers appended since creation, in append order.
    pub fn layers(&self) -> &[PendingLayer] {
        &self.layers
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    /// CPU variant inherited from the base, e.g. `v7` or `v8`.
    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    pub fn os_version(&self) -> Option<&str> {
        self.os_version.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.labels
    }

    /// Value of `key`; `None` also for a name declared without a value.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.config
            .env
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn env_vars(&self) -> &[(String, Option<String>)] {
        &self.config.env
    }

    pub fn entrypoint(&self) -> Option<&[String]> {
        self.config.entrypoint.as_deref()
    }

    pub fn cmd(&self) -> Option<&[String]> {
        self.config.cmd.as_deref()
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.config.working_dir.as_deref()
    }

    pub fn exposed_ports(&self) -> &BTreeSet<String> {
        &self.config.exposed_ports
    }

    /// Render the config file for a commit.
    ///
    /// `new_diff_ids` are the staged diff ids of [`layers`](Self::layers), in order.
    pub fn render_config(&self, new_diff_ids: &[String]) -> ConfigFile {
        let diff_ids = self
            .base_layers()
            .iter()
            .map(|l| l.diff_id.clone())
            .chain(new_diff_ids.iter().cloned())
            .collect();

        ConfigFile {
            architecture: self.architecture.clone(),
            config: self.config.to_container_config(),
            created: Some(NORMALIZED_CREATED.to_string()),
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            rootfs: RootFs {
                diff_ids,
                ..RootFs::default()
            },
            variant: self.variant.clone(),
        }
    }

    pub(crate) fn config_mut(&mut self) -> &mut ImageConfig {
        self.dirty = true;
        &mut self.config
    }

    pub(crate) fn push_layer(&mut self, layer: PendingLayer) {
        self.dirty = true;
        self.layers.push(layer);
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ConfigFile {
        ConfigFile::from_slice(
            br#"{
                "architecture": "amd64",
                "os": "linux",
                "created": "2023-05-19T20:19:24Z",
                "config": {
                    "Env": ["PATH=/usr/local/sbin:/usr/bin", "HOME"],
                    "Cmd": ["sh"],
                    "WorkingDir": "",
                    "Entrypoint": null,
                    "ExposedPorts": {"80/tcp": {}}
                },
                "rootfs": {"type": "layers", "diff_ids": ["sha256:base"]}
            }"#,
        )
        .unwrap()
    }

    fn base_model() -> ImageModel {
        let config = base_config();
        let base = BaseImage {
            reference: ImageReference::parse("busybox").unwrap(),
            digest: Some("sha256:manifest".to_string()),
            layers: vec![BaseLayer {
                diff_id: "sha256:base".to_string(),
                descriptor: None,
            }],
        };
        ImageModel::from_base(ImageReference::parse("localhost:5000/app").unwrap(), base, &config)
    }

    #[test]
    fn test_from_base_inherits_config() {
        let model = base_model();
        assert_eq!(model.os(), "linux");
        assert_eq!(model.architecture(), "amd64");
        assert_eq!(model.env("PATH"), Some("/usr/local/sbin:/usr/bin"));
        assert_eq!(model.env("HOME"), None);
        assert_eq!(model.env_vars()[1], ("HOME".to_string(), None));
        assert_eq!(model.cmd(), Some(&["sh".to_string()][..]));
        assert_eq!(model.working_dir(), None);
        assert_eq!(model.entrypoint(), None);
        assert!(model.exposed_ports().contains("80/tcp"));
        assert_eq!(model.base_layers().len(), 1);
        assert!(!model.is_dirty());
    }

    #[test]
    fn test_render_config_appends_diff_ids() {
        let model = base_model();
        let config = model.render_config(&["sha256:a".to_string(), "sha256:b".to_string()]);
        assert_eq!(
            config.rootfs.diff_ids,
            vec!["sha256:base", "sha256:a", "sha256:b"]
        );
        assert_eq!(config.created.as_deref(), Some(NORMALIZED_CREATED));
        assert_eq!(config.config.working_dir, None);
        assert_eq!(
            config.config.env,
            Some(vec![
                "PATH=/usr/local/sbin:/usr/bin".to_string(),
                "HOME".to_string()
            ])
        );
    }

    #[test]
    fn test_render_config_roundtrips_through_normalization() {
        let model = base_model();
        let rendered = model.render_config(&[]);
        let reparsed = ImageConfig::from_container_config(&rendered.config);
        assert_eq!(&reparsed, model.config());
    }

    #[test]
    fn test_inherited_runtime_fields_survive_render() {
        let config = ConfigFile::from_slice(
            br#"{
                "architecture": "arm64",
                "variant": "v8",
                "os": "linux",
                "config": {
                    "StopSignal": "SIGTERM",
                    "Volumes": {"/var/lib/data": {}},
                    "Shell": ["/bin/bash", "-c"],
                    "OnBuild": [],
                    "Healthcheck": {"Test": ["CMD-SHELL", "curl -f localhost"], "Retries": 3}
                },
                "rootfs": {"type": "layers", "diff_ids": []}
            }"#,
        )
        .unwrap();
        let base = BaseImage {
            reference: ImageReference::parse("nginx").unwrap(),
            digest: None,
            layers: vec![],
        };
        let model = ImageModel::from_base(ImageReference::parse("app").unwrap(), base, &config);
        assert_eq!(model.variant(), Some("v8"));
        assert_eq!(model.config().on_build, None);

        let rendered = model.render_config(&[]);
        assert_eq!(rendered.variant.as_deref(), Some("v8"));
        assert_eq!(rendered.config.stop_signal.as_deref(), Some("SIGTERM"));
        assert_eq!(rendered.config.shell, config.config.shell);
        assert_eq!(rendered.config.healthcheck, config.config.healthcheck);
        assert_eq!(rendered.config.volumes, config.config.volumes);
        assert_eq!(rendered.config.on_build, None);
    }

    #[test]
    fn test_scratch_model() {
        let model = ImageModel::scratch(ImageReference::parse("app").unwrap(), "linux", "arm64");
        assert!(model.base().is_none());
        assert!(model.base_layers().is_empty());
        let config = model.render_config(&[]);
        assert!(config.rootfs.diff_ids.is_empty());
        assert_eq!(config.config, ContainerConfig::default());
    }

    #[test]
    fn test_rename() {
        let mut model = base_model();
        model.rename(ImageReference::parse("localhost:5000/other:v2").unwrap());
        assert_eq!(model.name().to_string(), "localhost:5000/other:v2");
    }
}
