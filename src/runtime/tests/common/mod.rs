//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_runtime::oci::config::{ConfigFile, ContainerConfig, RootFs};
use strata_runtime::oci::layer::{sha256_digest, single_file_tar};
use strata_runtime::{Image, ImageReference, MemoryDaemon, MemoryRegistry, SavedImage};
use tempfile::TempDir;

/// Deterministic source of names and layer contents.
pub struct Fixtures {
    rng: StdRng,
    dir: TempDir,
}

impl Fixtures {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dir: TempDir::new().expect("create fixture dir"),
        }
    }

    pub fn rand_string(&mut self, len: usize) -> String {
        (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    /// Write a tar holding one randomly named file and return its path.
    pub fn random_layer(&mut self) -> PathBuf {
        let name = format!("new-layer-{}.txt", self.rand_string(10));
        let contents = format!("new-layer-{}", self.rand_string(10));
        let tar = single_file_tar(&name, contents.as_bytes()).expect("build layer tar");
        let file = format!("{}.tar", self.rand_string(8));
        let path = self.dir.path().join(file);
        std::fs::write(&path, tar).expect("write layer tar");
        path
    }

    /// A fresh image name in the test registry.
    pub fn image_name(&mut self) -> String {
        format!("localhost:5000/strata-acceptance-{}", self.rand_string(10))
    }
}

/// The mutation sequence applied to every image in a scenario.
#[derive(Debug, Clone)]
pub struct MutationPlan {
    pub layer1: PathBuf,
    pub layer2: PathBuf,
    pub label_key: String,
    pub label_val: String,
    pub env_key: String,
    pub env_val: String,
    pub working_dir: String,
}

impl MutationPlan {
    pub fn random(fixtures: &mut Fixtures) -> Self {
        Self {
            layer1: fixtures.random_layer(),
            layer2: fixtures.random_layer(),
            label_key: format!("label-key-{}", fixtures.rand_string(10)),
            label_val: format!("label-val-{}", fixtures.rand_string(10)),
            env_key: format!("env-key-{}", fixtures.rand_string(10)),
            env_val: format!("env-val-{}", fixtures.rand_string(10)),
            working_dir: format!("working-dir-{}", fixtures.rand_string(10)),
        }
    }

    pub async fn mutate_and_save(&self, image: &mut dyn Image) -> SavedImage {
        image.add_layer(&self.layer1).expect("add layer1");
        image.add_layer(&self.layer2).expect("add layer2");
        image.set_label(&self.label_key, &self.label_val).expect("set label");
        image.set_env(&self.env_key, &self.env_val).expect("set env");
        image.set_entrypoint(&["some", "entrypoint"]).expect("set entrypoint");
        image.set_cmd(&["some", "cmd"]).expect("set cmd");
        image.set_working_dir(&self.working_dir).expect("set working dir");
        image.save().await.expect("save image")
    }
}

/// In-process registry and daemon with a busybox-like base seeded.
pub struct TestContext {
    pub registry: Arc<MemoryRegistry>,
    pub daemon: Arc<MemoryDaemon>,
    /// Digest-pinned base reference
    pub base: String,
}

impl TestContext {
    pub fn new(fixtures: &mut Fixtures) -> Self {
        let registry = Arc::new(MemoryRegistry::new());

        let tars: Vec<Vec<u8>> = (0..2)
            .map(|i| {
                let contents = fixtures.rand_string(32);
                single_file_tar(&format!("bin/tool-{}", i), contents.as_bytes())
                    .expect("build base layer")
            })
            .collect();
        let config = ConfigFile {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            created: Some("2023-05-19T20:19:24.344715404Z".to_string()),
            config: ContainerConfig {
                cmd: Some(vec!["sh".to_string()]),
                env: Some(vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                ]),
                ..Default::default()
            },
            rootfs: RootFs {
                diff_ids: tars.iter().map(|t| sha256_digest(t)).collect(),
                ..RootFs::default()
            },
            ..Default::default()
        };

        let reference = ImageReference::parse("busybox").expect("parse base");
        let digest = registry
            .seed_image(&reference, &config, &tars)
            .expect("seed base image");

        Self {
            daemon: Arc::new(MemoryDaemon::new(registry.clone())),
            registry,
            base: format!("busybox@{}", digest),
        }
    }
}
