//! Integration test: identical mutations reproduce identical images.
//!
//! Two images are built from the same base with the same mutation sequence,
//! each through either the registry or the daemon backend, and compared
//! through the registry protocol.
//!
//! The in-process scenarios run by default. The live scenarios need a
//! docker daemon and a registry on `localhost:5000`; registry credentials,
//! if any, come from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`:
//!
//! ```bash
//! docker run -d -p 5000:5000 registry:2
//! STRATA_INSECURE_REGISTRIES=localhost:5000 \
//!     cargo test -p strata-runtime --test reproducibility -- --ignored --nocapture
//! ```

mod common;

use std::sync::Arc;

use common::{Fixtures, MutationPlan, TestContext};
use strata_core::config::StrataConfig;
use strata_runtime::oci::verify::compare;
use strata_core::error::StrataError;
use strata_runtime::oci::{snapshot, Daemon, DockerCli, EnvKeychain};
use strata_runtime::{
    verify_reproducible, Image, ImageOptions, ImageReference, LocalImage, OciRegistry, Registry,
    RemoteImage,
};

const SEED: u64 = 0x5eed_1980;

async fn remote_image(ctx: &TestContext, name: &str) -> RemoteImage {
    let options = ImageOptions::default().from_base_image(ctx.base.clone());
    RemoteImage::new(name, ctx.registry.clone(), options)
        .await
        .expect("create remote image")
}

async fn local_image(ctx: &TestContext, name: &str) -> LocalImage {
    let options = ImageOptions::default().from_base_image(ctx.base.clone());
    LocalImage::new(name, ctx.daemon.clone(), options)
        .await
        .expect("create local image")
}

async fn assert_reproducible(ctx: &TestContext, name1: &str, name2: &str) {
    let a = ImageReference::parse(name1).unwrap();
    let b = ImageReference::parse(name2).unwrap();
    let report = verify_reproducible(ctx.registry.as_ref(), &a, &b)
        .await
        .expect("images should be reproducible");
    assert!(report.config_equal);
    assert!(report.image_ids_equal);
    assert!(report.manifests_equal, "{:?}", report.differences);
}

#[tokio::test]
async fn test_remote_remote() {
    let mut fixtures = Fixtures::new(SEED);
    let ctx = TestContext::new(&mut fixtures);
    let plan = MutationPlan::random(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    let mut img1 = remote_image(&ctx, &name1).await;
    let saved1 = plan.mutate_and_save(&mut img1).await;

    let mut img2 = remote_image(&ctx, &name2).await;
    let saved2 = plan.mutate_and_save(&mut img2).await;

    assert_eq!(saved1.image_id, saved2.image_id);
    assert_eq!(saved1.digest, saved2.digest);
    assert_reproducible(&ctx, &name1, &name2).await;
}

#[tokio::test]
async fn test_local_local() {
    let mut fixtures = Fixtures::new(SEED + 1);
    let ctx = TestContext::new(&mut fixtures);
    let plan = MutationPlan::random(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    let mut img1 = local_image(&ctx, &name1).await;
    let saved1 = plan.mutate_and_save(&mut img1).await;
    ctx.daemon.push(&name1).await.expect("push image 1");

    let mut img2 = local_image(&ctx, &name2).await;
    let saved2 = plan.mutate_and_save(&mut img2).await;
    ctx.daemon.push(&name2).await.expect("push image 2");

    assert_eq!(saved1.image_id, saved2.image_id);
    assert_reproducible(&ctx, &name1, &name2).await;
}

#[tokio::test]
async fn test_remote_local() {
    let mut fixtures = Fixtures::new(SEED + 2);
    let ctx = TestContext::new(&mut fixtures);
    let plan = MutationPlan::random(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    let mut img1 = remote_image(&ctx, &name1).await;
    let saved1 = plan.mutate_and_save(&mut img1).await;

    let mut img2 = local_image(&ctx, &name2).await;
    let saved2 = plan.mutate_and_save(&mut img2).await;
    ctx.daemon.push(&name2).await.expect("push image 2");

    assert_eq!(saved1.image_id, saved2.image_id);
    assert_eq!(
        img1.identifier().await.unwrap(),
        ctx.registry
            .manifest_digest(&ImageReference::parse(&name2).unwrap())
            .await
            .unwrap()
    );
    assert_reproducible(&ctx, &name1, &name2).await;
}

#[tokio::test]
async fn test_created_is_normalized() {
    let mut fixtures = Fixtures::new(SEED + 3);
    let ctx = TestContext::new(&mut fixtures);
    let plan = MutationPlan::random(&mut fixtures);
    let name = fixtures.image_name();

    let mut image = remote_image(&ctx, &name).await;
    let saved = plan.mutate_and_save(&mut image).await;
    assert_eq!(saved.config.created.as_deref(), Some("1980-01-01T00:00:01Z"));

    let snap = snapshot(ctx.registry.as_ref(), image.name()).await.unwrap();
    assert_eq!(snap.config.config.entrypoint, Some(vec!["some".to_string(), "entrypoint".to_string()]));
    assert_eq!(snap.config.config.cmd, Some(vec!["some".to_string(), "cmd".to_string()]));
    assert_eq!(snap.config.config.working_dir.as_deref(), Some(plan.working_dir.as_str()));
    assert_eq!(snap.config.rootfs.diff_ids.len(), 4);
}

#[tokio::test]
async fn test_label_last_write_wins() {
    let mut fixtures = Fixtures::new(SEED + 4);
    let ctx = TestContext::new(&mut fixtures);
    let name = fixtures.image_name();

    let mut image = remote_image(&ctx, &name).await;
    image.set_label("k", "v1").unwrap();
    image.set_label("k", "v2").unwrap();
    let saved = image.save().await.unwrap();

    assert_eq!(image.model().label("k"), Some("v2"));
    let labels = saved.config.config.labels.unwrap();
    assert_eq!(labels.get("k").map(String::as_str), Some("v2"));
    assert_eq!(labels.len(), 1);
}

#[tokio::test]
async fn test_layer_order() {
    let mut fixtures = Fixtures::new(SEED + 5);
    let ctx = TestContext::new(&mut fixtures);
    let name = fixtures.image_name();
    let (a, b) = (fixtures.random_layer(), fixtures.random_layer());

    let mut image = local_image(&ctx, &name).await;
    let base_diff_ids: Vec<String> = image
        .model()
        .base_layers()
        .iter()
        .map(|l| l.diff_id.clone())
        .collect();
    image.add_layer(&a).unwrap();
    image.add_layer(&b).unwrap();
    let saved = image.save().await.unwrap();

    let diff_ids = &saved.config.rootfs.diff_ids;
    assert_eq!(diff_ids.len(), base_diff_ids.len() + 2);
    assert_eq!(&diff_ids[..base_diff_ids.len()], base_diff_ids.as_slice());
    assert_eq!(
        diff_ids[base_diff_ids.len()],
        strata_runtime::oci::layer::sha256_file(&a).unwrap()
    );
    assert_eq!(
        diff_ids[base_diff_ids.len() + 1],
        strata_runtime::oci::layer::sha256_file(&b).unwrap()
    );
}

#[tokio::test]
async fn test_set_working_dir_idempotent() {
    let mut fixtures = Fixtures::new(SEED + 6);
    let ctx = TestContext::new(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    let mut once = remote_image(&ctx, &name1).await;
    once.set_working_dir("/w").unwrap();
    let mut twice = remote_image(&ctx, &name2).await;
    twice.set_working_dir("/w").unwrap();
    twice.set_working_dir("/w").unwrap();

    assert_eq!(once.model().config(), twice.model().config());
    let (a, b) = (once.save().await.unwrap(), twice.save().await.unwrap());
    assert_eq!(a.image_id, b.image_id);
}

#[tokio::test]
async fn test_differing_mutations_are_reported() {
    let mut fixtures = Fixtures::new(SEED + 7);
    let ctx = TestContext::new(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    let mut img1 = remote_image(&ctx, &name1).await;
    img1.set_cmd(&["one"]).unwrap();
    img1.save().await.unwrap();
    let mut img2 = remote_image(&ctx, &name2).await;
    img2.set_cmd(&["two"]).unwrap();
    img2.save().await.unwrap();

    let a = snapshot(ctx.registry.as_ref(), img1.name()).await.unwrap();
    let b = snapshot(ctx.registry.as_ref(), img2.name()).await.unwrap();
    let report = compare(&a, &b);
    assert!(!report.is_reproducible());
    assert!(!report.differences.is_empty());
}

#[tokio::test]
async fn test_remote_failed_name_leaves_names_untouched() {
    let mut fixtures = Fixtures::new(SEED + 8);
    let ctx = TestContext::new(&mut fixtures);
    let plan = MutationPlan::random(&mut fixtures);
    let (name, other, locked) = (
        fixtures.image_name(),
        fixtures.image_name(),
        fixtures.image_name(),
    );
    let locked = ImageReference::parse(&locked).unwrap();
    ctx.registry.deny_manifests(&locked);

    let mut image = remote_image(&ctx, &name).await;
    plan.mutate_and_save(&mut image).await;
    let saved_digest = image.identifier().await.unwrap();

    image.set_label("rebuilt", "true").unwrap();
    let other = ImageReference::parse(&other).unwrap();
    let err = image
        .save_as(&[other.clone(), locked.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::PushRejected { .. }), "{:?}", err);

    assert_eq!(image.identifier().await.unwrap(), saved_digest);
    assert_eq!(ctx.registry.find_manifest_digest(&other).await.unwrap(), None);
    assert_eq!(ctx.registry.find_manifest_digest(&locked).await.unwrap(), None);
}

#[tokio::test]
async fn test_local_failed_name_leaves_names_untouched() {
    let mut fixtures = Fixtures::new(SEED + 9);
    let ctx = TestContext::new(&mut fixtures);
    let plan = MutationPlan::random(&mut fixtures);
    let (name, other, locked) = (
        fixtures.image_name(),
        fixtures.image_name(),
        fixtures.image_name(),
    );
    ctx.daemon.deny_tags(&locked);

    let mut image = local_image(&ctx, &name).await;
    let saved = plan.mutate_and_save(&mut image).await;

    image.set_label("rebuilt", "true").unwrap();
    let extra = [
        ImageReference::parse(&other).unwrap(),
        ImageReference::parse(&locked).unwrap(),
    ];
    assert!(image.save_as(&extra).await.is_err());

    assert_eq!(image.identifier().await.unwrap(), saved.image_id);
    assert!(!ctx.daemon.image_exists(&other).await.unwrap());
    assert!(!ctx.daemon.image_exists(&locked).await.unwrap());
}

#[tokio::test]
async fn test_registry_reported_digest_is_checked() {
    let mut fixtures = Fixtures::new(SEED + 10);
    let ctx = TestContext::new(&mut fixtures);
    let plan = MutationPlan::random(&mut fixtures);
    let name = fixtures.image_name();

    ctx.registry.set_reencode_manifests(true);
    let mut image = remote_image(&ctx, &name).await;
    image.add_layer(&plan.layer1).unwrap();
    let err = image.save().await.unwrap_err();
    assert!(matches!(err, StrataError::DigestMismatch { .. }), "{:?}", err);
    assert!(!image.found().await.unwrap());
}

// Live scenarios

fn live_config() -> StrataConfig {
    let mut config = StrataConfig::from_env();
    if !config.registry.insecure.iter().any(|h| h == "localhost:5000") {
        config.registry.insecure.push("localhost:5000".to_string());
    }
    config
}

const LIVE_BASE: &str =
    "busybox@sha256:915f390a8912e16d4beb8689720a17348f3f6d1a7b659697df850ab625ea29d5";

#[tokio::test]
#[ignore] // Requires a registry on localhost:5000
async fn test_live_remote_remote() {
    let config = live_config();
    let registry = Arc::new(OciRegistry::new(&config, Arc::new(EnvKeychain)));
    let options = ImageOptions::from_config(&config).from_base_image(LIVE_BASE);

    let mut fixtures = Fixtures::new(SEED + 2);
    let plan = MutationPlan::random(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    let mut digests = Vec::new();
    for name in [&name1, &name2] {
        let mut image = RemoteImage::new(name, registry.clone(), options.clone())
            .await
            .unwrap();
        assert!(!image.found().await.unwrap());
        let saved = plan.mutate_and_save(&mut image).await;
        assert!(image.found().await.unwrap());
        assert_eq!(image.identifier().await.unwrap(), saved.identifier());
        digests.push(saved.identifier().to_string());
    }
    assert_eq!(digests[0], digests[1]);

    let a = ImageReference::parse(&name1).unwrap();
    let b = ImageReference::parse(&name2).unwrap();
    let report = verify_reproducible(registry.as_ref(), &a, &b).await.unwrap();
    assert!(report.manifests_equal);
    println!("    ✓ reproducible: {:?}", report);
}

#[tokio::test]
#[ignore] // Requires a docker daemon and a registry on localhost:5000
async fn test_live_remote_local() {
    let config = live_config();
    let registry = Arc::new(OciRegistry::new(&config, Arc::new(EnvKeychain)));
    let daemon = Arc::new(DockerCli::new(&config.daemon));
    let options = ImageOptions::from_config(&config).from_base_image(LIVE_BASE);

    let mut fixtures = Fixtures::new(SEED);
    let plan = MutationPlan::random(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    let mut img1 = RemoteImage::new(&name1, registry.clone(), options.clone())
        .await
        .unwrap();
    plan.mutate_and_save(&mut img1).await;

    let mut img2 = LocalImage::new(&name2, daemon.clone(), options).await.unwrap();
    plan.mutate_and_save(&mut img2).await;
    daemon.push(&name2).await.unwrap();

    let a = ImageReference::parse(&name1).unwrap();
    let b = ImageReference::parse(&name2).unwrap();
    let report = verify_reproducible(registry.as_ref(), &a, &b).await.unwrap();
    println!("    ✓ reproducible: {:?}", report);

    let _ = daemon.remove(&name2).await;
}

#[tokio::test]
#[ignore] // Requires a docker daemon and a registry on localhost:5000
async fn test_live_local_local() {
    let config = live_config();
    let registry = Arc::new(OciRegistry::new(&config, Arc::new(EnvKeychain)));
    let daemon = Arc::new(DockerCli::new(&config.daemon));
    let options = ImageOptions::from_config(&config).from_base_image(LIVE_BASE);

    let mut fixtures = Fixtures::new(SEED + 1);
    let plan = MutationPlan::random(&mut fixtures);
    let (name1, name2) = (fixtures.image_name(), fixtures.image_name());

    for name in [&name1, &name2] {
        let mut image = LocalImage::new(name, daemon.clone(), options.clone())
            .await
            .unwrap();
        plan.mutate_and_save(&mut image).await;
        daemon.push(name).await.unwrap();
    }

    let a = ImageReference::parse(&name1).unwrap();
    let b = ImageReference::parse(&name2).unwrap();
    verify_reproducible(registry.as_ref(), &a, &b).await.unwrap();

    for name in [&name1, &name2] {
        let _ = daemon.remove(name).await;
    }
}
