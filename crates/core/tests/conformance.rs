use objstore_core::backend::local::LocalStore;
use objstore_core::backend::memory::MemoryRegistry;
use objstore_core::backend::s3::{S3Settings, S3Store};
use objstore_core::config::LiveTestEnv;
use objstore_core::conformance::{self, Fixture};
use objstore_core::{Encryption, ObjectStore, StoreConfig, diff_listings};
use tracing_subscriber::EnvFilter;

const TEST_COUNT: usize = 100;
const BROKEN_BUCKET: &str = "fake-bucket-cant-exist-fbce123";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn local_driver_conforms() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let plain = LocalStore::new(dir.path()).with_prefix("plain");
    let encrypted = LocalStore::new(dir.path())
        .with_prefix("ssetest")
        .with_encryption(Encryption::Aes256)
        .unwrap();
    let shared = LocalStore::new(dir.path())
        .with_prefix("plain")
        .with_encryption(Encryption::Aes256)
        .unwrap();
    let broken = LocalStore::new(dir.path().join(BROKEN_BUCKET));

    conformance::run_all(&Fixture::new(TEST_COUNT), &plain, &encrypted, &shared, &broken)
        .await
        .unwrap();
}

#[tokio::test]
async fn memory_driver_conforms() {
    init_tracing();
    let registry = MemoryRegistry::new();
    registry.create_bucket("charts");
    let plain = registry.store("charts").with_prefix("plain");
    let encrypted = registry
        .store("charts")
        .with_prefix("ssetest")
        .with_encryption(Encryption::Aes256);
    let shared = registry
        .store("charts")
        .with_prefix("plain")
        .with_encryption(Encryption::Aes256);
    let broken = registry.store(BROKEN_BUCKET);

    conformance::run_all(&Fixture::new(TEST_COUNT), &plain, &encrypted, &shared, &broken)
        .await
        .unwrap();
}

#[tokio::test]
async fn config_selected_drivers_conform() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = MemoryRegistry::new();
    registry.create_bucket("charts");

    let local = |extra: &str| {
        StoreConfig::from_toml(&format!(
            "type = \"local\"\npath = {:?}\nprefix = \"plain\"\n{extra}",
            dir.path().display().to_string()
        ))
        .unwrap()
        .open(&registry)
        .unwrap()
    };
    let plain = local("");
    let shared = local("encryption = \"AES256\"");
    let encrypted = StoreConfig::from_toml(
        "type = \"memory\"\nbucket = \"charts\"\nprefix = \"ssetest\"\nencryption = \"AES256\"",
    )
    .unwrap()
    .open(&registry)
    .unwrap();
    let broken = StoreConfig::from_toml(&format!("type = \"memory\"\nbucket = \"{BROKEN_BUCKET}\""))
        .unwrap()
        .open(&registry)
        .unwrap();

    conformance::run_all(
        &Fixture::new(10),
        plain.as_ref(),
        encrypted.as_ref(),
        shared.as_ref(),
        broken.as_ref(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn prefixed_objects_visible_from_bucket_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = LocalStore::new(dir.path());
    let scoped = LocalStore::new(dir.path()).with_prefix("ssetest");

    let fixture = Fixture::new(3);
    fixture.populate(&scoped).await.unwrap();

    let paths: Vec<_> = root
        .list_objects("ssetest/")
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.path)
        .collect();
    assert_eq!(paths.len(), 6);
    assert!(paths.iter().all(|p| p.starts_with("ssetest/")));
    assert_eq!(root.list_folders("").await.unwrap(), vec!["ssetest"]);
    assert_eq!(scoped.list_folders("").await.unwrap().len(), 3);
    assert!(
        scoped
            .list_objects("")
            .await
            .unwrap()
            .iter()
            .all(|o| !o.path.starts_with("ssetest"))
    );

    fixture.teardown(&scoped).await.unwrap();
}

#[tokio::test]
async fn listing_diff_tracks_changes() {
    let registry = MemoryRegistry::new();
    registry.create_bucket("charts");
    let store = registry.store("charts");

    store.put_object("a.tgz", b"a").await.unwrap();
    store.put_object("b.tgz", b"b").await.unwrap();
    let before = store.list_objects("").await.unwrap();

    store.put_object("b.tgz", b"b2").await.unwrap();
    store.put_object("c.tgz", b"c").await.unwrap();
    store.delete_object("a.tgz").await.unwrap();
    let after = store.list_objects("").await.unwrap();

    let diff = diff_listings(&before, &after);
    let paths = |objects: &[objstore_core::Object]| {
        objects.iter().map(|o| o.path.clone()).collect::<Vec<_>>()
    };
    assert_eq!(paths(&diff.added), vec!["c.tgz"]);
    assert_eq!(paths(&diff.removed), vec!["a.tgz"]);
    assert_eq!(paths(&diff.updated), vec!["b.tgz"]);
    assert!(after.iter().all(|o| o.has_extension("tgz")));
}

#[tokio::test]
async fn live_s3_conforms() {
    init_tracing();
    let Some(env) = LiveTestEnv::from_env() else {
        return;
    };
    let plain = S3Store::new(env.settings(Some("plain"), Encryption::None)).unwrap();
    let encrypted = S3Store::new(env.settings(Some("ssetest"), Encryption::Aes256)).unwrap();
    let shared = S3Store::new(env.settings(Some("plain"), Encryption::Aes256)).unwrap();
    let mut broken_settings = S3Settings::new(BROKEN_BUCKET);
    broken_settings.endpoint = Some(env.endpoint.clone());
    let broken = S3Store::new(broken_settings).unwrap();

    conformance::run_all(&Fixture::new(TEST_COUNT), &plain, &encrypted, &shared, &broken)
        .await
        .unwrap();
}
