//! Black-box checks every [`ObjectStore`] driver must pass.
//!
//! The suite populates `count` top-level objects plus `count` objects in
//! `testdir{i}/` folders, verifies listings and reads, and removes everything
//! again. Each check returns an error describing the first violation.

use anyhow::{Context, Result, ensure};
use futures::future::try_join_all;

use crate::backend::ObjectStore;

pub const CONTENT: &[u8] = b"some object";
const FILE_NAME: &str = "deleteme.txt";

/// The key set used by the suite.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub count: usize,
}

impl Fixture {
    pub fn new(count: usize) -> Self {
        Self { count }
    }

    pub fn top_level_key(i: usize) -> String {
        format!("{i}{FILE_NAME}")
    }

    pub fn nested_key(i: usize) -> String {
        format!("testdir{i}/{FILE_NAME}")
    }

    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.count).flat_map(|i| [Self::top_level_key(i), Self::nested_key(i)])
    }

    pub async fn populate(&self, store: &dyn ObjectStore) -> Result<()> {
        try_join_all(self.keys().map(|key| async move {
            store
                .put_object(&key, CONTENT)
                .await
                .with_context(|| format!("put {key}"))
        }))
        .await?;
        Ok(())
    }

    /// Delete every fixture key twice; the second pass must also succeed.
    pub async fn teardown(&self, store: &dyn ObjectStore) -> Result<()> {
        for pass in ["first", "repeated"] {
            for key in self.keys() {
                store
                    .delete_object(&key)
                    .await
                    .with_context(|| format!("{pass} delete of {key}"))?;
            }
        }
        let left = store.list_objects("").await.context("list after teardown")?;
        ensure!(
            left.iter().all(|o| !self.keys().any(|k| k == o.path)),
            "fixture objects survived teardown"
        );
        Ok(())
    }

    /// `list_objects("")` sees every fixture object and `list_folders("")`
    /// sees one folder per nested object. Expects an otherwise empty
    /// namespace.
    pub async fn check_listing(&self, store: &dyn ObjectStore) -> Result<()> {
        let objects = store.list_objects("").await.context("list objects")?;
        ensure!(
            objects.len() == 2 * self.count,
            "expected {} objects, listed {}",
            2 * self.count,
            objects.len()
        );
        ensure!(
            objects.windows(2).all(|w| w[0].path < w[1].path),
            "listing is not sorted and duplicate-free"
        );

        let folders = store.list_folders("").await.context("list folders")?;
        ensure!(
            folders.len() == self.count,
            "expected {} folders, listed {}",
            self.count,
            folders.len()
        );
        ensure!(
            folders.iter().all(|f| f.starts_with("testdir")),
            "leaf objects listed as folders: {folders:?}"
        );

        if self.count > 0 {
            let nested = store
                .list_objects("testdir0/")
                .await
                .context("list nested prefix")?;
            ensure!(
                nested.len() == 1 && nested[0].path == Self::nested_key(0),
                "prefix listing returned {nested:?}"
            );
        }
        Ok(())
    }

    pub async fn check_get(&self, store: &dyn ObjectStore) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        let key = Self::top_level_key(0);
        let object = store.get_object(&key).await.with_context(|| format!("get {key}"))?;
        ensure!(object.content == CONTENT, "content mismatch for {key}");
        ensure!(object.path == key, "object path {} != {key}", object.path);
        Ok(())
    }
}

/// Put/get/delete laws on a scratch key outside the fixture.
pub async fn check_round_trip_laws(store: &dyn ObjectStore) -> Result<()> {
    let key = "conformance/scratch.bin";
    let content: Vec<u8> = (0..=255u8).collect();

    store.put_object(key, &content).await.context("put scratch")?;
    let object = store.get_object(key).await.context("get scratch")?;
    ensure!(object.content == content, "round trip changed content");

    store.put_object(key, b"v2").await.context("overwrite scratch")?;
    let object = store.get_object(key).await.context("get overwritten")?;
    ensure!(object.content == b"v2", "overwrite not visible");

    store.delete_object(key).await.context("delete scratch")?;
    let err = store
        .get_object(key)
        .await
        .err()
        .context("get after delete succeeded")?;
    ensure!(err.is_not_found(), "get after delete: {err}");

    store
        .delete_object(key)
        .await
        .context("delete of absent key")?;

    let err = store
        .put_object("", b"")
        .await
        .err()
        .context("empty key accepted")?;
    ensure!(err.is_invalid_key(), "empty key: {err}");
    Ok(())
}

/// Every operation against a misconfigured backend reports
/// `BackendUnavailable`.
pub async fn check_broken(store: &dyn ObjectStore) -> Result<()> {
    let put = store.put_object("this-file-will-not-upload.txt", &[]).await;
    ensure!(
        matches!(&put, Err(e) if e.is_unavailable()),
        "put against broken backend: {put:?}"
    );
    let get = store.get_object("this-file-cannot-possibly-exist.tgz").await;
    ensure!(
        matches!(&get, Err(e) if e.is_unavailable()),
        "get against broken backend: {get:?}"
    );
    let objects = store.list_objects("").await;
    ensure!(
        matches!(&objects, Err(e) if e.is_unavailable()),
        "list objects against broken backend: {objects:?}"
    );
    let folders = store.list_folders("").await;
    ensure!(
        matches!(&folders, Err(e) if e.is_unavailable()),
        "list folders against broken backend: {folders:?}"
    );
    Ok(())
}

/// `plain` and `encrypted` address the same namespace. Objects either one
/// writes read back, and list, identically through the other.
pub async fn check_encryption_transparent(
    plain: &dyn ObjectStore,
    encrypted: &dyn ObjectStore,
) -> Result<()> {
    let key = "conformance/encrypted.txt";
    plain.put_object(key, CONTENT).await.context("plain put")?;
    encrypted.put_object(key, CONTENT).await.context("encrypted overwrite")?;
    for (name, store) in [("plain", plain), ("encrypted", encrypted)] {
        let object = store
            .get_object(key)
            .await
            .with_context(|| format!("{name} get"))?;
        ensure!(object.content == CONTENT, "{name} get changed content");
        let listed = store
            .list_objects(key)
            .await
            .with_context(|| format!("{name} list"))?;
        ensure!(
            listed.len() == 1 && listed[0].size == CONTENT.len() as u64,
            "{name} listing disagrees with content: {listed:?}"
        );
    }

    // Plain content that looks like an envelope stays plain.
    let lookalike = b"OSE1 is my file header";
    plain.put_object(key, lookalike).await.context("plain overwrite")?;
    let object = encrypted.get_object(key).await.context("encrypted get")?;
    ensure!(object.content == lookalike, "encrypted get changed plain content");

    encrypted.delete_object(key).await?;
    let err = plain.get_object(key).await.err().context("delete not shared")?;
    ensure!(err.is_not_found(), "get after shared delete: {err}");
    Ok(())
}

/// Full suite. `plain` and `encrypted` must start with empty namespaces that
/// do not overlap (e.g. distinct prefixes or buckets). `shared` encrypts on
/// top of `plain`'s namespace.
pub async fn run_all(
    fixture: &Fixture,
    plain: &dyn ObjectStore,
    encrypted: &dyn ObjectStore,
    shared: &dyn ObjectStore,
    broken: &dyn ObjectStore,
) -> Result<()> {
    check_broken(broken).await.context("broken backend")?;

    for (name, store) in [("plain", plain), ("encrypted", encrypted)] {
        fixture
            .populate(store)
            .await
            .with_context(|| format!("populate {name}"))?;
    }
    let checks = async {
        for (name, store) in [("plain", plain), ("encrypted", encrypted)] {
            fixture
                .check_listing(store)
                .await
                .with_context(|| format!("{name} listing"))?;
            fixture
                .check_get(store)
                .await
                .with_context(|| format!("{name} get"))?;
        }
        check_encryption_transparent(plain, shared)
            .await
            .context("shared namespace")?;
        for (name, store) in [("plain", plain), ("encrypted", encrypted)] {
            check_round_trip_laws(store)
                .await
                .with_context(|| format!("{name} round trip"))?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    // Tear down even when a check failed, then report the first failure.
    let teardown = async {
        fixture.teardown(plain).await.context("plain teardown")?;
        fixture
            .teardown(encrypted)
            .await
            .context("encrypted teardown")
    }
    .await;
    checks.and(teardown)
}
