use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{Encryption, ObjectStore};
use crate::crypto;
use crate::error::{StoreError, StoreResult};
use crate::key::{self, KeyCodec};
use crate::object::Object;

const SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct StoredObject {
    content: Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
    encryption: Encryption,
}

/// One named bucket. Keys are spread over independently locked shards so
/// writers to unrelated keys rarely contend, and no lock is held across an
/// await point.
struct MemoryBucket {
    shards: Vec<RwLock<HashMap<String, StoredObject>>>,
}

impl MemoryBucket {
    fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, storage_key: &str) -> &RwLock<HashMap<String, StoredObject>> {
        let mut hasher = DefaultHasher::new();
        storage_key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARDS]
    }

    fn put(&self, storage_key: String, object: StoredObject) {
        self.shard(&storage_key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(storage_key, object);
    }

    fn get(&self, storage_key: &str) -> Option<StoredObject> {
        self.shard(storage_key)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(storage_key)
            .cloned()
    }

    fn remove(&self, storage_key: &str) -> bool {
        self.shard(storage_key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(storage_key)
            .is_some()
    }

    /// Keys and metadata starting with `storage_prefix`, shard by shard.
    fn scan(&self, storage_prefix: &str) -> Vec<(String, StoredObject)> {
        let mut found = Vec::new();
        for shard in &self.shards {
            let map = shard.read().unwrap_or_else(PoisonError::into_inner);
            found.extend(
                map.iter()
                    .filter(|(k, _)| k.starts_with(storage_prefix))
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        found
    }
}

/// In-process stand-in for an object service: a set of named buckets shared
/// by every [`MemoryStore`] created from it. Cloning shares the buckets.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    buckets: Arc<RwLock<HashMap<String, Arc<MemoryBucket>>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` if it does not exist yet.
    pub fn create_bucket(&self, name: &str) {
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBucket::new()));
    }

    /// Drop `name` and everything in it. Returns `true` if it existed.
    pub fn delete_bucket(&self, name: &str) -> bool {
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// A store bound to `bucket`. The bucket is resolved on every call, so
    /// binding to a missing bucket only fails once the store is used.
    pub fn store(&self, bucket: &str) -> MemoryStore {
        MemoryStore {
            registry: self.clone(),
            bucket: bucket.to_string(),
            codec: KeyCodec::default(),
            encryption: Encryption::None,
        }
    }

    fn bucket(&self, name: &str) -> Option<Arc<MemoryBucket>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemoryRegistry")
            .field("buckets", &buckets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// [`ObjectStore`] over a [`MemoryRegistry`] bucket.
///
/// Encryption modes are recorded with each object the way a server applies
/// SSE; reads return the original bytes regardless.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    registry: MemoryRegistry,
    bucket: String,
    codec: KeyCodec,
    encryption: Encryption,
}

impl MemoryStore {
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.codec = KeyCodec::new(prefix);
        self
    }

    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = encryption;
        self
    }

    /// Encryption mode recorded for `key`, if the object exists.
    pub fn encryption_of(&self, key: &str) -> StoreResult<Option<Encryption>> {
        let storage_key = self.codec.to_storage(key)?;
        Ok(self
            .resolve("head")?
            .get(&storage_key)
            .map(|o| o.encryption))
    }

    fn resolve(&self, op: &'static str) -> StoreResult<Arc<MemoryBucket>> {
        self.registry.bucket(&self.bucket).ok_or_else(|| {
            StoreError::unavailable(op, format!("bucket {} does not exist", self.bucket))
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, key: &str, content: &[u8]) -> StoreResult<()> {
        let storage_key = self.codec.to_storage(key)?;
        let bucket = self.resolve("put")?;
        let object = StoredObject {
            content: Bytes::copy_from_slice(content),
            last_modified: Utc::now(),
            etag: crypto::etag_of(content),
            encryption: self.encryption,
        };
        debug!(bucket = %self.bucket, key = %storage_key, bytes = content.len(), "object stored");
        bucket.put(storage_key, object);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StoreResult<Object> {
        let key = key::normalize(key)?;
        let storage_key = self.codec.to_storage(&key)?;
        let stored = self
            .resolve("get")?
            .get(&storage_key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(Object {
            path: key,
            size: stored.content.len() as u64,
            content: stored.content.to_vec(),
            last_modified: Some(stored.last_modified),
            etag: Some(stored.etag),
        })
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        let storage_key = self.codec.to_storage(key)?;
        if self.resolve("delete")?.remove(&storage_key) {
            debug!(bucket = %self.bucket, key = %storage_key, "object deleted");
        }
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> StoreResult<Vec<Object>> {
        let storage_prefix = self.codec.to_storage_prefix(prefix)?;
        let mut objects: Vec<Object> = self
            .resolve("list objects")?
            .scan(&storage_prefix)
            .into_iter()
            .filter(|(k, _)| !key::is_folder_marker(k))
            .filter_map(|(k, stored)| {
                Some(Object {
                    path: self.codec.from_storage(&k)?,
                    size: stored.content.len() as u64,
                    last_modified: Some(stored.last_modified),
                    etag: Some(stored.etag),
                    ..Default::default()
                })
            })
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn list_folders(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let prefix = key::normalize_prefix(prefix)?;
        let storage_prefix = self.codec.to_storage_prefix(&prefix)?;
        let keys: Vec<String> = self
            .resolve("list folders")?
            .scan(&storage_prefix)
            .into_iter()
            .filter_map(|(k, _)| self.codec.from_storage(&k))
            .collect();
        Ok(key::folders_under(keys.iter().map(String::as_str), &prefix))
    }
}
