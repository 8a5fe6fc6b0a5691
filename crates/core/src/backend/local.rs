use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{Encryption, ObjectStore};
use crate::crypto::{self, CryptoEngine, KeyConfig};
use crate::error::{StoreError, StoreResult};
use crate::key::{self, KeyCodec};
use crate::object::Object;

const KEYS_FILE: &str = ".objstore-keys.json";
const TMP_PREFIX: &str = ".tmp-";
const MAX_FILE_NAME: usize = 255;
const PLAIN_MAGIC: &[u8; 4] = b"OSP1";
const MAGIC_LEN: usize = PLAIN_MAGIC.len();

/// Objects stored as files in one existing directory (the bucket).
pub struct LocalStore {
    root: PathBuf,
    codec: KeyCodec,
    encryption: Encryption,
    engine: OnceCell<CryptoEngine>,
}

/// How an object file is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Plain,
    Sealed,
    /// No header: a file placed in the bucket by something else.
    Foreign,
}

impl Framing {
    fn of(header: &[u8]) -> Self {
        if header.starts_with(PLAIN_MAGIC) {
            Framing::Plain
        } else if crypto::is_sealed(header) {
            Framing::Sealed
        } else {
            Framing::Foreign
        }
    }

    fn content_len(self, stored: u64) -> u64 {
        match self {
            Framing::Plain => stored.saturating_sub(MAGIC_LEN as u64),
            Framing::Sealed => stored.saturating_sub(crypto::SEAL_OVERHEAD as u64),
            Framing::Foreign => stored,
        }
    }
}

impl LocalStore {
    /// Bind to `path`. Nothing is checked until the first operation.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root: path.as_ref().to_path_buf(),
            codec: KeyCodec::default(),
            encryption: Encryption::None,
            engine: OnceCell::new(),
        }
    }

    /// Create the bucket directory and bind to it.
    pub fn create_bucket(path: impl AsRef<Path>) -> StoreResult<Self> {
        let root = path.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            StoreError::unavailable("create bucket", format!("{}: {e}", root.display()))
        })?;
        Ok(Self::new(root))
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.codec = KeyCodec::new(prefix);
        self
    }

    /// Seal new objects with the bucket key. Reads never depend on this.
    pub fn with_encryption(mut self, encryption: Encryption) -> StoreResult<Self> {
        if encryption == Encryption::AwsKms {
            return Err(StoreError::InvalidConfig(format!(
                "encryption mode {encryption} is not supported by the local driver"
            )));
        }
        self.encryption = encryption;
        Ok(self)
    }

    fn object_path(&self, storage_key: &str) -> StoreResult<PathBuf> {
        let name = escape(storage_key);
        if name.len() > MAX_FILE_NAME {
            return Err(StoreError::invalid_key(
                storage_key,
                "key too long for a local volume",
            ));
        }
        Ok(self.root.join(name))
    }

    async fn ensure_bucket(&self, op: &'static str) -> StoreResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::unavailable(
                op,
                format!("{} is not a directory", self.root.display()),
            )),
            Err(e) => Err(StoreError::unavailable(
                op,
                format!("bucket {}: {e}", self.root.display()),
            )),
        }
    }

    /// The bucket's engine. Writers create the key on first use; readers
    /// require it to exist.
    async fn engine(&self, create: bool) -> StoreResult<&CryptoEngine> {
        self.engine.get_or_try_init(|| self.load_engine(create)).await
    }

    async fn load_engine(&self, create: bool) -> StoreResult<CryptoEngine> {
        let path = self.root.join(KEYS_FILE);
        let config = match read_key_config(&path).await? {
            Some(config) => config,
            None if create => self.create_key_config(&path).await?,
            None => {
                return Err(StoreError::Corrupt {
                    key: KEYS_FILE.to_string(),
                    reason: "bucket holds sealed objects but no key".into(),
                });
            }
        };
        CryptoEngine::from_config(&config).map_err(|e| StoreError::Corrupt {
            key: KEYS_FILE.to_string(),
            reason: e.to_string(),
        })
    }

    async fn create_key_config(&self, path: &Path) -> StoreResult<KeyConfig> {
        let config = KeyConfig::generate();
        let bytes = serde_json::to_vec_pretty(&config)
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        // Linking fails if another writer got there first; its key wins.
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::unavailable("write key config", e))?;
        let linked = tokio::fs::hard_link(&tmp, path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(bucket = %self.root.display(), "created bucket key");
                Ok(config)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => read_key_config(path)
                .await?
                .ok_or_else(|| StoreError::unavailable("read key config", "key config vanished")),
            Err(e) => Err(StoreError::unavailable("write key config", e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Caller keys and directory entries of every object below
    /// `storage_prefix`, folder markers included.
    async fn scan(
        &self,
        op: &'static str,
        storage_prefix: &str,
    ) -> StoreResult<Vec<(String, tokio::fs::DirEntry)>> {
        self.ensure_bucket(op).await?;
        let mut read_dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::unavailable(op, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StoreError::unavailable(op, e))?
        {
            let file_name = entry.file_name();
            let Some(storage_key) = file_name.to_str().and_then(unescape) else {
                continue;
            };
            if !storage_key.starts_with(storage_prefix) {
                continue;
            }
            if let Some(key) = self.codec.from_storage(&storage_key) {
                entries.push((key, entry));
            }
        }
        Ok(entries)
    }
}

async fn read_key_config(path: &Path) -> StoreResult<Option<KeyConfig>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: KEYS_FILE.to_string(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::unavailable("read key config", e)),
    }
}

async fn read_framing(path: &Path) -> std::io::Result<Framing> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; MAGIC_LEN];
    let mut filled = 0;
    while filled < MAGIC_LEN {
        let n = file.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(Framing::of(&header[..filled]))
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_object(&self, key: &str, content: &[u8]) -> StoreResult<()> {
        let storage_key = self.codec.to_storage(key)?;
        let path = self.object_path(&storage_key)?;
        self.ensure_bucket("put").await?;

        let data = if self.encryption.is_enabled() {
            self.engine(true)
                .await?
                .seal(content)
                .map_err(|e| StoreError::Corrupt {
                    key: storage_key.clone(),
                    reason: e.to_string(),
                })?
        } else {
            [PLAIN_MAGIC.as_slice(), content].concat()
        };

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| StoreError::unavailable("put", e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::unavailable("put", e));
        }
        debug!(
            key = %storage_key,
            bytes = content.len(),
            sealed = self.encryption.is_enabled(),
            "object stored"
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StoreResult<Object> {
        let key = key::normalize(key)?;
        let storage_key = self.codec.to_storage(&key)?;
        let path = self.object_path(&storage_key)?;
        self.ensure_bucket("get").await?;

        let mut data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(key)),
            Err(e) => return Err(StoreError::unavailable("get", e)),
        };
        let last_modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        let content = match Framing::of(&data) {
            Framing::Plain => data.split_off(MAGIC_LEN),
            Framing::Sealed => {
                self.engine(false)
                    .await?
                    .open(&data)
                    .map_err(|e| StoreError::Corrupt {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?
            }
            Framing::Foreign => data,
        };
        debug!(key = %storage_key, bytes = content.len(), "object read");
        Ok(Object {
            path: key,
            size: content.len() as u64,
            content,
            last_modified,
            etag: None,
        })
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        let storage_key = self.codec.to_storage(key)?;
        let path = self.object_path(&storage_key)?;
        self.ensure_bucket("delete").await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %storage_key, "object deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::unavailable("delete", e)),
        }
    }

    async fn list_objects(&self, prefix: &str) -> StoreResult<Vec<Object>> {
        let storage_prefix = self.codec.to_storage_prefix(prefix)?;
        let mut objects = Vec::new();
        for (path, entry) in self.scan("list objects", &storage_prefix).await? {
            if key::is_folder_marker(&path) {
                continue;
            }
            // Deleted between readdir and stat.
            let gone = |e: &std::io::Error| e.kind() == ErrorKind::NotFound;
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) if gone(&e) => continue,
                Err(e) => return Err(StoreError::unavailable("list objects", e)),
            };
            let framing = match read_framing(&entry.path()).await {
                Ok(framing) => framing,
                Err(e) if gone(&e) => continue,
                Err(e) => return Err(StoreError::unavailable("list objects", e)),
            };
            objects.push(Object {
                path,
                size: framing.content_len(meta.len()),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                ..Default::default()
            });
        }
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn list_folders(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let prefix = key::normalize_prefix(prefix)?;
        let storage_prefix = self.codec.to_storage_prefix(&prefix)?;
        let keys: Vec<String> = self
            .scan("list folders", &storage_prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let folders = key::folders_under(keys.iter().map(String::as_str), &prefix);
        debug!(prefix = %prefix, count = folders.len(), "listed folders");
        Ok(folders)
    }
}

/// Flat file name for a storage key. Anything outside `[A-Za-z0-9._-]` is
/// percent-encoded, as is a leading `.` so hidden names stay reserved.
fn escape(storage_key: &str) -> String {
    let mut out = String::with_capacity(storage_key.len());
    for (i, b) in storage_key.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_') || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn unescape(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
