use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::local::LocalStore;
use crate::backend::memory::MemoryRegistry;
use crate::backend::s3::{S3Settings, S3Store};
use crate::backend::{Encryption, ObjectStore};
use crate::error::{StoreError, StoreResult};

/// Which driver to open and how.
///
/// ```toml
/// type = "s3"
/// bucket = "charts"
/// endpoint = "https://oss-eu-central-1.aliyuncs.com"
/// prefix = "ssetest"
/// encryption = "AES256"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    #[serde(rename = "local")]
    Local(LocalSettings),
    #[serde(rename = "memory")]
    Memory(MemorySettings),
    #[serde(rename = "s3")]
    S3(S3Settings),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSettings {
    pub path: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub encryption: Encryption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub encryption: Encryption,
}

impl StoreConfig {
    pub fn from_toml(content: &str) -> StoreResult<Self> {
        toml::from_str(content).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    pub fn to_toml(&self) -> StoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    /// Build the configured driver. Only the configuration is validated here;
    /// the medium is first contacted by the first operation.
    ///
    /// `registry` backs `memory` stores and is ignored by the other drivers.
    pub fn open(&self, registry: &MemoryRegistry) -> StoreResult<Arc<dyn ObjectStore>> {
        match self {
            StoreConfig::Local(settings) => {
                let store = LocalStore::new(&settings.path)
                    .with_prefix(settings.prefix.as_deref().unwrap_or(""))
                    .with_encryption(settings.encryption)?;
                Ok(Arc::new(store))
            }
            StoreConfig::Memory(settings) => {
                let store = registry
                    .store(&settings.bucket)
                    .with_prefix(settings.prefix.as_deref().unwrap_or(""))
                    .with_encryption(settings.encryption);
                Ok(Arc::new(store))
            }
            StoreConfig::S3(settings) => Ok(Arc::new(S3Store::new(settings.clone())?)),
        }
    }
}

pub const ENV_GATE: &str = "TEST_CLOUD_STORAGE";
pub const ENV_BUCKET: &str = "TEST_STORAGE_S3_BUCKET";
pub const ENV_ENDPOINT: &str = "TEST_STORAGE_S3_ENDPOINT";
pub const ENV_REGION: &str = "TEST_STORAGE_S3_REGION";
pub const ENV_ACCESS_KEY: &str = "TEST_STORAGE_S3_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "TEST_STORAGE_S3_SECRET_KEY";

/// Settings for the live-network conformance run, taken from the process
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTestEnv {
    pub bucket: String,
    pub endpoint: String,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl LiveTestEnv {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `None` unless the gate is `1` and bucket and endpoint are non-empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if lookup(ENV_GATE).as_deref() != Some("1") {
            return None;
        }
        Some(Self {
            bucket: non_empty(ENV_BUCKET)?,
            endpoint: non_empty(ENV_ENDPOINT)?,
            region: non_empty(ENV_REGION),
            access_key: non_empty(ENV_ACCESS_KEY),
            secret_key: non_empty(ENV_SECRET_KEY),
        })
    }

    /// S3 settings for the configured bucket.
    pub fn settings(&self, prefix: Option<&str>, encryption: Encryption) -> S3Settings {
        let mut settings = S3Settings::new(&self.bucket);
        if let Some(region) = &self.region {
            settings.region = region.clone();
        }
        settings.endpoint = Some(self.endpoint.clone());
        settings.access_key = self.access_key.clone();
        settings.secret_key = self.secret_key.clone();
        settings.prefix = prefix.map(str::to_string);
        settings.encryption = encryption;
        settings
    }
}
