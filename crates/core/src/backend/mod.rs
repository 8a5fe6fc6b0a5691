pub mod local;
pub mod memory;
pub mod s3;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::object::Object;

/// Storage interface implemented by every driver.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `content` under `key`, replacing any existing object.
    async fn put_object(&self, key: &str, content: &[u8]) -> StoreResult<()>;

    /// Read the object stored under `key`, content included.
    async fn get_object(&self, key: &str) -> StoreResult<Object>;

    /// Remove the object under `key`. Absent keys are not an error.
    async fn delete_object(&self, key: &str) -> StoreResult<()>;

    /// Every object whose key starts with `prefix`, at any depth.
    ///
    /// Returns metadata only: `content` is left empty.
    async fn list_objects(&self, prefix: &str) -> StoreResult<Vec<Object>>;

    /// Distinct first-level folder names below `prefix`.
    async fn list_folders(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Encryption-at-rest mode requested for every write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Encryption {
    #[default]
    None,
    Aes256,
    AwsKms,
}

impl Encryption {
    pub fn is_enabled(&self) -> bool {
        *self != Encryption::None
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encryption::None => Ok(()),
            Encryption::Aes256 => write!(f, "AES256"),
            Encryption::AwsKms => write!(f, "aws:kms"),
        }
    }
}

impl FromStr for Encryption {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(Encryption::None),
            "aes256" => Ok(Encryption::Aes256),
            "aws:kms" => Ok(Encryption::AwsKms),
            other => Err(StoreError::InvalidConfig(format!(
                "unknown encryption mode: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Encryption {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        value.parse()
    }
}

impl From<Encryption> for String {
    fn from(value: Encryption) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_modes_parse() {
        assert_eq!("".parse::<Encryption>().unwrap(), Encryption::None);
        assert_eq!("AES256".parse::<Encryption>().unwrap(), Encryption::Aes256);
        assert_eq!("aes256".parse::<Encryption>().unwrap(), Encryption::Aes256);
        assert_eq!("aws:kms".parse::<Encryption>().unwrap(), Encryption::AwsKms);
        assert!(matches!(
            "rot13".parse::<Encryption>(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn encryption_display_round_trips() {
        for mode in [Encryption::None, Encryption::Aes256, Encryption::AwsKms] {
            assert_eq!(mode.to_string().parse::<Encryption>().unwrap(), mode);
        }
        assert!(!Encryption::None.is_enabled());
        assert!(Encryption::Aes256.is_enabled());
    }
}
