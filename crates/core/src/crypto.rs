use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm};
use anyhow::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};

const AES_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Marks a blob written by [`CryptoEngine::seal`]:
/// `[magic][nonce][ciphertext + tag]`.
pub const SEALED_MAGIC: &[u8; 4] = b"OSE1";

/// Bytes a sealed blob carries on top of its plaintext.
pub const SEAL_OVERHEAD: usize = SEALED_MAGIC.len() + NONCE_LEN + TAG_LEN;

/// Data key of a bucket, persisted next to the objects it protects.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub version: u32,
    pub master_key: Vec<u8>,
}

impl KeyConfig {
    pub fn generate() -> Self {
        let mut master_key = vec![0u8; AES_KEY_LEN];
        OsRng.fill_bytes(&mut master_key);
        Self {
            version: 1,
            master_key,
        }
    }
}

pub struct CryptoEngine {
    cipher: Aes256Gcm,
}

impl CryptoEngine {
    pub fn new(master_key: &[u8; AES_KEY_LEN]) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(master_key));
        Self { cipher }
    }

    pub fn from_config(config: &KeyConfig) -> Result<Self> {
        if config.version != 1 {
            anyhow::bail!("unsupported key config version {}", config.version);
        }
        let master_key: &[u8; AES_KEY_LEN] = config
            .master_key
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid master key length"))?;
        Ok(Self::new(master_key))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;
        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        out.extend_from_slice(SEALED_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        let body = data
            .strip_prefix(SEALED_MAGIC.as_slice())
            .ok_or_else(|| anyhow::anyhow!("not an encrypted blob"))?;
        if body.len() < NONCE_LEN + TAG_LEN {
            anyhow::bail!("ciphertext too short");
        }
        let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
        let nonce = GenericArray::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or tampered data"))
    }
}

pub fn is_sealed(data: &[u8]) -> bool {
    data.starts_with(SEALED_MAGIC)
}

/// Content fingerprint used as the etag by drivers without a native one.
pub fn etag_of(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let config = KeyConfig::generate();
        let engine = CryptoEngine::from_config(&config).unwrap();
        let sealed = engine.seal(b"some object").unwrap();
        assert!(is_sealed(&sealed));
        assert_eq!(sealed.len(), b"some object".len() + SEAL_OVERHEAD);
        assert_eq!(engine.open(&sealed).unwrap(), b"some object");

        let json = serde_json::to_vec(&config).unwrap();
        let reloaded: KeyConfig = serde_json::from_slice(&json).unwrap();
        let reopened = CryptoEngine::from_config(&reloaded).unwrap();
        assert_eq!(reopened.open(&sealed).unwrap(), b"some object");
    }

    #[test]
    fn other_key_fails() {
        let sealed = CryptoEngine::from_config(&KeyConfig::generate())
            .unwrap()
            .seal(b"abc")
            .unwrap();
        let other = CryptoEngine::from_config(&KeyConfig::generate()).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn bad_key_configs_are_rejected() {
        let mut config = KeyConfig::generate();
        config.master_key.truncate(16);
        assert!(CryptoEngine::from_config(&config).is_err());
        let mut config = KeyConfig::generate();
        config.version = 2;
        assert!(CryptoEngine::from_config(&config).is_err());
    }

    #[test]
    fn open_rejects_plain_and_truncated_data() {
        let engine = CryptoEngine::from_config(&KeyConfig::generate()).unwrap();
        assert!(engine.open(b"some object").is_err());
        assert!(engine.open(b"OSE1short").is_err());
        let mut sealed = engine.seal(b"abc").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(engine.open(&sealed).is_err());
    }

    #[test]
    fn etag_is_stable() {
        assert_eq!(etag_of(b"x"), etag_of(b"x"));
        assert_ne!(etag_of(b"x"), etag_of(b"y"));
    }
}
