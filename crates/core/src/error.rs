/// Errors returned by every [`ObjectStore`](crate::backend::ObjectStore) driver.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key failed normalization. Local input error, never worth retrying.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// No object is stored under the key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The medium could not be reached, rejected the request, or the bucket
    /// does not exist. Callers may retry with backoff.
    #[error("backend unavailable during {op}: {reason}")]
    BackendUnavailable { op: &'static str, reason: String },

    /// The backend configuration itself is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stored bytes exist but cannot be decoded.
    #[error("corrupt object {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(op: &'static str, reason: impl ToString) -> Self {
        Self::BackendUnavailable {
            op,
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        assert!(StoreError::NotFound("a".into()).is_not_found());
        assert!(StoreError::unavailable("list", "no such bucket").is_unavailable());
        assert!(StoreError::invalid_key("", "empty").is_invalid_key());
        assert!(!StoreError::InvalidConfig("x".into()).is_unavailable());
    }

    #[test]
    fn display_carries_context() {
        let err = StoreError::unavailable("put", "connection refused");
        assert_eq!(
            err.to_string(),
            "backend unavailable during put: connection refused"
        );
    }
}
