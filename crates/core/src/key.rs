use std::collections::BTreeSet;

use crate::error::{StoreError, StoreResult};

pub const SEPARATOR: char = '/';

/// Maps caller-visible keys to storage keys and back.
///
/// A backend configured with a sub-path prefix stores every object at
/// `prefix/key`. The codec applies that prefix on the request path and strips
/// it on the response path so callers never see it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches(SEPARATOR).to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage key for a caller key. Validates the key first.
    pub fn to_storage(&self, key: &str) -> StoreResult<String> {
        let key = normalize(key)?;
        Ok(self.join(&key))
    }

    /// Storage prefix for a listing prefix. The empty prefix is valid and
    /// selects the whole namespace.
    pub fn to_storage_prefix(&self, prefix: &str) -> StoreResult<String> {
        let prefix = normalize_prefix(prefix)?;
        if self.prefix.is_empty() {
            Ok(prefix)
        } else {
            // Always `base/...` so a sibling like `basement/x` never matches.
            Ok(format!("{}{SEPARATOR}{prefix}", self.prefix))
        }
    }

    /// Caller key for a storage key, or `None` when the key lies outside this
    /// backend's namespace.
    pub fn from_storage(&self, storage_key: &str) -> Option<String> {
        let key = if self.prefix.is_empty() {
            storage_key
        } else {
            storage_key
                .strip_prefix(self.prefix.as_str())?
                .strip_prefix(SEPARATOR)?
        };
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }

    fn join(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{SEPARATOR}{key}", self.prefix)
        }
    }
}

/// Strip accidental leading separators and validate the remaining key.
///
/// A single trailing separator is kept: such keys are folder markers.
pub fn normalize(key: &str) -> StoreResult<String> {
    let trimmed = key.trim_start_matches(SEPARATOR);
    if trimmed.is_empty() {
        return Err(StoreError::invalid_key(key, "empty key"));
    }
    if trimmed.contains('\0') {
        return Err(StoreError::invalid_key(key, "contains NUL byte"));
    }
    let body = trimmed.strip_suffix(SEPARATOR).unwrap_or(trimmed);
    for segment in body.split(SEPARATOR) {
        check_segment(key, segment)?;
    }
    Ok(trimmed.to_string())
}

/// Like [`normalize`] but for listing prefixes: empty is allowed and the
/// final segment may be partial.
pub fn normalize_prefix(prefix: &str) -> StoreResult<String> {
    let trimmed = prefix.trim_start_matches(SEPARATOR);
    if trimmed.contains('\0') {
        return Err(StoreError::invalid_key(prefix, "contains NUL byte"));
    }
    if let Some((dirs, _partial)) = trimmed.rsplit_once(SEPARATOR) {
        for segment in dirs.split(SEPARATOR) {
            check_segment(prefix, segment)?;
        }
    }
    Ok(trimmed.to_string())
}

fn check_segment(key: &str, segment: &str) -> StoreResult<()> {
    match segment {
        "" => Err(StoreError::invalid_key(key, "empty path segment")),
        "." | ".." => Err(StoreError::invalid_key(key, "relative path segment")),
        _ => Ok(()),
    }
}

pub fn is_folder_marker(key: &str) -> bool {
    key.ends_with(SEPARATOR)
}

/// Length of the directory part of a listing prefix: everything up to and
/// including its last separator. Folder names are taken relative to it.
pub fn dir_len(prefix: &str) -> usize {
    prefix.rfind(SEPARATOR).map(|i| i + 1).unwrap_or(0)
}

/// First path segment following `prefix_len` bytes of `key`, if that segment
/// is a folder (i.e. a separator follows it).
pub fn folder_of(key: &str, prefix_len: usize) -> Option<&str> {
    let rest = key.get(prefix_len..)?;
    let (folder, _) = rest.split_once(SEPARATOR)?;
    if folder.is_empty() {
        None
    } else {
        Some(folder)
    }
}

/// Distinct, sorted folder names under `prefix` derived from caller keys.
pub fn folders_under<'a>(keys: impl IntoIterator<Item = &'a str>, prefix: &str) -> Vec<String> {
    let base = dir_len(prefix);
    keys.into_iter()
        .filter(|key| key.starts_with(prefix))
        .filter_map(|key| folder_of(key, base))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}
