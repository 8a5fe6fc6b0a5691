use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An object as seen by callers.
///
/// `get_object` always fills `content`. Listings return metadata only and
/// leave `content` empty; fetch the bytes with `get_object`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub path: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl Object {
    pub fn has_extension(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.');
        self.path
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .is_some_and(|(stem, ext)| !stem.is_empty() && ext == extension)
    }
}

/// Difference between two listings of the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectDiff {
    pub added: Vec<Object>,
    pub removed: Vec<Object>,
    pub updated: Vec<Object>,
}

impl ObjectDiff {
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }
}

/// Compare a previous listing with the current one.
///
/// An object present in both is updated when its modification time or etag
/// differs. Entries keep the order of the listing they came from.
pub fn diff_listings(previous: &[Object], current: &[Object]) -> ObjectDiff {
    let before: HashMap<&str, &Object> = previous.iter().map(|o| (o.path.as_str(), o)).collect();
    let after: HashMap<&str, &Object> = current.iter().map(|o| (o.path.as_str(), o)).collect();

    let mut diff = ObjectDiff::default();
    for object in current {
        match before.get(object.path.as_str()) {
            None => diff.added.push(object.clone()),
            Some(old) if old.last_modified != object.last_modified || old.etag != object.etag => {
                diff.updated.push(object.clone())
            }
            Some(_) => {}
        }
    }
    diff.removed = previous
        .iter()
        .filter(|o| !after.contains_key(o.path.as_str()))
        .cloned()
        .collect();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obj(path: &str, secs: i64, etag: &str) -> Object {
        Object {
            path: path.to_string(),
            size: 1,
            last_modified: Utc.timestamp_opt(secs, 0).single(),
            etag: Some(etag.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn extension_matching() {
        let o = obj("charts/mychart-0.1.0.tgz", 0, "x");
        assert!(o.has_extension("tgz"));
        assert!(o.has_extension(".tgz"));
        assert!(!o.has_extension("gz.tgz"));
        assert!(!obj("dir.tgz/README", 0, "x").has_extension("tgz"));
        assert!(!obj(".tgz", 0, "x").has_extension("tgz"));
    }

    #[test]
    fn diff_detects_all_kinds() {
        let previous = vec![obj("a", 1, "1"), obj("b", 1, "1"), obj("c", 1, "1")];
        let current = vec![obj("a", 1, "1"), obj("b", 2, "2"), obj("d", 1, "1")];
        let diff = diff_listings(&previous, &current);
        assert!(diff.changed());
        assert_eq!(diff.added, vec![obj("d", 1, "1")]);
        assert_eq!(diff.removed, vec![obj("c", 1, "1")]);
        assert_eq!(diff.updated, vec![obj("b", 2, "2")]);
    }

    #[test]
    fn identical_listings_do_not_change() {
        let listing = vec![obj("a", 1, "1"), obj("b", 1, "1")];
        assert!(!diff_listings(&listing, &listing).changed());
    }
}
