use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::serde_types::ListBucketResult;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{Encryption, ObjectStore};
use crate::error::{StoreError, StoreResult};
use crate::key::{self, KeyCodec};
use crate::object::Object;

const SSE_HEADER: &str = "x-amz-server-side-encryption";

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_path_style() -> bool {
    true
}

/// Connection settings for an S3-compatible service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, Alibaba OSS, ...). Uses the AWS endpoint for
    /// `region` when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_path_style")]
    pub path_style: bool,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub encryption: Encryption,
}

impl S3Settings {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            region: default_region(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            path_style: default_path_style(),
            prefix: None,
            encryption: Encryption::None,
        }
    }
}

struct Handles {
    read: Box<Bucket>,
    /// Same bucket, with the SSE header attached. Services reject that
    /// header on GET, so it only goes on writes.
    write: Box<Bucket>,
}

/// [`ObjectStore`] over an S3-compatible HTTP object service.
///
/// The client is built on first use, so a store pointed at a bucket that does
/// not exist constructs fine and reports `BackendUnavailable` from its first
/// call. Read-after-write consistency is inherited from the service; AWS S3
/// and the common compatible services provide it for single objects.
/// Requests are bounded by the SDK's request timeout.
pub struct S3Store {
    settings: S3Settings,
    region: Region,
    codec: KeyCodec,
    handles: OnceCell<Handles>,
}

impl S3Store {
    pub fn new(settings: S3Settings) -> StoreResult<Self> {
        let region = match &settings.endpoint {
            Some(endpoint) if !endpoint.is_empty() => Region::Custom {
                region: settings.region.clone(),
                endpoint: endpoint.clone(),
            },
            _ => settings.region.parse::<Region>().map_err(|e| {
                StoreError::InvalidConfig(format!("unknown region {}: {e}", settings.region))
            })?,
        };
        let codec = KeyCodec::new(settings.prefix.as_deref().unwrap_or(""));
        Ok(Self {
            settings,
            region,
            codec,
            handles: OnceCell::new(),
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.settings.bucket
    }

    async fn handles(&self, op: &'static str) -> StoreResult<&Handles> {
        self.handles
            .get_or_try_init(|| async { self.connect(op) })
            .await
    }

    fn connect(&self, op: &'static str) -> StoreResult<Handles> {
        let credentials = self
            .credentials()
            .map_err(|e| StoreError::unavailable(op, format!("credentials: {e}")))?;
        let mut read = Bucket::new(&self.settings.bucket, self.region.clone(), credentials)
            .map_err(|e| StoreError::unavailable(op, e))?;
        if self.settings.path_style {
            read = read.with_path_style();
        }
        let mut write = read.clone();
        if self.settings.encryption.is_enabled() {
            write.add_header(SSE_HEADER, &self.settings.encryption.to_string());
        }
        debug!(bucket = %self.settings.bucket, region = %self.region, "S3 client ready");
        Ok(Handles { read, write })
    }

    fn credentials(&self) -> Result<Credentials, s3::creds::error::CredentialsError> {
        match (&self.settings.access_key, &self.settings.secret_key) {
            (Some(access_key), Some(secret_key)) => Credentials::new(
                Some(access_key),
                Some(secret_key),
                None,
                None,
                None,
            ),
            _ => Credentials::from_env()
                .or_else(|_| Credentials::from_profile(None))
                .or_else(|_| Credentials::anonymous()),
        }
    }

    /// Every page of a listing, following continuation tokens.
    async fn list_all(
        &self,
        op: &'static str,
        storage_prefix: &str,
        delimiter: Option<&str>,
    ) -> StoreResult<Vec<ListBucketResult>> {
        let bucket = &self.handles(op).await?.read;
        let mut pages = Vec::new();
        let mut token = None;
        loop {
            let (page, status) = bucket
                .list_page(
                    storage_prefix.to_string(),
                    delimiter.map(str::to_string),
                    token.take(),
                    None,
                    None,
                )
                .await
                .map_err(|e| StoreError::unavailable(op, e))?;
            if !is_success(status) {
                return Err(StoreError::unavailable(op, format!("HTTP {status}")));
            }
            let next = if page.is_truncated {
                page.next_continuation_token.clone()
            } else {
                None
            };
            pages.push(page);
            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(pages)
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Status and body of a response. Non-2xx statuses may arrive either as a
/// response or as `HttpFailWithBody`, depending on SDK features.
fn into_status(
    op: &'static str,
    result: Result<(u16, Bytes), S3Error>,
) -> StoreResult<(u16, Bytes)> {
    match result {
        Ok(response) => Ok(response),
        Err(S3Error::HttpFailWithBody(status, body)) => Ok((status, Bytes::from(body))),
        Err(e) => Err(StoreError::unavailable(op, e)),
    }
}

/// The `<Code>` of an S3 XML error body.
fn error_code(body: &[u8]) -> Option<&str> {
    let body = std::str::from_utf8(body).ok()?;
    let start = body.find("<Code>")? + "<Code>".len();
    let len = body[start..].find("</Code>")?;
    Some(&body[start..start + len])
}

/// Body of a successful response, `None` for a missing key. A 404 naming
/// the bucket is a configuration problem, not a missing key.
fn classify(op: &'static str, status: u16, body: Bytes) -> StoreResult<Option<Bytes>> {
    match status {
        s if is_success(s) => Ok(Some(body)),
        404 if error_code(&body) != Some("NoSuchBucket") => Ok(None),
        _ => Err(failure(op, status, &body)),
    }
}

fn failure(op: &'static str, status: u16, body: &[u8]) -> StoreError {
    let code = error_code(body).unwrap_or("unknown error");
    StoreError::unavailable(op, format!("HTTP {status}: {code}"))
}

fn parse_last_modified(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(&self, key: &str, content: &[u8]) -> StoreResult<()> {
        let storage_key = self.codec.to_storage(key)?;
        let bucket = &self.handles("put").await?.write;
        let response = bucket
            .put_object(&storage_key, content)
            .await
            .map(|r| (r.status_code(), r.bytes().clone()));
        let (status, body) = into_status("put", response)?;
        if !is_success(status) {
            return Err(failure("put", status, &body));
        }
        debug!(bucket = %self.settings.bucket, key = %storage_key, bytes = content.len(), "object stored");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> StoreResult<Object> {
        let key = key::normalize(key)?;
        let storage_key = self.codec.to_storage(&key)?;
        let bucket = &self.handles("get").await?.read;
        let response = bucket
            .get_object(&storage_key)
            .await
            .map(|r| (r.status_code(), r.bytes().clone()));
        let (status, body) = into_status("get", response)?;
        match classify("get", status, body)? {
            Some(body) => Ok(Object {
                path: key,
                size: body.len() as u64,
                content: body.to_vec(),
                ..Default::default()
            }),
            None => Err(StoreError::NotFound(key)),
        }
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        let storage_key = self.codec.to_storage(key)?;
        let bucket = &self.handles("delete").await?.read;
        let response = bucket
            .delete_object(&storage_key)
            .await
            .map(|r| (r.status_code(), r.bytes().clone()));
        let (status, body) = into_status("delete", response)?;
        classify("delete", status, body)?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> StoreResult<Vec<Object>> {
        let storage_prefix = self.codec.to_storage_prefix(prefix)?;
        let pages = self.list_all("list objects", &storage_prefix, None).await?;
        let mut objects: Vec<Object> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .filter(|o| !key::is_folder_marker(&o.key))
            .filter_map(|o| {
                Some(Object {
                    path: self.codec.from_storage(&o.key)?,
                    size: o.size,
                    last_modified: parse_last_modified(&o.last_modified),
                    etag: o.e_tag.map(|e| e.trim_matches('"').to_string()),
                    ..Default::default()
                })
            })
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        objects.dedup_by(|a, b| a.path == b.path);
        debug!(bucket = %self.settings.bucket, prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn list_folders(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let prefix = key::normalize_prefix(prefix)?;
        let storage_prefix = self.codec.to_storage_prefix(&prefix)?;
        let pages = self
            .list_all("list folders", &storage_prefix, Some("/"))
            .await?;
        let common: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.common_prefixes.unwrap_or_default())
            .filter_map(|p| self.codec.from_storage(&p.prefix))
            .collect();
        let folders = key::folders_under(common.iter().map(String::as_str), &prefix);
        debug!(bucket = %self.settings.bucket, prefix = %prefix, count = folders.len(), "listed folders");
        Ok(folders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_extraction() {
        let body = b"<?xml version=\"1.0\"?><Error><Code>NoSuchBucket</Code><Message>x</Message></Error>";
        assert_eq!(error_code(body), Some("NoSuchBucket"));
        assert_eq!(error_code(b""), None);
        assert_eq!(error_code(b"<Code>unterminated"), None);
    }

    fn error_body(code: &str) -> Bytes {
        Bytes::from(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{code}</Code><Message>m</Message></Error>"
        ))
    }

    #[test]
    fn status_classification() {
        let ok = classify("get", 200, Bytes::from_static(b"some object")).unwrap();
        assert_eq!(ok.as_deref(), Some(b"some object".as_slice()));
        assert_eq!(classify("delete", 204, Bytes::new()).unwrap(), Some(Bytes::new()));

        assert_eq!(classify("get", 404, error_body("NoSuchKey")).unwrap(), None);
        assert_eq!(classify("delete", 404, error_body("NoSuchKey")).unwrap(), None);
        // Some services answer HEAD-style 404s without a body.
        assert_eq!(classify("get", 404, Bytes::new()).unwrap(), None);

        let missing_bucket = classify("get", 404, error_body("NoSuchBucket")).unwrap_err();
        assert!(missing_bucket.is_unavailable());
        assert!(missing_bucket.to_string().contains("NoSuchBucket"));
        assert!(
            classify("delete", 404, error_body("NoSuchBucket"))
                .unwrap_err()
                .is_unavailable()
        );

        for status in [301, 403, 500, 503] {
            let err = classify("get", status, error_body("AccessDenied")).unwrap_err();
            assert!(err.is_unavailable(), "{status}: {err}");
            assert!(!err.is_not_found());
        }
    }

    #[test]
    fn failed_responses_fold_into_statuses() {
        let (status, body) = into_status(
            "get",
            Err(S3Error::HttpFailWithBody(404, "<Error><Code>NoSuchKey</Code></Error>".into())),
        )
        .unwrap();
        assert_eq!(status, 404);
        assert_eq!(classify("get", status, body).unwrap(), None);

        let (status, body) = into_status(
            "get",
            Err(S3Error::HttpFailWithBody(404, "<Error><Code>NoSuchBucket</Code></Error>".into())),
        )
        .unwrap();
        assert!(classify("get", status, body).unwrap_err().is_unavailable());
    }

    #[test]
    fn last_modified_parses_s3_timestamps() {
        let parsed = parse_last_modified("2009-10-12T17:50:30.000Z").unwrap();
        assert_eq!(parsed.timestamp(), 1_255_369_830);
        assert!(parse_last_modified("yesterday").is_none());
    }

    #[test]
    fn construction_does_not_connect() {
        let mut settings = S3Settings::new("fake-bucket-cant-exist-fbce123");
        settings.endpoint = Some("http://127.0.0.1:9".to_string());
        settings.prefix = Some("/ssetest/".to_string());
        let store = S3Store::new(settings).unwrap();
        assert_eq!(store.bucket_name(), "fake-bucket-cant-exist-fbce123");
        assert_eq!(store.codec.prefix(), "ssetest");
        assert!(store.handles.get().is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let mut settings = S3Settings::new("fake-bucket-cant-exist-fbce123");
        settings.endpoint = Some("http://127.0.0.1:9".to_string());
        settings.access_key = Some("key".to_string());
        settings.secret_key = Some("secret".to_string());
        let store = S3Store::new(settings).unwrap();
        assert!(store.put_object("a", b"").await.unwrap_err().is_unavailable());
        assert!(store.get_object("a").await.unwrap_err().is_unavailable());
        assert!(store.list_objects("").await.unwrap_err().is_unavailable());
        assert!(store.list_folders("").await.unwrap_err().is_unavailable());
    }

    #[test]
    fn settings_defaults_from_toml() {
        let settings: S3Settings = toml::from_str("bucket = \"charts\"\nencryption = \"AES256\"").unwrap();
        assert_eq!(settings.region, "us-east-1");
        assert!(settings.path_style);
        assert_eq!(settings.encryption, Encryption::Aes256);
    }
}
