//! HTTP client for the platform storage API.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::ProjectConfig;
use crate::error::{Result, SyncError};

const STEP: &str = "sync-storage";

/// Objects returned per listing page; the API caps pages, so listing walks
/// offsets until a short page.
const LIST_PAGE_SIZE: usize = 1000;

/// Characters escaped in object path segments ('/' separators are kept).
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%');

/// A storage bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub file_size_limit: Option<i64>,
    #[serde(default)]
    pub allowed_mime_types: Option<Vec<String>>,
}

/// A fully-resolved object path with its metadata.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub path: String,
    pub content_type: Option<String>,
    pub size: Option<i64>,
}

/// One entry of a listing page. A null `id` marks a folder that requires
/// recursive descent.
#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    id: Option<String>,
    #[serde(default)]
    metadata: Option<EntryMetadata>,
}

#[derive(Debug, Deserialize)]
struct EntryMetadata {
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    size: Option<i64>,
}

/// Storage API client for one platform instance.
#[derive(Debug, Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base: String,
    credential: String,
    legacy_keys: bool,
}

impl StorageClient {
    /// Build a client from a project's connection descriptor.
    pub fn new(project: &ProjectConfig) -> Result<Self> {
        let credential = project
            .api_credential()
            .ok_or_else(|| SyncError::validation(STEP, "missing API credential"))?
            .to_string();

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::storage(STEP, e))?;

        Ok(Self {
            http,
            base: project.api_url.trim_end_matches('/').to_string(),
            credential,
            legacy_keys: project.uses_legacy_keys(),
        })
    }

    /// The instance's storage endpoint, as persisted in object references.
    pub fn endpoint(&self) -> &str {
        &self.base
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(&self.credential);
        // The legacy scheme sends the key twice; the gateway routes on the
        // apikey header.
        if self.legacy_keys {
            req = req.header("apikey", &self.credential);
        }
        req
    }

    /// List every bucket on the instance.
    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let url = format!("{}/storage/v1/bucket", self.base);
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| SyncError::storage(STEP, e))?;
        let resp = check_status(resp, "listing buckets").await?;
        resp.json().await.map_err(|e| SyncError::storage(STEP, e))
    }

    /// Create a bucket matching the source definition. Returns false if it
    /// already existed.
    pub async fn create_bucket(&self, bucket: &Bucket) -> Result<bool> {
        let url = format!("{}/storage/v1/bucket", self.base);
        let body = json!({
            "id": bucket.id,
            "name": bucket.name,
            "public": bucket.public,
            "file_size_limit": bucket.file_size_limit,
            "allowed_mime_types": bucket.allowed_mime_types,
        });
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::storage(STEP, e))?;

        if resp.status().is_success() {
            return Ok(true);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::CONFLICT || text.contains("already exists") {
            debug!("bucket {} already exists", bucket.name);
            return Ok(false);
        }
        Err(status_error(status, &format!("creating bucket {}: {text}", bucket.name)))
    }

    /// Recursively materialize the full object path set of a bucket.
    ///
    /// The listing API returns one flat page of entries per call; folder
    /// entries (null id) are pushed back as prefixes to descend into.
    pub async fn list_all_objects(&self, bucket: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut prefixes = vec![String::new()];

        while let Some(prefix) = prefixes.pop() {
            let mut offset = 0usize;
            loop {
                let page = self.list_page(bucket, &prefix, offset).await?;
                let page_len = page.len();

                for entry in page {
                    let path = if prefix.is_empty() {
                        entry.name.clone()
                    } else {
                        format!("{}/{}", prefix, entry.name)
                    };
                    match entry.id {
                        Some(_) => objects.push(ObjectInfo {
                            path,
                            content_type: entry.metadata.as_ref().and_then(|m| m.mimetype.clone()),
                            size: entry.metadata.as_ref().and_then(|m| m.size),
                        }),
                        None => prefixes.push(path),
                    }
                }

                if page_len < LIST_PAGE_SIZE {
                    break;
                }
                offset += page_len;
            }
        }

        Ok(objects)
    }

    async fn list_page(&self, bucket: &str, prefix: &str, offset: usize) -> Result<Vec<ListEntry>> {
        let url = format!("{}/storage/v1/object/list/{}", self.base, bucket);
        let body = json!({
            "prefix": prefix,
            "limit": LIST_PAGE_SIZE,
            "offset": offset,
            "sortBy": { "column": "name", "order": "asc" },
        });
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::storage(STEP, e))?;
        let resp = check_status(resp, &format!("listing {bucket}/{prefix}")).await?;
        resp.json().await.map_err(|e| SyncError::storage(STEP, e))
    }

    /// Download an object's content.
    pub async fn download(&self, bucket: &str, path: &str) -> Result<bytes::Bytes> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base,
            bucket,
            encode_path(path)
        );
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| SyncError::storage(STEP, e))?;
        let resp = check_status(resp, &format!("downloading {bucket}/{path}")).await?;
        resp.bytes().await.map_err(|e| SyncError::storage(STEP, e))
    }

    /// Upload an object, overwriting any existing content at the path.
    pub async fn upload(
        &self,
        bucket: &str,
        path: &str,
        content: bytes::Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base,
            bucket,
            encode_path(path)
        );
        let mut req = self
            .request(reqwest::Method::POST, url)
            .header("x-upsert", "true")
            .body(content);
        if let Some(ct) = content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, ct);
        }
        let resp = req.send().await.map_err(|e| SyncError::storage(STEP, e))?;
        check_status(resp, &format!("uploading {bucket}/{path}")).await?;
        Ok(())
    }
}

/// Percent-encode an object path, segment by segment.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

async fn check_status(resp: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(status_error(status, &format!("{context}: {text}")))
}

fn status_error(status: reqwest::StatusCode, message: &str) -> SyncError {
    match status.as_u16() {
        401 => SyncError::authentication(STEP, message),
        403 => SyncError::permission(STEP, message),
        408 | 504 => SyncError::timeout(STEP, message),
        _ => SyncError::storage(STEP, format!("HTTP {status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_encoding_keeps_separators() {
        assert_eq!(encode_path("avatars/user 1.png"), "avatars/user%201.png");
        assert_eq!(encode_path("a/b/c.txt"), "a/b/c.txt");
        assert_eq!(encode_path("100%.pdf"), "100%25.pdf");
    }

    #[test]
    fn folder_entries_have_no_id() {
        let page: Vec<ListEntry> = serde_json::from_value(serde_json::json!([
            { "name": "avatars", "id": null },
            {
                "name": "logo.png",
                "id": "3b9a1c2d",
                "metadata": { "mimetype": "image/png", "size": 1234 }
            }
        ]))
        .unwrap();
        assert!(page[0].id.is_none());
        assert_eq!(page[1].metadata.as_ref().unwrap().size, Some(1234));
    }

    #[test]
    fn endpoint_is_normalized() {
        let project = crate::config::ProjectConfig {
            db_url: "postgres://u@h/db".into(),
            api_url: "https://proj.example.com/".into(),
            service_key: Some("sk".into()),
            secret_key: None,
        };
        let client = StorageClient::new(&project).unwrap();
        assert_eq!(client.endpoint(), "https://proj.example.com");
    }
}
