use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::app::ports::BlobStorePort;
use crate::error::{MigrationError, Result};

/// Google Cloud Storage through its JSON API, authenticated with a bearer
/// access token supplied by configuration.
pub struct GcsBlobStore {
    client: Client,
    base: Url,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectMeta>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketMeta {
    iam_configuration: Option<IamConfiguration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamConfiguration {
    uniform_bucket_level_access: Option<UniformAccess>,
}

#[derive(Debug, Deserialize)]
struct UniformAccess {
    #[serde(default)]
    enabled: bool,
}

impl GcsBlobStore {
    /// `host` is the storage domain, e.g. `googleapis.com`.
    pub fn new(host: &str, token: impl Into<String>) -> Result<Self> {
        let base = Url::parse(&format!("https://storage.{}/", host))
            .map_err(|e| MigrationError::Config(format!("invalid storage host '{}': {}", host, e)))?;
        Ok(Self { client: Client::new(), base, token: token.into() })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MigrationError::Config("storage base URL cannot hold a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, bucket: &str, name: &str) -> Result<Url> {
        self.url(&["storage", "v1", "b", bucket, "o", name])
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
    }

    async fn list(&self, bucket: &str, prefix: &str, delimiter: Option<&str>) -> Result<ObjectList> {
        let url = self.url(&["storage", "v1", "b", bucket, "o"])?;
        let mut merged = ObjectList { items: Vec::new(), prefixes: Vec::new(), next_page_token: None };
        let mut page_token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![("prefix", prefix.to_string())];
            if let Some(d) = delimiter {
                query.push(("delimiter", d.to_string()));
            }
            if let Some(t) = &page_token {
                query.push(("pageToken", t.clone()));
            }
            let resp = check(self.authed(self.client.get(url.clone()).query(&query)).send().await?, bucket).await?;
            let page: ObjectList = resp.json().await?;
            merged.items.extend(page.items);
            merged.prefixes.extend(page.prefixes);
            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }
        Ok(merged)
    }
}

async fn check(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(MigrationError::Auth(format!("{} on {}: {}", status, what, body)))
        }
        _ => Err(MigrationError::BlobStore(format!("{} on {}: {}", status, what, body))),
    }
}

#[async_trait]
impl BlobStorePort for GcsBlobStore {
    async fn list_prefixes(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self.list(bucket, prefix, Some("/")).await?.prefixes)
    }

    async fn list_blobs(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self.list(bucket, prefix, None).await?.items.into_iter().map(|o| o.name).collect())
    }

    async fn blob_exists(&self, bucket: &str, name: &str) -> Result<bool> {
        let url = self.object_url(bucket, name)?;
        let resp = self.authed(self.client.get(url).query(&[("fields", "name")])).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp, name).await?;
        Ok(true)
    }

    async fn read_blob(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, name)?;
        let resp = self.authed(self.client.get(url).query(&[("alt", "media")])).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(MigrationError::BlobNotFound { bucket: bucket.into(), name: name.into() });
        }
        let resp = check(resp, name).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write_blob(&self, bucket: &str, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let url = self.url(&["upload", "storage", "v1", "b", bucket, "o"])?;
        let req = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", name)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        check(self.authed(req).send().await?, name).await?;
        debug!("Wrote gs://{}/{}", bucket, name);
        Ok(())
    }

    async fn uniform_access(&self, bucket: &str) -> Result<bool> {
        let url = self.url(&["storage", "v1", "b", bucket])?;
        let req = self.client.get(url).query(&[("fields", "iamConfiguration")]);
        let meta: BucketMeta = check(self.authed(req).send().await?, bucket).await?.json().await?;
        Ok(meta
            .iam_configuration
            .and_then(|c| c.uniform_bucket_level_access)
            .map(|u| u.enabled)
            .unwrap_or(false))
    }

    async fn make_public(&self, bucket: &str, name: &str) -> Result<()> {
        let url = self.url(&["storage", "v1", "b", bucket, "o", name, "acl"])?;
        let req = self.client.post(url).json(&json!({"entity": "allUsers", "role": "READER"}));
        check(self.authed(req).send().await?, name).await?;
        Ok(())
    }
}
