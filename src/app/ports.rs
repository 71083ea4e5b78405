use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::types::{
    ActorRun, ClassificationRun, CompanyContext, CompanyRow, ImageRow, LedgerEntry, PendingImage,
    PendingLink, ReferenceRecord, Row,
};

/// Object store addressed by bucket and object name.
#[async_trait]
pub trait BlobStorePort: Send + Sync {
    /// Immediate child prefixes of `prefix` (each ending in `/`), in listing order.
    async fn list_prefixes(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
    /// Every object name under `prefix`, recursively, in listing order.
    async fn list_blobs(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
    async fn blob_exists(&self, bucket: &str, name: &str) -> Result<bool>;
    async fn read_blob(&self, bucket: &str, name: &str) -> Result<Vec<u8>>;
    async fn write_blob(&self, bucket: &str, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    /// Whether uniform bucket-level access is enforced (no per-object ACLs).
    async fn uniform_access(&self, bucket: &str) -> Result<bool>;
    async fn make_public(&self, bucket: &str, name: &str) -> Result<()>;
}

/// Which configured table a merge-upsert targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableTarget {
    Raw,
    Companies,
    Images,
}

/// Analytical store holding the raw, new-records and image tables.
#[async_trait]
pub trait TablePort: Send + Sync {
    /// Source-of-truth rows for `country`, in stable first-seen order.
    async fn reference_records(&self, country: &str) -> Result<Vec<ReferenceRecord>>;
    async fn existing_company_ids(&self) -> Result<HashSet<String>>;
    async fn existing_image_paths(&self) -> Result<HashSet<String>>;
    /// Bulk load in one transaction. Rows whose key already exists are
    /// skipped; returns the number actually inserted.
    async fn insert_companies(&self, rows: &[CompanyRow]) -> Result<usize>;
    async fn insert_images(&self, rows: &[ImageRow]) -> Result<usize>;
    /// Update-by-key through a temporary table. Every row must carry `key`;
    /// other columns present in the row are written. Returns matched rows.
    async fn merge_rows(&self, target: TableTarget, key: &str, rows: &[Row]) -> Result<usize>;

    async fn pending_links(&self, limit: usize) -> Result<Vec<PendingLink>>;
    /// Subset of `ids` whose raw row already has `created_at` set.
    async fn processed_company_ids(&self, ids: &[String]) -> Result<HashSet<String>>;
    async fn pending_classification_companies(&self, limit: usize) -> Result<Vec<String>>;
    async fn company_context(&self, id_scraping: &str) -> Result<Option<CompanyContext>>;
    async fn pending_images(&self, id_scraping: &str) -> Result<Vec<PendingImage>>;
    async fn insert_classification_run(&self, run: &ClassificationRun) -> Result<()>;
}

/// Third-party scraping actor platform.
#[async_trait]
pub trait ScrapingActorPort: Send + Sync {
    async fn start_run(&self, actor: &str, input: serde_json::Value) -> Result<ActorRun>;
    /// Items of the run's default dataset.
    async fn dataset_items(&self, run_id: &str) -> Result<Vec<serde_json::Value>>;
}

#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub image_uri: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClassificationResponse {
    /// Raw `products` array as returned by the model.
    pub products: Vec<serde_json::Value>,
    pub token_input: i64,
    pub token_output: i64,
    pub model: String,
}

#[async_trait]
pub trait ClassifierPort: Send + Sync {
    async fn classify(&self, request: ClassificationRequest) -> Result<ClassificationResponse>;
}

/// Append-only ledger of launched actor jobs.
#[async_trait]
pub trait RunLedgerPort: Send + Sync {
    async fn record(&self, entry: &LedgerEntry) -> Result<()>;
    /// Latest record per job, when that record is `Pending`, in first-recorded order.
    async fn pending_jobs(&self) -> Result<Vec<LedgerEntry>>;
    async fn history(&self) -> Result<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait HttpClientPort: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpGetResult>;
}

#[derive(Clone, Debug)]
pub struct HttpGetResult {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
}
