//! In-process adapters for every port, used by tests and dry runs.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::app::ports::{
    BlobStorePort, ClassificationRequest, ClassificationResponse, ClassifierPort, HttpClientPort, HttpGetResult,
    RunLedgerPort, ScrapingActorPort, TablePort, TableTarget,
};
use crate::constants::POST_IMAGE_TYPE;
use crate::error::{MigrationError, Result};
use crate::pipeline::ledger::pending_from_history;
use crate::types::{
    ActorRun, ClassificationRun, CompanyContext, CompanyRow, ImageRow, LedgerEntry, PendingImage, PendingLink,
    ReferenceRecord, Row,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Blob store

#[derive(Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<BTreeMap<(String, String), StoredBlob>>,
    public: Mutex<Vec<String>>,
    writes: AtomicUsize,
    not_uniform: AtomicBool,
    fail_access: AtomicBool,
    fail_listing: AtomicBool,
    deny_writes: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, name: &str, bytes: &[u8]) {
        lock(&self.blobs).insert(
            (bucket.to_string(), name.to_string()),
            StoredBlob { bytes: bytes.to_vec(), content_type: "application/octet-stream".into() },
        );
    }

    pub fn get(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        lock(&self.blobs).get(&(bucket.to_string(), name.to_string())).map(|b| b.bytes.clone())
    }

    pub fn content_type(&self, bucket: &str, name: &str) -> Option<String> {
        lock(&self.blobs).get(&(bucket.to_string(), name.to_string())).map(|b| b.content_type.clone())
    }

    pub fn names(&self, bucket: &str) -> Vec<String> {
        lock(&self.blobs).keys().filter(|(b, _)| b == bucket).map(|(_, n)| n.clone()).collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn public_objects(&self) -> Vec<String> {
        lock(&self.public).clone()
    }

    /// Report per-object ACLs instead of uniform bucket-level access.
    pub fn disable_uniform_access(&self) {
        self.not_uniform.store(true, Ordering::SeqCst);
    }

    pub fn fail_access_policy(&self) {
        self.fail_access.store(true, Ordering::SeqCst);
    }

    pub fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }

    /// Every write fails with an expired-credentials error.
    pub fn deny_writes(&self) {
        self.deny_writes.store(true, Ordering::SeqCst);
    }

    fn check_listing(&self) -> Result<()> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(MigrationError::BlobStore("listing unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorePort for InMemoryBlobStore {
    async fn list_prefixes(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.check_listing()?;
        let mut out: Vec<String> = Vec::new();
        for (b, name) in lock(&self.blobs).keys() {
            if b != bucket {
                continue;
            }
            let Some(rest) = name.strip_prefix(prefix) else { continue };
            if let Some(idx) = rest.find('/') {
                let child = format!("{}{}", prefix, &rest[..=idx]);
                if out.last() != Some(&child) {
                    out.push(child);
                }
            }
        }
        Ok(out)
    }

    async fn list_blobs(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.check_listing()?;
        Ok(lock(&self.blobs)
            .keys()
            .filter(|(b, n)| b == bucket && n.starts_with(prefix))
            .map(|(_, n)| n.clone())
            .collect())
    }

    async fn blob_exists(&self, bucket: &str, name: &str) -> Result<bool> {
        Ok(lock(&self.blobs).contains_key(&(bucket.to_string(), name.to_string())))
    }

    async fn read_blob(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        self.get(bucket, name)
            .ok_or_else(|| MigrationError::BlobNotFound { bucket: bucket.into(), name: name.into() })
    }

    async fn write_blob(&self, bucket: &str, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(MigrationError::Auth(format!("credentials rejected writing {}/{}", bucket, name)));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.blobs).insert(
            (bucket.to_string(), name.to_string()),
            StoredBlob { bytes, content_type: content_type.to_string() },
        );
        Ok(())
    }

    async fn uniform_access(&self, _bucket: &str) -> Result<bool> {
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(MigrationError::Auth("missing storage.buckets.get permission".into()));
        }
        Ok(!self.not_uniform.load(Ordering::SeqCst))
    }

    async fn make_public(&self, bucket: &str, name: &str) -> Result<()> {
        if !lock(&self.blobs).contains_key(&(bucket.to_string(), name.to_string())) {
            return Err(MigrationError::BlobNotFound { bucket: bucket.into(), name: name.into() });
        }
        lock(&self.public).push(format!("{}/{}", bucket, name));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tables

/// Rows are kept as JSON maps so merge-upserts can touch arbitrary columns.
#[derive(Default)]
pub struct InMemoryTables {
    raw: Mutex<Vec<Row>>,
    companies: Mutex<Vec<Row>>,
    images: Mutex<Vec<Row>>,
    runs: Mutex<Vec<ClassificationRun>>,
    fail_inserts: AtomicBool,
    unreachable: AtomicBool,
}

fn key_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn str_field(row: &Row, key: &str) -> Option<String> {
    match row.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn flag(row: &Row, key: &str) -> bool {
    matches!(row.get(key), Some(Value::Bool(true)))
}

fn is_null(row: &Row, key: &str) -> bool {
    matches!(row.get(key), None | Some(Value::Null))
}

fn to_row<T: serde::Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(MigrationError::Table(format!("expected an object row, got {}", other))),
    }
}

impl InMemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a source-of-truth row with fresh status flags.
    pub fn seed_reference(&self, record: &ReferenceRecord) {
        if let Ok(mut row) = to_row(record) {
            row.insert("processed".into(), json!(false));
            row.insert("is_downloaded".into(), json!(false));
            row.insert("images_processed".into(), json!(false));
            row.insert("created_at".into(), Value::Null);
            lock(&self.raw).push(row);
        }
    }

    pub fn seed_raw(&self, row: Row) {
        lock(&self.raw).push(row);
    }

    pub fn seed_image(&self, row: &ImageRow) {
        if let Ok(row) = to_row(row) {
            lock(&self.images).push(row);
        }
    }

    pub fn raw_row(&self, id_scraping: &str) -> Option<Row> {
        lock(&self.raw).iter().find(|r| str_field(r, "id_scraping").as_deref() == Some(id_scraping)).cloned()
    }

    pub fn companies(&self) -> Vec<CompanyRow> {
        lock(&self.companies).iter().filter_map(|r| serde_json::from_value(Value::Object(r.clone())).ok()).collect()
    }

    pub fn images(&self) -> Vec<Row> {
        lock(&self.images).clone()
    }

    pub fn classification_runs(&self) -> Vec<ClassificationRun> {
        lock(&self.runs).clone()
    }

    pub fn fail_inserts(&self) {
        self.fail_inserts.store(true, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MigrationError::Table("store unreachable".into()));
        }
        Ok(())
    }

    fn check_insert(&self) -> Result<()> {
        self.check_reachable()?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(MigrationError::Table("bulk load rejected".into()));
        }
        Ok(())
    }

    fn table(&self, target: TableTarget) -> &Mutex<Vec<Row>> {
        match target {
            TableTarget::Raw => &self.raw,
            TableTarget::Companies => &self.companies,
            TableTarget::Images => &self.images,
        }
    }

    fn insert_unique(table: &Mutex<Vec<Row>>, key: &str, rows: Vec<Row>) -> usize {
        let mut table = lock(table);
        let mut keys: HashSet<String> = table.iter().filter_map(|r| key_text(r.get(key))).collect();
        let mut inserted = 0;
        for row in rows {
            if let Some(k) = key_text(row.get(key)) {
                if keys.insert(k) {
                    table.push(row);
                    inserted += 1;
                }
            }
        }
        inserted
    }

    fn pending_post_images(&self) -> Vec<Row> {
        lock(&self.images)
            .iter()
            .filter(|r| {
                str_field(r, "image_type").as_deref() == Some(POST_IMAGE_TYPE)
                    && is_null(r, "is_construction_image")
                    && !flag(r, "time_out")
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TablePort for InMemoryTables {
    async fn reference_records(&self, country: &str) -> Result<Vec<ReferenceRecord>> {
        self.check_reachable()?;
        let wanted = country.to_lowercase();
        Ok(lock(&self.raw)
            .iter()
            .filter(|r| str_field(r, "country").map(|c| c.to_lowercase()).as_deref() == Some(wanted.as_str()))
            .filter_map(|r| serde_json::from_value(Value::Object(r.clone())).ok())
            .collect())
    }

    async fn existing_company_ids(&self) -> Result<HashSet<String>> {
        self.check_reachable()?;
        Ok(lock(&self.companies).iter().filter_map(|r| key_text(r.get("id_scraping"))).collect())
    }

    async fn existing_image_paths(&self) -> Result<HashSet<String>> {
        self.check_reachable()?;
        Ok(lock(&self.images).iter().filter_map(|r| str_field(r, "img_path")).collect())
    }

    async fn insert_companies(&self, rows: &[CompanyRow]) -> Result<usize> {
        self.check_insert()?;
        let rows = rows.iter().map(to_row).collect::<Result<Vec<_>>>()?;
        Ok(Self::insert_unique(&self.companies, "id_scraping", rows))
    }

    async fn insert_images(&self, rows: &[ImageRow]) -> Result<usize> {
        self.check_insert()?;
        let rows = rows.iter().map(to_row).collect::<Result<Vec<_>>>()?;
        Ok(Self::insert_unique(&self.images, "img_path", rows))
    }

    async fn merge_rows(&self, target: TableTarget, key: &str, rows: &[Row]) -> Result<usize> {
        self.check_reachable()?;
        let mut table = lock(self.table(target));
        let mut matched = 0;
        for update in rows {
            let Some(k) = key_text(update.get(key)) else {
                return Err(MigrationError::Table(format!("merge row without key column {}", key)));
            };
            for row in table.iter_mut().filter(|r| key_text(r.get(key)).as_deref() == Some(k.as_str())) {
                for (col, value) in update {
                    if col != key {
                        row.insert(col.clone(), value.clone());
                    }
                }
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn pending_links(&self, limit: usize) -> Result<Vec<PendingLink>> {
        self.check_reachable()?;
        let mut seen = HashSet::new();
        Ok(lock(&self.raw)
            .iter()
            .filter(|r| !flag(r, "processed") && !flag(r, "is_downloaded") && is_null(r, "created_at"))
            .filter_map(|r| {
                let link = str_field(r, "link").filter(|l| !l.trim().is_empty())?;
                Some(PendingLink {
                    id_scraping: key_text(r.get("id_scraping"))?,
                    link,
                    country: str_field(r, "country").unwrap_or_default(),
                })
            })
            .filter(|p| seen.insert(p.link.clone()))
            .take(limit)
            .collect())
    }

    async fn processed_company_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        self.check_reachable()?;
        let wanted: HashSet<&String> = ids.iter().collect();
        Ok(lock(&self.raw)
            .iter()
            .filter(|r| !is_null(r, "created_at"))
            .filter_map(|r| key_text(r.get("id_scraping")))
            .filter(|id| wanted.contains(id))
            .collect())
    }

    async fn pending_classification_companies(&self, limit: usize) -> Result<Vec<String>> {
        self.check_reachable()?;
        let mut ids: Vec<String> =
            self.pending_post_images().iter().filter_map(|r| key_text(r.get("id_scraping"))).collect();
        ids.sort();
        ids.dedup();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn company_context(&self, id_scraping: &str) -> Result<Option<CompanyContext>> {
        self.check_reachable()?;
        Ok(self.raw_row(id_scraping).map(|r| CompanyContext {
            title: str_field(&r, "title").unwrap_or_default(),
            intro: str_field(&r, "intro").unwrap_or_default(),
        }))
    }

    async fn pending_images(&self, id_scraping: &str) -> Result<Vec<PendingImage>> {
        self.check_reachable()?;
        let mut images: Vec<PendingImage> = self
            .pending_post_images()
            .iter()
            .filter(|r| key_text(r.get("id_scraping")).as_deref() == Some(id_scraping))
            .filter_map(|r| {
                Some(PendingImage {
                    id_photo_cleaned: r.get("id_photo_cleaned")?.as_i64()?,
                    img_path: str_field(r, "img_path")?,
                })
            })
            .collect();
        images.sort_by_key(|i| i.id_photo_cleaned);
        Ok(images)
    }

    async fn insert_classification_run(&self, run: &ClassificationRun) -> Result<()> {
        self.check_insert()?;
        lock(&self.runs).push(run.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run ledger

#[derive(Default)]
pub struct InMemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLedgerPort for InMemoryLedger {
    async fn record(&self, entry: &LedgerEntry) -> Result<()> {
        lock(&self.entries).push(entry.clone());
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<LedgerEntry>> {
        Ok(pending_from_history(lock(&self.entries).clone()))
    }

    async fn history(&self) -> Result<Vec<LedgerEntry>> {
        Ok(lock(&self.entries).clone())
    }
}

// ---------------------------------------------------------------------------
// Scraping actors

#[derive(Default)]
pub struct InMemoryActors {
    started: Mutex<Vec<(String, Value)>>,
    datasets: Mutex<HashMap<String, Vec<Value>>>,
    fail_start: AtomicBool,
}

impl InMemoryActors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dataset(&self, run_id: &str, items: Vec<Value>) {
        lock(&self.datasets).insert(run_id.to_string(), items);
    }

    /// Actors and inputs of every started run, in start order.
    pub fn started(&self) -> Vec<(String, Value)> {
        lock(&self.started).clone()
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScrapingActorPort for InMemoryActors {
    async fn start_run(&self, actor: &str, input: Value) -> Result<ActorRun> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(MigrationError::Actor(format!("could not start {}", actor)));
        }
        let mut started = lock(&self.started);
        started.push((actor.to_string(), input));
        let run_id = format!("run-{}", started.len());
        Ok(ActorRun {
            actor: actor.to_string(),
            monitor_url: format!("memory://{}/{}", actor, run_id),
            run_id,
        })
    }

    async fn dataset_items(&self, run_id: &str) -> Result<Vec<Value>> {
        Ok(lock(&self.datasets).get(run_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Classifier

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Products(Vec<Value>),
    Fail(String),
    /// Never answers within any reasonable limit.
    Hang,
}

/// Replies by image URI; unknown URIs get an empty product list.
#[derive(Default)]
pub struct ScriptedClassifier {
    replies: Mutex<HashMap<String, ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, image_uri: &str, reply: ScriptedReply) {
        lock(&self.replies).insert(image_uri.to_string(), reply);
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl ClassifierPort for ScriptedClassifier {
    async fn classify(&self, request: ClassificationRequest) -> Result<ClassificationResponse> {
        lock(&self.prompts).push(request.prompt.clone());
        let reply = lock(&self.replies).get(&request.image_uri).cloned();
        match reply {
            Some(ScriptedReply::Products(products)) => Ok(ClassificationResponse {
                products,
                token_input: 120,
                token_output: 40,
                model: "scripted".into(),
            }),
            Some(ScriptedReply::Fail(msg)) => Err(MigrationError::Classifier(msg)),
            Some(ScriptedReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(MigrationError::Classifier("unreachable".into()))
            }
            None => Ok(ClassificationResponse { model: "scripted".into(), ..Default::default() }),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP

/// Canned responses keyed by URL; unknown URLs fail.
#[derive(Default)]
pub struct StaticHttp {
    routes: HashMap<String, (u16, Vec<u8>)>,
}

impl StaticHttp {
    pub fn with(mut self, url: &str, status: u16, body: &[u8]) -> Self {
        self.routes.insert(url.to_string(), (status, body.to_vec()));
        self
    }
}

#[async_trait]
impl HttpClientPort for StaticHttp {
    async fn get(&self, url: &str) -> Result<HttpGetResult> {
        let (status, bytes) = self
            .routes
            .get(url)
            .cloned()
            .ok_or_else(|| MigrationError::BlobStore(format!("no route for {}", url)))?;
        Ok(HttpGetResult { status, bytes, content_type: "image/jpeg".into() })
    }
}
