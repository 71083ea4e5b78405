use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants;

/// Loosely-typed row used for merge-upserts through a temporary table.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A directory under the enumeration prefix, i.e. one freshly scraped business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateEntry {
    pub name: String,
    /// Full source prefix, always ending in `/`.
    pub prefix: String,
}

/// A row of the source-of-truth table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub id_scraping: String,
    pub title: String,
    pub link: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub category: Option<String>,
    pub email: Option<String>,
    pub intro: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub candidate: CandidateEntry,
    /// Present only when `score` reached the threshold.
    pub reference: Option<ReferenceRecord>,
    pub score: f64,
}

impl MatchResult {
    pub fn id_scraping(&self) -> Option<&str> {
        self.reference.as_ref().map(|r| r.id_scraping.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Cover,
    Profile,
    /// 1-indexed position within the posts collection.
    Post(usize),
}

impl ArtifactKind {
    pub fn suffix(&self) -> String {
        match self {
            ArtifactKind::Cover => constants::COVER_SUFFIX.to_string(),
            ArtifactKind::Profile => constants::PROFILE_SUFFIX.to_string(),
            ArtifactKind::Post(n) => format!("post_{}", n),
        }
    }

    /// Value stored in the `image_type` column.
    pub fn image_type(&self) -> &'static str {
        match self {
            ArtifactKind::Cover => constants::COVER_SUFFIX,
            ArtifactKind::Profile => constants::PROFILE_SUFFIX,
            ArtifactKind::Post(_) => constants::POST_IMAGE_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Blob { bucket: String, path: String },
    Url(String),
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSource::Blob { bucket, path } => write!(f, "{}/{}", bucket, path),
            ArtifactSource::Url(url) => write!(f, "{}", url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub id_scraping: String,
    pub country: String,
    pub source: ArtifactSource,
    pub destination_name: String,
    pub kind: ArtifactKind,
}

/// A newly migrated business for the new-records table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRow {
    pub id_scraping: String,
    pub title: String,
    pub link: Option<String>,
    pub country: String,
    pub address: Option<String>,
    pub category: Option<String>,
    pub email: Option<String>,
    pub intro: Option<String>,
    pub phone: Option<String>,
    pub candidate_name: String,
    pub source_prefix: String,
    pub similarity_score: f64,
    pub has_images: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRow {
    pub id_photo_cleaned: i64,
    pub id_scraping: String,
    pub country: String,
    pub img_path: String,
    pub image_type: String,
    pub created_at: String,
}

/// Raw-table row awaiting an actor launch.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLink {
    pub id_scraping: String,
    pub link: String,
    pub country: String,
}

/// Company details extracted from an actor page record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompanyDetails {
    pub id_scraping: String,
    pub facebook_url: Option<String>,
    pub address: Option<String>,
    pub category: Option<String>,
    pub email: Option<String>,
    pub intro: Option<String>,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub profile_picture_url: Option<String>,
    pub cover_photo_url: Option<String>,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompanyContext {
    pub title: String,
    pub intro: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingImage {
    pub id_photo_cleaned: i64,
    pub img_path: String,
}

/// One row of the classification run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRun {
    pub companies_processed: usize,
    pub total_images: usize,
    pub construction_images: usize,
    pub successful_images: usize,
    pub failed_images: usize,
    pub timed_out_images: usize,
    pub execution_start: String,
    pub execution_end: String,
    pub model_used: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerStatus {
    Pending,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRun {
    pub actor: String,
    pub run_id: String,
    pub monitor_url: String,
}

/// One append-only record of the run ledger. The latest record per
/// `job_id` decides the job's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: String,
    pub status: LedgerStatus,
    pub runs: Vec<ActorRun>,
    pub company_count: usize,
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn with_status(&self, status: LedgerStatus, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
            recorded_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn run_for(&self, actor: &str) -> Option<&ActorRun> {
        self.runs.iter().find(|r| r.actor == actor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Enumerate,
    Match,
    Dedup,
    ResolveImages,
    Upload,
    Write,
    Done,
    Failed,
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStage::Enumerate => "ENUMERATE",
            BatchStage::Match => "MATCH",
            BatchStage::Dedup => "DEDUP",
            BatchStage::ResolveImages => "RESOLVE_IMAGES",
            BatchStage::Upload => "UPLOAD",
            BatchStage::Write => "WRITE",
            BatchStage::Done => "DONE",
            BatchStage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Counters surfaced at the end of every migration batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    pub candidates_found: usize,
    pub reference_records: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub malformed: usize,
    pub already_present: usize,
    pub duplicates_in_batch: usize,
    pub migrated: usize,
    pub with_images: usize,
    pub without_images: usize,
    pub images_resolved: usize,
    pub images_uploaded: usize,
    pub images_failed: usize,
    pub image_rows_written: usize,
    pub item_errors: usize,
    pub elapsed_ms: u128,
}
