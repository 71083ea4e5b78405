use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::{MigrationError, Result};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier regex"));

/// Immutable run configuration. Loaded once at startup, validated, then
/// handed to each component by value or behind an `Arc`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub tables: TablesConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub actors: ActorsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    Gcs,
    Fs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub source_bucket: String,
    pub dest_bucket: String,
    #[serde(default = "default_storage_host")]
    pub host: String,
    #[serde(default = "default_source_prefix")]
    pub source_prefix: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_backend")]
    pub backend: BlobBackend,
    /// Root directory for the `fs` backend; each bucket is a subdirectory.
    #[serde(default = "default_fs_root")]
    pub fs_root: PathBuf,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TablesConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    pub raw: String,
    pub companies: String,
    pub images: String,
    #[serde(default = "default_classification_runs")]
    pub classification_runs: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_match_workers")]
    pub match_workers: usize,
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
    #[serde(default = "default_true")]
    pub token_prefilter: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorsConfig {
    #[serde(default = "default_apify_base")]
    pub base_url: String,
    #[serde(default)]
    pub photos_actor: String,
    #[serde(default)]
    pub page_actor: String,
    #[serde(default = "default_results_limit")]
    pub results_limit: u32,
    #[serde(default = "default_launch_companies")]
    pub max_companies: usize,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_vertex_location")]
    pub location: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_classify_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_classify_companies")]
    pub max_companies: usize,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Fixed UTC offset used for `created_at` values.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,
}

fn default_storage_host() -> String {
    constants::DEFAULT_STORAGE_HOST.to_string()
}
fn default_source_prefix() -> String {
    constants::DEFAULT_SOURCE_PREFIX.to_string()
}
fn default_country() -> String {
    constants::DEFAULT_COUNTRY.to_string()
}
fn default_backend() -> BlobBackend {
    BlobBackend::Gcs
}
fn default_fs_root() -> PathBuf {
    PathBuf::from("data/blobs")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("data/warehouse.db")
}
fn default_classification_runs() -> String {
    "classification_runs".to_string()
}
fn default_threshold() -> f64 {
    constants::DEFAULT_SIMILARITY_THRESHOLD
}
fn default_match_workers() -> usize {
    4
}
fn default_max_name_len() -> usize {
    constants::DEFAULT_MAX_NAME_LEN
}
fn default_true() -> bool {
    true
}
fn default_upload_workers() -> usize {
    constants::DEFAULT_UPLOAD_WORKERS
}
fn default_apify_base() -> String {
    "https://api.apify.com".to_string()
}
fn default_results_limit() -> u32 {
    10
}
fn default_launch_companies() -> usize {
    100
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/run_ledger.ndjson")
}
fn default_vertex_location() -> String {
    "us-central1".to_string()
}
fn default_model() -> String {
    "gemini-2.0-flash-001".to_string()
}
fn default_classify_timeout() -> u64 {
    constants::DEFAULT_CLASSIFY_TIMEOUT_SECS
}
fn default_classify_companies() -> usize {
    10
}
fn default_utc_offset() -> i32 {
    -5
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_threshold(),
            match_workers: default_match_workers(),
            max_name_len: default_max_name_len(),
            token_prefilter: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { workers: default_upload_workers() }
    }
}

impl Default for ActorsConfig {
    fn default() -> Self {
        Self {
            base_url: default_apify_base(),
            photos_actor: String::new(),
            page_actor: String::new(),
            results_limit: default_results_limit(),
            max_companies: default_launch_companies(),
            ledger_path: default_ledger_path(),
            token: None,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            location: default_vertex_location(),
            model: default_model(),
            timeout_secs: default_classify_timeout(),
            max_companies: default_classify_companies(),
            access_token: None,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { utc_offset_hours: default_utc_offset() }
    }
}

impl Config {
    /// Load the TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MigrationError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override file values with whatever `lookup` returns for the known keys.
    /// A numeric override that does not parse is a configuration error.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *target = v;
            }
        };
        set(&mut self.storage.source_bucket, "SOURCE_BUCKET");
        set(&mut self.storage.dest_bucket, "DEST_BUCKET");
        set(&mut self.storage.source_prefix, "SOURCE_PREFIX");
        set(&mut self.storage.country, "COUNTRY");
        set(&mut self.tables.raw, "RAW_TABLE");
        set(&mut self.tables.companies, "COMPANIES_TABLE");
        set(&mut self.tables.images, "IMAGES_TABLE");
        set(&mut self.actors.photos_actor, "APIFY_ACTOR_PHOTOS");
        set(&mut self.actors.page_actor, "APIFY_ACTOR_PAGE");
        set(&mut self.classifier.project_id, "VERTEX_PROJECT_ID");
        set(&mut self.classifier.location, "VERTEX_LOCATION");
        set(&mut self.classifier.model, "MODEL_ID");

        if let Some(v) = numeric(&lookup, "SIMILARITY_THRESHOLD")? {
            self.matching.similarity_threshold = v;
        }
        if let Some(v) = numeric(&lookup, "MATCH_WORKERS")? {
            self.matching.match_workers = v;
        }
        if let Some(v) = numeric(&lookup, "UPLOAD_WORKERS")? {
            self.upload.workers = v;
        }
        if let Some(v) = numeric(&lookup, "CLASSIFY_TIMEOUT_SECS")? {
            self.classifier.timeout_secs = v;
        }

        if let Some(v) = lookup("GCS_ACCESS_TOKEN") {
            self.storage.access_token = Some(v);
        }
        if let Some(v) = lookup("APIFY_TOKEN") {
            self.actors.token = Some(v);
        }
        if let Some(v) = lookup("VERTEX_ACCESS_TOKEN") {
            self.classifier.access_token = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.matching.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MigrationError::Config(format!(
                "similarity_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.matching.match_workers == 0 {
            return Err(MigrationError::Config("match_workers must be at least 1".into()));
        }
        if self.matching.max_name_len == 0 {
            return Err(MigrationError::Config("max_name_len must be at least 1".into()));
        }
        if self.upload.workers == 0 {
            return Err(MigrationError::Config("upload workers must be at least 1".into()));
        }
        if self.classifier.timeout_secs == 0 {
            return Err(MigrationError::Config("classifier timeout_secs must be at least 1".into()));
        }
        if self.storage.source_bucket.trim().is_empty() || self.storage.dest_bucket.trim().is_empty() {
            return Err(MigrationError::Config("source_bucket and dest_bucket are required".into()));
        }
        if !(-12..=14).contains(&self.run.utc_offset_hours) {
            return Err(MigrationError::Config(format!(
                "utc_offset_hours out of range: {}",
                self.run.utc_offset_hours
            )));
        }
        for name in [
            &self.tables.raw,
            &self.tables.companies,
            &self.tables.images,
            &self.tables.classification_runs,
        ] {
            validate_identifier(name)?;
        }
        Ok(())
    }

}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn numeric<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MigrationError::Config(format!("{}={:?} is not a number", key, v))),
        None => Ok(None),
    }
}

/// Table and column names are interpolated into SQL, so they must be plain identifiers.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(MigrationError::Config(format!("invalid table identifier '{}'", name)))
    }
}

/// Fetch a credential that a command cannot run without.
pub fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(MigrationError::Config(format!("{} is not set", name))),
    }
}
