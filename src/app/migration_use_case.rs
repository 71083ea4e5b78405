use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::app::ports::{BlobStorePort, TablePort};
use crate::clock::RunClock;
use crate::config::Config;
use crate::error::MigrationError;
use crate::idempotency::{photo_digest, photo_id};
use crate::metrics::MigrationMetrics;
use crate::pipeline::dedup::DedupFilter;
use crate::pipeline::enumerate::enumerate_candidates;
use crate::pipeline::images::{ImageResolver, NameRegistry};
use crate::pipeline::matcher::{match_all_blocking, MatchOutcome, ReferenceIndex, SimilarityMatcher};
use crate::pipeline::uploader::{ParallelUploader, UploadReport};
use crate::pipeline::writer::TableWriter;
use crate::types::{BatchStage, BatchStats, CompanyRow, ImageArtifact, ImageRow, MatchResult};

/// Result of one migration batch. `stage` is `Done` or `Failed`; on failure
/// `failed_at` names the stage that stopped the batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub stage: BatchStage,
    pub failed_at: Option<BatchStage>,
    pub error: Option<MigrationError>,
    pub stats: BatchStats,
    /// Artifacts resolved for the batch; the whole plan on a dry run.
    pub planned: Vec<ImageArtifact>,
}

impl BatchOutcome {
    pub fn is_done(&self) -> bool {
        self.stage == BatchStage::Done
    }
}

type StageResult<T> = std::result::Result<T, (BatchStage, MigrationError)>;

trait AtStage<T> {
    fn at(self, stage: BatchStage) -> StageResult<T>;
}

impl<T> AtStage<T> for crate::error::Result<T> {
    fn at(self, stage: BatchStage) -> StageResult<T> {
        self.map_err(|e| (stage, e))
    }
}

struct StageTimer {
    stage: BatchStage,
    started: Instant,
}

impl StageTimer {
    fn enter(stage: BatchStage) -> Self {
        info!(stage = %stage, "Entering stage");
        Self { stage, started: Instant::now() }
    }

    fn finish(self) {
        MigrationMetrics::record_stage_duration(self.stage, self.started.elapsed().as_secs_f64());
    }
}

/// Blob-based batch: ENUMERATE → MATCH → DEDUP → RESOLVE_IMAGES → UPLOAD →
/// WRITE → DONE, with FAILED reachable from every stage. Each stage takes
/// the full output of the previous one.
pub struct MigrationUseCase {
    config: Arc<Config>,
    source: Arc<dyn BlobStorePort>,
    tables: Arc<dyn TablePort>,
    uploader: ParallelUploader,
    writer: TableWriter,
    clock: RunClock,
}

impl MigrationUseCase {
    pub fn new(
        config: Arc<Config>,
        source: Arc<dyn BlobStorePort>,
        tables: Arc<dyn TablePort>,
        uploader: ParallelUploader,
    ) -> Self {
        let clock = RunClock::new(config.run.utc_offset_hours);
        Self { writer: TableWriter::new(tables.clone()), config, source, tables, uploader, clock }
    }

    pub async fn run(&self, dry_run: bool) -> BatchOutcome {
        let batch_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut stats = BatchStats::default();
        let mut planned = Vec::new();

        let span = info_span!("batch", batch_id = %batch_id);
        let result = self.run_stages(&mut stats, &mut planned, dry_run).instrument(span.clone()).await;
        stats.elapsed_ms = started.elapsed().as_millis();

        let _enter = span.enter();
        match result {
            Ok(()) => {
                log_summary(&stats);
                BatchOutcome { batch_id, stage: BatchStage::Done, failed_at: None, error: None, stats, planned }
            }
            Err((stage, e)) => {
                MigrationMetrics::record_batch_failed();
                error!(stage = %stage, "Batch failed: {}", e);
                log_summary(&stats);
                BatchOutcome { batch_id, stage: BatchStage::Failed, failed_at: Some(stage), error: Some(e), stats, planned }
            }
        }
    }

    async fn run_stages(
        &self,
        stats: &mut BatchStats,
        planned: &mut Vec<ImageArtifact>,
        dry_run: bool,
    ) -> StageResult<()> {
        let storage = &self.config.storage;

        // ENUMERATE
        let timer = StageTimer::enter(BatchStage::Enumerate);
        let candidates = enumerate_candidates(self.source.as_ref(), &storage.source_bucket, &storage.source_prefix)
            .await
            .at(BatchStage::Enumerate)?;
        stats.candidates_found = candidates.len();
        timer.finish();
        if candidates.is_empty() {
            info!("No candidate entries found, nothing to migrate");
            return Ok(());
        }

        // MATCH
        let timer = StageTimer::enter(BatchStage::Match);
        let references = self.tables.reference_records(&storage.country).await.at(BatchStage::Match)?;
        let index = Arc::new(ReferenceIndex::build(references));
        stats.reference_records = index.record_count();
        info!("Reference index holds {} titles for {}", index.len(), storage.country);

        let matcher = SimilarityMatcher::new(&self.config.matching);
        let outcomes = match_all_blocking(matcher, candidates, index, self.config.matching.match_workers)
            .await
            .at(BatchStage::Match)?;
        let mut accepted: Vec<MatchResult> = Vec::new();
        for outcome in outcomes {
            match outcome {
                MatchOutcome::Accepted(m) => {
                    MigrationMetrics::record_match(true);
                    accepted.push(m);
                }
                MatchOutcome::Rejected(_) => {
                    MigrationMetrics::record_match(false);
                    stats.unmatched += 1;
                }
                MatchOutcome::Malformed { .. } => {
                    MigrationMetrics::record_malformed();
                    stats.malformed += 1;
                    stats.item_errors += 1;
                }
            }
        }
        stats.matched = accepted.len();
        timer.finish();
        info!("Matched {} of {} candidates", stats.matched, stats.candidates_found);
        if accepted.is_empty() {
            info!("No accepted matches, nothing to migrate");
            return Ok(());
        }

        // DEDUP
        let timer = StageTimer::enter(BatchStage::Dedup);
        let existing = self.tables.existing_company_ids().await.at(BatchStage::Dedup)?;
        let filter = DedupFilter::new(existing);
        debug!("Destination snapshot holds {} ids", filter.snapshot_len());
        let deduped = filter.filter(accepted);
        stats.already_present = deduped.already_present;
        stats.duplicates_in_batch = deduped.duplicates_in_batch;
        timer.finish();
        info!(
            "{} new entries ({} already migrated, {} duplicates in batch)",
            deduped.survivors.len(),
            deduped.already_present,
            deduped.duplicates_in_batch
        );
        if deduped.survivors.is_empty() {
            return Ok(());
        }

        // RESOLVE_IMAGES
        let timer = StageTimer::enter(BatchStage::ResolveImages);
        let resolver = ImageResolver::new(storage.source_bucket.clone());
        let mut registry = NameRegistry::new();
        let mut entries: Vec<MatchResult> = Vec::new();
        for m in deduped.survivors {
            let Some(id) = m.id_scraping().map(str::to_string) else { continue };
            let country = self.country_of(&m);
            match resolver.resolve(self.source.as_ref(), &id, &country, &m.candidate.prefix, &mut registry).await {
                Ok(artifacts) => {
                    stats.images_resolved += artifacts.len();
                    planned.extend(artifacts);
                    entries.push(m);
                }
                Err(e) if e.is_fatal() => return Err((BatchStage::ResolveImages, e)),
                Err(e) => {
                    // Left out of this batch so a rerun picks it up again
                    stats.item_errors += 1;
                    warn!(stage = "RESOLVE_IMAGES", id_scraping = %id, "Image probe failed: {}", e);
                }
            }
        }
        timer.finish();

        if dry_run {
            for artifact in planned.iter() {
                info!(id_scraping = %artifact.id_scraping, "Would copy {} -> {}", artifact.source, artifact.destination_name);
            }
            info!("Dry run: {} entries and {} artifacts planned, nothing written", entries.len(), planned.len());
            return Ok(());
        }

        // UPLOAD
        let timer = StageTimer::enter(BatchStage::Upload);
        let uniform = self.uploader.detect_uniform_access().await;
        let mut report = self.uploader.upload_all(planned.clone(), uniform).await;
        stats.images_uploaded = report.uploaded.len();
        stats.images_failed = report.failed.len();
        stats.item_errors += report.failed.len();
        timer.finish();
        // Writing now would mark these companies migrated without their images
        if let Some(e) = report.fatal.take() {
            return Err((BatchStage::Upload, e));
        }

        // WRITE
        let timer = StageTimer::enter(BatchStage::Write);
        let created_at = self.clock.timestamp();
        let companies = self.company_rows(&entries, &report, &created_at);
        let images = image_rows(&report, &created_at);
        let written = self.writer.write_batch(&companies, images).await.at(BatchStage::Write)?;
        stats.migrated = written.companies_inserted;
        stats.image_rows_written = written.images_inserted;
        stats.with_images = companies.iter().filter(|c| c.has_images).count();
        stats.without_images = companies.len() - stats.with_images;
        timer.finish();

        Ok(())
    }

    fn country_of(&self, m: &MatchResult) -> String {
        m.reference
            .as_ref()
            .and_then(|r| r.country.clone())
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.config.storage.country.clone())
    }

    fn company_rows(&self, entries: &[MatchResult], report: &UploadReport, created_at: &str) -> Vec<CompanyRow> {
        entries
            .iter()
            .filter_map(|m| {
                let r = m.reference.as_ref()?;
                Some(CompanyRow {
                    id_scraping: r.id_scraping.clone(),
                    title: r.title.clone(),
                    link: r.link.clone(),
                    country: self.country_of(m),
                    address: r.address.clone(),
                    category: r.category.clone(),
                    email: r.email.clone(),
                    intro: r.intro.clone(),
                    phone: r.phone.clone(),
                    candidate_name: m.candidate.name.clone(),
                    source_prefix: m.candidate.prefix.clone(),
                    similarity_score: m.score,
                    has_images: report.uploaded_for(&r.id_scraping) > 0,
                    created_at: created_at.to_string(),
                })
            })
            .collect()
    }
}

/// Image metadata for every artifact that reached the destination bucket.
pub fn image_rows(report: &UploadReport, created_at: &str) -> Vec<ImageRow> {
    report
        .uploaded
        .iter()
        .map(|u| {
            let suffix = u.artifact.kind.suffix();
            debug!(
                id_scraping = %u.artifact.id_scraping,
                digest = %photo_digest(&u.artifact.id_scraping, &suffix),
                "Image row for {}",
                u.public_url
            );
            ImageRow {
                id_photo_cleaned: photo_id(&u.artifact.id_scraping, &suffix),
                id_scraping: u.artifact.id_scraping.clone(),
                country: u.artifact.country.clone(),
                img_path: u.public_url.clone(),
                image_type: u.artifact.kind.image_type().to_string(),
                created_at: created_at.to_string(),
            }
        })
        .collect()
}

fn log_summary(stats: &BatchStats) {
    info!(
        candidates = stats.candidates_found,
        references = stats.reference_records,
        matched = stats.matched,
        unmatched = stats.unmatched,
        malformed = stats.malformed,
        already_present = stats.already_present,
        migrated = stats.migrated,
        with_images = stats.with_images,
        without_images = stats.without_images,
        images_uploaded = stats.images_uploaded,
        images_failed = stats.images_failed,
        item_errors = stats.item_errors,
        elapsed_ms = stats.elapsed_ms as u64,
        "Batch summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::in_memory::{InMemoryBlobStore, InMemoryTables, StaticHttp};
    use crate::types::ReferenceRecord;

    fn config() -> Arc<Config> {
        let mut config = Config::from_toml_str(
            r#"
            [storage]
            source_bucket = "src"
            dest_bucket = "dst"
            source_prefix = "Paises/Brasil/"
            country = "Brasil"

            [tables]
            raw = "raw"
            companies = "companies"
            images = "images"

            [matching]
            similarity_threshold = 0.85
            match_workers = 2
            "#,
        )
        .unwrap();
        config.upload.workers = 2;
        Arc::new(config)
    }

    fn reference(id: &str, title: &str) -> ReferenceRecord {
        ReferenceRecord {
            id_scraping: id.into(),
            title: title.into(),
            link: Some(format!("https://facebook.com/{}", id)),
            country: Some("Brasil".into()),
            address: None,
            category: Some("Construction".into()),
            email: None,
            intro: None,
            phone: None,
        }
    }

    fn use_case(source: Arc<InMemoryBlobStore>, tables: Arc<InMemoryTables>) -> (MigrationUseCase, Arc<InMemoryBlobStore>) {
        let dest = Arc::new(InMemoryBlobStore::new());
        let uploader = ParallelUploader::new(source.clone(), dest.clone(), Arc::new(StaticHttp::default()), "dst", "googleapis.com", 2);
        (MigrationUseCase::new(config(), source, tables, uploader), dest)
    }

    #[tokio::test]
    async fn empty_enumeration_finishes_without_writes() {
        let tables = Arc::new(InMemoryTables::new());
        let (uc, _) = use_case(Arc::new(InMemoryBlobStore::new()), tables.clone());
        let outcome = uc.run(false).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.stats.candidates_found, 0);
        assert!(tables.companies().is_empty());
    }

    #[tokio::test]
    async fn enumeration_failure_fails_the_batch() {
        let source = Arc::new(InMemoryBlobStore::new());
        source.fail_listing();
        let (uc, _) = use_case(source, Arc::new(InMemoryTables::new()));
        let outcome = uc.run(false).await;
        assert_eq!(outcome.stage, BatchStage::Failed);
        assert_eq!(outcome.failed_at, Some(BatchStage::Enumerate));
    }

    #[tokio::test]
    async fn rejected_bulk_load_fails_at_write() {
        let source = Arc::new(InMemoryBlobStore::new());
        source.put("src", "Paises/Brasil/ACME CO/Logo.jpg", b"logo");
        let tables = Arc::new(InMemoryTables::new());
        tables.seed_reference(&reference("123", "Acme Co."));
        tables.fail_inserts();

        let (uc, dest) = use_case(source, tables);
        let outcome = uc.run(false).await;
        assert_eq!(outcome.failed_at, Some(BatchStage::Write));
        // Uploads happened before the write stage
        assert_eq!(dest.names("dst"), vec!["123_profile_image.jpg"]);
    }

    #[tokio::test]
    async fn rejected_load_keeps_rows_from_earlier_batches() {
        let source = Arc::new(InMemoryBlobStore::new());
        source.put("src", "Paises/Brasil/ACME CO/Logo.jpg", b"logo");
        let tables = Arc::new(InMemoryTables::new());
        tables.seed_reference(&reference("123", "Acme Co."));
        tables.seed_reference(&reference("456", "Sol Materiais"));

        let (uc, _) = use_case(source.clone(), tables.clone());
        assert!(uc.run(false).await.is_done());

        source.put("src", "Paises/Brasil/Sol Materiais/Logo.jpg", b"sol");
        tables.fail_inserts();
        let (uc, _) = use_case(source, tables.clone());
        let outcome = uc.run(false).await;
        assert_eq!(outcome.failed_at, Some(BatchStage::Write));

        let companies = tables.companies();
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0].id_scraping, "123");
        assert!(companies[0].has_images);
        assert_eq!(tables.images().len(), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_the_batch_before_write() {
        let source = Arc::new(InMemoryBlobStore::new());
        source.put("src", "Paises/Brasil/ACME CO/Logo.jpg", b"logo");
        let tables = Arc::new(InMemoryTables::new());
        tables.seed_reference(&reference("123", "Acme Co."));

        let (uc, dest) = use_case(source.clone(), tables.clone());
        dest.deny_writes();
        let outcome = uc.run(false).await;
        assert_eq!(outcome.stage, BatchStage::Failed);
        assert_eq!(outcome.failed_at, Some(BatchStage::Upload));
        assert!(matches!(outcome.error, Some(MigrationError::Auth(_))));
        assert!(tables.companies().is_empty());
        assert!(tables.images().is_empty());

        // Nothing was recorded, so the next batch migrates the entry
        let (uc, dest) = use_case(source, tables.clone());
        let outcome = uc.run(false).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.stats.migrated, 1);
        assert_eq!(outcome.stats.images_uploaded, 1);
        assert_eq!(dest.names("dst"), vec!["123_profile_image.jpg"]);
        assert!(tables.companies()[0].has_images);
    }

    #[tokio::test]
    async fn dry_run_plans_without_uploading() {
        let source = Arc::new(InMemoryBlobStore::new());
        source.put("src", "Paises/Brasil/ACME CO/Banner.jpg", b"b");
        source.put("src", "Paises/Brasil/ACME CO/Posts/Post1.jpg", b"p");
        let tables = Arc::new(InMemoryTables::new());
        tables.seed_reference(&reference("123", "Acme Co."));

        let (uc, dest) = use_case(source, tables.clone());
        let outcome = uc.run(true).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.planned.len(), 2);
        assert_eq!(dest.write_count(), 0);
        assert!(tables.companies().is_empty());
    }
}
