use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::app::migration_use_case::image_rows;
use crate::app::ports::{RunLedgerPort, ScrapingActorPort, TablePort, TableTarget};
use crate::clock::RunClock;
use crate::config::ActorsConfig;
use crate::error::{MigrationError, Result};
use crate::metrics::EnrichmentMetrics;
use crate::pipeline::datasets::{company_details, group_photos};
use crate::pipeline::images::{artifacts_from_urls, NameRegistry};
use crate::pipeline::uploader::{ParallelUploader, UploadReport};
use crate::pipeline::writer::TableWriter;
use crate::types::{CompanyDetails, LedgerEntry, LedgerStatus, Row};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConsumeOutcome {
    pub jobs_seen: usize,
    pub jobs_processed: usize,
    pub jobs_failed: usize,
    /// Jobs whose page dataset was still empty; they stay pending.
    pub jobs_waiting: usize,
    pub companies_updated: usize,
    pub companies_with_images: usize,
    pub images_uploaded: usize,
    pub images_failed: usize,
}

enum JobResult {
    Waiting,
    Done { companies: usize, with_images: usize, uploaded: usize, failed: usize },
}

/// Drains pending ledger jobs: downloads both actor datasets, copies the
/// remote images, then updates the raw and image tables.
pub struct ConsumeUseCase {
    actors_config: ActorsConfig,
    tables: Arc<dyn TablePort>,
    actors: Arc<dyn ScrapingActorPort>,
    ledger: Arc<dyn RunLedgerPort>,
    uploader: ParallelUploader,
    writer: TableWriter,
    clock: RunClock,
}

impl ConsumeUseCase {
    pub fn new(
        actors_config: ActorsConfig,
        tables: Arc<dyn TablePort>,
        actors: Arc<dyn ScrapingActorPort>,
        ledger: Arc<dyn RunLedgerPort>,
        uploader: ParallelUploader,
        clock: RunClock,
    ) -> Self {
        Self { writer: TableWriter::new(tables.clone()), actors_config, tables, actors, ledger, uploader, clock }
    }

    /// A job whose stage fails is recorded `Failed` and the next job runs.
    /// Fatal errors (credentials, configuration) stop the command.
    pub async fn consume(&self) -> Result<ConsumeOutcome> {
        let jobs = self.ledger.pending_jobs().await?;
        let mut outcome = ConsumeOutcome { jobs_seen: jobs.len(), ..Default::default() };
        if jobs.is_empty() {
            info!("No pending jobs in the run ledger");
            return Ok(outcome);
        }
        info!("Consuming {} pending jobs", jobs.len());
        let uniform = self.uploader.detect_uniform_access().await;

        for job in jobs {
            let span = info_span!("job", job_id = %job.job_id);
            match self.consume_job(&job, uniform).instrument(span).await {
                Ok(JobResult::Waiting) => {
                    outcome.jobs_waiting += 1;
                    info!(job_id = %job.job_id, "Page dataset is empty, job stays pending");
                }
                Ok(JobResult::Done { companies, with_images, uploaded, failed }) => {
                    EnrichmentMetrics::record_job_consumed(true);
                    let description = format!("{} companies updated, {} with images", companies, with_images);
                    self.ledger.record(&job.with_status(LedgerStatus::Processed, description)).await?;
                    outcome.jobs_processed += 1;
                    outcome.companies_updated += companies;
                    outcome.companies_with_images += with_images;
                    outcome.images_uploaded += uploaded;
                    outcome.images_failed += failed;
                }
                Err(e) => {
                    EnrichmentMetrics::record_job_consumed(false);
                    error!(job_id = %job.job_id, "Job failed: {}", e);
                    self.ledger.record(&job.with_status(LedgerStatus::Failed, e.to_string())).await?;
                    outcome.jobs_failed += 1;
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        }

        info!(
            "Consumed {} jobs: {} processed, {} failed, {} waiting",
            outcome.jobs_seen, outcome.jobs_processed, outcome.jobs_failed, outcome.jobs_waiting
        );
        Ok(outcome)
    }

    async fn consume_job(&self, job: &LedgerEntry, uniform: bool) -> Result<JobResult> {
        let cfg = &self.actors_config;
        let page_run = job
            .run_for(&cfg.page_actor)
            .ok_or_else(|| MigrationError::Ledger(format!("job {} has no {} run", job.job_id, cfg.page_actor)))?;
        let page_items = self.actors.dataset_items(&page_run.run_id).await?;
        if page_items.is_empty() {
            return Ok(JobResult::Waiting);
        }

        let photo_items = match job.run_for(&cfg.photos_actor) {
            Some(run) => self.actors.dataset_items(&run.run_id).await?,
            None => {
                warn!("Job {} has no {} run, continuing without post photos", job.job_id, cfg.photos_actor);
                Vec::new()
            }
        };

        let details = company_details(&page_items);
        let photos = group_photos(&photo_items);
        info!("{} page records, {} pages with photos", details.len(), photos.len());

        let ids: Vec<String> = details.iter().map(|d| d.id_scraping.clone()).collect();
        let processed = self.tables.processed_company_ids(&ids).await?;
        let mut seen = HashSet::new();
        let fresh: Vec<CompanyDetails> = details
            .into_iter()
            .filter(|d| !processed.contains(&d.id_scraping) && seen.insert(d.id_scraping.clone()))
            .collect();
        if fresh.is_empty() {
            info!("Every company in job {} was already processed", job.job_id);
            return Ok(JobResult::Done { companies: 0, with_images: 0, uploaded: 0, failed: 0 });
        }

        let mut registry = NameRegistry::new();
        let mut artifacts = Vec::new();
        for d in &fresh {
            let posts = d.facebook_url.as_ref().and_then(|u| photos.get(u)).cloned().unwrap_or_default();
            artifacts.extend(artifacts_from_urls(
                &d.id_scraping,
                &d.country,
                d.profile_picture_url.as_deref(),
                d.cover_photo_url.as_deref(),
                &posts,
                &mut registry,
            ));
        }
        let mut report = self.uploader.upload_all(artifacts, uniform).await;
        if let Some(e) = report.fatal.take() {
            return Err(e);
        }

        let created_at = self.clock.timestamp();
        self.writer.merge(TableTarget::Raw, "id_scraping", detail_rows(&fresh, &created_at)).await?;
        self.writer.write_images(image_rows(&report, &created_at)).await?;
        let flags = processed_flags(&fresh, &report);
        let with_images = flags.iter().filter(|r| r.get("processed") == Some(&Value::Bool(true))).count();
        self.writer.merge(TableTarget::Raw, "id_scraping", flags).await?;

        Ok(JobResult::Done {
            companies: fresh.len(),
            with_images,
            uploaded: report.uploaded.len(),
            failed: report.failed.len(),
        })
    }
}

/// Raw-table updates carrying only the detail fields the page record had.
fn detail_rows(details: &[CompanyDetails], created_at: &str) -> Vec<Row> {
    details
        .iter()
        .map(|d| {
            let mut row = Row::new();
            row.insert("id_scraping".into(), json!(d.id_scraping));
            for (column, value) in [
                ("address", &d.address),
                ("category", &d.category),
                ("email", &d.email),
                ("intro", &d.intro),
                ("phone", &d.phone),
                ("title", &d.title),
            ] {
                if let Some(v) = value {
                    row.insert(column.into(), json!(v));
                }
            }
            row.insert("created_at".into(), json!(created_at));
            row
        })
        .collect()
}

fn processed_flags(details: &[CompanyDetails], report: &UploadReport) -> Vec<Row> {
    details
        .iter()
        .filter_map(|d| {
            json!({"id_scraping": d.id_scraping, "processed": report.uploaded_for(&d.id_scraping) > 0})
                .as_object()
                .cloned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::in_memory::{InMemoryActors, InMemoryBlobStore, InMemoryLedger, InMemoryTables, StaticHttp};
    use crate::types::{ActorRun, ReferenceRecord};
    use chrono::Utc;

    const PHOTOS: &str = "apify/facebook-photos-scraper";
    const PAGE: &str = "apify/facebook-pages-scraper";

    fn actors_config() -> ActorsConfig {
        ActorsConfig { photos_actor: PHOTOS.into(), page_actor: PAGE.into(), ..ActorsConfig::default() }
    }

    fn job(id: &str) -> LedgerEntry {
        let run = |actor: &str, run_id: &str| ActorRun {
            actor: actor.into(),
            run_id: run_id.into(),
            monitor_url: String::new(),
        };
        LedgerEntry {
            job_id: id.into(),
            status: LedgerStatus::Pending,
            runs: vec![run(PHOTOS, &format!("{}-photos", id)), run(PAGE, &format!("{}-page", id))],
            company_count: 1,
            description: String::new(),
            recorded_at: Utc::now(),
        }
    }

    fn seed(tables: &InMemoryTables, id: &str) {
        tables.seed_reference(&ReferenceRecord {
            id_scraping: id.into(),
            title: "old title".into(),
            link: Some(format!("https://facebook.com/{}", id)),
            country: Some("Mexico".into()),
            address: Some("old address".into()),
            category: None,
            email: None,
            intro: None,
            phone: None,
        });
    }

    struct Fixture {
        tables: Arc<InMemoryTables>,
        actors: Arc<InMemoryActors>,
        ledger: Arc<InMemoryLedger>,
        dest: Arc<InMemoryBlobStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tables: Arc::new(InMemoryTables::new()),
                actors: Arc::new(InMemoryActors::new()),
                ledger: Arc::new(InMemoryLedger::new()),
                dest: Arc::new(InMemoryBlobStore::new()),
            }
        }

        fn use_case(&self, http: StaticHttp) -> ConsumeUseCase {
            let uploader = ParallelUploader::new(
                Arc::new(InMemoryBlobStore::new()),
                self.dest.clone(),
                Arc::new(http),
                "dst",
                "googleapis.com",
                2,
            );
            ConsumeUseCase::new(
                actors_config(),
                self.tables.clone(),
                self.actors.clone(),
                self.ledger.clone(),
                uploader,
                RunClock::new(-5),
            )
        }
    }

    #[tokio::test]
    async fn processes_job_end_to_end() {
        let fx = Fixture::new();
        seed(&fx.tables, "7");
        fx.ledger.record(&job("j1")).await.unwrap();
        fx.actors.set_dataset(
            "j1-page",
            vec![json!({
                "facebookUrl": "https://facebook.com/7",
                "title": "Aceros del Norte",
                "phone": "811 000",
                "profilePictureUrl": "https://cdn/p.jpg",
                "userData": {"id_scraping": "7", "country": "mexico"}
            })],
        );
        fx.actors.set_dataset(
            "j1-photos",
            vec![
                json!({"facebookUrl": "https://facebook.com/7", "image": "https://cdn/1.jpg"}),
                json!({"facebookUrl": "https://facebook.com/7", "image": "https://cdn/2.jpg"}),
            ],
        );
        let http = StaticHttp::default()
            .with("https://cdn/p.jpg", 200, b"p")
            .with("https://cdn/1.jpg", 200, b"1")
            .with("https://cdn/2.jpg", 404, b"");

        let outcome = fx.use_case(http).consume().await.unwrap();
        assert_eq!(outcome.jobs_processed, 1);
        assert_eq!(outcome.images_uploaded, 2);
        assert_eq!(outcome.images_failed, 1);

        let raw = fx.tables.raw_row("7").unwrap();
        assert_eq!(raw["title"], "Aceros del Norte");
        assert_eq!(raw["address"], "old address");
        assert_eq!(raw["processed"], true);
        assert!(raw["created_at"].is_string());
        assert_eq!(fx.tables.images().len(), 2);
        assert_eq!(fx.dest.names("dst"), vec!["7_profile_image.jpg", "7_post_1.jpg"]);
        assert!(fx.ledger.pending_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_page_dataset_keeps_job_pending() {
        let fx = Fixture::new();
        fx.ledger.record(&job("j1")).await.unwrap();

        let outcome = fx.use_case(StaticHttp::default()).consume().await.unwrap();
        assert_eq!(outcome.jobs_waiting, 1);
        assert_eq!(fx.ledger.pending_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn already_processed_companies_are_skipped() {
        let fx = Fixture::new();
        seed(&fx.tables, "7");
        fx.mark_created("7").await;
        fx.ledger.record(&job("j1")).await.unwrap();
        fx.actors.set_dataset(
            "j1-page",
            vec![json!({"id_scraping": "7", "title": "New", "profilePictureUrl": "https://cdn/p.jpg"})],
        );

        let outcome = fx.use_case(StaticHttp::default().with("https://cdn/p.jpg", 200, b"p")).consume().await.unwrap();
        assert_eq!(outcome.jobs_processed, 1);
        assert_eq!(outcome.companies_updated, 0);
        assert_eq!(fx.dest.write_count(), 0);
        assert_eq!(fx.tables.raw_row("7").unwrap()["title"], "old title");
    }

    #[tokio::test]
    async fn stage_failure_marks_job_failed_and_continues() {
        let fx = Fixture::new();
        seed(&fx.tables, "7");
        fx.ledger.record(&job("j1")).await.unwrap();
        fx.ledger.record(&job("j2")).await.unwrap();
        fx.actors.set_dataset("j1-page", vec![json!({"id_scraping": "7", "title": "New"})]);
        fx.tables.set_unreachable();

        let outcome = fx.use_case(StaticHttp::default()).consume().await.unwrap();
        assert_eq!(outcome.jobs_failed, 1);
        assert_eq!(outcome.jobs_waiting, 1);
        let history = fx.ledger.history().await.unwrap();
        assert_eq!(history.last().unwrap().status, LedgerStatus::Failed);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_the_job_without_touching_companies() {
        let fx = Fixture::new();
        seed(&fx.tables, "7");
        fx.ledger.record(&job("j1")).await.unwrap();
        fx.actors.set_dataset(
            "j1-page",
            vec![json!({"id_scraping": "7", "title": "New", "profilePictureUrl": "https://cdn/p.jpg"})],
        );
        fx.dest.deny_writes();

        let err = fx
            .use_case(StaticHttp::default().with("https://cdn/p.jpg", 200, b"p"))
            .consume()
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Auth(_)));
        assert_eq!(fx.ledger.history().await.unwrap().last().unwrap().status, LedgerStatus::Failed);

        let raw = fx.tables.raw_row("7").unwrap();
        assert!(raw.get("created_at").map_or(true, Value::is_null));
        assert_eq!(raw["title"], "old title");
        assert!(fx.tables.processed_company_ids(&["7".to_string()]).await.unwrap().is_empty());
        assert!(fx.tables.images().is_empty());
    }

    impl Fixture {
        async fn mark_created(&self, id: &str) {
            let row = json!({"id_scraping": id, "created_at": "2024-01-01 00:00:00"}).as_object().cloned().unwrap();
            self.tables.merge_rows(TableTarget::Raw, "id_scraping", &[row]).await.unwrap();
        }
    }
}
