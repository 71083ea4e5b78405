use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::app::ports::{RunLedgerPort, ScrapingActorPort, TablePort, TableTarget};
use crate::config::ActorsConfig;
use crate::error::{MigrationError, Result};
use crate::metrics::EnrichmentMetrics;
use crate::pipeline::writer::TableWriter;
use crate::types::{LedgerEntry, LedgerStatus, PendingLink, Row};

/// Starts the photos and page actors for raw rows that were never scraped.
pub struct LaunchUseCase {
    actors_config: ActorsConfig,
    tables: Arc<dyn TablePort>,
    actors: Arc<dyn ScrapingActorPort>,
    ledger: Arc<dyn RunLedgerPort>,
    writer: TableWriter,
}

impl LaunchUseCase {
    pub fn new(
        actors_config: ActorsConfig,
        tables: Arc<dyn TablePort>,
        actors: Arc<dyn ScrapingActorPort>,
        ledger: Arc<dyn RunLedgerPort>,
    ) -> Self {
        Self { writer: TableWriter::new(tables.clone()), actors_config, tables, actors, ledger }
    }

    /// Returns the recorded ledger entry, or `None` when nothing was pending.
    pub async fn launch(&self) -> Result<Option<LedgerEntry>> {
        let cfg = &self.actors_config;
        if cfg.photos_actor.trim().is_empty() || cfg.page_actor.trim().is_empty() {
            return Err(MigrationError::Config("photos_actor and page_actor must be configured".into()));
        }

        let links = self.tables.pending_links(cfg.max_companies).await?;
        if links.is_empty() {
            info!("No pending links to launch");
            return Ok(None);
        }
        info!("Launching actors for {} companies", links.len());

        let start_urls = start_urls(&links);
        let photos_input = json!({"startUrls": start_urls, "resultsLimit": cfg.results_limit});
        let page_input = json!({"startUrls": start_urls});

        let photos_run = self.actors.start_run(&cfg.photos_actor, photos_input).await?;
        let page_run = self.actors.start_run(&cfg.page_actor, page_input).await?;
        EnrichmentMetrics::record_actor_runs_started(2);
        info!("Photos run: {}", photos_run.monitor_url);
        info!("Page run: {}", page_run.monitor_url);

        let entry = LedgerEntry {
            job_id: Uuid::new_v4().to_string(),
            status: LedgerStatus::Pending,
            runs: vec![photos_run, page_run],
            company_count: links.len(),
            description: format!("{} companies launched", links.len()),
            recorded_at: Utc::now(),
        };
        // Ledger first: a crash before the flag re-launches the rows.
        self.ledger.record(&entry).await?;

        let rows: Vec<Row> = links
            .iter()
            .filter_map(|l| json!({"id_scraping": l.id_scraping, "is_downloaded": true}).as_object().cloned())
            .collect();
        let flagged = self.writer.merge(TableTarget::Raw, "id_scraping", rows).await?;
        info!("Job {} recorded, {} raw rows flagged as downloaded", entry.job_id, flagged);

        Ok(Some(entry))
    }
}

fn start_urls(links: &[PendingLink]) -> Vec<Value> {
    links
        .iter()
        .map(|l| {
            json!({
                "url": l.link,
                "userData": {"id_scraping": l.id_scraping, "country": l.country}
            })
        })
        .collect()
}
