use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use biz_migrate::app::classify_use_case::ClassifyUseCase;
use biz_migrate::app::consume_use_case::ConsumeUseCase;
use biz_migrate::app::launch_use_case::LaunchUseCase;
use biz_migrate::app::ledger_use_case::LedgerUseCase;
use biz_migrate::app::migration_use_case::MigrationUseCase;
use biz_migrate::app::ports::{BlobStorePort, TablePort};
use biz_migrate::clock::RunClock;
use biz_migrate::config::{required, BlobBackend, Config};
use biz_migrate::infra::apify_client::ApifyClient;
use biz_migrate::infra::file_ledger::FileLedger;
use biz_migrate::infra::fs_blob_store::FsBlobStore;
use biz_migrate::infra::gcs_blob_store::GcsBlobStore;
use biz_migrate::infra::http_client::ReqwestHttp;
use biz_migrate::infra::sqlite_tables::SqliteTables;
use biz_migrate::infra::vertex_classifier::VertexClassifier;
use biz_migrate::pipeline::uploader::ParallelUploader;
use biz_migrate::types::{LedgerEntry, ReferenceRecord};
use biz_migrate::{logging, metrics};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "biz_migrate")]
#[command(about = "Reconciles scraped business entries with the reference table and migrates their images")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "MIGRATE_CONFIG", default_value = "migrate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match scraped entries, copy their images and write the new rows
    Migrate {
        /// Stop after resolving images and only log the plan
        #[arg(long)]
        dry_run: bool,
    },
    /// Start the photos and page actors for raw rows not yet scraped
    Launch,
    /// Drain pending actor jobs from the run ledger
    Consume,
    /// Classify pending post images
    Classify {
        /// Override the configured number of companies per run
        #[arg(long)]
        max_companies: Option<usize>,
    },
    /// Inspect or repair the run ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
    /// Load reference records from a newline-delimited JSON file
    ImportReference {
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// Latest state of every job
    List,
    /// Jobs waiting to be consumed
    Pending,
    /// Mark a job pending again
    Requeue { job_id: String },
}

fn blob_store(config: &Config) -> anyhow::Result<Arc<dyn BlobStorePort>> {
    let storage = &config.storage;
    Ok(match storage.backend {
        BlobBackend::Gcs => {
            let token = required(&storage.access_token, "GCS_ACCESS_TOKEN")?;
            Arc::new(GcsBlobStore::new(&storage.host, token)?)
        }
        BlobBackend::Fs => Arc::new(FsBlobStore::new(&storage.fs_root)),
    })
}

fn tables(config: &Config) -> anyhow::Result<Arc<SqliteTables>> {
    let path = &config.tables.database_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(Arc::new(SqliteTables::open(path, &config.tables)?))
}

fn uploader(config: &Config, store: Arc<dyn BlobStorePort>) -> anyhow::Result<ParallelUploader> {
    Ok(ParallelUploader::new(
        store.clone(),
        store,
        Arc::new(ReqwestHttp::new(DOWNLOAD_TIMEOUT)?),
        config.storage.dest_bucket.clone(),
        config.storage.host.clone(),
        config.upload.workers,
    ))
}

fn apify(config: &Config) -> anyhow::Result<Arc<ApifyClient>> {
    let token = required(&config.actors.token, "APIFY_TOKEN")?;
    Ok(Arc::new(ApifyClient::new(config.actors.base_url.clone(), token)))
}

fn print_jobs(title: &str, jobs: &[LedgerEntry]) {
    println!("\n📒 {} ({}):", title, jobs.len());
    for job in jobs {
        println!(
            "   {} {:?} companies={} recorded={} {}",
            job.job_id,
            job.status,
            job.company_count,
            job.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            job.description
        );
        for run in &job.runs {
            println!("      {} -> {}", run.actor, run.monitor_url);
        }
    }
}

fn read_reference(path: &Path) -> anyhow::Result<Vec<ReferenceRecord>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| serde_json::from_str(line).with_context(|| format!("{}:{}", path.display(), i + 1)))
        .collect()
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(Config::load(&cli.config)?);
    let clock = RunClock::new(config.run.utc_offset_hours);

    match cli.command {
        Commands::Migrate { dry_run } => {
            println!("🔄 Running migration batch{}...", if dry_run { " (dry run)" } else { "" });
            let store = blob_store(&config)?;
            let table_port: Arc<dyn TablePort> = tables(&config)?;
            let use_case = MigrationUseCase::new(config.clone(), store.clone(), table_port, uploader(&config, store)?);
            let outcome = use_case.run(dry_run).await;
            let stats = &outcome.stats;

            println!("\n📊 Batch {}:", outcome.batch_id);
            println!("   Candidates: {}", stats.candidates_found);
            println!("   Matched: {} (unmatched {}, malformed {})", stats.matched, stats.unmatched, stats.malformed);
            println!("   Already migrated: {}", stats.already_present);
            println!("   Migrated: {} ({} with images, {} without)", stats.migrated, stats.with_images, stats.without_images);
            println!("   Images: {} uploaded, {} failed", stats.images_uploaded, stats.images_failed);
            if dry_run {
                println!("   Planned artifacts: {}", outcome.planned.len());
            }
            println!("   Elapsed: {} ms", stats.elapsed_ms);

            if let Some(e) = outcome.error {
                println!("❌ Batch failed at {}: {}", outcome.failed_at.map(|s| s.to_string()).unwrap_or_default(), e);
                bail!("batch {} failed: {}", outcome.batch_id, e);
            }
            println!("✅ Batch completed");
        }
        Commands::Launch => {
            println!("🚀 Launching scraping actors...");
            let use_case = LaunchUseCase::new(
                config.actors.clone(),
                tables(&config)?,
                apify(&config)?,
                Arc::new(FileLedger::new(&config.actors.ledger_path)),
            );
            match use_case.launch().await? {
                Some(entry) => print_jobs("Launched job", &[entry]),
                None => println!("✅ Nothing to launch"),
            }
        }
        Commands::Consume => {
            println!("📥 Consuming pending actor jobs...");
            let store = blob_store(&config)?;
            let use_case = ConsumeUseCase::new(
                config.actors.clone(),
                tables(&config)?,
                apify(&config)?,
                Arc::new(FileLedger::new(&config.actors.ledger_path)),
                uploader(&config, store)?,
                clock,
            );
            let outcome = use_case.consume().await?;
            println!("\n📊 Jobs: {} seen, {} processed, {} failed, {} waiting", outcome.jobs_seen, outcome.jobs_processed, outcome.jobs_failed, outcome.jobs_waiting);
            println!("   Companies updated: {} ({} with images)", outcome.companies_updated, outcome.companies_with_images);
            println!("   Images: {} uploaded, {} failed", outcome.images_uploaded, outcome.images_failed);
        }
        Commands::Classify { max_companies } => {
            println!("🔍 Classifying pending images...");
            let cls = &config.classifier;
            if cls.project_id.trim().is_empty() {
                bail!("classifier project_id is not configured");
            }
            let token = required(&cls.access_token, "VERTEX_ACCESS_TOKEN")?;
            let classifier = Arc::new(VertexClassifier::new(&cls.project_id, &cls.location, &cls.model, token));
            let use_case = ClassifyUseCase::new(cls.clone(), tables(&config)?, classifier, clock);
            let run = use_case.run(max_companies).await?;
            println!("\n📊 Classification run {} → {}:", run.execution_start, run.execution_end);
            println!("   Companies: {}", run.companies_processed);
            println!("   Images: {} total, {} construction", run.total_images, run.construction_images);
            println!("   Failed: {}, timed out: {}", run.failed_images, run.timed_out_images);
        }
        Commands::Ledger { action } => {
            let use_case = LedgerUseCase::new(Arc::new(FileLedger::new(&config.actors.ledger_path)));
            match action {
                LedgerAction::List => print_jobs("Jobs", &use_case.list().await?),
                LedgerAction::Pending => print_jobs("Pending jobs", &use_case.pending().await?),
                LedgerAction::Requeue { job_id } => {
                    let entry = use_case.requeue(&job_id).await?;
                    println!("✅ Job {} is {:?}", entry.job_id, entry.status);
                }
            }
        }
        Commands::ImportReference { file } => {
            let records = read_reference(&file)?;
            let inserted = tables(&config)?.load_reference(&records)?;
            info!("Imported {} of {} reference records", inserted, records.len());
            println!("✅ Imported {} reference records ({} already present)", inserted, records.len() - inserted);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("Command failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}
