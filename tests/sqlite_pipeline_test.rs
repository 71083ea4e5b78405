use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use biz_migrate::app::classify_use_case::ClassifyUseCase;
use biz_migrate::app::consume_use_case::ConsumeUseCase;
use biz_migrate::app::launch_use_case::LaunchUseCase;
use biz_migrate::app::migration_use_case::MigrationUseCase;
use biz_migrate::app::ports::{RunLedgerPort, TablePort};
use biz_migrate::clock::RunClock;
use biz_migrate::config::{ActorsConfig, BlobBackend, ClassifierConfig, Config};
use biz_migrate::infra::file_ledger::FileLedger;
use biz_migrate::infra::fs_blob_store::FsBlobStore;
use biz_migrate::infra::in_memory::{InMemoryActors, ScriptedClassifier, ScriptedReply, StaticHttp};
use biz_migrate::infra::sqlite_tables::SqliteTables;
use biz_migrate::pipeline::uploader::ParallelUploader;
use biz_migrate::types::{LedgerStatus, ReferenceRecord};

fn config(root: &Path) -> Config {
    let mut config = Config::from_toml_str(&format!(
        r#"
        [storage]
        source_bucket = "scraping-raw"
        dest_bucket = "company-images"
        source_prefix = "Paises/Mexico/"
        country = "Mexico"
        backend = "fs"
        fs_root = "{root}/blobs"

        [tables]
        database_path = "{root}/warehouse.db"
        raw = "facebook_raw"
        companies = "companies_migrated"
        images = "company_images"
        "#,
        root = root.display()
    ))
    .unwrap();
    config.validate().unwrap();
    assert_eq!(config.storage.backend, BlobBackend::Fs);
    config.actors = ActorsConfig {
        photos_actor: "apify/facebook-photos-scraper".into(),
        page_actor: "apify/facebook-pages-scraper".into(),
        ledger_path: root.join("ledger.ndjson"),
        ..ActorsConfig::default()
    };
    config
}

fn record(id: &str, title: &str, link: &str) -> ReferenceRecord {
    ReferenceRecord {
        id_scraping: id.into(),
        title: title.into(),
        link: Some(link.into()),
        country: Some("Mexico".into()),
        address: None,
        category: Some("Ferretería".into()),
        email: None,
        intro: Some("Materiales para construcción".into()),
        phone: None,
    }
}

fn put(root: &Path, rel: &str) {
    let path = root.join("blobs/scraping-raw/Paises/Mexico").join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, rel.as_bytes()).unwrap();
}

fn uploader(config: &Config, store: Arc<FsBlobStore>, http: StaticHttp) -> ParallelUploader {
    ParallelUploader::new(
        store.clone(),
        store,
        Arc::new(http),
        config.storage.dest_bucket.clone(),
        config.storage.host.clone(),
        config.upload.workers,
    )
}

#[tokio::test]
async fn migration_batch_is_idempotent_on_disk() {
    let dir = tempdir().unwrap();
    let config = Arc::new(config(dir.path()));
    let tables = Arc::new(SqliteTables::open(&config.tables.database_path, &config.tables).unwrap());
    tables
        .load_reference(&[
            record("101", "Ferretería El Martillo", "https://facebook.com/martillo"),
            record("102", "Aceros Monterrey S.A.", "https://facebook.com/aceros"),
        ])
        .unwrap();

    put(dir.path(), "FERRETERIA EL MARTILLO/Banner.jpg");
    put(dir.path(), "Ferretería El Martillo/Logo.jpg");
    put(dir.path(), "Ferretería El Martillo/Posts/1.jpg");
    put(dir.path(), "Aceros Monterrey SA/Posts/a.png");
    put(dir.path(), "Panaderia Lupita/Logo.jpg");

    let store = Arc::new(FsBlobStore::new(&config.storage.fs_root));
    let run = || {
        MigrationUseCase::new(
            config.clone(),
            store.clone(),
            tables.clone(),
            uploader(&config, store.clone(), StaticHttp::default()),
        )
    };

    let first = run().run(false).await;
    assert!(first.is_done(), "{:?}", first.error);
    assert_eq!(first.stats.candidates_found, 4);
    assert_eq!(first.stats.migrated, 2);
    assert_eq!(first.stats.unmatched, 1);

    let ids = tables.existing_company_ids().await.unwrap();
    assert!(ids.contains("101") && ids.contains("102"));
    let dest = dir.path().join("blobs/company-images");
    assert!(dest.join("101_profile_image.jpg").is_file());
    assert!(dest.join("101_post_1.jpg").is_file());
    assert!(dest.join("102_post_1.jpg").is_file());
    let images_after_first = tables.existing_image_paths().await.unwrap().len();

    let second = run().run(false).await;
    assert!(second.is_done());
    assert_eq!(second.stats.migrated, 0);
    assert_eq!(second.stats.image_rows_written, 0);
    assert_eq!(tables.existing_image_paths().await.unwrap().len(), images_after_first);
}

#[tokio::test]
async fn launch_consume_and_classify_share_one_store() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let tables = Arc::new(SqliteTables::open(&config.tables.database_path, &config.tables).unwrap());
    tables.load_reference(&[record("7", "Aceros del Norte", "https://facebook.com/aceros-norte")]).unwrap();

    let actors = Arc::new(InMemoryActors::new());
    let ledger = Arc::new(FileLedger::new(&config.actors.ledger_path));

    let entry = LaunchUseCase::new(config.actors.clone(), tables.clone(), actors.clone(), ledger.clone())
        .launch()
        .await
        .unwrap()
        .unwrap();
    assert!(tables.pending_links(10).await.unwrap().is_empty());

    let photos_run = entry.run_for(&config.actors.photos_actor).unwrap().run_id.clone();
    let page_run = entry.run_for(&config.actors.page_actor).unwrap().run_id.clone();
    actors.set_dataset(
        &page_run,
        vec![json!({
            "facebookUrl": "https://facebook.com/aceros-norte",
            "title": "Aceros del Norte",
            "intro": "Varilla, malla y perfiles",
            "userData": {"id_scraping": "7", "country": "mexico"}
        })],
    );
    actors.set_dataset(
        &photos_run,
        vec![json!({"facebookUrl": "https://facebook.com/aceros-norte", "image": "https://cdn.example.com/p1.jpg"})],
    );

    let store = Arc::new(FsBlobStore::new(&config.storage.fs_root));
    let http = StaticHttp::default().with("https://cdn.example.com/p1.jpg", 200, b"jpeg");
    let consumed = ConsumeUseCase::new(
        config.actors.clone(),
        tables.clone(),
        actors.clone(),
        ledger.clone(),
        uploader(&config, store, http),
        RunClock::new(-5),
    )
    .consume()
    .await
    .unwrap();
    assert_eq!(consumed.jobs_processed, 1);
    assert_eq!(consumed.images_uploaded, 1);
    assert!(ledger.pending_jobs().await.unwrap().is_empty());
    assert_eq!(ledger.history().await.unwrap().last().unwrap().status, LedgerStatus::Processed);
    assert!(tables.processed_company_ids(&["7".to_string()]).await.unwrap().contains("7"));

    let image_url = "https://storage.googleapis.com/company-images/7_post_1.jpg";
    let classifier = Arc::new(ScriptedClassifier::new());
    classifier.reply(image_url, ScriptedReply::Products(vec![json!({"product_name": "Varilla corrugada 3/8"})]));

    let run = ClassifyUseCase::new(ClassifierConfig::default(), tables.clone(), classifier.clone(), RunClock::new(-5))
        .with_timeout(Duration::from_secs(5))
        .run(None)
        .await
        .unwrap();
    assert_eq!(run.companies_processed, 1);
    assert_eq!(run.construction_images, 1);
    assert!(classifier.prompts()[0].contains("Varilla, malla y perfiles"));
    assert!(tables.pending_classification_companies(10).await.unwrap().is_empty());
}
