use std::sync::Arc;

use biz_migrate::app::migration_use_case::MigrationUseCase;
use biz_migrate::config::Config;
use biz_migrate::infra::in_memory::{InMemoryBlobStore, InMemoryTables, StaticHttp};
use biz_migrate::pipeline::uploader::ParallelUploader;
use biz_migrate::types::{BatchStage, ReferenceRecord};

const CONFIG: &str = r#"
    [storage]
    source_bucket = "scraping-raw"
    dest_bucket = "company-images"
    source_prefix = "Paises/Brasil/"
    country = "Brasil"

    [tables]
    raw = "facebook_raw"
    companies = "companies_migrated"
    images = "company_images"

    [matching]
    similarity_threshold = 0.85
    match_workers = 2

    [upload]
    workers = 3
"#;

struct Harness {
    source: Arc<InMemoryBlobStore>,
    dest: Arc<InMemoryBlobStore>,
    tables: Arc<InMemoryTables>,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: Arc::new(InMemoryBlobStore::new()),
            dest: Arc::new(InMemoryBlobStore::new()),
            tables: Arc::new(InMemoryTables::new()),
        }
    }

    fn reference(&self, id: &str, title: &str) {
        self.tables.seed_reference(&ReferenceRecord {
            id_scraping: id.into(),
            title: title.into(),
            link: Some(format!("https://facebook.com/{}", id)),
            country: Some("Brasil".into()),
            address: Some("Rua 1".into()),
            category: Some("Materiais de construção".into()),
            email: None,
            intro: None,
            phone: Some("+55 11 0000".into()),
        });
    }

    fn blob(&self, path: &str) {
        self.source.put("scraping-raw", &format!("Paises/Brasil/{}", path), path.as_bytes());
    }

    fn use_case(&self) -> MigrationUseCase {
        let config = Arc::new(Config::from_toml_str(CONFIG).unwrap());
        let uploader = ParallelUploader::new(
            self.source.clone(),
            self.dest.clone(),
            Arc::new(StaticHttp::default()),
            "company-images",
            "googleapis.com",
            3,
        );
        MigrationUseCase::new(config, self.source.clone(), self.tables.clone(), uploader)
    }
}

#[tokio::test]
async fn punctuation_and_case_do_not_block_a_match() {
    let h = Harness::new();
    h.reference("123", "Acme Co.");
    h.blob("ACME CO/Banner.jpg");

    let outcome = h.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.stats.matched, 1);

    let companies = h.tables.companies();
    assert_eq!(companies.len(), 1);
    assert_eq!(companies[0].id_scraping, "123");
    assert_eq!(companies[0].candidate_name, "ACME CO");
    assert_eq!(companies[0].similarity_score, 1.0);
    assert!(companies[0].has_images);
}

#[tokio::test]
async fn logo_only_entry_migrates_one_profile_image() {
    let h = Harness::new();
    h.reference("123", "Acme Co.");
    h.blob("ACME CO/Logo.jpg");

    let outcome = h.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.stats.images_uploaded, 1);
    assert_eq!(h.dest.names("company-images"), vec!["123_profile_image.jpg"]);

    let images = h.tables.images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0]["image_type"], "profile_image");
    assert_eq!(images[0]["img_path"], "https://storage.googleapis.com/company-images/123_profile_image.jpg");
}

#[tokio::test]
async fn posts_are_numbered_and_non_images_ignored() {
    let h = Harness::new();
    h.reference("55", "Sol Materiais");
    h.blob("Sol Materiais/Posts/a.jpg");
    h.blob("Sol Materiais/Posts/b.png");
    h.blob("Sol Materiais/Posts/notes.txt");

    let outcome = h.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(h.dest.names("company-images"), vec!["55_post_1.jpg", "55_post_2.jpg"]);
}

#[tokio::test]
async fn already_migrated_entry_is_never_uploaded() {
    let h = Harness::new();
    h.reference("123", "Acme Co.");
    h.blob("ACME CO/Logo.jpg");
    h.use_case().run(false).await;
    let writes_after_first = h.dest.write_count();

    let outcome = h.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.stats.already_present, 1);
    assert_eq!(outcome.stats.migrated, 0);
    assert_eq!(h.dest.write_count(), writes_after_first);
    assert_eq!(h.tables.companies().len(), 1);
    assert_eq!(h.tables.images().len(), 1);
}

#[tokio::test]
async fn weak_matches_are_rejected() {
    let h = Harness::new();
    h.reference("1", "Ferragens Paulista");
    h.blob("Padaria Central/Logo.jpg");

    let outcome = h.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.stats.unmatched, 1);
    assert_eq!(outcome.stats.matched, 0);
    assert_eq!(h.dest.write_count(), 0);
}

#[tokio::test]
async fn unreadable_access_policy_is_treated_as_uniform() {
    let h = Harness::new();
    h.reference("9", "Casa do Aço");
    h.blob("Casa do Aço/Banner.jpg");
    h.dest.fail_access_policy();

    let outcome = h.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.stats.images_uploaded, 1);
    assert!(h.dest.public_objects().is_empty());
}

#[tokio::test]
async fn per_object_acls_without_uniform_access() {
    let h = Harness::new();
    h.reference("9", "Casa do Aço");
    h.blob("Casa do Aço/Banner.jpg");
    h.dest.disable_uniform_access();

    h.use_case().run(false).await;
    assert_eq!(h.dest.public_objects(), vec!["company-images/9_cover_image.jpg"]);
}

#[tokio::test]
async fn listing_failure_fails_the_batch_at_enumeration() {
    let h = Harness::new();
    h.reference("123", "Acme Co.");
    h.source.fail_listing();

    let outcome = h.use_case().run(false).await;
    assert_eq!(outcome.stage, BatchStage::Failed);
    assert_eq!(outcome.failed_at, Some(BatchStage::Enumerate));
    assert!(h.tables.companies().is_empty());
}

#[tokio::test]
async fn unreachable_store_fails_at_match() {
    let h = Harness::new();
    h.blob("ACME CO/Logo.jpg");
    h.tables.set_unreachable();

    let outcome = h.use_case().run(false).await;
    assert_eq!(outcome.failed_at, Some(BatchStage::Match));
    assert_eq!(h.dest.write_count(), 0);
}

#[tokio::test]
async fn duplicate_candidates_keep_the_best_score() {
    let h = Harness::new();
    h.reference("77", "Madeireira Boa Vista");
    h.blob("Madeireira Boa Vist/Logo.jpg");
    h.blob("Madeireira Boa Vista/Logo.jpg");

    let outcome = h.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.stats.matched, 2);
    assert_eq!(outcome.stats.duplicates_in_batch, 1);

    let companies = h.tables.companies();
    assert_eq!(companies.len(), 1);
    assert_eq!(companies[0].candidate_name, "Madeireira Boa Vista");
    assert_eq!(h.dest.write_count(), 1);
}

#[tokio::test]
async fn expired_destination_credentials_leave_the_entry_for_a_rerun() {
    let h = Harness::new();
    h.reference("123", "Acme Co.");
    h.blob("ACME CO/Logo.jpg");
    h.dest.deny_writes();

    let outcome = h.use_case().run(false).await;
    assert_eq!(outcome.failed_at, Some(BatchStage::Upload));
    assert!(h.tables.companies().is_empty());

    let fresh = Harness { source: h.source.clone(), dest: Arc::new(InMemoryBlobStore::new()), tables: h.tables.clone() };
    let outcome = fresh.use_case().run(false).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.stats.already_present, 0);
    assert_eq!(outcome.stats.images_uploaded, 1);
    assert!(h.tables.companies()[0].has_images);
}
