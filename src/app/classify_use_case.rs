use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};

use crate::app::ports::{ClassificationRequest, ClassifierPort, TablePort, TableTarget};
use crate::bounded_call::bounded_call;
use crate::clock::RunClock;
use crate::config::ClassifierConfig;
use crate::error::{MigrationError, Result};
use crate::metrics::EnrichmentMetrics;
use crate::pipeline::writer::TableWriter;
use crate::types::{ClassificationRun, CompanyContext, PendingImage, Row};

const CATALOGUE_PROMPT: &str = "\
You are cataloguing products for a construction materials marketplace.
Look at the image and decide whether it shows construction products or
materials offered by the company (cement, steel, aggregates, tiles, pipes,
tools, machinery, finishes and similar).
If it does, return one entry in `products` for each distinct product you can
identify, filling product_name, category and product_description, plus sku,
model, price, currency, brand and specifications when they are visible.
If the image shows people, events, memes, or anything that is not a
construction product, return an empty `products` list.
Answer only with JSON that follows the response schema.";

/// Base catalogue prompt followed by what is known about the company.
pub fn build_prompt(context: &CompanyContext) -> String {
    let mut prompt = String::from(CATALOGUE_PROMPT);
    prompt.push_str("\n\nCompany context:\n");
    prompt.push_str(&format!("- Name: {}\n", non_empty(&context.title, "unknown")));
    prompt.push_str(&format!("- Description: {}\n", non_empty(&context.intro, "not available")));
    prompt
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim()
    }
}

enum ImageResult {
    Classified { construction: bool },
    TimedOut,
    Failed,
}

#[derive(Default)]
struct Tally {
    total: usize,
    construction: usize,
    successful: usize,
    failed: usize,
    timed_out: usize,
}

/// Classifies pending post images for a bounded set of companies and logs
/// one run row per invocation.
pub struct ClassifyUseCase {
    config: ClassifierConfig,
    tables: Arc<dyn TablePort>,
    classifier: Arc<dyn ClassifierPort>,
    writer: TableWriter,
    clock: RunClock,
    timeout: Duration,
}

impl ClassifyUseCase {
    pub fn new(
        config: ClassifierConfig,
        tables: Arc<dyn TablePort>,
        classifier: Arc<dyn ClassifierPort>,
        clock: RunClock,
    ) -> Self {
        let timeout = config.timeout();
        Self { writer: TableWriter::new(tables.clone()), config, tables, classifier, clock, timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A fatal classifier error stops the run; the run row is still written.
    pub async fn run(&self, max_companies: Option<usize>) -> Result<ClassificationRun> {
        let execution_start = self.clock.timestamp();
        let limit = max_companies.unwrap_or(self.config.max_companies);
        let companies = self.tables.pending_classification_companies(limit).await?;
        info!("Classifying pending images for {} companies", companies.len());

        let mut tally = Tally::default();
        let mut companies_processed = 0;
        let mut fatal: Option<MigrationError> = None;

        for id_scraping in &companies {
            let span = info_span!("company", id_scraping = %id_scraping);
            let result = self.classify_company(id_scraping, &mut tally).instrument(span).await;
            companies_processed += 1;
            if let Err(e) = result {
                error!(id_scraping = %id_scraping, "Stopping classification: {}", e);
                fatal = Some(e);
                break;
            }
        }

        let run = ClassificationRun {
            companies_processed,
            total_images: tally.total,
            construction_images: tally.construction,
            successful_images: tally.successful,
            failed_images: tally.failed,
            timed_out_images: tally.timed_out,
            execution_start,
            execution_end: self.clock.timestamp(),
            model_used: self.config.model.clone(),
        };
        self.tables.insert_classification_run(&run).await?;
        info!(
            "Classified {} images ({} construction, {} failed, {} timed out) across {} companies",
            run.successful_images, run.construction_images, run.failed_images, run.timed_out_images, run.companies_processed
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(run),
        }
    }

    /// Only fatal errors are returned; per-image failures are tallied.
    async fn classify_company(&self, id_scraping: &str, tally: &mut Tally) -> Result<()> {
        let context = self.tables.company_context(id_scraping).await?.unwrap_or(CompanyContext {
            title: String::new(),
            intro: String::new(),
        });
        let prompt = build_prompt(&context);
        let images = self.tables.pending_images(id_scraping).await?;

        let mut classified = 0;
        for image in &images {
            tally.total += 1;
            match self.classify_image(image, &prompt).await? {
                ImageResult::Classified { construction } => {
                    classified += 1;
                    tally.successful += 1;
                    if construction {
                        tally.construction += 1;
                    }
                }
                ImageResult::TimedOut => tally.timed_out += 1,
                ImageResult::Failed => tally.failed += 1,
            }
        }

        if classified > 0 {
            let row = flag_row(id_scraping);
            if let Err(e) = self.writer.merge(TableTarget::Raw, "id_scraping", vec![row]).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Could not flag images_processed: {}", e);
            }
        }
        info!("{} of {} images classified", classified, images.len());
        Ok(())
    }

    async fn classify_image(&self, image: &PendingImage, prompt: &str) -> Result<ImageResult> {
        let request = ClassificationRequest { image_uri: image.img_path.clone(), prompt: prompt.to_string() };
        let started = Instant::now();
        let reply = bounded_call(self.timeout, self.classifier.classify(request)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let (row, result) = match reply {
            Ok(response) => {
                let construction = !response.products.is_empty();
                EnrichmentMetrics::record_classification(construction, elapsed);
                let product = response.products.first().map(|p| with_image(p, &image.img_path));
                let row = json!({
                    "id_photo_cleaned": image.id_photo_cleaned,
                    "is_construction_image": construction,
                    "product_information": product.map(|p| p.to_string()),
                    "token_input": response.token_input,
                    "token_output": response.token_output,
                    "model_used": response.model,
                    "execution_time_seconds": elapsed,
                    "processed_ia_at": self.clock.timestamp(),
                });
                (row, ImageResult::Classified { construction })
            }
            Err(e) if e.is_timeout() => {
                EnrichmentMetrics::record_classifier_timeout();
                warn!(img_path = %image.img_path, "{}", e);
                (json!({"id_photo_cleaned": image.id_photo_cleaned, "time_out": true}), ImageResult::TimedOut)
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // Stored as a non-construction verdict so the image leaves the queue
                warn!(img_path = %image.img_path, "Classification failed: {}", e);
                let row = json!({
                    "id_photo_cleaned": image.id_photo_cleaned,
                    "is_construction_image": false,
                    "product_information": Value::Null,
                    "token_input": 0,
                    "token_output": 0,
                    "model_used": self.config.model,
                    "execution_time_seconds": elapsed,
                    "processed_ia_at": self.clock.timestamp(),
                    "classification_error": e.to_string(),
                });
                (row, ImageResult::Failed)
            }
        };

        let Some(row) = row.as_object().cloned() else {
            return Ok(ImageResult::Failed);
        };
        match self.writer.merge(TableTarget::Images, "id_photo_cleaned", vec![row]).await {
            Ok(_) => Ok(result),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(img_path = %image.img_path, "Could not store classification: {}", e);
                Ok(ImageResult::Failed)
            }
        }
    }
}

fn with_image(product: &Value, img_path: &str) -> Value {
    let mut product = product.clone();
    if let Some(map) = product.as_object_mut() {
        map.insert("product_image".into(), json!(img_path));
    }
    product
}

fn flag_row(id_scraping: &str) -> Row {
    let mut row = Row::new();
    row.insert("id_scraping".into(), json!(id_scraping));
    row.insert("images_processed".into(), json!(true));
    row
}
