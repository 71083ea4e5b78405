use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::app::ports::{TablePort, TableTarget};
use crate::error::Result;
use crate::metrics::MigrationMetrics;
use crate::types::{CompanyRow, ImageRow, Row};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriteReport {
    pub companies_inserted: usize,
    pub images_inserted: usize,
    /// Image rows dropped because their `img_path` was already stored.
    pub images_already_present: usize,
}

/// Bulk loads and merge-upserts against the analytical store. Any error
/// here fails the current batch; rows from earlier batches are untouched.
pub struct TableWriter {
    tables: Arc<dyn TablePort>,
}

impl TableWriter {
    pub fn new(tables: Arc<dyn TablePort>) -> Self {
        Self { tables }
    }

    /// Image metadata is loaded before the company rows so that a failed
    /// company load leaves the entries eligible for the next run.
    pub async fn write_batch(&self, companies: &[CompanyRow], images: Vec<ImageRow>) -> Result<WriteReport> {
        let mut report = WriteReport::default();

        let images = self.drop_existing_images(images, &mut report).await?;
        if !images.is_empty() {
            report.images_inserted = self.tables.insert_images(&images).await?;
        }
        if !companies.is_empty() {
            report.companies_inserted = self.tables.insert_companies(companies).await?;
        }

        MigrationMetrics::record_rows_written(report.companies_inserted + report.images_inserted);
        info!(
            "Wrote {} company rows and {} image rows ({} images already present)",
            report.companies_inserted, report.images_inserted, report.images_already_present
        );
        Ok(report)
    }

    pub async fn write_images(&self, images: Vec<ImageRow>) -> Result<WriteReport> {
        self.write_batch(&[], images).await
    }

    async fn drop_existing_images(&self, images: Vec<ImageRow>, report: &mut WriteReport) -> Result<Vec<ImageRow>> {
        if images.is_empty() {
            return Ok(images);
        }
        let existing = self.tables.existing_image_paths().await?;
        let before = images.len();
        let fresh: Vec<ImageRow> = images.into_iter().filter(|r| !existing.contains(&r.img_path)).collect();
        report.images_already_present = before - fresh.len();
        Ok(fresh)
    }

    /// Rows may carry different column sets; each set is merged as its own
    /// temp-table batch so absent columns are left untouched.
    pub async fn merge(&self, target: TableTarget, key: &str, rows: Vec<Row>) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let total = rows.len();
        let mut groups: BTreeMap<Vec<String>, Vec<Row>> = BTreeMap::new();
        for row in rows {
            let columns: Vec<String> = row.keys().cloned().collect();
            groups.entry(columns).or_default().push(row);
        }
        let mut merged = 0;
        for group in groups.values() {
            merged += self.tables.merge_rows(target, key, group).await?;
        }
        info!("Merged {} of {} rows into {:?} by {}", merged, total, target, key);
        Ok(merged)
    }
}
