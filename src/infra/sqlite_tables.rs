use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::app::ports::{TablePort, TableTarget};
use crate::config::{validate_identifier, TablesConfig};
use crate::constants::POST_IMAGE_TYPE;
use crate::error::{MigrationError, Result};
use crate::types::{
    ClassificationRun, CompanyContext, CompanyRow, ImageRow, PendingImage, PendingLink, ReferenceRecord, Row,
};

const MERGE_SOURCE: &str = "merge_source";

/// Analytical tables in a local SQLite database. Keys are unique at the
/// table level, so overlapping runs converge instead of duplicating rows.
pub struct SqliteTables {
    conn: Mutex<Connection>,
    raw: String,
    companies: String,
    images: String,
    runs: String,
}

impl SqliteTables {
    pub fn open<P: AsRef<Path>>(path: P, tables: &TablesConfig) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn, tables)
    }

    pub fn open_in_memory(tables: &TablesConfig) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, tables)
    }

    fn with_connection(conn: Connection, tables: &TablesConfig) -> Result<Self> {
        for name in [&tables.raw, &tables.companies, &tables.images, &tables.classification_runs] {
            validate_identifier(name)?;
        }
        let this = Self {
            conn: Mutex::new(conn),
            raw: tables.raw.clone(),
            companies: tables.companies.clone(),
            images: tables.images.clone(),
            runs: tables.classification_runs.clone(),
        };
        this.create_schema()?;
        Ok(this)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_schema(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {raw} (
                id_scraping       TEXT PRIMARY KEY,
                title             TEXT,
                link              TEXT,
                country           TEXT,
                address           TEXT,
                category          TEXT,
                email             TEXT,
                intro             TEXT,
                phone             TEXT,
                processed         INTEGER NOT NULL DEFAULT 0,
                is_downloaded     INTEGER NOT NULL DEFAULT 0,
                images_processed  INTEGER NOT NULL DEFAULT 0,
                created_at        TEXT
            );
            CREATE TABLE IF NOT EXISTS {companies} (
                id_scraping       TEXT PRIMARY KEY,
                title             TEXT NOT NULL,
                link              TEXT,
                country           TEXT,
                address           TEXT,
                category          TEXT,
                email             TEXT,
                intro             TEXT,
                phone             TEXT,
                candidate_name    TEXT NOT NULL,
                source_prefix     TEXT NOT NULL,
                similarity_score  REAL NOT NULL,
                has_images        INTEGER NOT NULL DEFAULT 0,
                created_at        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {images} (
                id_photo_cleaned        INTEGER NOT NULL,
                id_scraping             TEXT NOT NULL,
                country                 TEXT,
                img_path                TEXT NOT NULL UNIQUE,
                image_type              TEXT NOT NULL,
                created_at              TEXT,
                is_construction_image   INTEGER,
                product_information     TEXT,
                token_input             INTEGER,
                token_output            INTEGER,
                model_used              TEXT,
                execution_time_seconds  REAL,
                processed_ia_at         TEXT,
                time_out                INTEGER,
                classification_error    TEXT
            );
            CREATE INDEX IF NOT EXISTS {images}_by_company ON {images} (id_scraping);
            CREATE TABLE IF NOT EXISTS {runs} (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                companies_processed  INTEGER NOT NULL,
                total_images         INTEGER NOT NULL,
                construction_images  INTEGER NOT NULL,
                successful_images    INTEGER NOT NULL,
                failed_images        INTEGER NOT NULL,
                timed_out_images     INTEGER NOT NULL,
                execution_start      TEXT NOT NULL,
                execution_end        TEXT NOT NULL,
                model_used           TEXT NOT NULL
            );
            "#,
            raw = self.raw,
            companies = self.companies,
            images = self.images,
            runs = self.runs,
        );
        self.conn().execute_batch(&sql)?;
        Ok(())
    }

    /// Load source-of-truth rows; rows whose id already exists are left alone.
    pub fn load_reference(&self, records: &[ReferenceRecord]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (id_scraping, title, link, country, address, category, email, intro, phone)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id_scraping) DO NOTHING",
                self.raw
            ))?;
            for r in records {
                inserted += stmt.execute(params![
                    r.id_scraping,
                    r.title,
                    r.link,
                    r.country,
                    r.address,
                    r.category,
                    r.email,
                    r.intro,
                    r.phone
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn table_name(&self, target: TableTarget) -> &str {
        match target {
            TableTarget::Raw => &self.raw,
            TableTarget::Companies => &self.companies,
            TableTarget::Images => &self.images,
        }
    }

    fn strings(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// All rows must carry the same columns, including `key`.
fn merge_columns(key: &str, rows: &[Row]) -> Result<Vec<String>> {
    let columns: BTreeSet<&String> = rows[0].keys().collect();
    if !columns.iter().any(|c| c.as_str() == key) {
        return Err(MigrationError::Table(format!("merge rows lack key column {}", key)));
    }
    for row in &rows[1..] {
        if row.keys().collect::<BTreeSet<_>>() != columns {
            return Err(MigrationError::Table("merge rows must share the same columns".into()));
        }
    }
    for c in &columns {
        validate_identifier(c)?;
    }
    Ok(columns.into_iter().cloned().collect())
}

#[async_trait]
impl TablePort for SqliteTables {
    async fn reference_records(&self, country: &str) -> Result<Vec<ReferenceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id_scraping, title, link, country, address, category, email, intro, phone
             FROM {} WHERE lower(country) = lower(?1) AND title IS NOT NULL ORDER BY rowid",
            self.raw
        ))?;
        let rows = stmt.query_map(params![country], |row| {
            Ok(ReferenceRecord {
                id_scraping: row.get(0)?,
                title: row.get(1)?,
                link: row.get(2)?,
                country: row.get(3)?,
                address: row.get(4)?,
                category: row.get(5)?,
                email: row.get(6)?,
                intro: row.get(7)?,
                phone: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn existing_company_ids(&self) -> Result<HashSet<String>> {
        let sql = format!("SELECT id_scraping FROM {}", self.companies);
        Ok(self.strings(&sql, [])?.into_iter().collect())
    }

    async fn existing_image_paths(&self) -> Result<HashSet<String>> {
        let sql = format!("SELECT img_path FROM {}", self.images);
        Ok(self.strings(&sql, [])?.into_iter().collect())
    }

    async fn insert_companies(&self, rows: &[CompanyRow]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (id_scraping, title, link, country, address, category, email, intro, phone,
                                 candidate_name, source_prefix, similarity_score, has_images, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id_scraping) DO NOTHING",
                self.companies
            ))?;
            for r in rows {
                inserted += stmt.execute(params![
                    r.id_scraping,
                    r.title,
                    r.link,
                    r.country,
                    r.address,
                    r.category,
                    r.email,
                    r.intro,
                    r.phone,
                    r.candidate_name,
                    r.source_prefix,
                    r.similarity_score,
                    r.has_images,
                    r.created_at
                ])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} of {} rows into {}", inserted, rows.len(), self.companies);
        Ok(inserted)
    }

    async fn insert_images(&self, rows: &[ImageRow]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (id_photo_cleaned, id_scraping, country, img_path, image_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(img_path) DO NOTHING",
                self.images
            ))?;
            for r in rows {
                inserted += stmt.execute(params![
                    r.id_photo_cleaned,
                    r.id_scraping,
                    r.country,
                    r.img_path,
                    r.image_type,
                    r.created_at
                ])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} of {} rows into {}", inserted, rows.len(), self.images);
        Ok(inserted)
    }

    async fn merge_rows(&self, target: TableTarget, key: &str, rows: &[Row]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        validate_identifier(key)?;
        let columns = merge_columns(key, rows)?;
        let table = self.table_name(target).to_string();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS temp.{src}; CREATE TEMP TABLE {src} ({cols});",
            src = MERGE_SOURCE,
            cols = columns.join(", ")
        ))?;
        {
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO temp.{} ({}) VALUES ({})",
                MERGE_SOURCE,
                columns.join(", "),
                placeholders.join(", ")
            ))?;
            for row in rows {
                let values = columns.iter().map(|c| row.get(c).map(to_sql).unwrap_or(SqlValue::Null));
                stmt.execute(params_from_iter(values))?;
            }
        }
        let assignments: Vec<String> = columns
            .iter()
            .filter(|c| c.as_str() != key)
            .map(|c| format!("{c} = {src}.{c}", c = c, src = MERGE_SOURCE))
            .collect();
        let merged = if assignments.is_empty() {
            0
        } else {
            tx.execute(
                &format!(
                    "UPDATE {table} SET {sets} FROM temp.{src} AS {src} WHERE {table}.{key} = {src}.{key}",
                    table = table,
                    sets = assignments.join(", "),
                    src = MERGE_SOURCE,
                    key = key
                ),
                [],
            )?
        };
        tx.execute_batch(&format!("DROP TABLE temp.{};", MERGE_SOURCE))?;
        tx.commit()?;
        Ok(merged)
    }

    async fn pending_links(&self, limit: usize) -> Result<Vec<PendingLink>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id_scraping, link, country, min(rowid) AS first_seen FROM {}
             WHERE processed = 0 AND is_downloaded = 0 AND created_at IS NULL
               AND link IS NOT NULL AND link <> ''
             GROUP BY link ORDER BY first_seen LIMIT ?1",
            self.raw
        ))?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(PendingLink {
                id_scraping: row.get(0)?,
                link: row.get(1)?,
                country: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn processed_company_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let wanted: HashSet<&String> = ids.iter().collect();
        let sql = format!("SELECT id_scraping FROM {} WHERE created_at IS NOT NULL", self.raw);
        Ok(self.strings(&sql, [])?.into_iter().filter(|id| wanted.contains(id)).collect())
    }

    async fn pending_classification_companies(&self, limit: usize) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT id_scraping FROM {}
             WHERE image_type = ?1 AND is_construction_image IS NULL AND coalesce(time_out, 0) = 0
             ORDER BY id_scraping LIMIT ?2",
            self.images
        );
        self.strings(&sql, params![POST_IMAGE_TYPE, limit as i64])
    }

    async fn company_context(&self, id_scraping: &str) -> Result<Option<CompanyContext>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT title, intro FROM {} WHERE id_scraping = ?1", self.raw))?;
        let mut rows = stmt.query(params![id_scraping])?;
        match rows.next()? {
            Some(row) => Ok(Some(CompanyContext {
                title: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                intro: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })),
            None => Ok(None),
        }
    }

    async fn pending_images(&self, id_scraping: &str) -> Result<Vec<PendingImage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT id_photo_cleaned, img_path FROM {}
             WHERE id_scraping = ?1 AND image_type = ?2
               AND is_construction_image IS NULL AND coalesce(time_out, 0) = 0
             ORDER BY id_photo_cleaned",
            self.images
        ))?;
        let rows = stmt.query_map(params![id_scraping, POST_IMAGE_TYPE], |row| {
            Ok(PendingImage { id_photo_cleaned: row.get(0)?, img_path: row.get(1)? })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn insert_classification_run(&self, run: &ClassificationRun) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO {} (companies_processed, total_images, construction_images, successful_images,
                                 failed_images, timed_out_images, execution_start, execution_end, model_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                self.runs
            ),
            params![
                run.companies_processed as i64,
                run.total_images as i64,
                run.construction_images as i64,
                run.successful_images as i64,
                run.failed_images as i64,
                run.timed_out_images as i64,
                run.execution_start,
                run.execution_end,
                run.model_used
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tables_config() -> TablesConfig {
        TablesConfig {
            database_path: "unused.db".into(),
            raw: "facebook_raw".into(),
            companies: "companies_migrated".into(),
            images: "company_images".into(),
            classification_runs: "classification_runs".into(),
        }
    }

    fn reference(id: &str, title: &str, link: &str) -> ReferenceRecord {
        ReferenceRecord {
            id_scraping: id.into(),
            title: title.into(),
            link: Some(link.into()),
            country: Some("Mexico".into()),
            address: None,
            category: None,
            email: None,
            intro: Some(format!("{} intro", title)),
            phone: None,
        }
    }

    fn image(id: &str, path: &str, photo_id: i64) -> ImageRow {
        ImageRow {
            id_photo_cleaned: photo_id,
            id_scraping: id.into(),
            country: "Mexico".into(),
            img_path: path.into(),
            image_type: POST_IMAGE_TYPE.into(),
            created_at: "2024-01-01 00:00:00".into(),
        }
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn duplicate_keys_are_ignored_on_insert() {
        let tables = SqliteTables::open_in_memory(&tables_config()).unwrap();
        assert_eq!(tables.insert_images(&[image("1", "https://s/a.jpg", 1)]).await.unwrap(), 1);
        assert_eq!(
            tables.insert_images(&[image("1", "https://s/a.jpg", 1), image("1", "https://s/b.jpg", 2)]).await.unwrap(),
            1
        );
        assert_eq!(tables.existing_image_paths().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn merge_updates_by_key_and_converges() {
        let tables = SqliteTables::open_in_memory(&tables_config()).unwrap();
        tables.load_reference(&[reference("1", "Acme", "https://fb/acme"), reference("2", "Sol", "https://fb/sol")]).unwrap();

        let updates = vec![
            row(json!({"id_scraping": "1", "is_downloaded": true})),
            row(json!({"id_scraping": "404", "is_downloaded": true})),
        ];
        assert_eq!(tables.merge_rows(TableTarget::Raw, "id_scraping", &updates).await.unwrap(), 1);
        assert_eq!(tables.merge_rows(TableTarget::Raw, "id_scraping", &updates).await.unwrap(), 1);

        let pending = tables.pending_links(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id_scraping, "2");
    }

    #[tokio::test]
    async fn merge_rejects_ragged_rows() {
        let tables = SqliteTables::open_in_memory(&tables_config()).unwrap();
        let updates = vec![
            row(json!({"id_scraping": "1", "title": "a"})),
            row(json!({"id_scraping": "2"})),
        ];
        assert!(tables.merge_rows(TableTarget::Raw, "id_scraping", &updates).await.is_err());
    }

    #[tokio::test]
    async fn classification_queue_skips_done_and_timed_out_images() {
        let tables = SqliteTables::open_in_memory(&tables_config()).unwrap();
        tables.load_reference(&[reference("1", "Acme", "https://fb/acme")]).unwrap();
        tables
            .insert_images(&[image("1", "https://s/1.jpg", 30), image("1", "https://s/2.jpg", 10), image("1", "https://s/3.jpg", 20)])
            .await
            .unwrap();
        tables
            .merge_rows(
                TableTarget::Images,
                "id_photo_cleaned",
                &[row(json!({"id_photo_cleaned": 20, "time_out": true}))],
            )
            .await
            .unwrap();

        assert_eq!(tables.pending_classification_companies(5).await.unwrap(), vec!["1"]);
        let ids: Vec<i64> = tables.pending_images("1").await.unwrap().iter().map(|i| i.id_photo_cleaned).collect();
        assert_eq!(ids, vec![10, 30]);

        let ctx = tables.company_context("1").await.unwrap().unwrap();
        assert_eq!(ctx.intro, "Acme intro");
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let mut config = tables_config();
        config.raw = "raw; DROP TABLE x".into();
        assert!(SqliteTables::open_in_memory(&config).is_err());
    }
}
