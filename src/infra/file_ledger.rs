use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::app::ports::RunLedgerPort;
use crate::error::{MigrationError, Result};
use crate::pipeline::ledger::pending_from_history;
use crate::types::LedgerEntry;

/// Run ledger as an append-only NDJSON file, one entry per line.
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    fn read_all(&self) -> Result<Vec<LedgerEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => entries.push(entry),
                // A torn last line from an interrupted append is skipped
                Err(e) => warn!("Skipping unreadable ledger line {} in {}: {}", lineno + 1, self.path.display(), e),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl RunLedgerPort for FileLedger {
    async fn record(&self, entry: &LedgerEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line).map_err(|e| MigrationError::Ledger(format!("append failed: {}", e)))?;
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<LedgerEntry>> {
        Ok(pending_from_history(self.read_all()?))
    }

    async fn history(&self) -> Result<Vec<LedgerEntry>> {
        self.read_all()
    }
}
