use std::sync::Arc;
use tracing::info;

use crate::app::ports::RunLedgerPort;
use crate::error::{MigrationError, Result};
use crate::pipeline::ledger::latest_per_job;
use crate::types::{LedgerEntry, LedgerStatus};

/// Inspection and manual repair of the run ledger.
pub struct LedgerUseCase {
    ledger: Arc<dyn RunLedgerPort>,
}

impl LedgerUseCase {
    pub fn new(ledger: Arc<dyn RunLedgerPort>) -> Self {
        Self { ledger }
    }

    /// Current state of every job.
    pub async fn list(&self) -> Result<Vec<LedgerEntry>> {
        Ok(latest_per_job(self.ledger.history().await?))
    }

    pub async fn pending(&self) -> Result<Vec<LedgerEntry>> {
        self.ledger.pending_jobs().await
    }

    /// Append a `Pending` record so the next `consume` retries the job.
    pub async fn requeue(&self, job_id: &str) -> Result<LedgerEntry> {
        let current = self
            .list()
            .await?
            .into_iter()
            .find(|e| e.job_id == job_id)
            .ok_or_else(|| MigrationError::Ledger(format!("unknown job {}", job_id)))?;
        if current.status == LedgerStatus::Pending {
            info!("Job {} is already pending", job_id);
            return Ok(current);
        }
        let entry = current.with_status(LedgerStatus::Pending, "requeued manually");
        self.ledger.record(&entry).await?;
        info!("Requeued job {} (was {:?})", job_id, current.status);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::in_memory::InMemoryLedger;
    use chrono::Utc;

    fn entry(job: &str, status: LedgerStatus) -> LedgerEntry {
        LedgerEntry {
            job_id: job.into(),
            status,
            runs: vec![],
            company_count: 3,
            description: String::new(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn requeue_repends_a_failed_job() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.record(&entry("a", LedgerStatus::Pending)).await.unwrap();
        ledger.record(&entry("a", LedgerStatus::Failed)).await.unwrap();
        let uc = LedgerUseCase::new(ledger.clone());

        assert!(uc.pending().await.unwrap().is_empty());
        let requeued = uc.requeue("a").await.unwrap();
        assert_eq!(requeued.status, LedgerStatus::Pending);
        assert_eq!(requeued.company_count, 3);
        assert_eq!(uc.pending().await.unwrap().len(), 1);
        assert_eq!(ledger.history().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let uc = LedgerUseCase::new(Arc::new(InMemoryLedger::new()));
        assert!(matches!(uc.requeue("missing").await, Err(MigrationError::Ledger(_))));
    }
}
