use std::collections::HashMap;

use crate::types::{LedgerEntry, LedgerStatus};

/// Latest record per job, kept when it is still pending. Jobs come back in
/// the order they were first recorded.
pub fn pending_from_history(history: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    latest_per_job(history)
        .into_iter()
        .filter(|e| e.status == LedgerStatus::Pending)
        .collect()
}

pub fn latest_per_job(history: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, LedgerEntry> = HashMap::new();
    for entry in history {
        if !latest.contains_key(&entry.job_id) {
            order.push(entry.job_id.clone());
        }
        latest.insert(entry.job_id.clone(), entry);
    }
    order.into_iter().filter_map(|id| latest.remove(&id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(job: &str, status: LedgerStatus) -> LedgerEntry {
        LedgerEntry {
            job_id: job.into(),
            status,
            runs: vec![],
            company_count: 1,
            description: String::new(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn latest_record_decides_status() {
        let history = vec![
            entry("a", LedgerStatus::Pending),
            entry("b", LedgerStatus::Pending),
            entry("a", LedgerStatus::Processed),
            entry("c", LedgerStatus::Failed),
            entry("c", LedgerStatus::Pending),
        ];
        let pending: Vec<String> = pending_from_history(history).into_iter().map(|e| e.job_id).collect();
        assert_eq!(pending, vec!["b", "c"]);
    }
}
