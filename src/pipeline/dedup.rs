use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::types::MatchResult;

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub survivors: Vec<MatchResult>,
    pub already_present: usize,
    pub duplicates_in_batch: usize,
}

/// Drops accepted matches whose reference id already exists in the
/// destination table. The snapshot is taken once per batch by the caller
/// and never refreshed.
pub struct DedupFilter {
    existing: HashSet<String>,
}

impl DedupFilter {
    pub fn new(existing: HashSet<String>) -> Self {
        Self { existing }
    }

    pub fn snapshot_len(&self) -> usize {
        self.existing.len()
    }

    /// When two candidates resolve to the same id the higher score is kept;
    /// on a tie the earlier candidate stays, in its original position.
    pub fn filter(&self, matches: Vec<MatchResult>) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for m in matches {
            let id = match m.id_scraping() {
                Some(id) => id.to_string(),
                None => continue,
            };
            if self.existing.contains(&id) {
                debug!(stage = "DEDUP", id_scraping = %id, "Already present, skipping");
                outcome.already_present += 1;
                continue;
            }
            match positions.get(&id) {
                Some(&pos) => {
                    outcome.duplicates_in_batch += 1;
                    if m.score > outcome.survivors[pos].score {
                        outcome.survivors[pos] = m;
                    }
                }
                None => {
                    positions.insert(id, outcome.survivors.len());
                    outcome.survivors.push(m);
                }
            }
        }
        outcome
    }
}
