//! Fuzzy reconciliation of scraped entry names against reference titles.
//!
//! Names are compared on their normalized form. An exact normalized hit
//! short-circuits to a score of 1.0; otherwise the best normalized
//! Levenshtein ratio over the (optionally token-prefiltered) index wins,
//! ties keeping the key that was seen first.

use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MatchingConfig;
use crate::error::{MigrationError, Result};
use crate::types::{CandidateEntry, MatchResult, ReferenceRecord};

/// Lowercase, drop everything that is neither alphanumeric nor whitespace,
/// collapse whitespace runs and trim.
pub fn normalize(name: &str) -> String {
    let kept: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity of two raw names in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    score_normalized(&normalize(a), &normalize(b))
}

fn score_normalized(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b).clamp(0.0, 1.0)
}

struct IndexKey {
    normalized: String,
    tokens: HashSet<String>,
    records: Vec<ReferenceRecord>,
}

/// Normalized title → reference records, keeping first-seen order.
pub struct ReferenceIndex {
    keys: Vec<IndexKey>,
    by_key: HashMap<String, usize>,
    record_count: usize,
}

impl ReferenceIndex {
    pub fn build(records: Vec<ReferenceRecord>) -> Self {
        let mut keys: Vec<IndexKey> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut record_count = 0;

        for record in records {
            let normalized = normalize(&record.title);
            if normalized.is_empty() {
                continue;
            }
            record_count += 1;
            match by_key.get(&normalized) {
                Some(&pos) => keys[pos].records.push(record),
                None => {
                    by_key.insert(normalized.clone(), keys.len());
                    keys.push(IndexKey {
                        tokens: normalized.split(' ').map(str::to_string).collect(),
                        normalized,
                        records: vec![record],
                    });
                }
            }
        }

        Self { keys, by_key, record_count }
    }

    /// Number of distinct normalized titles.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Accepted(MatchResult),
    Rejected(MatchResult),
    /// The name cannot be scored at all; the candidate is skipped.
    Malformed { candidate: CandidateEntry, reason: String },
}

#[derive(Debug, Clone)]
pub struct SimilarityMatcher {
    threshold: f64,
    max_name_len: usize,
    token_prefilter: bool,
}

impl SimilarityMatcher {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            threshold: config.similarity_threshold,
            max_name_len: config.max_name_len,
            token_prefilter: config.token_prefilter,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.chars().any(|c| c.is_control() && !c.is_whitespace()) {
            return Err(MigrationError::InvalidName(format!("control character in {:?}", name)));
        }
        let len = name.chars().count();
        if len > self.max_name_len {
            return Err(MigrationError::InvalidName(format!(
                "name is {} characters, limit is {}",
                len, self.max_name_len
            )));
        }
        Ok(())
    }

    pub fn match_candidate(&self, candidate: &CandidateEntry, index: &ReferenceIndex) -> MatchOutcome {
        let rejected = |score: f64| {
            MatchOutcome::Rejected(MatchResult { candidate: candidate.clone(), reference: None, score })
        };

        if candidate.name.trim().is_empty() {
            return rejected(0.0);
        }
        if let Err(e) = self.check_name(&candidate.name) {
            return MatchOutcome::Malformed { candidate: candidate.clone(), reason: e.to_string() };
        }
        let normalized = normalize(&candidate.name);
        if normalized.is_empty() {
            return rejected(0.0);
        }

        if let Some(&pos) = index.by_key.get(&normalized) {
            return match index.keys[pos].records.first() {
                Some(record) => MatchOutcome::Accepted(MatchResult {
                    candidate: candidate.clone(),
                    reference: Some(record.clone()),
                    score: 1.0,
                }),
                _ => rejected(1.0),
            };
        }

        let tokens: HashSet<&str> = normalized.split(' ').collect();
        let min_common = tokens.len().min(2);

        let mut best: Option<(usize, f64)> = None;
        for (pos, key) in index.keys.iter().enumerate() {
            if self.token_prefilter {
                let common = tokens.iter().filter(|t| key.tokens.contains(**t)).count();
                if common < min_common {
                    continue;
                }
            }
            let score = score_normalized(&normalized, &key.normalized);
            // Strictly greater keeps the first-seen key on ties
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((pos, score));
            }
        }

        match best {
            Some((pos, score)) if score >= self.threshold => match index.keys[pos].records.first() {
                Some(record) => MatchOutcome::Accepted(MatchResult {
                    candidate: candidate.clone(),
                    reference: Some(record.clone()),
                    score,
                }),
                None => rejected(score),
            },
            Some((_, score)) => {
                debug!("No match for {:?} (best score {:.3})", candidate.name, score);
                rejected(score)
            }
            None => rejected(0.0),
        }
    }

    /// Score every candidate on a dedicated pool of `workers` threads.
    /// Outcomes come back in candidate order.
    pub fn match_all(
        &self,
        candidates: &[CandidateEntry],
        index: &ReferenceIndex,
        workers: usize,
    ) -> Result<Vec<MatchOutcome>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("matcher-{}", i))
            .build()
            .map_err(|e| MigrationError::Worker(format!("failed to build matcher pool: {}", e)))?;

        let outcomes: Vec<MatchOutcome> = pool.install(|| {
            candidates
                .par_iter()
                .map(|candidate| self.match_candidate(candidate, index))
                .collect()
        });

        for outcome in &outcomes {
            if let MatchOutcome::Malformed { candidate, reason } = outcome {
                warn!(stage = "MATCH", candidate = %candidate.name, "Skipping malformed name: {}", reason);
            }
        }
        Ok(outcomes)
    }
}

/// Run [`SimilarityMatcher::match_all`] off the async runtime.
pub async fn match_all_blocking(
    matcher: SimilarityMatcher,
    candidates: Vec<CandidateEntry>,
    index: Arc<ReferenceIndex>,
    workers: usize,
) -> Result<Vec<MatchOutcome>> {
    tokio::task::spawn_blocking(move || matcher.match_all(&candidates, &index, workers))
        .await
        .map_err(|e| MigrationError::Worker(format!("matcher task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, title: &str) -> ReferenceRecord {
        ReferenceRecord {
            id_scraping: id.to_string(),
            title: title.to_string(),
            link: None,
            country: Some("Brasil".into()),
            address: None,
            category: None,
            email: None,
            intro: None,
            phone: None,
        }
    }

    fn candidate(name: &str) -> CandidateEntry {
        CandidateEntry { name: name.to_string(), prefix: format!("root/{}/", name) }
    }

    fn matcher(threshold: f64) -> SimilarityMatcher {
        SimilarityMatcher::new(&MatchingConfig { similarity_threshold: threshold, ..MatchingConfig::default() })
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("  Acme   Co. "), "acme co");
        assert_eq!(normalize("ACME CO"), "acme co");
        assert_eq!(normalize("Café São-Paulo!"), "café sãopaulo");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn similarity_stays_in_unit_range() {
        let names = ["", "a", "Acme Co.", "ACME", "Padaria do Zé", "zzzzzzzzzzzzzz", "!!", "日本料理"];
        for a in names {
            for b in names {
                let s = similarity(a, b);
                assert!((0.0..=1.0).contains(&s), "{:?} vs {:?} gave {}", a, b, s);
            }
        }
    }

    #[test]
    fn equal_normalized_forms_score_one() {
        assert_eq!(similarity("Acme Co.", "ACME CO"), 1.0);
        assert_eq!(similarity("padaria   sol", "Padaria-Sol"), similarity("padaria sol", "padariasol"));
        assert_eq!(similarity("Padaria, Sol", "padaria sol"), 1.0);
    }

    #[test]
    fn exact_normalized_hit_is_accepted_with_first_seen_record() {
        let index = ReferenceIndex::build(vec![record("123", "ACME CO"), record("999", "Acme co")]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.record_count(), 2);

        match matcher(0.85).match_candidate(&candidate("Acme Co."), &index) {
            MatchOutcome::Accepted(m) => {
                assert_eq!(m.score, 1.0);
                assert_eq!(m.id_scraping(), Some("123"));
            }
            other => panic!("expected accepted, got {:?}", other),
        }
    }

    #[test]
    fn fuzzy_match_respects_threshold() {
        let index = ReferenceIndex::build(vec![record("1", "Padaria Sol Nascente")]);

        let outcome = matcher(0.7).match_candidate(&candidate("Padaria Sol Nascent"), &index);
        assert!(matches!(outcome, MatchOutcome::Accepted(ref m) if m.score >= 0.7 && m.score < 1.0));

        let outcome = matcher(0.99).match_candidate(&candidate("Padaria Sol Nascent"), &index);
        match outcome {
            MatchOutcome::Rejected(m) => assert!(m.reference.is_none()),
            other => panic!("expected rejected, got {:?}", other),
        }
    }

    #[test]
    fn ties_keep_first_seen_key() {
        let index = ReferenceIndex::build(vec![record("first", "loja abc"), record("second", "loja abd")]);
        let m = SimilarityMatcher::new(&MatchingConfig {
            similarity_threshold: 0.5,
            token_prefilter: false,
            ..MatchingConfig::default()
        });
        match m.match_candidate(&candidate("loja abx"), &index) {
            MatchOutcome::Accepted(r) => assert_eq!(r.id_scraping(), Some("first")),
            other => panic!("expected accepted, got {:?}", other),
        }
    }

    #[test]
    fn token_prefilter_skips_unrelated_keys() {
        let index = ReferenceIndex::build(vec![record("1", "mercado central")]);
        let outcome = matcher(0.0).match_candidate(&candidate("padaria sul"), &index);
        assert!(matches!(outcome, MatchOutcome::Rejected(ref m) if m.score == 0.0));
    }

    #[test]
    fn blank_and_malformed_names() {
        let index = ReferenceIndex::build(vec![record("1", "Acme")]);
        let m = matcher(0.0);

        assert!(matches!(m.match_candidate(&candidate("   "), &index), MatchOutcome::Rejected(_)));
        assert!(matches!(m.match_candidate(&candidate("..."), &index), MatchOutcome::Rejected(_)));
        assert!(matches!(
            m.match_candidate(&candidate("Acme\u{0007}"), &index),
            MatchOutcome::Malformed { .. }
        ));

        let long = "a".repeat(MatchingConfig::default().max_name_len + 1);
        assert!(matches!(m.match_candidate(&candidate(&long), &index), MatchOutcome::Malformed { .. }));
    }

    #[test]
    fn match_all_preserves_candidate_order() {
        let index = ReferenceIndex::build(vec![record("1", "Acme Co"), record("2", "Padaria Sol")]);
        let candidates: Vec<CandidateEntry> =
            ["Padaria Sol", "nothing alike", "ACME CO.", "Acme\u{0000}"].iter().map(|n| candidate(n)).collect();

        let outcomes = matcher(0.85).match_all(&candidates, &index, 3).unwrap();
        assert_eq!(outcomes.len(), 4);
        assert!(matches!(&outcomes[0], MatchOutcome::Accepted(m) if m.id_scraping() == Some("2")));
        assert!(matches!(&outcomes[1], MatchOutcome::Rejected(_)));
        assert!(matches!(&outcomes[2], MatchOutcome::Accepted(m) if m.id_scraping() == Some("1")));
        assert!(matches!(&outcomes[3], MatchOutcome::Malformed { .. }));
    }
}
