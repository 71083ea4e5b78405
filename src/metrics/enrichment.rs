//! Actor batch and image classification metrics.

use crate::metrics::{phase_metric, PhaseMetrics};

pub struct EnrichmentMetrics;

impl EnrichmentMetrics {
    pub fn record_actor_runs_started(runs: usize) {
        ::metrics::counter!(phase_metric!(counter, "enrichment", "actor_runs_started")).increment(runs as u64);
    }

    pub fn record_job_consumed(success: bool) {
        if success {
            ::metrics::counter!(phase_metric!(counter, "enrichment", "jobs_processed")).increment(1);
        } else {
            ::metrics::counter!(phase_metric!(counter, "enrichment", "jobs_failed")).increment(1);
        }
    }

    pub fn record_classification(construction: bool, secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "enrichment", "images_classified")).increment(1);
        if construction {
            ::metrics::counter!(phase_metric!(counter, "enrichment", "construction_images")).increment(1);
        }
        ::metrics::histogram!(phase_metric!(histogram, "enrichment", "classify_seconds")).record(secs);
    }

    pub fn record_classifier_timeout() {
        ::metrics::counter!(phase_metric!(counter, "enrichment", "classifier_timeouts")).increment(1);
    }
}

impl PhaseMetrics for EnrichmentMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "enrichment", "actor_runs_started"));
        let _ = counter!(phase_metric!(counter, "enrichment", "jobs_processed"));
        let _ = counter!(phase_metric!(counter, "enrichment", "jobs_failed"));
        let _ = counter!(phase_metric!(counter, "enrichment", "images_classified"));
        let _ = counter!(phase_metric!(counter, "enrichment", "construction_images"));
        let _ = counter!(phase_metric!(counter, "enrichment", "classifier_timeouts"));
        let _ = histogram!(phase_metric!(histogram, "enrichment", "classify_seconds"));
    }

    fn phase_name() -> &'static str {
        "enrichment"
    }
}
