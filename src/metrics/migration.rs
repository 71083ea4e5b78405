//! Migration batch metrics: matching, uploads and table writes.

use crate::metrics::{phase_metric, PhaseMetrics};
use crate::types::BatchStage;

pub struct MigrationMetrics;

impl MigrationMetrics {
    pub fn record_match(accepted: bool) {
        if accepted {
            ::metrics::counter!(phase_metric!(counter, "migration", "candidates_matched")).increment(1);
        } else {
            ::metrics::counter!(phase_metric!(counter, "migration", "candidates_unmatched")).increment(1);
        }
    }

    pub fn record_malformed() {
        ::metrics::counter!(phase_metric!(counter, "migration", "candidates_malformed")).increment(1);
    }

    pub fn record_upload(success: bool) {
        if success {
            ::metrics::counter!(phase_metric!(counter, "migration", "uploads_success")).increment(1);
        } else {
            ::metrics::counter!(phase_metric!(counter, "migration", "uploads_error")).increment(1);
        }
    }

    pub fn record_rows_written(rows: usize) {
        ::metrics::counter!(phase_metric!(counter, "migration", "rows_written")).increment(rows as u64);
    }

    pub fn record_stage_duration(stage: BatchStage, secs: f64) {
        ::metrics::histogram!(
            phase_metric!(histogram, "migration", "stage_duration_seconds"),
            "stage" => stage.to_string()
        )
        .record(secs);
    }

    pub fn record_batch_failed() {
        ::metrics::counter!(phase_metric!(counter, "migration", "batches_failed")).increment(1);
    }
}

impl PhaseMetrics for MigrationMetrics {
    fn register_metrics() {
        use metrics::{counter, histogram};

        let _ = counter!(phase_metric!(counter, "migration", "candidates_matched"));
        let _ = counter!(phase_metric!(counter, "migration", "candidates_unmatched"));
        let _ = counter!(phase_metric!(counter, "migration", "candidates_malformed"));
        let _ = counter!(phase_metric!(counter, "migration", "uploads_success"));
        let _ = counter!(phase_metric!(counter, "migration", "uploads_error"));
        let _ = counter!(phase_metric!(counter, "migration", "rows_written"));
        let _ = counter!(phase_metric!(counter, "migration", "batches_failed"));
        let _ = histogram!(phase_metric!(histogram, "migration", "stage_duration_seconds"));
    }

    fn phase_name() -> &'static str {
        "migration"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        MigrationMetrics::record_match(true);
        MigrationMetrics::record_upload(false);
        MigrationMetrics::record_rows_written(3);
        MigrationMetrics::record_stage_duration(BatchStage::Match, 0.25);
    }

    #[test]
    fn metric_names_follow_convention() {
        assert_eq!(
            phase_metric!(counter, "migration", "rows_written"),
            "bizmig_migration_rows_written_total"
        );
    }
}
