//! Metrics for the migration and enrichment pipelines
//!
//! Each pipeline owns a submodule with its metric names and recording
//! helpers. Recording goes through the `metrics` facade, so it is a no-op
//! unless a recorder was installed with [`init_metrics`].

pub mod enrichment;
pub mod migration;

pub use enrichment::EnrichmentMetrics;
pub use migration::MigrationMetrics;

use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Install the Prometheus exporter when `MIGRATE_METRICS_ADDR` is set.
///
/// Idempotent. Batch jobs usually run without it; the facade then drops
/// every sample.
pub fn init_metrics() {
    INIT.call_once(|| {
        let addr = match std::env::var("MIGRATE_METRICS_ADDR") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => return,
        };
        let addr = match addr.parse::<std::net::SocketAddr>() {
            Ok(a) => a,
            Err(e) => {
                warn!("Invalid MIGRATE_METRICS_ADDR '{}': {}", addr, e);
                return;
            }
        };
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => {
                info!("Prometheus exporter listening on http://{}/metrics", addr);
                register_all_metrics();
            }
            Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
        }
    });
}

/// Trait for pipeline-specific metric collections
pub trait PhaseMetrics {
    /// Pre-register every metric so exporters show zeros before the first sample.
    fn register_metrics();

    fn phase_name() -> &'static str;
}

/// Metric naming convention: bizmig_{phase}_{name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("bizmig_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("bizmig_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

fn register_all_metrics() {
    MigrationMetrics::register_metrics();
    EnrichmentMetrics::register_metrics();
    info!(
        "Registered metrics for phases: {}, {}",
        MigrationMetrics::phase_name(),
        EnrichmentMetrics::phase_name()
    );
}
