//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Counter, CounterVec, Histogram, HistogramOpts, IntCounter,
    IntGauge, Opts, Registry,
};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::error;

/// Global metrics registry
///
/// Metric names are fixed, so registration only fails on a programming error.
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Summarization metrics
    pub summarizations: CounterVec,

    // Compression pipeline metrics
    pub compression_passes: CounterVec,
    pub compression_ratio: Histogram,
    pub pipeline_duration: Histogram,

    // Checkpoint aging metrics
    pub aging_actions: CounterVec,

    // Snapshot metrics
    pub snapshots_created: Counter,
    pub snapshots_pruned: IntCounter,

    // Budget metrics
    pub emergency_actions: CounterVec,
    pub active_tokens: IntGauge,
}

fn ratio_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0]
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let summarizations = register_counter_vec_with_registry!(
            Opts::new("summarizations_total", "Summarization requests by outcome"),
            &["outcome"],
            registry
        )?;

        let compression_passes = register_counter_vec_with_registry!(
            Opts::new("compression_passes_total", "Compression passes by outcome"),
            &["outcome"],
            registry
        )?;

        let compression_ratio = register_histogram_with_registry!(
            HistogramOpts::new(
                "compression_ratio",
                "Summary tokens over original tokens for committed checkpoints"
            )
            .buckets(ratio_buckets()),
            registry
        )?;

        let pipeline_duration = register_histogram_with_registry!(
            "compression_pipeline_duration_seconds",
            "Compression pass duration in seconds",
            registry
        )?;

        let aging_actions = register_counter_vec_with_registry!(
            Opts::new("checkpoint_aging_actions_total", "Checkpoints re-summarized or merged"),
            &["action"],
            registry
        )?;

        let snapshots_created = register_counter_with_registry!(
            Opts::new("snapshots_created_total", "Snapshots written"),
            registry
        )?;

        let snapshots_pruned = register_int_counter_with_registry!(
            Opts::new("snapshots_pruned_total", "Snapshots removed by retention"),
            registry
        )?;

        let emergency_actions = register_counter_vec_with_registry!(
            Opts::new("emergency_actions_total", "Emergency ladder rungs reached"),
            &["rung"],
            registry
        )?;

        let active_tokens = register_int_gauge_with_registry!(
            Opts::new("active_context_tokens", "Tokens in the most recently updated active context"),
            registry
        )?;

        Ok(Self {
            registry,
            summarizations,
            compression_passes,
            compression_ratio,
            pipeline_duration,
            aging_actions,
            snapshots_created,
            snapshots_pruned,
            emergency_actions,
            active_tokens,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}
