//! Prometheus metrics of the Instance reconciler

use crate::error::{OperatorError, Result};
use prometheus::{exponential_buckets, HistogramOpts, HistogramVec, Registry};
use std::time::Duration;

/// Labels attached to the time-to-ready observations
#[derive(Debug, Clone, Default)]
pub struct ReadyLabels {
    pub workspace: String,
    pub template: String,
    pub environment: String,
    pub environment_type: String,
    pub persistent: bool,
}

/// Metrics recorder injected into the reconciler.
#[derive(Clone)]
pub struct InstanceMetrics {
    initial_ready: HistogramVec,
}

impl InstanceMetrics {
    /// Creates the metrics and registers them into `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let buckets = exponential_buckets(5.0, 1.5, 12).map_err(metrics_error)?;
        let initial_ready = HistogramVec::new(
            HistogramOpts::new(
                "instance_initial_ready_seconds",
                "Time elapsed between the creation of an instance and its first Ready phase",
            )
            .buckets(buckets),
            &["workspace", "template", "environment", "type", "persistent"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(initial_ready.clone()))
            .map_err(metrics_error)?;
        Ok(Self { initial_ready })
    }

    pub fn observe_initial_ready(&self, labels: &ReadyLabels, elapsed: Duration) {
        let persistent = labels.persistent.to_string();
        self.initial_ready
            .with_label_values(&[
                labels.workspace.as_str(),
                labels.template.as_str(),
                labels.environment.as_str(),
                labels.environment_type.as_str(),
                persistent.as_str(),
            ])
            .observe(elapsed.as_secs_f64());
    }
}

fn metrics_error(e: prometheus::Error) -> OperatorError {
    OperatorError::Configuration(format!("metrics setup failed: {}", e))
}
