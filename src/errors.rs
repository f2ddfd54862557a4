//! Typed error hierarchy for the metric pipeline.
//!
//! Precondition failures surface synchronously to the RPC caller; the
//! execution variants are only ever recorded as a metric's `last_error`.

use thiserror::Error;

use crate::pipeline::models::RefreshStep;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Metric {id} not found")]
    MetricNotFound { id: String },

    #[error("Metric {id} is a manual metric and has no ingestion template")]
    ManualMetric { id: String },

    #[error("Integration for metric {metric_id} not found")]
    IntegrationNotFound { metric_id: String },

    #[error("No dashboard chart found for metric {metric_id}")]
    ChartNotFound { metric_id: String },

    #[error("Metric {metric_id} has no data points to chart")]
    NoDataPoints { metric_id: String },

    #[error("Pipeline already running for metric {metric_id} (step: {step})")]
    AlreadyRunning { metric_id: String, step: RefreshStep },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Pipeline run {run_id} was superseded by a newer run")]
    Superseded { run_id: String },

    #[error("Connector fetch failed: {0}")]
    Connector(String),

    #[error("Transformer generation failed: {0}")]
    Generation(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// True for errors raised before any background work is scheduled.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MetricNotFound { .. }
                | Self::ManualMetric { .. }
                | Self::IntegrationNotFound { .. }
                | Self::ChartNotFound { .. }
                | Self::NoDataPoints { .. }
                | Self::AlreadyRunning { .. }
                | Self::BadRequest(_)
        )
    }
}
