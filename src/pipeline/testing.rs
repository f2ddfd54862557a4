//! Test doubles for the external collaborators.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use super::cache::CacheInvalidator;
use super::chart::{ChartAggregation, ChartSpec};
use super::connector::{ConnectorRequest, DataConnector};
use super::generator::{ChartPrompt, IngestionPrompt, TransformerGenerator};
use super::ingestion::IngestionSpec;
use super::models::{Cadence, ChartType};

pub struct MockConnector {
    response: Mutex<Result<serde_json::Value, String>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl MockConnector {
    pub fn new(response: serde_json::Value) -> Self {
        Self {
            response: Mutex::new(Ok(response)),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Mutex::new(Err(message.to_string())),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Every fetch waits for one `notify_one` on the returned handle.
    pub fn gated(response: serde_json::Value) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let connector = Self {
            gate: Some(gate.clone()),
            ..Self::new(response)
        };
        (connector, gate)
    }

    pub fn set_response(&self, response: serde_json::Value) {
        *self.response.lock().unwrap() = Ok(response);
    }

    pub fn set_failure(&self, message: &str) {
        *self.response.lock().unwrap() = Err(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataConnector for MockConnector {
    async fn fetch(&self, _request: &ConnectorRequest) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let response = self.response.lock().unwrap().clone();
        response.map_err(|e| anyhow::anyhow!(e))
    }
}

/// Returns fixed definitions: a daily count of `/items` keyed on
/// `/created_at`, and a line chart. Queued ingestion definitions are
/// handed out first.
pub struct MockGenerator {
    ingestion: IngestionSpec,
    queued: Mutex<VecDeque<IngestionSpec>>,
    chart: ChartSpec,
    failure: Option<String>,
    ingestion_calls: AtomicUsize,
    chart_calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self {
            ingestion: IngestionSpec::counting("/items", "/created_at"),
            queued: Mutex::new(VecDeque::new()),
            chart: ChartSpec {
                chart_type: ChartType::Line,
                cadence: Cadence::Daily,
                aggregation: ChartAggregation::Sum,
                title: "Generated".into(),
                description: None,
                selected_dimension: None,
                stacked: false,
                show_legend: None,
                show_tooltip: true,
            },
            failure: None,
            ingestion_calls: AtomicUsize::new(0),
            chart_calls: AtomicUsize::new(0),
            gate: None,
        }
    }
}

impl MockGenerator {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// The first ingestion generation returns `spec`, later ones the default.
    pub fn with_first_ingestion(spec: IngestionSpec) -> Self {
        Self {
            queued: Mutex::new(VecDeque::from([spec])),
            ..Self::default()
        }
    }

    /// Every generation waits for one `notify_one` on the returned handle.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let generator = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (generator, gate)
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
    }

    pub fn ingestion_calls(&self) -> usize {
        self.ingestion_calls.load(Ordering::SeqCst)
    }

    pub fn chart_calls(&self) -> usize {
        self.chart_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformerGenerator for MockGenerator {
    async fn generate_ingestion(&self, _prompt: &IngestionPrompt) -> Result<IngestionSpec> {
        self.ingestion_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        match &self.failure {
            Some(message) => anyhow::bail!("{}", message),
            None => {
                let queued = self.queued.lock().unwrap().pop_front();
                Ok(queued.unwrap_or_else(|| self.ingestion.clone()))
            }
        }
    }

    async fn generate_chart(&self, _prompt: &ChartPrompt) -> Result<ChartSpec> {
        self.chart_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        match &self.failure {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(self.chart.clone()),
        }
    }
}

/// Remembers every invalidation instead of notifying anyone.
#[derive(Default)]
pub struct RecordingInvalidator {
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingInvalidator {
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, tags: &[String]) {
        self.calls.lock().unwrap().push(tags.to_vec());
    }
}
