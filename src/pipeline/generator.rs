use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::chart::ChartSpec;
use super::ingestion::IngestionSpec;
use super::models::{Cadence, ChartType};

/// Input for generating an ingestion transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionPrompt {
    pub metric_name: String,
    pub metric_description: Option<String>,
    pub provider: String,
    pub endpoint_config: serde_json::Value,
    /// Raw connector response with long arrays cut down.
    pub sample_response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SamplePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub dimensions: Option<serde_json::Value>,
}

/// Input for generating a chart transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPrompt {
    pub metric_name: String,
    pub metric_description: Option<String>,
    pub preferred_chart_type: Option<ChartType>,
    pub cadence: Option<Cadence>,
    pub selected_dimension: Option<String>,
    pub dimension_keys: Vec<String>,
    pub point_count: usize,
    pub first_date: Option<DateTime<Utc>>,
    pub last_date: Option<DateTime<Utc>>,
    pub sample_points: Vec<SamplePoint>,
}

/// The externally hosted transformer-generation service, treated as an
/// opaque function from a prompt to a transformer definition.
#[async_trait]
pub trait TransformerGenerator: Send + Sync {
    async fn generate_ingestion(&self, prompt: &IngestionPrompt) -> Result<IngestionSpec>;

    async fn generate_chart(&self, prompt: &ChartPrompt) -> Result<ChartSpec>;
}

/// Calls the transformer service over HTTP.
///
/// `POST {base}/ingestion-transformers` and `POST {base}/chart-transformers`
/// with the prompt as JSON; the response body carries the definition either
/// bare or wrapped in `{"transformer": ...}`.
pub struct HttpTransformerGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransformerGenerator {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build generator HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<P: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, prompt: &P) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut builder = self.client.post(&url).json(prompt);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach transformer service at {}", url))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("Failed to read transformer service response")?;
        if !status.is_success() {
            anyhow::bail!(
                "Transformer service returned {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            );
        }
        parse_definition(&body)
    }
}

#[async_trait]
impl TransformerGenerator for HttpTransformerGenerator {
    async fn generate_ingestion(&self, prompt: &IngestionPrompt) -> Result<IngestionSpec> {
        self.post("ingestion-transformers", prompt).await
    }

    async fn generate_chart(&self, prompt: &ChartPrompt) -> Result<ChartSpec> {
        self.post("chart-transformers", prompt).await
    }
}

/// Parse a transformer definition out of a service response.
///
/// Tolerates surrounding prose or markdown fences by parsing the outermost
/// `{...}` span, and unwraps a `{"transformer": {...}}` envelope.
pub fn parse_definition<T: DeserializeOwned>(body: &str) -> Result<T> {
    let cleaned = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body,
    };
    let value: serde_json::Value =
        serde_json::from_str(cleaned).context("Transformer response is not valid JSON")?;
    let definition = match value.get("transformer") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => value,
    };
    serde_json::from_value(definition).context("Transformer response does not match the expected definition")
}

/// Cut every array in `value` down to its first `max_items` elements.
pub fn truncate_sample(value: &serde_json::Value, max_items: usize) -> serde_json::Value {
    match value {
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .take(max_items)
                .map(|item| truncate_sample(item, max_items))
                .collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_sample(v, max_items)))
                .collect(),
        ),
        other => other.clone(),
    }
}
