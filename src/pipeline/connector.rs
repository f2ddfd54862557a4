use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Connector call parameters stored on a metric (`Metric.endpoint_config`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// Provider API path, e.g. `/repos/acme/app/commits`.
    pub endpoint: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EndpointConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .context("Endpoint config must be an object with an 'endpoint' field")?;
        if config.endpoint.trim().is_empty() {
            anyhow::bail!("Endpoint config has an empty 'endpoint'");
        }
        Ok(config)
    }

    /// Query parameters flattened to strings (strings unquoted, arrays comma-joined).
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), param_to_string(v)))
            .collect()
    }
}

fn param_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(param_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// One fetch against a connected third-party integration.
#[derive(Debug, Clone)]
pub struct ConnectorRequest {
    pub connection_id: String,
    /// Provider config key of the integration (`github`, `posthog`, ...).
    pub provider: String,
    pub endpoint: EndpointConfig,
}

/// Abstraction over the managed integration-connector service.
/// Real implementation: `NangoConnector`. Tests use in-memory doubles.
#[async_trait]
pub trait DataConnector: Send + Sync {
    async fn fetch(&self, request: &ConnectorRequest) -> Result<serde_json::Value>;
}

/// Fetches provider data through the Nango proxy API.
pub struct NangoConnector {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl NangoConnector {
    pub fn new(base_url: &str, secret_key: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build connector HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    pub fn proxy_url(&self, endpoint: &str) -> String {
        format!("{}/proxy/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl DataConnector for NangoConnector {
    async fn fetch(&self, request: &ConnectorRequest) -> Result<serde_json::Value> {
        let endpoint = &request.endpoint;
        let method = endpoint
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .with_context(|| format!("Invalid HTTP method '{}'", method))?;

        let mut builder = self
            .client
            .request(method, self.proxy_url(&endpoint.endpoint))
            .bearer_auth(&self.secret_key)
            .header("Connection-Id", &request.connection_id)
            .header("Provider-Config-Key", &request.provider)
            .query(&endpoint.query_pairs());
        for (name, value) in &endpoint.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &endpoint.body {
            builder = builder.json(body);
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach connector for {}", endpoint.endpoint))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Connector returned {} for {}: {}",
                status,
                endpoint.endpoint,
                text.chars().take(300).collect::<String>()
            );
        }
        resp.json::<serde_json::Value>()
            .await
            .context("Connector response was not valid JSON")
    }
}
