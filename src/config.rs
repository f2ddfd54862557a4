//! Layered configuration for the metricflow server.
//!
//! Values come from `metricflow.toml` (every field has a default), then
//! from the environment (after `.env` has been loaded), then from CLI flags.
//!
//! ```toml
//! [server]
//! port = 4180
//! db_path = ".metricflow/metricflow.db"
//! dev_mode = false
//!
//! [connector]
//! base_url = "https://api.nango.dev"
//! secret_key = "..."
//! timeout_secs = 30
//!
//! [generator]
//! base_url = "http://127.0.0.1:4181"
//! timeout_secs = 120
//!
//! [pipeline]
//! progress_window_secs = 300
//! stale_run_secs = 900
//! cache_invalidation_delay_ms = 5000
//! dimension_sample_size = 100
//! generator_sample_points = 50
//!
//! [logging]
//! dir = ".metricflow/logs"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::orchestrator::PipelineSettings;
use crate::pipeline::server::ServerConfig;

pub const CONFIG_FILE: &str = "metricflow.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 4180,
            db_path: PathBuf::from(".metricflow/metricflow.db"),
            dev_mode: false,
        }
    }
}

/// Nango proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectorSection {
    pub base_url: String,
    pub secret_key: String,
    /// 0 disables the request timeout.
    pub timeout_secs: u64,
}

impl Default for ConnectorSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.nango.dev".to_string(),
            secret_key: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Transformer generation service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4181".to_string(),
            api_key: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub progress_window_secs: i64,
    pub stale_run_secs: i64,
    /// Delay of the second cache invalidation; 0 sends only one.
    pub cache_invalidation_delay_ms: u64,
    pub dimension_sample_size: i64,
    pub generator_sample_points: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            progress_window_secs: 300,
            stale_run_secs: 900,
            cache_invalidation_delay_ms: 5000,
            dimension_sample_size: 100,
            generator_sample_points: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for daily rolling log files; stderr only when unset.
    pub dir: Option<PathBuf>,
    pub json: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub connector: ConnectorSection,
    pub generator: GeneratorSection,
    pub pipeline: PipelineSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse metricflow.toml")
    }

    /// Returns the default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize metricflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("METRICFLOW_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid METRICFLOW_PORT '{}'", port))?;
        }
        if let Some(path) = get("METRICFLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(url) = get("NANGO_BASE_URL") {
            self.connector.base_url = url;
        }
        if let Some(key) = get("NANGO_SECRET_KEY") {
            self.connector.secret_key = key;
        }
        if let Some(url) = get("TRANSFORMER_SERVICE_URL") {
            self.generator.base_url = url;
        }
        if let Some(key) = get("TRANSFORMER_SERVICE_KEY") {
            self.generator.api_key = Some(key);
        }
        Ok(())
    }

    /// CLI flags win over everything else.
    pub fn apply_cli(&mut self, port: Option<u16>, db_path: Option<PathBuf>, dev: bool) {
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(db_path) = db_path {
            self.server.db_path = db_path;
        }
        if dev {
            self.server.dev_mode = true;
        }
    }

    /// Human-readable problems with the configuration; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.server.port == 0 {
            problems.push("server.port must be greater than 0".to_string());
        }
        if self.pipeline.progress_window_secs <= 0 {
            problems.push("pipeline.progress_window_secs must be positive".to_string());
        }
        if self.pipeline.stale_run_secs <= 0 {
            problems.push("pipeline.stale_run_secs must be positive".to_string());
        }
        if self.pipeline.dimension_sample_size <= 0 {
            problems.push("pipeline.dimension_sample_size must be positive".to_string());
        }
        if self.pipeline.generator_sample_points == 0 {
            problems.push("pipeline.generator_sample_points must be positive".to_string());
        }
        for (name, url) in [
            ("connector.base_url", &self.connector.base_url),
            ("generator.base_url", &self.generator.base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                problems.push(format!("{} must be an http(s) URL, got '{}'", name, url));
            }
        }
        problems
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            progress_window: chrono::Duration::seconds(self.pipeline.progress_window_secs),
            stale_after: chrono::Duration::seconds(self.pipeline.stale_run_secs),
            dimension_sample_size: self.pipeline.dimension_sample_size,
            generator_sample_points: self.pipeline.generator_sample_points,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
            nango_base_url: self.connector.base_url.clone(),
            nango_secret_key: self.connector.secret_key.clone(),
            connector_timeout: secs(self.connector.timeout_secs),
            generator_base_url: self.generator.base_url.clone(),
            generator_api_key: self.generator.api_key.clone(),
            generator_timeout: secs(self.generator.timeout_secs),
            cache_resend_after: Some(Duration::from_millis(self.pipeline.cache_invalidation_delay_ms))
                .filter(|d| !d.is_zero()),
            pipeline: self.pipeline_settings(),
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.pipeline.stale_run_secs, 900);
        assert_eq!(config.pipeline.cache_invalidation_delay_ms, 5000);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = AppConfig::parse(
            r#"
[server]
port = 9000

[pipeline]
stale_run_secs = 60

[logging]
dir = "/var/log/metricflow"
json = true
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.db_path, PathBuf::from(".metricflow/metricflow.db"));
        assert_eq!(config.pipeline.stale_run_secs, 60);
        assert_eq!(config.pipeline.progress_window_secs, 300);
        assert_eq!(config.logging.dir, Some(PathBuf::from("/var/log/metricflow")));
        assert!(config.logging.json);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(AppConfig::parse("[server\nport = 1").is_err());
        assert!(AppConfig::parse("[server]\nport = \"eighty\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = AppConfig::parse("[connector]\nsecret_key = \"from-file\"").unwrap();
        config
            .apply_env_with(env(&[
                ("METRICFLOW_PORT", "8088"),
                ("NANGO_SECRET_KEY", "from-env"),
                ("TRANSFORMER_SERVICE_KEY", "gen-key"),
                ("METRICFLOW_DB_PATH", "  "),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.connector.secret_key, "from-env");
        assert_eq!(config.generator.api_key.as_deref(), Some("gen-key"));
        assert_eq!(config.server.db_path, PathBuf::from(".metricflow/metricflow.db"));
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_with(env(&[("METRICFLOW_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("METRICFLOW_PORT"));
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = AppConfig::default();
        config
            .apply_env_with(env(&[("METRICFLOW_PORT", "8088")]))
            .unwrap();
        config.apply_cli(Some(7000), Some(PathBuf::from("/tmp/m.db")), true);
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/m.db"));
        assert!(config.server.dev_mode);

        config.apply_cli(None, None, false);
        assert_eq!(config.server.port, 7000);
        assert!(config.server.dev_mode);
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        config.pipeline.stale_run_secs = 0;
        config.generator.base_url = "localhost:4181".into();
        let problems = config.validate();
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("generator.base_url")));
    }

    #[test]
    fn test_server_config_conversion() {
        let mut config = AppConfig::default();
        config.pipeline.cache_invalidation_delay_ms = 0;
        config.connector.timeout_secs = 0;
        let server = config.server_config();
        assert_eq!(server.port, 4180);
        assert!(server.cache_resend_after.is_none());
        assert!(server.connector_timeout.is_none());
        assert_eq!(server.generator_timeout, Some(Duration::from_secs(120)));
        assert_eq!(server.pipeline.stale_after, chrono::Duration::seconds(900));
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        assert_eq!(AppConfig::load_or_default(&path).unwrap(), AppConfig::default());

        let mut config = AppConfig::default();
        config.server.port = 5055;
        config.generator.api_key = Some("k".into());
        config.save(&path).unwrap();
        assert_eq!(AppConfig::load_or_default(&path).unwrap(), config);
    }
}
