use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::chart::ChartSpec;
use super::ingestion::IngestionSpec;

/// Free-form breakdown attached to a data point (`{"region": "eu"}`).
pub type Dimensions = BTreeMap<String, serde_json::Value>;

/// Canonical text form of a timestamp as stored in SQLite.
///
/// Millisecond precision with a `Z` suffix, so lexical order equals
/// chronological order in SQL comparisons.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

// ── Pipeline steps & state ────────────────────────────────────────────

/// The step a metric's pipeline is currently executing.
///
/// Persisted verbatim in `metrics.refresh_status` and used as the suffix of
/// `pipeline-step:<step>` log tags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshStep {
    FetchingApiData,
    DeletingOldData,
    DeletingOldTransformer,
    GeneratingIngestionTransformer,
    ExecutingIngestionTransformer,
    SavingTimeseriesData,
    GeneratingChartTransformer,
    ExecutingChartTransformer,
    SavingChartConfig,
}

impl RefreshStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchingApiData => "fetching-api-data",
            Self::DeletingOldData => "deleting-old-data",
            Self::DeletingOldTransformer => "deleting-old-transformer",
            Self::GeneratingIngestionTransformer => "generating-ingestion-transformer",
            Self::ExecutingIngestionTransformer => "executing-ingestion-transformer",
            Self::SavingTimeseriesData => "saving-timeseries-data",
            Self::GeneratingChartTransformer => "generating-chart-transformer",
            Self::ExecutingChartTransformer => "executing-chart-transformer",
            Self::SavingChartConfig => "saving-chart-config",
        }
    }
}

impl fmt::Display for RefreshStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetching-api-data" => Ok(Self::FetchingApiData),
            "deleting-old-data" => Ok(Self::DeletingOldData),
            "deleting-old-transformer" => Ok(Self::DeletingOldTransformer),
            "generating-ingestion-transformer" => Ok(Self::GeneratingIngestionTransformer),
            "executing-ingestion-transformer" => Ok(Self::ExecutingIngestionTransformer),
            "saving-timeseries-data" => Ok(Self::SavingTimeseriesData),
            "generating-chart-transformer" => Ok(Self::GeneratingChartTransformer),
            "executing-chart-transformer" => Ok(Self::ExecutingChartTransformer),
            "saving-chart-config" => Ok(Self::SavingChartConfig),
            _ => Err(format!("Invalid refresh step: {}", s)),
        }
    }
}

/// Explicit view of the `refresh_status` / `last_error` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running(RefreshStep),
    Failed(String),
}

impl PipelineState {
    pub fn of(metric: &Metric) -> Self {
        match (metric.refresh_status, &metric.last_error) {
            (Some(step), _) => Self::Running(step),
            (None, Some(err)) => Self::Failed(err.clone()),
            (None, None) => Self::Idle,
        }
    }
}

/// Kind of background task scheduled by the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    SoftRefresh,
    HardRefresh,
    IngestionOnly,
    ChartOnly,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoftRefresh => "soft-refresh",
            Self::HardRefresh => "hard-refresh",
            Self::IngestionOnly => "ingestion-only",
            Self::ChartOnly => "chart-only",
        }
    }

    /// Status written synchronously when the task is scheduled.
    pub fn initial_step(&self) -> RefreshStep {
        match self {
            Self::SoftRefresh => RefreshStep::FetchingApiData,
            Self::HardRefresh => RefreshStep::DeletingOldData,
            Self::IngestionOnly | Self::ChartOnly => RefreshStep::DeletingOldTransformer,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Chart vocabulary ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cadence {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            _ => Err(format!("Invalid cadence: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    #[default]
    Line,
    Bar,
    Area,
    Pie,
    Radar,
    Radial,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Bar => "bar",
            Self::Area => "area",
            Self::Pie => "pie",
            Self::Radar => "radar",
            Self::Radial => "radial",
        }
    }

    /// Pie and radial charts plot categories, not a time axis.
    pub fn is_radial(&self) -> bool {
        matches!(self, Self::Pie | Self::Radial)
    }
}

impl FromStr for ChartType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "line" => Ok(Self::Line),
            "bar" => Ok(Self::Bar),
            "area" => Ok(Self::Area),
            "pie" => Ok(Self::Pie),
            "radar" => Ok(Self::Radar),
            "radial" => Ok(Self::Radial),
            _ => Err(format!("Invalid chart type: {}", s)),
        }
    }
}

// ── Persisted records ─────────────────────────────────────────────────

/// A connected third-party platform (Nango connection) owned by an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub organization_id: String,
    /// Nango provider config key, e.g. `github` or `posthog`.
    pub provider: String,
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub organization_id: String,
    pub team_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub integration_id: Option<String>,
    /// Key of the ingestion transformer; `None` for manual metrics.
    pub template_id: Option<String>,
    pub is_manual: bool,
    pub endpoint_config: serde_json::Value,
    pub goal_value: Option<f64>,
    pub refresh_status: Option<RefreshStep>,
    pub last_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub current_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Metric {
    /// Cache tags whose dashboards render this metric.
    pub fn cache_tags(&self) -> Vec<String> {
        let mut tags = vec![format!("dashboard_org_{}", self.organization_id)];
        if let Some(team_id) = &self.team_id {
            tags.push(format!("dashboard_team_{}", team_id));
        }
        tags
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardChart {
    pub id: String,
    pub metric_id: String,
    pub name: String,
    pub chart_type: ChartType,
    pub chart_transformer_id: Option<String>,
    pub chart_config: Option<serde_json::Value>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTransformer {
    pub id: String,
    pub template_id: String,
    pub spec: IngestionSpec,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartTransformer {
    pub id: String,
    pub dashboard_chart_id: String,
    pub spec: ChartSpec,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDataPoint {
    pub id: i64,
    pub metric_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub dimensions: Option<Dimensions>,
}

/// A normalized observation produced by an ingestion transformer, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub dimensions: Option<Dimensions>,
}

impl NewDataPoint {
    /// Uniqueness key for the dimension map; empty when there are none.
    pub fn dimensions_key(&self) -> String {
        match &self.dimensions {
            Some(dims) if !dims.is_empty() => serde_json::to_string(dims).unwrap_or_default(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricApiLog {
    pub id: i64,
    pub metric_id: String,
    pub run_id: Option<String>,
    /// Event tag: `pipeline-step:<step>`, `transformer:<kind>:<phase>`, ...
    pub endpoint: String,
    pub success: bool,
    pub raw_response: Option<serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

// ── Insert payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NewMetric {
    pub id: Option<String>,
    pub organization_id: String,
    pub team_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub integration_id: Option<String>,
    pub template_id: Option<String>,
    pub is_manual: bool,
    pub endpoint_config: serde_json::Value,
    pub goal_value: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDashboardChart {
    pub id: Option<String>,
    pub metric_id: String,
    pub name: String,
    pub chart_type: ChartType,
    pub position: i32,
}

#[derive(Debug, Clone)]
pub struct NewApiLog {
    pub metric_id: String,
    pub run_id: Option<String>,
    pub endpoint: String,
    pub success: bool,
    pub raw_response: Option<serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

// ── API view types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub started: bool,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedStep {
    pub step: String,
    pub started_at: DateTime<Utc>,
    /// Time until the next logged step; `None` when no later step was logged.
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgress {
    pub is_processing: bool,
    pub current_step: Option<RefreshStep>,
    pub completed_steps: Vec<CompletedStep>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPointStats {
    pub count: i64,
    pub first_date: Option<DateTime<Utc>>,
    pub last_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerInfo {
    pub ingestion_transformer: Option<IngestionTransformer>,
    pub chart_transformer: Option<ChartTransformer>,
    pub data_points: DataPointStats,
}
