//! Chart Generation Engine.
//!
//! A chart transformer (`ChartSpec`) decides how a metric is drawn; the
//! renderable `ChartConfig` is then computed from the stored points by
//! `build_chart_config`, which is pure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::db::DbHandle;
use super::generator::{ChartPrompt, SamplePoint, TransformerGenerator};
use super::models::{Cadence, ChartTransformer, ChartType, MetricDataPoint, RefreshStep};
use super::progress::{StepReporter, transformer_tag};
use super::transformers::TransformerStore;
use crate::errors::PipelineError;

pub const MAX_SERIES: usize = 8;
pub const OTHER_SERIES: &str = "other";
const UNKNOWN_SERIES: &str = "unknown";
const VALUE_SERIES: &str = "value";
const MUTED_COLOR: &str = "var(--muted)";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChartAggregation {
    #[default]
    Sum,
    Average,
    Latest,
}

/// Generated chart-shaping definition, keyed by dashboard chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartSpec {
    #[serde(default)]
    pub chart_type: ChartType,
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default)]
    pub aggregation: ChartAggregation,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Dimension whose values become separate series.
    #[serde(default)]
    pub selected_dimension: Option<String>,
    #[serde(default)]
    pub stacked: bool,
    #[serde(default)]
    pub show_legend: Option<bool>,
    #[serde(default = "default_true")]
    pub show_tooltip: bool,
}

/// Caller-supplied choices that win over whatever the generator picked.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartOverrides {
    #[serde(default)]
    pub selected_dimension: Option<String>,
    #[serde(default)]
    pub chart_type: Option<ChartType>,
    #[serde(default)]
    pub cadence: Option<Cadence>,
}

impl ChartOverrides {
    pub fn is_empty(&self) -> bool {
        self.selected_dimension.is_none() && self.chart_type.is_none() && self.cadence.is_none()
    }
}

impl ChartSpec {
    pub fn with_overrides(mut self, overrides: &ChartOverrides) -> Self {
        if let Some(chart_type) = overrides.chart_type {
            self.chart_type = chart_type;
        }
        if let Some(cadence) = overrides.cadence {
            self.cadence = cadence;
        }
        if let Some(dimension) = &overrides.selected_dimension {
            self.selected_dimension = Some(dimension.clone());
        }
        self
    }
}

// ── Renderable configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStyle {
    pub key: String,
    pub label: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CenterLabel {
    pub value: f64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoalLine {
    pub value: f64,
    pub label: String,
}

/// What the dashboard needs to draw a chart, stored on `dashboard_charts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    pub chart_type: ChartType,
    pub title: String,
    pub description: Option<String>,
    pub cadence: Cadence,
    pub x_axis_key: String,
    pub data_keys: Vec<String>,
    pub chart_data: Vec<serde_json::Value>,
    pub series: Vec<SeriesStyle>,
    pub show_legend: bool,
    pub show_tooltip: bool,
    pub stacked: bool,
    pub center_label: Option<CenterLabel>,
    pub goal: Option<GoalLine>,
}

/// First day of the bucket `ts` falls in.
pub fn bucket_start(ts: &DateTime<Utc>, cadence: Cadence) -> NaiveDate {
    let date = ts.date_naive();
    match cadence {
        Cadence::Daily => date,
        Cadence::Weekly => date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64),
        Cadence::Monthly => date.with_day(1).unwrap_or(date),
    }
}

fn series_color(index: usize) -> String {
    format!("var(--chart-{})", index + 1)
}

fn dimension_label(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Running aggregate of one (bucket, series) cell.
#[derive(Default, Clone, Copy)]
struct Acc {
    sum: f64,
    count: usize,
    latest: f64,
}

impl Acc {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.latest = value;
    }

    fn value(&self, aggregation: ChartAggregation) -> f64 {
        match aggregation {
            ChartAggregation::Sum => self.sum,
            ChartAggregation::Average if self.count > 0 => self.sum / self.count as f64,
            ChartAggregation::Average => 0.0,
            ChartAggregation::Latest => self.latest,
        }
    }
}

/// Compute the renderable configuration of `points` (chronological order).
pub fn build_chart_config(spec: &ChartSpec, points: &[MetricDataPoint], goal: Option<f64>) -> ChartConfig {
    let series_of = |point: &MetricDataPoint| -> String {
        match &spec.selected_dimension {
            Some(dimension) => point
                .dimensions
                .as_ref()
                .and_then(|dims| dims.get(dimension))
                .filter(|v| !v.is_null())
                .map(dimension_label)
                .unwrap_or_else(|| UNKNOWN_SERIES.to_string()),
            None => VALUE_SERIES.to_string(),
        }
    };

    // Rank series by their overall aggregate and fold the tail into "other".
    let mut per_series: BTreeMap<String, Acc> = BTreeMap::new();
    for point in points {
        per_series.entry(series_of(point)).or_default().push(point.value);
    }
    let mut ranked: Vec<(String, f64)> = per_series
        .iter()
        .map(|(key, acc)| (key.clone(), acc.value(spec.aggregation)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let kept: BTreeSet<String> = ranked.iter().take(MAX_SERIES).map(|(k, _)| k.clone()).collect();
    let folded = ranked.len() > MAX_SERIES;
    let effective = |key: String| if kept.contains(&key) { key } else { OTHER_SERIES.to_string() };

    let mut series: Vec<SeriesStyle> = ranked
        .iter()
        .take(MAX_SERIES)
        .enumerate()
        .map(|(i, (key, _))| SeriesStyle {
            key: key.clone(),
            label: key.clone(),
            color: series_color(i),
        })
        .collect();
    if folded {
        series.push(SeriesStyle {
            key: OTHER_SERIES.to_string(),
            label: "Other".to_string(),
            color: MUTED_COLOR.to_string(),
        });
    }
    let data_keys: Vec<String> = series.iter().map(|s| s.key.clone()).collect();

    let (x_axis_key, chart_data, center_label) = if spec.chart_type.is_radial() {
        let mut totals: BTreeMap<String, Acc> = BTreeMap::new();
        for point in points {
            totals.entry(effective(series_of(point))).or_default().push(point.value);
        }
        let rows: Vec<serde_json::Value> = series
            .iter()
            .map(|s| {
                let value = totals.get(&s.key).map(|acc| acc.value(spec.aggregation)).unwrap_or(0.0);
                serde_json::json!({ "name": s.label, "value": value, "fill": s.color })
            })
            .collect();
        let total: f64 = rows.iter().filter_map(|row| row["value"].as_f64()).sum();
        let center = CenterLabel {
            value: total,
            label: spec.title.clone(),
        };
        ("name".to_string(), rows, Some(center))
    } else {
        let mut buckets: BTreeMap<NaiveDate, BTreeMap<String, Acc>> = BTreeMap::new();
        for point in points {
            buckets
                .entry(bucket_start(&point.timestamp, spec.cadence))
                .or_default()
                .entry(effective(series_of(point)))
                .or_default()
                .push(point.value);
        }
        let rows = buckets
            .into_iter()
            .map(|(day, cells)| {
                let mut row = serde_json::Map::new();
                row.insert("date".into(), day.format("%Y-%m-%d").to_string().into());
                for key in &data_keys {
                    match cells.get(key) {
                        Some(acc) => {
                            row.insert(key.clone(), acc.value(spec.aggregation).into());
                        }
                        // Empty sum buckets are real zeroes; other aggregations leave a gap.
                        None if spec.aggregation == ChartAggregation::Sum => {
                            row.insert(key.clone(), 0.0.into());
                        }
                        None => {}
                    }
                }
                serde_json::Value::Object(row)
            })
            .collect();
        ("date".to_string(), rows, None)
    };

    let multi = series.len() > 1;
    ChartConfig {
        chart_type: spec.chart_type,
        title: spec.title.clone(),
        description: spec.description.clone(),
        cadence: spec.cadence,
        x_axis_key,
        data_keys,
        chart_data,
        show_legend: spec
            .show_legend
            .unwrap_or(multi || spec.chart_type == ChartType::Pie),
        show_tooltip: spec.show_tooltip,
        stacked: spec.stacked && multi && matches!(spec.chart_type, ChartType::Bar | ChartType::Area),
        center_label,
        goal: goal
            .filter(|_| !spec.chart_type.is_radial())
            .map(|value| GoalLine {
                value,
                label: "Goal".to_string(),
            }),
        series,
    }
}

// ── Engine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChartRequest {
    pub dashboard_chart_id: String,
    pub metric_id: String,
    pub metric_name: String,
    pub metric_description: Option<String>,
    /// Type currently stored on the dashboard chart.
    pub chart_type: ChartType,
    pub goal_value: Option<f64>,
    pub overrides: ChartOverrides,
}

#[derive(Debug, Clone)]
pub struct ChartReport {
    pub transformer_id: String,
    pub generated: bool,
    pub config: ChartConfig,
}

pub struct ChartEngine {
    db: DbHandle,
    store: TransformerStore,
    generator: Arc<dyn TransformerGenerator>,
    sample_points: usize,
}

impl ChartEngine {
    pub fn new(db: DbHandle, generator: Arc<dyn TransformerGenerator>, sample_points: usize) -> Self {
        Self {
            store: TransformerStore::new(db.clone()),
            db,
            generator,
            sample_points,
        }
    }

    /// Build and persist the chart's configuration.
    ///
    /// An existing transformer is reused unless `regenerate` is set, in which
    /// case a fresh one replaces it. `points` must not be empty.
    pub async fn generate(
        &self,
        req: &ChartRequest,
        points: &[MetricDataPoint],
        regenerate: bool,
        reporter: &StepReporter,
    ) -> Result<ChartReport, PipelineError> {
        if points.is_empty() {
            return Err(PipelineError::NoDataPoints {
                metric_id: req.metric_id.clone(),
            });
        }

        let existing = if regenerate {
            None
        } else {
            self.store
                .chart(&req.dashboard_chart_id)
                .await
                .map_err(PipelineError::Database)?
        };
        let (transformer, generated) = match existing {
            Some(transformer) => (transformer, false),
            None => {
                reporter.step(RefreshStep::GeneratingChartTransformer).await?;
                (self.create_transformer(req, points, reporter).await?, true)
            }
        };

        reporter.step(RefreshStep::ExecutingChartTransformer).await?;
        let config = build_chart_config(&transformer.spec, points, req.goal_value);

        reporter.step(RefreshStep::SavingChartConfig).await?;
        let encoded = serde_json::to_value(&config)
            .map_err(|e| PipelineError::Transform(format!("chart config is not serializable: {}", e)))?;
        let chart_id = req.dashboard_chart_id.clone();
        let chart_type = transformer.spec.chart_type;
        let transformer_id = transformer.id.clone();
        self.db
            .call(move |db| db.update_chart_config(&chart_id, chart_type, &transformer_id, &encoded))
            .await
            .map_err(PipelineError::Database)?;

        tracing::info!(
            metric_id = %req.metric_id,
            chart_id = %req.dashboard_chart_id,
            chart_type = %chart_type.as_str(),
            generated,
            "Saved chart config"
        );
        Ok(ChartReport {
            transformer_id: transformer.id,
            generated,
            config,
        })
    }

    async fn create_transformer(
        &self,
        req: &ChartRequest,
        points: &[MetricDataPoint],
        reporter: &StepReporter,
    ) -> Result<ChartTransformer, PipelineError> {
        reporter.log(transformer_tag("chart", "start"), true, None).await;
        let prompt = self.prompt(req, points);
        let spec = match self.generator.generate_chart(&prompt).await {
            Ok(spec) if req.overrides.is_empty() => spec,
            Ok(spec) => {
                tracing::debug!(chart_id = %req.dashboard_chart_id, overrides = ?req.overrides, "Applying chart overrides");
                spec.with_overrides(&req.overrides)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                reporter
                    .log(
                        transformer_tag("chart", "error"),
                        false,
                        Some(serde_json::json!({ "error": message })),
                    )
                    .await;
                return Err(PipelineError::Generation(message));
            }
        };
        let transformer = self
            .store
            .replace_chart(&req.dashboard_chart_id, spec)
            .await
            .map_err(PipelineError::Database)?;
        reporter
            .log(
                transformer_tag("chart", "complete"),
                true,
                Some(serde_json::json!({
                    "transformerId": transformer.id,
                    "chartType": transformer.spec.chart_type,
                })),
            )
            .await;
        Ok(transformer)
    }

    fn prompt(&self, req: &ChartRequest, points: &[MetricDataPoint]) -> ChartPrompt {
        let dimension_keys: BTreeSet<String> = points
            .iter()
            .filter_map(|p| p.dimensions.as_ref())
            .flat_map(|dims| dims.keys().cloned())
            .collect();
        let skip = points.len().saturating_sub(self.sample_points);
        ChartPrompt {
            metric_name: req.metric_name.clone(),
            metric_description: req.metric_description.clone(),
            preferred_chart_type: Some(req.overrides.chart_type.unwrap_or(req.chart_type)),
            cadence: req.overrides.cadence,
            selected_dimension: req.overrides.selected_dimension.clone(),
            dimension_keys: dimension_keys.into_iter().collect(),
            point_count: points.len(),
            first_date: points.first().map(|p| p.timestamp),
            last_date: points.last().map(|p| p.timestamp),
            sample_points: points
                .iter()
                .skip(skip)
                .map(|p| SamplePoint {
                    timestamp: p.timestamp,
                    value: p.value,
                    dimensions: p
                        .dimensions
                        .as_ref()
                        .and_then(|d| serde_json::to_value(d).ok()),
                })
                .collect(),
        }
    }
}
