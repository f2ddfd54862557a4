//! Ingestion Engine.
//!
//! Fetch raw provider data, obtain the metric's extraction transformer
//! (generating it on first use), apply it and persist the resulting points
//! in one transaction. A failure anywhere leaves the stored points untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::connector::{ConnectorRequest, DataConnector, EndpointConfig};
use super::db::DbHandle;
use super::generator::{IngestionPrompt, TransformerGenerator, truncate_sample};
use super::models::{Dimensions, IngestionTransformer, NewDataPoint, RefreshStep};
use super::progress::{StepReporter, transformer_tag};
use super::transformers::TransformerStore;
use crate::errors::PipelineError;

/// Logged connector payloads larger than this are replaced by a preview.
const MAX_LOGGED_PAYLOAD: usize = 64 * 1024;

/// Array items kept per array when sampling a response for the generator.
const PROMPT_SAMPLE_ITEMS: usize = 5;

// ── Transformer definition ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    #[default]
    Rfc3339,
    /// `YYYY-MM-DD`, read as UTC midnight.
    Date,
    UnixSeconds,
    UnixMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimestampField {
    pub pointer: String,
    #[serde(default)]
    pub format: TimestampFormat,
}

/// How records that land on the same (timestamp, dimensions) key merge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PointAggregation {
    #[default]
    Sum,
    Count,
    Last,
}

/// Deterministic mapping from a raw API response to data points.
///
/// All paths are JSON Pointers (RFC 6901). `records_pointer` is resolved
/// against the response, every other pointer against a single record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionSpec {
    #[serde(default)]
    pub records_pointer: String,
    pub timestamp: TimestampField,
    /// Without a value pointer every record counts as `1.0`.
    #[serde(default)]
    pub value_pointer: Option<String>,
    /// Dimension name to pointer.
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub group_by_day: bool,
    #[serde(default)]
    pub aggregation: PointAggregation,
}

impl IngestionSpec {
    /// Daily count of the records found at `records_pointer`.
    pub fn counting(records_pointer: &str, timestamp_pointer: &str) -> Self {
        Self {
            records_pointer: records_pointer.to_string(),
            timestamp: TimestampField {
                pointer: timestamp_pointer.to_string(),
                format: TimestampFormat::Rfc3339,
            },
            value_pointer: None,
            dimensions: BTreeMap::new(),
            group_by_day: true,
            aggregation: PointAggregation::Sum,
        }
    }

    /// Apply the definition to a raw response.
    ///
    /// Records missing a readable timestamp or value are skipped. An empty
    /// record list is fine; a non-empty one where every record is skipped
    /// is an error.
    pub fn apply(&self, raw: &serde_json::Value) -> Result<Vec<NewDataPoint>, PipelineError> {
        let target = raw.pointer(&self.records_pointer).ok_or_else(|| {
            PipelineError::Transform(format!(
                "records pointer '{}' not found in response",
                self.records_pointer
            ))
        })?;
        let records: Vec<&serde_json::Value> = match target {
            serde_json::Value::Array(items) => items.iter().collect(),
            serde_json::Value::Null => Vec::new(),
            single => vec![single],
        };

        let mut merged: BTreeMap<(DateTime<Utc>, String), (NewDataPoint, usize)> = BTreeMap::new();
        let mut skipped = 0usize;
        for record in &records {
            let Some(point) = self.extract(record) else {
                skipped += 1;
                continue;
            };
            let key = (point.timestamp, point.dimensions_key());
            match merged.get_mut(&key) {
                Some((existing, count)) => {
                    *count += 1;
                    match self.aggregation {
                        PointAggregation::Sum => existing.value += point.value,
                        PointAggregation::Count => existing.value = *count as f64,
                        PointAggregation::Last => existing.value = point.value,
                    }
                }
                None => {
                    let mut point = point;
                    if self.aggregation == PointAggregation::Count {
                        point.value = 1.0;
                    }
                    merged.insert(key, (point, 1));
                }
            }
        }

        if !records.is_empty() && merged.is_empty() {
            return Err(PipelineError::Transform(format!(
                "transformer produced no valid data points ({} records skipped)",
                skipped
            )));
        }
        if skipped > 0 {
            tracing::debug!(skipped, total = records.len(), "Skipped unreadable records");
        }
        Ok(merged.into_values().map(|(point, _)| point).collect())
    }

    fn extract(&self, record: &serde_json::Value) -> Option<NewDataPoint> {
        let mut timestamp = read_timestamp(record.pointer(&self.timestamp.pointer)?, self.timestamp.format)?;
        if self.group_by_day {
            timestamp = Utc.from_utc_datetime(&timestamp.date_naive().and_hms_opt(0, 0, 0)?);
        }
        let value = match &self.value_pointer {
            Some(pointer) => read_number(record.pointer(pointer)?)?,
            None => 1.0,
        };
        let dimensions: Dimensions = self
            .dimensions
            .iter()
            .filter_map(|(name, pointer)| {
                record
                    .pointer(pointer)
                    .filter(|v| !v.is_null())
                    .map(|v| (name.clone(), v.clone()))
            })
            .collect();
        Some(NewDataPoint {
            timestamp,
            value,
            dimensions: (!dimensions.is_empty()).then_some(dimensions),
        })
    }
}

fn read_number(value: &serde_json::Value) -> Option<f64> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn read_timestamp(value: &serde_json::Value, format: TimestampFormat) -> Option<DateTime<Utc>> {
    match format {
        TimestampFormat::Rfc3339 => {
            let raw = value.as_str()?;
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_date(raw))
        }
        TimestampFormat::Date => parse_date(value.as_str()?),
        TimestampFormat::UnixSeconds => {
            let secs = read_number(value)?;
            Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
        }
        TimestampFormat::UnixMillis => Utc.timestamp_millis_opt(read_number(value)? as i64).single(),
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

// ── Engine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IngestionRequest {
    pub template_id: String,
    pub integration_id: String,
    pub provider: String,
    pub connection_id: String,
    pub metric_id: String,
    pub metric_name: String,
    pub metric_description: Option<String>,
    pub endpoint_config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Keep existing points, add only unseen observations.
    Append,
    /// Swap the metric's points for the freshly extracted set.
    Replace,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub transformer_id: String,
    pub generated: bool,
    pub extracted: usize,
    pub inserted: usize,
}

pub struct IngestionEngine {
    db: DbHandle,
    store: TransformerStore,
    connector: Arc<dyn DataConnector>,
    generator: Arc<dyn TransformerGenerator>,
}

impl IngestionEngine {
    pub fn new(
        db: DbHandle,
        connector: Arc<dyn DataConnector>,
        generator: Arc<dyn TransformerGenerator>,
    ) -> Self {
        Self {
            store: TransformerStore::new(db.clone()),
            db,
            connector,
            generator,
        }
    }

    pub async fn ingest(
        &self,
        req: &IngestionRequest,
        mode: IngestMode,
        reporter: &StepReporter,
    ) -> Result<IngestionReport, PipelineError> {
        reporter.step(RefreshStep::FetchingApiData).await?;
        let raw = self.fetch(req, reporter).await?;

        let existing = self
            .store
            .ingestion(&req.template_id)
            .await
            .map_err(PipelineError::Database)?;
        let (transformer_id, points, generated) = match existing {
            Some(transformer) => {
                reporter.step(RefreshStep::ExecutingIngestionTransformer).await?;
                (transformer.id, transformer.spec.apply(&raw)?, false)
            }
            None => {
                reporter.step(RefreshStep::GeneratingIngestionTransformer).await?;
                let spec = self.generate(req, &raw, reporter).await?;
                reporter.step(RefreshStep::ExecutingIngestionTransformer).await?;
                // A definition is only cached once it extracts from the response it was built for.
                let points = match spec.apply(&raw) {
                    Ok(points) => points,
                    Err(e) => {
                        reporter
                            .log(
                                transformer_tag("ingestion", "error"),
                                false,
                                Some(serde_json::json!({ "error": e.to_string() })),
                            )
                            .await;
                        return Err(e);
                    }
                };
                let transformer = self.persist(req, spec, reporter).await?;
                (transformer.id, points, true)
            }
        };

        reporter.step(RefreshStep::SavingTimeseriesData).await?;
        let metric_id = req.metric_id.clone();
        let extracted = points.len();
        let inserted = self
            .db
            .call(move |db| db.insert_data_points(&metric_id, &points, mode == IngestMode::Replace))
            .await
            .map_err(PipelineError::Database)?;

        tracing::info!(
            metric_id = %req.metric_id,
            extracted,
            inserted,
            generated,
            "Ingested data points"
        );
        Ok(IngestionReport {
            transformer_id,
            generated,
            extracted,
            inserted,
        })
    }

    async fn fetch(
        &self,
        req: &IngestionRequest,
        reporter: &StepReporter,
    ) -> Result<serde_json::Value, PipelineError> {
        let endpoint = EndpointConfig::from_value(&req.endpoint_config)
            .map_err(|e| PipelineError::Connector(format!("{:#}", e)))?;
        let request = ConnectorRequest {
            connection_id: req.connection_id.clone(),
            provider: req.provider.clone(),
            endpoint,
        };
        match self.connector.fetch(&request).await {
            Ok(raw) => {
                reporter
                    .log("connector:fetch", true, Some(loggable_payload(&raw)))
                    .await;
                Ok(raw)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                reporter
                    .log("connector:fetch", false, Some(serde_json::json!({ "error": message })))
                    .await;
                Err(PipelineError::Connector(message))
            }
        }
    }

    async fn generate(
        &self,
        req: &IngestionRequest,
        raw: &serde_json::Value,
        reporter: &StepReporter,
    ) -> Result<IngestionSpec, PipelineError> {
        reporter.log(transformer_tag("ingestion", "start"), true, None).await;
        let prompt = IngestionPrompt {
            metric_name: req.metric_name.clone(),
            metric_description: req.metric_description.clone(),
            provider: req.provider.clone(),
            endpoint_config: req.endpoint_config.clone(),
            sample_response: truncate_sample(raw, PROMPT_SAMPLE_ITEMS),
        };
        let spec = match self.generator.generate_ingestion(&prompt).await {
            Ok(spec) => spec,
            Err(e) => {
                let message = format!("{:#}", e);
                reporter
                    .log(
                        transformer_tag("ingestion", "error"),
                        false,
                        Some(serde_json::json!({ "error": message })),
                    )
                    .await;
                return Err(PipelineError::Generation(message));
            }
        };
        Ok(spec)
    }

    async fn persist(
        &self,
        req: &IngestionRequest,
        spec: IngestionSpec,
        reporter: &StepReporter,
    ) -> Result<IngestionTransformer, PipelineError> {
        let transformer = self
            .store
            .replace_ingestion(&req.template_id, spec)
            .await
            .map_err(PipelineError::Database)?;
        reporter
            .log(
                transformer_tag("ingestion", "complete"),
                true,
                Some(serde_json::json!({ "transformerId": transformer.id })),
            )
            .await;
        Ok(transformer)
    }
}

fn loggable_payload(raw: &serde_json::Value) -> serde_json::Value {
    let text = raw.to_string();
    if text.len() <= MAX_LOGGED_PAYLOAD {
        return raw.clone();
    }
    let preview: String = text.chars().take(MAX_LOGGED_PAYLOAD / 16).collect();
    serde_json::json!({ "truncated": true, "bytes": text.len(), "preview": preview })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::PipelineDb;
    use crate::pipeline::models::{NewMetric, parse_ts};
    use crate::pipeline::testing::{MockConnector, MockGenerator};
    use serde_json::json;
    use tokio::sync::broadcast;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_ts(raw).unwrap()
    }

    fn valued(records: &str, ts_pointer: &str, format: TimestampFormat, value: &str) -> IngestionSpec {
        IngestionSpec {
            records_pointer: records.into(),
            timestamp: TimestampField {
                pointer: ts_pointer.into(),
                format,
            },
            value_pointer: Some(value.into()),
            dimensions: BTreeMap::new(),
            group_by_day: false,
            aggregation: PointAggregation::Sum,
        }
    }

    #[test]
    fn counting_groups_records_per_day() {
        let raw = json!({"items": [
            {"created_at": "2026-01-01T08:00:00Z"},
            {"created_at": "2026-01-01T17:30:00Z"},
            {"created_at": "2026-01-02T09:00:00+02:00"},
        ]});
        let points = IngestionSpec::counting("/items", "/created_at").apply(&raw).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, ts("2026-01-01T00:00:00Z"));
        assert_eq!(points[0].value, 2.0);
        assert_eq!(points[1].timestamp, ts("2026-01-02T00:00:00Z"));
        assert_eq!(points[1].value, 1.0);
    }

    #[test]
    fn extracts_values_and_dimensions() {
        let mut spec = valued("/data", "/day", TimestampFormat::Date, "/stats/views");
        spec.dimensions.insert("region".into(), "/region".into());
        let raw = json!({"data": [
            {"day": "2026-02-01", "stats": {"views": "12.5"}, "region": "eu"},
            {"day": "2026-02-01", "stats": {"views": 3}, "region": "us"},
            {"day": "2026-02-02", "stats": {"views": 7}, "region": null},
        ]});
        let points = spec.apply(&raw).unwrap();
        assert_eq!(points.len(), 3);
        let eu = points
            .iter()
            .find(|p| p.dimensions.as_ref().is_some_and(|d| d["region"] == "eu"))
            .unwrap();
        assert_eq!(eu.value, 12.5);
        assert!(points[2].dimensions.is_none());
    }

    #[test]
    fn unix_timestamps_and_root_records() {
        let raw = json!([{"t": 1767225600, "v": 1}, {"t": "1767312000", "v": 2}]);
        let points = valued("", "/t", TimestampFormat::UnixSeconds, "/v").apply(&raw).unwrap();
        assert_eq!(points[0].timestamp, ts("2026-01-01T00:00:00Z"));
        assert_eq!(points[1].timestamp, ts("2026-01-02T00:00:00Z"));

        let raw = json!({"at": 1767225600000i64, "v": 4});
        let points = valued("", "/at", TimestampFormat::UnixMillis, "/v").apply(&raw).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 4.0);
    }

    #[test]
    fn aggregation_modes() {
        let raw = json!([
            {"t": "2026-01-01T00:00:00Z", "v": 2},
            {"t": "2026-01-01T00:00:00Z", "v": 5},
        ]);
        let mut spec = valued("", "/t", TimestampFormat::Rfc3339, "/v");
        assert_eq!(spec.apply(&raw).unwrap()[0].value, 7.0);
        spec.aggregation = PointAggregation::Last;
        assert_eq!(spec.apply(&raw).unwrap()[0].value, 5.0);
        spec.aggregation = PointAggregation::Count;
        assert_eq!(spec.apply(&raw).unwrap()[0].value, 2.0);
    }

    #[test]
    fn skips_bad_records_but_fails_when_none_survive() {
        let spec = valued("/rows", "/t", TimestampFormat::Rfc3339, "/v");
        let raw = json!({"rows": [
            {"t": "yesterday", "v": 1},
            {"t": "2026-01-01T00:00:00Z", "v": "n/a"},
            {"t": "2026-01-01T00:00:00Z", "v": 3},
        ]});
        assert_eq!(spec.apply(&raw).unwrap().len(), 1);

        let raw = json!({"rows": [{"t": "yesterday", "v": 1}]});
        let err = spec.apply(&raw).unwrap_err();
        assert!(err.to_string().contains("no valid data points"));

        assert!(spec.apply(&json!({"rows": []})).unwrap().is_empty());
        assert!(spec.apply(&json!({"other": []})).is_err());
    }

    fn setup() -> (DbHandle, StepReporter) {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_integration("int_1", "org", "github", "conn_1").unwrap();
        db.create_metric(&NewMetric {
            id: Some("m1".into()),
            organization_id: "org".into(),
            name: "Commits".into(),
            integration_id: Some("int_1".into()),
            template_id: Some("m1".into()),
            endpoint_config: json!({"endpoint": "/commits"}),
            ..Default::default()
        })
        .unwrap();
        let now = Utc::now();
        db.begin_run("m1", "r1", RefreshStep::FetchingApiData, now, now).unwrap();
        let db = DbHandle::new(db);
        let (tx, _rx) = broadcast::channel(64);
        let reporter = StepReporter::new(db.clone(), tx, "m1", "r1", RefreshStep::FetchingApiData);
        (db, reporter)
    }

    fn request() -> IngestionRequest {
        IngestionRequest {
            template_id: "m1".into(),
            integration_id: "int_1".into(),
            provider: "github".into(),
            connection_id: "conn_1".into(),
            metric_id: "m1".into(),
            metric_name: "Commits".into(),
            metric_description: None,
            endpoint_config: json!({"endpoint": "/commits"}),
        }
    }

    fn commits(days: &[&str]) -> serde_json::Value {
        json!({"items": days.iter().map(|d| json!({"created_at": d})).collect::<Vec<_>>()})
    }

    #[tokio::test]
    async fn first_ingest_generates_and_second_reuses_transformer() {
        let (db, reporter) = setup();
        let connector = Arc::new(MockConnector::new(commits(&["2026-01-01T10:00:00Z"])));
        let generator = Arc::new(MockGenerator::default());
        let engine = IngestionEngine::new(db.clone(), connector.clone(), generator.clone());

        let first = engine.ingest(&request(), IngestMode::Append, &reporter).await.unwrap();
        assert!(first.generated);
        assert_eq!(first.inserted, 1);

        connector.set_response(commits(&["2026-01-01T10:00:00Z", "2026-01-02T10:00:00Z"]));
        let second = engine.ingest(&request(), IngestMode::Append, &reporter).await.unwrap();
        assert!(!second.generated);
        assert_eq!(second.transformer_id, first.transformer_id);
        assert_eq!(second.extracted, 2);
        assert_eq!(second.inserted, 1);
        assert_eq!(generator.ingestion_calls(), 1);
        assert_eq!(connector.calls(), 2);

        let count = db.call(|db| db.count_data_points("m1")).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn replace_mode_swaps_points() {
        let (db, reporter) = setup();
        let connector = Arc::new(MockConnector::new(commits(&["2026-01-01T10:00:00Z"])));
        let engine = IngestionEngine::new(db.clone(), connector.clone(), Arc::new(MockGenerator::default()));
        engine.ingest(&request(), IngestMode::Append, &reporter).await.unwrap();

        connector.set_response(commits(&["2026-03-05T10:00:00Z"]));
        engine.ingest(&request(), IngestMode::Replace, &reporter).await.unwrap();
        let points = db.call(|db| db.list_data_points("m1")).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, ts("2026-03-05T00:00:00Z"));
    }

    #[tokio::test]
    async fn connector_failure_writes_nothing() {
        let (db, reporter) = setup();
        let connector = Arc::new(MockConnector::failing("upstream 502"));
        let generator = Arc::new(MockGenerator::default());
        let engine = IngestionEngine::new(db.clone(), connector, generator.clone());

        let err = engine.ingest(&request(), IngestMode::Replace, &reporter).await.unwrap_err();
        assert!(matches!(err, PipelineError::Connector(ref m) if m.contains("upstream 502")));
        assert_eq!(generator.ingestion_calls(), 0);
        assert_eq!(db.call(|db| db.count_data_points("m1")).await.unwrap(), 0);

        let logs = db.call(|db| db.recent_logs("m1", 1)).await.unwrap();
        assert_eq!(logs[0].endpoint, "connector:fetch");
        assert!(!logs[0].success);
    }

    #[tokio::test]
    async fn generation_failure_is_logged() {
        let (db, reporter) = setup();
        let connector = Arc::new(MockConnector::new(commits(&["2026-01-01T10:00:00Z"])));
        let generator = Arc::new(MockGenerator::failing("model overloaded"));
        let engine = IngestionEngine::new(db.clone(), connector, generator);

        let err = engine.ingest(&request(), IngestMode::Append, &reporter).await.unwrap_err();
        assert!(matches!(err, PipelineError::Generation(_)));
        let logs = db.call(|db| db.recent_logs("m1", 1)).await.unwrap();
        assert_eq!(logs[0].endpoint, "transformer:ingestion:error");
        assert!(db.call(|db| db.get_ingestion_transformer("m1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn generated_transformer_that_cannot_extract_is_not_cached() {
        let (db, reporter) = setup();
        let connector = Arc::new(MockConnector::new(commits(&["2026-01-01T10:00:00Z"])));
        let generator = Arc::new(MockGenerator::with_first_ingestion(IngestionSpec::counting(
            "/wrong",
            "/created_at",
        )));
        let engine = IngestionEngine::new(db.clone(), connector, generator.clone());

        let err = engine.ingest(&request(), IngestMode::Append, &reporter).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transform(ref m) if m.contains("/wrong")));
        assert!(db.call(|db| db.get_ingestion_transformer("m1")).await.unwrap().is_none());
        let logs = db.call(|db| db.recent_logs("m1", 1)).await.unwrap();
        assert_eq!(logs[0].endpoint, "transformer:ingestion:error");
        assert!(!logs[0].success);

        let report = engine.ingest(&request(), IngestMode::Append, &reporter).await.unwrap();
        assert!(report.generated);
        assert_eq!(report.inserted, 1);
        assert_eq!(generator.ingestion_calls(), 2);
    }

    #[test]
    fn oversized_payloads_are_previewed() {
        let big = json!({"blob": "x".repeat(MAX_LOGGED_PAYLOAD + 10)});
        let logged = loggable_payload(&big);
        assert_eq!(logged["truncated"], true);
        let small = json!({"ok": 1});
        assert_eq!(loggable_payload(&small), small);
    }
}
