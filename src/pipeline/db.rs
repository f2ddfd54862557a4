use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::chart::ChartSpec;
use super::ingestion::IngestionSpec;
use super::models::*;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PipelineDb {
    conn: Connection,
}

const METRIC_COLUMNS: &str = "id, organization_id, team_id, name, description, integration_id, template_id, \
     is_manual, endpoint_config, goal_value, refresh_status, last_error, last_fetched_at, \
     current_run_id, created_at";

const CHART_COLUMNS: &str =
    "id, metric_id, name, chart_type, chart_transformer_id, chart_config, position, created_at";

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS integrations (
                    id TEXT PRIMARY KEY,
                    organization_id TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    connection_id TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS metrics (
                    id TEXT PRIMARY KEY,
                    organization_id TEXT NOT NULL,
                    team_id TEXT,
                    name TEXT NOT NULL,
                    description TEXT,
                    integration_id TEXT REFERENCES integrations(id) ON DELETE SET NULL,
                    template_id TEXT,
                    is_manual INTEGER NOT NULL DEFAULT 0,
                    endpoint_config TEXT NOT NULL DEFAULT '{}',
                    goal_value REAL,
                    refresh_status TEXT,
                    last_error TEXT,
                    last_fetched_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS dashboard_charts (
                    id TEXT PRIMARY KEY,
                    metric_id TEXT NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    chart_type TEXT NOT NULL DEFAULT 'line',
                    chart_transformer_id TEXT,
                    chart_config TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS ingestion_transformers (
                    id TEXT PRIMARY KEY,
                    template_id TEXT NOT NULL UNIQUE,
                    definition TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS chart_transformers (
                    id TEXT PRIMARY KEY,
                    dashboard_chart_id TEXT NOT NULL UNIQUE
                        REFERENCES dashboard_charts(id) ON DELETE CASCADE,
                    definition TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS metric_data_points (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    metric_id TEXT NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
                    timestamp TEXT NOT NULL,
                    value REAL NOT NULL,
                    dimensions TEXT,
                    dimensions_key TEXT NOT NULL DEFAULT '',
                    ingested_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    UNIQUE(metric_id, timestamp, dimensions_key)
                );

                CREATE TABLE IF NOT EXISTS metric_api_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    metric_id TEXT NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
                    run_id TEXT,
                    endpoint TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    raw_response TEXT,
                    fetched_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_metrics_org ON metrics(organization_id);
                CREATE INDEX IF NOT EXISTS idx_charts_metric ON dashboard_charts(metric_id);
                CREATE INDEX IF NOT EXISTS idx_points_metric_ts ON metric_data_points(metric_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_logs_metric_fetched ON metric_api_logs(metric_id, fetched_at);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable, safe to re-run).
        // Only "duplicate column" errors are ignored.
        for (column, ddl) in [
            (
                "current_run_id",
                "ALTER TABLE metrics ADD COLUMN current_run_id TEXT",
            ),
            (
                "refresh_status_updated_at",
                "ALTER TABLE metrics ADD COLUMN refresh_status_updated_at TEXT",
            ),
        ] {
            match self.conn.execute(ddl, []) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column") => {}
                Err(e) => {
                    return Err(anyhow::anyhow!("Failed to add {} column: {}", column, e));
                }
            }
        }

        Ok(())
    }

    // ── Integrations ──────────────────────────────────────────────────

    pub fn create_integration(
        &self,
        id: &str,
        organization_id: &str,
        provider: &str,
        connection_id: &str,
    ) -> Result<Integration> {
        self.conn
            .execute(
                "INSERT INTO integrations (id, organization_id, provider, connection_id) VALUES (?1, ?2, ?3, ?4)",
                params![id, organization_id, provider, connection_id],
            )
            .context("Failed to insert integration")?;
        self.get_integration(id)?
            .context("Integration not found after insert")
    }

    pub fn get_integration(&self, id: &str) -> Result<Option<Integration>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, organization_id, provider, connection_id, created_at FROM integrations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query integration")?;
        match row {
            Some((id, organization_id, provider, connection_id, created_at)) => Ok(Some(Integration {
                id,
                organization_id,
                provider,
                connection_id,
                created_at: parse_ts(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    // ── Metrics ───────────────────────────────────────────────────────

    pub fn create_metric(&self, new: &NewMetric) -> Result<Metric> {
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let endpoint_config = if new.endpoint_config.is_null() {
            "{}".to_string()
        } else {
            serde_json::to_string(&new.endpoint_config).context("Failed to encode endpoint config")?
        };
        self.conn
            .execute(
                "INSERT INTO metrics (id, organization_id, team_id, name, description, integration_id,
                                      template_id, is_manual, endpoint_config, goal_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    new.organization_id,
                    new.team_id,
                    new.name,
                    new.description,
                    new.integration_id,
                    new.template_id,
                    new.is_manual,
                    endpoint_config,
                    new.goal_value,
                ],
            )
            .context("Failed to insert metric")?;
        self.get_metric(&id)?.context("Metric not found after insert")
    }

    pub fn get_metric(&self, id: &str) -> Result<Option<Metric>> {
        let sql = format!("SELECT {} FROM metrics WHERE id = ?1", METRIC_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], MetricRow::from_row)
            .optional()
            .context("Failed to query metric")?;
        row.map(MetricRow::into_metric).transpose()
    }

    /// Start a run: claim the metric if it is idle (or its run went stale).
    ///
    /// Returns `false` when another run currently owns the metric.
    pub fn begin_run(
        &self,
        metric_id: &str,
        run_id: &str,
        step: RefreshStep,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE metrics
                 SET refresh_status = ?1, refresh_status_updated_at = ?2, last_error = NULL, current_run_id = ?3
                 WHERE id = ?4
                   AND (refresh_status IS NULL
                        OR refresh_status_updated_at IS NULL
                        OR refresh_status_updated_at < ?5)",
                params![step.as_str(), format_ts(&now), run_id, metric_id, format_ts(&stale_before)],
            )
            .context("Failed to begin pipeline run")?;
        Ok(changed == 1)
    }

    /// Move the run to its next step. A superseded run is a no-op (`false`).
    pub fn advance_run(
        &self,
        metric_id: &str,
        run_id: &str,
        step: RefreshStep,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE metrics SET refresh_status = ?1, refresh_status_updated_at = ?2
                 WHERE id = ?3 AND current_run_id = ?4",
                params![step.as_str(), format_ts(&now), metric_id, run_id],
            )
            .context("Failed to advance pipeline run")?;
        Ok(changed == 1)
    }

    /// Clear the status of a successful run; `fetched_at` updates `last_fetched_at`.
    pub fn finish_run(
        &self,
        metric_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE metrics
                 SET refresh_status = NULL, refresh_status_updated_at = ?1, last_error = NULL,
                     last_fetched_at = COALESCE(?2, last_fetched_at)
                 WHERE id = ?3 AND current_run_id = ?4",
                params![
                    format_ts(&now),
                    fetched_at.as_ref().map(format_ts),
                    metric_id,
                    run_id
                ],
            )
            .context("Failed to finish pipeline run")?;
        Ok(changed == 1)
    }

    pub fn fail_run(
        &self,
        metric_id: &str,
        run_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE metrics SET refresh_status = NULL, refresh_status_updated_at = ?1, last_error = ?2
                 WHERE id = ?3 AND current_run_id = ?4",
                params![format_ts(&now), error, metric_id, run_id],
            )
            .context("Failed to record pipeline failure")?;
        Ok(changed == 1)
    }

    /// Clear every in-flight status left behind by a previous process.
    pub fn reset_interrupted_runs(&self, message: &str, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE metrics SET refresh_status = NULL, refresh_status_updated_at = ?1, last_error = ?2
                 WHERE refresh_status IS NOT NULL",
                params![format_ts(&now), message],
            )
            .context("Failed to reset interrupted runs")
    }

    // ── Dashboard charts ──────────────────────────────────────────────

    pub fn create_dashboard_chart(&self, new: &NewDashboardChart) -> Result<DashboardChart> {
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.conn
            .execute(
                "INSERT INTO dashboard_charts (id, metric_id, name, chart_type, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, new.metric_id, new.name, new.chart_type.as_str(), new.position],
            )
            .context("Failed to insert dashboard chart")?;
        self.get_dashboard_chart(&id)?
            .context("Dashboard chart not found after insert")
    }

    pub fn get_dashboard_chart(&self, id: &str) -> Result<Option<DashboardChart>> {
        let sql = format!("SELECT {} FROM dashboard_charts WHERE id = ?1", CHART_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ChartRow::from_row)
            .optional()
            .context("Failed to query dashboard chart")?;
        row.map(ChartRow::into_chart).transpose()
    }

    pub fn list_charts_for_metric(&self, metric_id: &str) -> Result<Vec<DashboardChart>> {
        let sql = format!(
            "SELECT {} FROM dashboard_charts WHERE metric_id = ?1 ORDER BY position, created_at, id",
            CHART_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_charts_for_metric")?;
        let rows = stmt
            .query_map(params![metric_id], ChartRow::from_row)
            .context("Failed to query dashboard charts")?;
        let mut charts = Vec::new();
        for row in rows {
            let r = row.context("Failed to read dashboard chart row")?;
            charts.push(r.into_chart()?);
        }
        Ok(charts)
    }

    pub fn update_chart_config(
        &self,
        chart_id: &str,
        chart_type: ChartType,
        chart_transformer_id: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        let config = serde_json::to_string(config).context("Failed to encode chart config")?;
        self.conn
            .execute(
                "UPDATE dashboard_charts SET chart_type = ?1, chart_transformer_id = ?2, chart_config = ?3
                 WHERE id = ?4",
                params![chart_type.as_str(), chart_transformer_id, config, chart_id],
            )
            .context("Failed to update chart config")?;
        Ok(())
    }

    // ── Transformers ──────────────────────────────────────────────────

    pub fn get_ingestion_transformer(&self, template_id: &str) -> Result<Option<IngestionTransformer>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, template_id, definition, created_at FROM ingestion_transformers WHERE template_id = ?1",
                params![template_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query ingestion transformer")?;
        match row {
            Some((id, template_id, definition, created_at)) => {
                let spec: IngestionSpec = serde_json::from_str(&definition)
                    .context("Failed to parse ingestion transformer definition")?;
                Ok(Some(IngestionTransformer {
                    id,
                    template_id,
                    spec,
                    created_at: parse_ts(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn insert_ingestion_transformer(
        &self,
        template_id: &str,
        spec: &IngestionSpec,
        now: DateTime<Utc>,
    ) -> Result<IngestionTransformer> {
        let id = uuid::Uuid::new_v4().to_string();
        let definition = serde_json::to_string(spec).context("Failed to encode ingestion transformer")?;
        self.conn
            .execute(
                "INSERT INTO ingestion_transformers (id, template_id, definition, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, template_id, definition, format_ts(&now)],
            )
            .context("Failed to insert ingestion transformer")?;
        Ok(IngestionTransformer {
            id,
            template_id: template_id.to_string(),
            spec: spec.clone(),
            created_at: now,
        })
    }

    /// Returns the number of rows removed (0 or 1).
    pub fn delete_ingestion_transformer(&self, template_id: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM ingestion_transformers WHERE template_id = ?1",
                params![template_id],
            )
            .context("Failed to delete ingestion transformer")
    }

    pub fn get_chart_transformer(&self, dashboard_chart_id: &str) -> Result<Option<ChartTransformer>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, dashboard_chart_id, definition, created_at FROM chart_transformers WHERE dashboard_chart_id = ?1",
                params![dashboard_chart_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query chart transformer")?;
        match row {
            Some((id, dashboard_chart_id, definition, created_at)) => {
                let spec: ChartSpec = serde_json::from_str(&definition)
                    .context("Failed to parse chart transformer definition")?;
                Ok(Some(ChartTransformer {
                    id,
                    dashboard_chart_id,
                    spec,
                    created_at: parse_ts(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn insert_chart_transformer(
        &self,
        dashboard_chart_id: &str,
        spec: &ChartSpec,
        now: DateTime<Utc>,
    ) -> Result<ChartTransformer> {
        let id = uuid::Uuid::new_v4().to_string();
        let definition = serde_json::to_string(spec).context("Failed to encode chart transformer")?;
        self.conn
            .execute(
                "INSERT INTO chart_transformers (id, dashboard_chart_id, definition, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, dashboard_chart_id, definition, format_ts(&now)],
            )
            .context("Failed to insert chart transformer")?;
        Ok(ChartTransformer {
            id,
            dashboard_chart_id: dashboard_chart_id.to_string(),
            spec: spec.clone(),
            created_at: now,
        })
    }

    /// Removes the transformer and detaches it from its chart.
    /// Returns the number of transformer rows removed (0 or 1).
    pub fn delete_chart_transformer(&self, dashboard_chart_id: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM chart_transformers WHERE dashboard_chart_id = ?1",
                params![dashboard_chart_id],
            )
            .context("Failed to delete chart transformer")?;
        self.conn
            .execute(
                "UPDATE dashboard_charts SET chart_transformer_id = NULL WHERE id = ?1",
                params![dashboard_chart_id],
            )
            .context("Failed to detach chart transformer")?;
        Ok(removed)
    }

    // ── Data points ───────────────────────────────────────────────────

    /// Persist points in a single transaction: either all are written or none.
    ///
    /// Existing points are never modified; duplicates of an existing
    /// `(timestamp, dimensions)` pair are skipped. With `replace` the metric's
    /// previous points are removed inside the same transaction.
    /// Returns the number of rows inserted.
    pub fn insert_data_points(
        &self,
        metric_id: &str,
        points: &[NewDataPoint],
        replace: bool,
    ) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin data point transaction")?;
        if replace {
            tx.execute(
                "DELETE FROM metric_data_points WHERE metric_id = ?1",
                params![metric_id],
            )
            .context("Failed to clear data points")?;
        }
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO metric_data_points (metric_id, timestamp, value, dimensions, dimensions_key)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("Failed to prepare data point insert")?;
            for point in points {
                let dimensions = match &point.dimensions {
                    Some(dims) if !dims.is_empty() => Some(
                        serde_json::to_string(dims).context("Failed to encode dimensions")?,
                    ),
                    _ => None,
                };
                inserted += stmt
                    .execute(params![
                        metric_id,
                        format_ts(&point.timestamp),
                        point.value,
                        dimensions,
                        point.dimensions_key(),
                    ])
                    .context("Failed to insert data point")?;
            }
        }
        tx.commit().context("Failed to commit data points")?;
        Ok(inserted)
    }

    pub fn count_data_points(&self, metric_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM metric_data_points WHERE metric_id = ?1",
                params![metric_id],
                |row| row.get(0),
            )
            .context("Failed to count data points")
    }

    /// All points of a metric in chronological order.
    pub fn list_data_points(&self, metric_id: &str) -> Result<Vec<MetricDataPoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, metric_id, timestamp, value, dimensions FROM metric_data_points
                 WHERE metric_id = ?1 ORDER BY timestamp, id",
            )
            .context("Failed to prepare list_data_points")?;
        let rows = stmt
            .query_map(params![metric_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query data points")?;
        let mut points = Vec::new();
        for row in rows {
            let (id, metric_id, timestamp, value, dimensions) =
                row.context("Failed to read data point row")?;
            let dimensions = dimensions
                .map(|raw| serde_json::from_str::<Dimensions>(&raw))
                .transpose()
                .context("Failed to parse data point dimensions")?;
            points.push(MetricDataPoint {
                id,
                metric_id,
                timestamp: parse_ts(&timestamp)?,
                value,
                dimensions,
            });
        }
        Ok(points)
    }

    pub fn data_point_stats(&self, metric_id: &str) -> Result<DataPointStats> {
        let (count, first, last): (i64, Option<String>, Option<String>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM metric_data_points WHERE metric_id = ?1",
                params![metric_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to query data point stats")?;
        Ok(DataPointStats {
            count,
            first_date: first.as_deref().map(parse_ts).transpose()?,
            last_date: last.as_deref().map(parse_ts).transpose()?,
        })
    }

    /// Dimension maps of up to `limit` of the most recent points that have any.
    pub fn sample_dimensions(&self, metric_id: &str, limit: i64) -> Result<Vec<Dimensions>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT dimensions FROM metric_data_points
                 WHERE metric_id = ?1 AND dimensions IS NOT NULL
                 ORDER BY timestamp DESC LIMIT ?2",
            )
            .context("Failed to prepare sample_dimensions")?;
        let rows = stmt
            .query_map(params![metric_id, limit], |row| row.get::<_, String>(0))
            .context("Failed to query dimensions")?;
        let mut samples = Vec::new();
        for row in rows {
            let raw = row.context("Failed to read dimensions row")?;
            samples.push(serde_json::from_str(&raw).context("Failed to parse dimensions")?);
        }
        Ok(samples)
    }

    // ── API / event logs ──────────────────────────────────────────────

    pub fn insert_api_log(&self, log: &NewApiLog) -> Result<i64> {
        let raw = log
            .raw_response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode log payload")?;
        self.conn
            .execute(
                "INSERT INTO metric_api_logs (metric_id, run_id, endpoint, success, raw_response, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.metric_id,
                    log.run_id,
                    log.endpoint,
                    log.success,
                    raw,
                    format_ts(&log.fetched_at)
                ],
            )
            .context("Failed to insert api log")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Logs whose tag starts with `prefix`, at or after `since`, oldest first.
    /// When `run_id` is given only that run's entries are returned.
    pub fn list_logs_since(
        &self,
        metric_id: &str,
        prefix: &str,
        since: DateTime<Utc>,
        run_id: Option<&str>,
    ) -> Result<Vec<MetricApiLog>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, metric_id, run_id, endpoint, success, raw_response, fetched_at
                 FROM metric_api_logs
                 WHERE metric_id = ?1
                   AND substr(endpoint, 1, length(?2)) = ?2
                   AND fetched_at >= ?3
                   AND (?4 IS NULL OR run_id = ?4)
                 ORDER BY fetched_at, id",
            )
            .context("Failed to prepare list_logs_since")?;
        let rows = stmt
            .query_map(
                params![metric_id, prefix, format_ts(&since), run_id],
                LogRow::from_row,
            )
            .context("Failed to query api logs")?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read api log row")?.into_log()?);
        }
        Ok(logs)
    }

    /// Most recent log entries of a metric, newest first.
    pub fn recent_logs(&self, metric_id: &str, limit: i64) -> Result<Vec<MetricApiLog>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, metric_id, run_id, endpoint, success, raw_response, fetched_at
                 FROM metric_api_logs WHERE metric_id = ?1
                 ORDER BY fetched_at DESC, id DESC LIMIT ?2",
            )
            .context("Failed to prepare recent_logs")?;
        let rows = stmt
            .query_map(params![metric_id, limit], LogRow::from_row)
            .context("Failed to query api logs")?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read api log row")?.into_log()?);
        }
        Ok(logs)
    }
}

// ── Row conversion ────────────────────────────────────────────────────

struct MetricRow {
    id: String,
    organization_id: String,
    team_id: Option<String>,
    name: String,
    description: Option<String>,
    integration_id: Option<String>,
    template_id: Option<String>,
    is_manual: bool,
    endpoint_config: String,
    goal_value: Option<f64>,
    refresh_status: Option<String>,
    last_error: Option<String>,
    last_fetched_at: Option<String>,
    current_run_id: Option<String>,
    created_at: String,
}

impl MetricRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            team_id: row.get(2)?,
            name: row.get(3)?,
            description: row.get(4)?,
            integration_id: row.get(5)?,
            template_id: row.get(6)?,
            is_manual: row.get(7)?,
            endpoint_config: row.get(8)?,
            goal_value: row.get(9)?,
            refresh_status: row.get(10)?,
            last_error: row.get(11)?,
            last_fetched_at: row.get(12)?,
            current_run_id: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    fn into_metric(self) -> Result<Metric> {
        let refresh_status = self
            .refresh_status
            .as_deref()
            .map(RefreshStep::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse metric refresh status")?;
        let endpoint_config: serde_json::Value = serde_json::from_str(&self.endpoint_config)
            .context("Failed to parse metric endpoint config JSON")?;
        Ok(Metric {
            id: self.id,
            organization_id: self.organization_id,
            team_id: self.team_id,
            name: self.name,
            description: self.description,
            integration_id: self.integration_id,
            template_id: self.template_id,
            is_manual: self.is_manual,
            endpoint_config,
            goal_value: self.goal_value,
            refresh_status,
            last_error: self.last_error,
            last_fetched_at: self.last_fetched_at.as_deref().map(parse_ts).transpose()?,
            current_run_id: self.current_run_id,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct ChartRow {
    id: String,
    metric_id: String,
    name: String,
    chart_type: String,
    chart_transformer_id: Option<String>,
    chart_config: Option<String>,
    position: i32,
    created_at: String,
}

impl ChartRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            metric_id: row.get(1)?,
            name: row.get(2)?,
            chart_type: row.get(3)?,
            chart_transformer_id: row.get(4)?,
            chart_config: row.get(5)?,
            position: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_chart(self) -> Result<DashboardChart> {
        let chart_type = ChartType::from_str(&self.chart_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse chart type")?;
        let chart_config = self
            .chart_config
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Failed to parse chart config JSON")?;
        Ok(DashboardChart {
            id: self.id,
            metric_id: self.metric_id,
            name: self.name,
            chart_type,
            chart_transformer_id: self.chart_transformer_id,
            chart_config,
            position: self.position,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct LogRow {
    id: i64,
    metric_id: String,
    run_id: Option<String>,
    endpoint: String,
    success: bool,
    raw_response: Option<String>,
    fetched_at: String,
}

impl LogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            metric_id: row.get(1)?,
            run_id: row.get(2)?,
            endpoint: row.get(3)?,
            success: row.get(4)?,
            raw_response: row.get(5)?,
            fetched_at: row.get(6)?,
        })
    }

    fn into_log(self) -> Result<MetricApiLog> {
        let raw_response = self
            .raw_response
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Failed to parse log payload JSON")?;
        Ok(MetricApiLog {
            id: self.id,
            metric_id: self.metric_id,
            run_id: self.run_id,
            endpoint: self.endpoint,
            success: self.success,
            raw_response,
            fetched_at: parse_ts(&self.fetched_at)?,
        })
    }
}
