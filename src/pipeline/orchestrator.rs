//! Pipeline Orchestrator.
//!
//! Each trigger validates its preconditions, claims the metric with a
//! compare-and-swap on its status and returns right away. The work runs in a
//! supervised tokio task; whatever happens inside it, the metric ends idle,
//! with `last_error` set on failure, and dependent dashboard caches are
//! invalidated.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::{AbortHandle, JoinHandle};

use super::auth::Authorizer;
use super::cache::CacheInvalidator;
use super::chart::{ChartEngine, ChartOverrides, ChartRequest};
use super::connector::DataConnector;
use super::db::DbHandle;
use super::generator::TransformerGenerator;
use super::ingestion::{IngestMode, IngestionEngine, IngestionRequest};
use super::models::{
    DataPointStats, Metric, PipelineProgress, PipelineState, RefreshStep, TaskKind, TransformerInfo,
    TriggerResponse,
};
use super::progress::{STEP_TAG_PREFIX, StepReporter, build_progress, task_tag};
use super::transformers::{DeleteOutcome, TransformerStore};
use super::ws::{EventSender, PipelineEvent, broadcast_event};
use crate::errors::PipelineError;

pub const INTERRUPTED_BY_RESTART: &str = "Pipeline interrupted by server restart";
pub const INTERRUPTED_BY_SHUTDOWN: &str = "Pipeline interrupted by server shutdown";

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Trailing window of step logs considered by `get_progress`.
    pub progress_window: chrono::Duration,
    /// A run whose status has not moved for this long may be taken over.
    pub stale_after: chrono::Duration,
    pub dimension_sample_size: i64,
    /// Points sent to the generator when creating a chart transformer.
    pub generator_sample_points: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            progress_window: chrono::Duration::seconds(300),
            stale_after: chrono::Duration::seconds(900),
            dimension_sample_size: 100,
            generator_sample_points: 50,
        }
    }
}

/// External services the pipeline talks to.
pub struct Collaborators {
    pub connector: Arc<dyn DataConnector>,
    pub generator: Arc<dyn TransformerGenerator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub invalidator: Arc<dyn CacheInvalidator>,
}

#[derive(Debug, Clone)]
enum Task {
    SoftRefresh,
    HardRefresh,
    IngestionOnly,
    ChartOnly(ChartOverrides),
}

impl Task {
    fn kind(&self) -> TaskKind {
        match self {
            Self::SoftRefresh => TaskKind::SoftRefresh,
            Self::HardRefresh => TaskKind::HardRefresh,
            Self::IngestionOnly => TaskKind::IngestionOnly,
            Self::ChartOnly(_) => TaskKind::ChartOnly,
        }
    }

    /// Status written when the run is claimed. Manual metrics never fetch,
    /// so their refreshes open on a chart step.
    fn initial_step(&self, metric: &Metric) -> RefreshStep {
        match self {
            Self::SoftRefresh if is_manual(metric) => RefreshStep::GeneratingChartTransformer,
            Self::HardRefresh if is_manual(metric) => RefreshStep::DeletingOldTransformer,
            _ => self.kind().initial_step(),
        }
    }
}

/// Background task of one metric.
pub struct RunHandle {
    pub run_id: String,
    pub kind: TaskKind,
    /// Supervisor: awaits the work, records the outcome, deregisters.
    handle: JoinHandle<()>,
    work: AbortHandle,
}

struct Inner {
    db: DbHandle,
    events: EventSender,
    store: TransformerStore,
    ingestion: IngestionEngine,
    charts: ChartEngine,
    authorizer: Arc<dyn Authorizer>,
    invalidator: Arc<dyn CacheInvalidator>,
    settings: PipelineSettings,
    /// metric id → the task currently working on it.
    running: tokio::sync::Mutex<HashMap<String, RunHandle>>,
}

/// Schedules and supervises pipeline runs. Cheap to clone.
#[derive(Clone)]
pub struct PipelineRunner {
    inner: Arc<Inner>,
}

impl PipelineRunner {
    pub fn new(
        db: DbHandle,
        events: EventSender,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        let inner = Inner {
            store: TransformerStore::new(db.clone()),
            ingestion: IngestionEngine::new(
                db.clone(),
                collaborators.connector,
                collaborators.generator.clone(),
            ),
            charts: ChartEngine::new(
                db.clone(),
                collaborators.generator,
                settings.generator_sample_points,
            ),
            authorizer: collaborators.authorizer,
            invalidator: collaborators.invalidator,
            running: tokio::sync::Mutex::new(HashMap::new()),
            db,
            events,
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    // ── Triggers ──────────────────────────────────────────────────────

    /// Soft refresh: refetch with the existing transformers, append new points.
    pub async fn refresh(
        &self,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<TriggerResponse, PipelineError> {
        let metric = self.authorize(metric_id, organization_id).await?;
        self.start(metric, Task::SoftRefresh).await
    }

    /// Hard refresh: regenerate every transformer and replace the points.
    pub async fn regenerate(
        &self,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<TriggerResponse, PipelineError> {
        let metric = self.authorize(metric_id, organization_id).await?;
        self.start(metric, Task::HardRefresh).await
    }

    pub async fn regenerate_ingestion_only(
        &self,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<TriggerResponse, PipelineError> {
        let metric = self.authorize(metric_id, organization_id).await?;
        // Fails with ManualMetric / IntegrationNotFound before anything is written.
        self.inner.ingestion_request(&metric).await?;
        self.start(metric, Task::IngestionOnly).await
    }

    pub async fn regenerate_chart_only(
        &self,
        metric_id: &str,
        organization_id: &str,
        overrides: ChartOverrides,
    ) -> Result<TriggerResponse, PipelineError> {
        let metric = self.authorize(metric_id, organization_id).await?;
        let id = metric.id.clone();
        let (charts, points) = self
            .inner
            .db
            .call(move |db| Ok((db.list_charts_for_metric(&id)?.len(), db.count_data_points(&id)?)))
            .await
            .map_err(PipelineError::Database)?;
        if charts == 0 {
            return Err(PipelineError::ChartNotFound {
                metric_id: metric.id,
            });
        }
        if points == 0 {
            return Err(PipelineError::NoDataPoints {
                metric_id: metric.id,
            });
        }
        self.start(metric, Task::ChartOnly(overrides)).await
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub async fn get_progress(
        &self,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<PipelineProgress, PipelineError> {
        let metric = self.authorize(metric_id, organization_id).await?;
        if metric.refresh_status.is_none() {
            return Ok(build_progress(&metric, &[]));
        }
        let id = metric.id.clone();
        let run_id = metric.current_run_id.clone();
        let since = Utc::now() - self.inner.settings.progress_window;
        let logs = self
            .inner
            .db
            .call(move |db| db.list_logs_since(&id, STEP_TAG_PREFIX, since, run_id.as_deref()))
            .await
            .map_err(PipelineError::Database)?;
        Ok(build_progress(&metric, &logs))
    }

    /// Dimension keys found on a sample of the metric's most recent points.
    pub async fn get_available_dimensions(
        &self,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let metric = self.authorize(metric_id, organization_id).await?;
        let limit = self.inner.settings.dimension_sample_size;
        let samples = self
            .inner
            .db
            .call(move |db| db.sample_dimensions(&metric.id, limit))
            .await
            .map_err(PipelineError::Database)?;
        let keys: BTreeSet<String> = samples
            .into_iter()
            .flat_map(|dims| dims.into_keys())
            .collect();
        Ok(keys.into_iter().collect())
    }

    pub async fn get_transformer_info(
        &self,
        metric_id: &str,
        organization_id: &str,
    ) -> Result<TransformerInfo, PipelineError> {
        let metric = self.authorize(metric_id, organization_id).await?;
        let ingestion_transformer = match &metric.template_id {
            Some(template_id) => self
                .inner
                .store
                .ingestion(template_id)
                .await
                .map_err(PipelineError::Database)?,
            None => None,
        };
        let id = metric.id.clone();
        let (first_chart, data_points): (Option<String>, DataPointStats) = self
            .inner
            .db
            .call(move |db| {
                let chart = db.list_charts_for_metric(&id)?.into_iter().next().map(|c| c.id);
                Ok((chart, db.data_point_stats(&id)?))
            })
            .await
            .map_err(PipelineError::Database)?;
        let chart_transformer = match first_chart {
            Some(chart_id) => self
                .inner
                .store
                .chart(&chart_id)
                .await
                .map_err(PipelineError::Database)?,
            None => None,
        };
        Ok(TransformerInfo {
            ingestion_transformer,
            chart_transformer,
            data_points,
        })
    }

    // ── Task supervision ──────────────────────────────────────────────

    pub async fn is_running(&self, metric_id: &str) -> bool {
        self.inner
            .running
            .lock()
            .await
            .get(metric_id)
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Wait for the metric's background task, if any. Returns whether one was tracked.
    pub async fn wait(&self, metric_id: &str) -> bool {
        let run = self.inner.running.lock().await.remove(metric_id);
        match run {
            Some(run) => {
                if let Err(e) = run.handle.await {
                    tracing::warn!(metric_id, run_id = %run.run_id, error = %e, "Pipeline supervisor ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    /// Clear statuses left behind by a previous process. Run once at startup.
    pub async fn recover_interrupted(&self) -> anyhow::Result<usize> {
        let reset = self
            .inner
            .db
            .call(|db| db.reset_interrupted_runs(INTERRUPTED_BY_RESTART, Utc::now()))
            .await?;
        if reset > 0 {
            tracing::warn!(count = reset, "Reset pipeline runs interrupted by restart");
        }
        Ok(reset)
    }

    /// Abort every running task and mark its metric as failed.
    pub async fn shutdown(&self) {
        let runs: Vec<(String, RunHandle)> = self.inner.running.lock().await.drain().collect();
        for (metric_id, run) in runs {
            tracing::info!(metric_id = %metric_id, run_id = %run.run_id, kind = %run.kind, "Aborting pipeline run");
            run.handle.abort();
            run.work.abort();
            let run_id = run.run_id.clone();
            let id = metric_id.clone();
            if let Err(e) = self
                .inner
                .db
                .call(move |db| db.fail_run(&id, &run_id, INTERRUPTED_BY_SHUTDOWN, Utc::now()))
                .await
            {
                tracing::warn!(metric_id = %metric_id, error = %e, "Failed to mark aborted run");
            }
        }
    }

    async fn authorize(&self, metric_id: &str, organization_id: &str) -> Result<Metric, PipelineError> {
        self.inner
            .authorizer
            .get_metric_and_verify_access(&self.inner.db, metric_id, organization_id)
            .await
    }

    /// Claim the metric and hand the task to a supervised background worker.
    async fn start(&self, metric: Metric, task: Task) -> Result<TriggerResponse, PipelineError> {
        let kind = task.kind();
        let step = task.initial_step(&metric);
        let run_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let stale_before = now - self.inner.settings.stale_after;

        let (id, rid) = (metric.id.clone(), run_id.clone());
        let claimed = self
            .inner
            .db
            .call(move |db| db.begin_run(&id, &rid, step, now, stale_before))
            .await
            .map_err(PipelineError::Database)?;
        if !claimed {
            let id = metric.id.clone();
            let current = self
                .inner
                .db
                .call(move |db| db.get_metric(&id))
                .await
                .map_err(PipelineError::Database)?
                .map(|m| PipelineState::of(&m));
            let current = match current {
                Some(PipelineState::Running(current)) => current,
                _ => step,
            };
            return Err(PipelineError::AlreadyRunning {
                metric_id: metric.id,
                step: current,
            });
        }

        let reporter = StepReporter::new(
            self.inner.db.clone(),
            self.inner.events.clone(),
            &metric.id,
            &run_id,
            step,
        );
        reporter.record_initial().await;
        broadcast_event(
            &self.inner.events,
            &PipelineEvent::RunStarted {
                metric_id: metric.id.clone(),
                run_id: run_id.clone(),
                kind,
                step,
            },
        );
        tracing::info!(metric_id = %metric.id, run_id = %run_id, kind = %kind, "Pipeline run started");

        // Registered under the lock so the task cannot deregister before it is tracked.
        let mut running = self.inner.running.lock().await;
        let reporter = Arc::new(reporter);
        let work = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let metric = metric.clone();
            let reporter = Arc::clone(&reporter);
            async move { inner.dispatch(&metric, task, &reporter).await }
        });
        let work_abort = work.abort_handle();

        let inner = Arc::clone(&self.inner);
        let metric_id = metric.id.clone();
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(e) => Err(PipelineError::Other(anyhow::anyhow!("Pipeline task panicked: {}", e))),
            };
            inner.complete(&metric, kind, &reporter, outcome).await;

            let mut running = inner.running.lock().await;
            if running.get(&metric.id).is_some_and(|run| run.run_id == task_run_id) {
                running.remove(&metric.id);
            }
        });
        running.insert(
            metric_id,
            RunHandle {
                run_id: run_id.clone(),
                kind,
                handle,
                work: work_abort,
            },
        );

        Ok(TriggerResponse {
            success: true,
            started: true,
            run_id,
        })
    }
}

impl Inner {
    /// Run one background task. `Ok(true)` when provider data was fetched.
    async fn dispatch(
        &self,
        metric: &Metric,
        task: Task,
        reporter: &StepReporter,
    ) -> Result<bool, PipelineError> {
        match task {
            Task::SoftRefresh => self.refresh_metric_and_charts(metric, false, reporter).await,
            Task::HardRefresh => self.refresh_metric_and_charts(metric, true, reporter).await,
            Task::IngestionOnly => self.regenerate_ingestion(metric, reporter).await,
            Task::ChartOnly(overrides) => self.regenerate_charts(metric, overrides, reporter).await,
        }
    }

    /// Ingestion (unless the metric is manual) followed by every chart.
    ///
    /// With `force` the transformers are recreated and the metric's points
    /// are replaced atomically once the new set has been extracted.
    async fn refresh_metric_and_charts(
        &self,
        metric: &Metric,
        force: bool,
        reporter: &StepReporter,
    ) -> Result<bool, PipelineError> {
        if force {
            self.delete_transformers(metric).await?;
        }

        let fetched = if is_manual(metric) {
            tracing::info!(metric_id = %metric.id, "Manual metric, skipping ingestion");
            false
        } else {
            let request = self.ingestion_request(metric).await?;
            let mode = if force { IngestMode::Replace } else { IngestMode::Append };
            self.ingestion.ingest(&request, mode, reporter).await?;
            true
        };

        self.rebuild_charts(metric, force, &ChartOverrides::default(), reporter)
            .await?;
        Ok(fetched)
    }

    async fn regenerate_ingestion(
        &self,
        metric: &Metric,
        reporter: &StepReporter,
    ) -> Result<bool, PipelineError> {
        let request = self.ingestion_request(metric).await?;
        let outcome = self
            .store
            .delete_ingestion(&request.template_id)
            .await
            .map_err(PipelineError::Database)?;
        if outcome == DeleteOutcome::NotFound {
            tracing::debug!(metric_id = %metric.id, "No ingestion transformer to delete");
        }

        self.ingestion
            .ingest(&request, IngestMode::Replace, reporter)
            .await?;
        // Existing chart transformers are re-executed against the new points.
        self.rebuild_charts(metric, false, &ChartOverrides::default(), reporter)
            .await?;
        Ok(true)
    }

    async fn regenerate_charts(
        &self,
        metric: &Metric,
        overrides: ChartOverrides,
        reporter: &StepReporter,
    ) -> Result<bool, PipelineError> {
        let id = metric.id.clone();
        let charts = self
            .db
            .call(move |db| db.list_charts_for_metric(&id))
            .await
            .map_err(PipelineError::Database)?;
        for chart in &charts {
            self.store
                .delete_chart(&chart.id)
                .await
                .map_err(PipelineError::Database)?;
        }
        self.rebuild_charts(metric, true, &overrides, reporter).await?;
        Ok(false)
    }

    async fn rebuild_charts(
        &self,
        metric: &Metric,
        regenerate: bool,
        overrides: &ChartOverrides,
        reporter: &StepReporter,
    ) -> Result<(), PipelineError> {
        let id = metric.id.clone();
        let (charts, points) = self
            .db
            .call(move |db| Ok((db.list_charts_for_metric(&id)?, db.list_data_points(&id)?)))
            .await
            .map_err(PipelineError::Database)?;
        if charts.is_empty() {
            return Ok(());
        }
        if points.is_empty() {
            tracing::info!(metric_id = %metric.id, "No data points, skipping chart generation");
            reporter
                .log("chart:skipped", true, Some(serde_json::json!({ "reason": "no data points" })))
                .await;
            return Ok(());
        }

        for chart in charts {
            let request = ChartRequest {
                dashboard_chart_id: chart.id,
                metric_id: metric.id.clone(),
                metric_name: metric.name.clone(),
                metric_description: metric.description.clone(),
                chart_type: chart.chart_type,
                goal_value: metric.goal_value,
                overrides: overrides.clone(),
            };
            self.charts
                .generate(&request, &points, regenerate, reporter)
                .await?;
        }
        Ok(())
    }

    async fn delete_transformers(&self, metric: &Metric) -> Result<(), PipelineError> {
        if let Some(template_id) = &metric.template_id {
            self.store
                .delete_ingestion(template_id)
                .await
                .map_err(PipelineError::Database)?;
        }
        let id = metric.id.clone();
        let charts = self
            .db
            .call(move |db| db.list_charts_for_metric(&id))
            .await
            .map_err(PipelineError::Database)?;
        for chart in &charts {
            self.store
                .delete_chart(&chart.id)
                .await
                .map_err(PipelineError::Database)?;
        }
        Ok(())
    }

    async fn ingestion_request(&self, metric: &Metric) -> Result<IngestionRequest, PipelineError> {
        let template_id = match &metric.template_id {
            Some(template_id) if !metric.is_manual => template_id.clone(),
            _ => {
                return Err(PipelineError::ManualMetric {
                    id: metric.id.clone(),
                });
            }
        };
        let not_found = || PipelineError::IntegrationNotFound {
            metric_id: metric.id.clone(),
        };
        let integration_id = metric.integration_id.clone().ok_or_else(not_found)?;
        let lookup = integration_id.clone();
        let integration = self
            .db
            .call(move |db| db.get_integration(&lookup))
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(not_found)?;
        Ok(IngestionRequest {
            template_id,
            integration_id,
            provider: integration.provider,
            connection_id: integration.connection_id,
            metric_id: metric.id.clone(),
            metric_name: metric.name.clone(),
            metric_description: metric.description.clone(),
            endpoint_config: metric.endpoint_config.clone(),
        })
    }

    /// Record the outcome of a run, then invalidate dashboards either way.
    async fn complete(
        &self,
        metric: &Metric,
        kind: TaskKind,
        reporter: &StepReporter,
        outcome: Result<bool, PipelineError>,
    ) {
        let metric_id = metric.id.clone();
        let run_id = reporter.run_id().to_string();
        let now = Utc::now();

        match outcome {
            Ok(fetched) => {
                let (id, rid) = (metric_id.clone(), run_id.clone());
                let fetched_at = fetched.then_some(now);
                match self
                    .db
                    .call(move |db| db.finish_run(&id, &rid, now, fetched_at))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(metric_id = %metric_id, run_id = %run_id, "Run finished after being superseded"),
                    Err(e) => tracing::error!(metric_id = %metric_id, run_id = %run_id, error = %e, "Failed to record pipeline completion"),
                }
                reporter.log(task_tag(kind, "complete"), true, None).await;
                tracing::info!(metric_id = %metric_id, run_id = %run_id, kind = %kind, "Pipeline run completed");
                broadcast_event(
                    &self.events,
                    &PipelineEvent::RunCompleted {
                        metric_id: metric_id.clone(),
                        run_id: run_id.clone(),
                        kind,
                    },
                );
            }
            Err(PipelineError::Superseded { .. }) => {
                tracing::warn!(metric_id = %metric_id, run_id = %run_id, kind = %kind, "Pipeline run superseded, stopping");
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(metric_id = %metric_id, run_id = %run_id, kind = %kind, error = %message, "Pipeline run failed");
                let (id, rid, msg) = (metric_id.clone(), run_id.clone(), message.clone());
                if let Err(e) = self
                    .db
                    .call(move |db| db.fail_run(&id, &rid, &msg, now))
                    .await
                {
                    tracing::error!(metric_id = %metric_id, run_id = %run_id, error = %e, "Failed to record pipeline failure");
                }
                reporter
                    .log(
                        task_tag(kind, "error"),
                        false,
                        Some(serde_json::json!({ "error": message })),
                    )
                    .await;
                broadcast_event(
                    &self.events,
                    &PipelineEvent::RunFailed {
                        metric_id: metric_id.clone(),
                        run_id: run_id.clone(),
                        kind,
                        error: message,
                    },
                );
            }
        }

        self.invalidator.invalidate(&metric.cache_tags());
    }
}

fn is_manual(metric: &Metric) -> bool {
    metric.is_manual || metric.template_id.is_none()
}
