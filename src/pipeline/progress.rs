//! Progress/Log Reporter.
//!
//! Every transition of a run is appended to `metric_api_logs` under a
//! string tag. `build_progress` rebuilds the step timeline from those rows
//! alone; no separate progress table exists.

use std::sync::Mutex;

use chrono::Utc;

use super::db::DbHandle;
use super::models::{
    CompletedStep, Metric, MetricApiLog, NewApiLog, PipelineProgress, PipelineState, RefreshStep,
    TaskKind,
};
use super::ws::{EventSender, PipelineEvent, broadcast_event};
use crate::errors::PipelineError;

pub const STEP_TAG_PREFIX: &str = "pipeline-step:";

pub fn step_tag(step: RefreshStep) -> String {
    format!("{}{}", STEP_TAG_PREFIX, step.as_str())
}

/// `transformer:<kind>:<phase>`, e.g. `transformer:chart:error`.
pub fn transformer_tag(kind: &str, phase: &str) -> String {
    format!("transformer:{}:{}", kind, phase)
}

/// `pipeline:<task>:<outcome>`, written once when a background task ends.
pub fn task_tag(kind: TaskKind, outcome: &str) -> String {
    format!("pipeline:{}:{}", kind.as_str(), outcome)
}

/// Writes the step log of one run and keeps the metric's status in step.
pub struct StepReporter {
    db: DbHandle,
    events: EventSender,
    metric_id: String,
    run_id: String,
    current: Mutex<RefreshStep>,
}

impl StepReporter {
    pub fn new(
        db: DbHandle,
        events: EventSender,
        metric_id: &str,
        run_id: &str,
        initial: RefreshStep,
    ) -> Self {
        Self {
            db,
            events,
            metric_id: metric_id.to_string(),
            run_id: run_id.to_string(),
            current: Mutex::new(initial),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn current(&self) -> RefreshStep {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Log the step that was written when the run was claimed.
    pub async fn record_initial(&self) {
        let step = self.current();
        self.log(step_tag(step), true, None).await;
    }

    /// Enter `step`: persist it as the metric's status, log it and notify
    /// subscribers. Re-entering the current step is a no-op.
    pub async fn step(&self, step: RefreshStep) -> Result<(), PipelineError> {
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if *current == step {
                return Ok(());
            }
            *current = step;
        }

        let metric_id = self.metric_id.clone();
        let run_id = self.run_id.clone();
        let owned = self
            .db
            .call(move |db| db.advance_run(&metric_id, &run_id, step, Utc::now()))
            .await
            .map_err(PipelineError::Database)?;
        if !owned {
            return Err(PipelineError::Superseded {
                run_id: self.run_id.clone(),
            });
        }

        tracing::debug!(metric_id = %self.metric_id, run_id = %self.run_id, step = %step, "Pipeline step");
        self.log(step_tag(step), true, None).await;
        broadcast_event(
            &self.events,
            &PipelineEvent::StepStarted {
                metric_id: self.metric_id.clone(),
                run_id: self.run_id.clone(),
                step,
            },
        );
        Ok(())
    }

    /// Append a log row. Failures are reported but never abort the run.
    pub async fn log(
        &self,
        tag: impl Into<String>,
        success: bool,
        payload: Option<serde_json::Value>,
    ) {
        let entry = NewApiLog {
            metric_id: self.metric_id.clone(),
            run_id: Some(self.run_id.clone()),
            endpoint: tag.into(),
            success,
            raw_response: payload,
            fetched_at: Utc::now(),
        };
        let endpoint = entry.endpoint.clone();
        if let Err(e) = self.db.call(move |db| db.insert_api_log(&entry)).await {
            tracing::warn!(metric_id = %self.metric_id, tag = %endpoint, error = %e, "Failed to write pipeline log");
        }
    }
}

/// Reconstruct a metric's progress from its step log.
///
/// `logs` are the `pipeline-step:*` rows of the current run inside the
/// progress window, oldest first. The most recent row for the in-flight
/// step is left out; every other step's duration runs until the next row.
pub fn build_progress(metric: &Metric, logs: &[MetricApiLog]) -> PipelineProgress {
    let current = match PipelineState::of(metric) {
        PipelineState::Running(step) => step,
        settled => {
            return PipelineProgress {
                is_processing: false,
                current_step: None,
                completed_steps: Vec::new(),
                error: match settled {
                    PipelineState::Failed(error) => Some(error),
                    _ => None,
                },
            };
        }
    };

    let entries: Vec<_> = logs
        .iter()
        .filter_map(|log| {
            log.endpoint
                .strip_prefix(STEP_TAG_PREFIX)
                .map(|step| (step, log.fetched_at))
        })
        .collect();
    let active = entries
        .iter()
        .rposition(|(step, _)| *step == current.as_str());

    let completed_steps = entries
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != active)
        .map(|(i, (step, started_at))| CompletedStep {
            step: step.to_string(),
            started_at: *started_at,
            duration_ms: entries
                .get(i + 1)
                .map(|(_, next)| (*next - *started_at).num_milliseconds()),
        })
        .collect();

    PipelineProgress {
        is_processing: true,
        current_step: Some(current),
        completed_steps,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::PipelineDb;
    use crate::pipeline::models::{NewMetric, parse_ts};
    use chrono::{DateTime, Duration};
    use tokio::sync::broadcast;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_ts(raw).unwrap()
    }

    fn log(step: RefreshStep, at: DateTime<Utc>) -> MetricApiLog {
        MetricApiLog {
            id: 0,
            metric_id: "m1".into(),
            run_id: Some("r1".into()),
            endpoint: step_tag(step),
            success: true,
            raw_response: None,
            fetched_at: at,
        }
    }

    fn metric(status: Option<RefreshStep>, error: Option<&str>) -> Metric {
        Metric {
            id: "m1".into(),
            organization_id: "org".into(),
            team_id: None,
            name: "Stars".into(),
            description: None,
            integration_id: None,
            template_id: Some("m1".into()),
            is_manual: false,
            endpoint_config: serde_json::json!({}),
            goal_value: None,
            refresh_status: status,
            last_error: error.map(String::from),
            last_fetched_at: None,
            current_run_id: Some("r1".into()),
            created_at: ts("2026-03-01T00:00:00Z"),
        }
    }

    #[test]
    fn active_step_is_not_reported_as_completed() {
        let t0 = ts("2026-03-01T10:00:00Z");
        let logs = vec![
            log(RefreshStep::FetchingApiData, t0),
            log(RefreshStep::SavingTimeseriesData, t0 + Duration::milliseconds(2000)),
        ];
        let progress = build_progress(&metric(Some(RefreshStep::SavingTimeseriesData), None), &logs);

        assert!(progress.is_processing);
        assert_eq!(progress.current_step, Some(RefreshStep::SavingTimeseriesData));
        assert_eq!(
            progress.completed_steps,
            vec![CompletedStep {
                step: "fetching-api-data".into(),
                started_at: t0,
                duration_ms: Some(2000),
            }]
        );
        assert!(progress.error.is_none());
    }

    #[test]
    fn idle_metric_reports_last_error() {
        let logs = vec![log(RefreshStep::FetchingApiData, ts("2026-03-01T10:00:00Z"))];
        let progress = build_progress(&metric(None, Some("upstream 500")), &logs);
        assert!(!progress.is_processing);
        assert!(progress.current_step.is_none());
        assert!(progress.completed_steps.is_empty());
        assert_eq!(progress.error.as_deref(), Some("upstream 500"));
    }

    #[test]
    fn trailing_step_without_successor_has_no_duration() {
        let t0 = ts("2026-03-01T10:00:00Z");
        let logs = vec![
            log(RefreshStep::DeletingOldData, t0),
            log(RefreshStep::FetchingApiData, t0 + Duration::milliseconds(300)),
            log(RefreshStep::SavingTimeseriesData, t0 + Duration::milliseconds(900)),
        ];
        // Status already moved on but its log row has not landed yet.
        let progress = build_progress(&metric(Some(RefreshStep::GeneratingChartTransformer), None), &logs);
        let durations: Vec<_> = progress
            .completed_steps
            .iter()
            .map(|s| s.duration_ms)
            .collect();
        assert_eq!(durations, vec![Some(300), Some(600), None]);
    }

    #[test]
    fn non_step_tags_are_ignored() {
        let t0 = ts("2026-03-01T10:00:00Z");
        let mut noise = log(RefreshStep::FetchingApiData, t0);
        noise.endpoint = "transformer:ingestion:start".into();
        let logs = vec![log(RefreshStep::FetchingApiData, t0), noise];
        let progress = build_progress(&metric(Some(RefreshStep::FetchingApiData), None), &logs);
        assert!(progress.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn reporter_advances_status_and_logs() {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_metric(&NewMetric {
            id: Some("m1".into()),
            organization_id: "org".into(),
            name: "Stars".into(),
            ..Default::default()
        })
        .unwrap();
        let now = Utc::now();
        assert!(db.begin_run("m1", "r1", RefreshStep::FetchingApiData, now, now).unwrap());
        let db = DbHandle::new(db);
        let (tx, mut rx) = broadcast::channel(8);

        let reporter = StepReporter::new(db.clone(), tx, "m1", "r1", RefreshStep::FetchingApiData);
        reporter.record_initial().await;
        reporter.step(RefreshStep::FetchingApiData).await.unwrap();
        reporter.step(RefreshStep::SavingTimeseriesData).await.unwrap();

        let metric = db.call(|db| db.get_metric("m1")).await.unwrap().unwrap();
        assert_eq!(metric.refresh_status, Some(RefreshStep::SavingTimeseriesData));

        let logs = db
            .call(|db| db.list_logs_since("m1", STEP_TAG_PREFIX, Utc::now() - Duration::minutes(5), Some("r1")))
            .await
            .unwrap();
        let tags: Vec<_> = logs.iter().map(|l| l.endpoint.as_str()).collect();
        assert_eq!(
            tags,
            vec!["pipeline-step:fetching-api-data", "pipeline-step:saving-timeseries-data"]
        );
        assert!(rx.try_recv().unwrap().contains("StepStarted"));
    }

    #[tokio::test]
    async fn superseded_reporter_stops() {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_metric(&NewMetric {
            id: Some("m1".into()),
            organization_id: "org".into(),
            name: "Stars".into(),
            ..Default::default()
        })
        .unwrap();
        let now = Utc::now();
        db.begin_run("m1", "r-new", RefreshStep::FetchingApiData, now, now).unwrap();
        let (tx, _rx) = broadcast::channel(8);

        let reporter = StepReporter::new(DbHandle::new(db), tx, "m1", "r-old", RefreshStep::FetchingApiData);
        let err = reporter.step(RefreshStep::SavingTimeseriesData).await.unwrap_err();
        assert!(matches!(err, PipelineError::Superseded { .. }));
    }

    #[test]
    fn tag_helpers() {
        assert_eq!(step_tag(RefreshStep::SavingChartConfig), "pipeline-step:saving-chart-config");
        assert_eq!(transformer_tag("chart", "error"), "transformer:chart:error");
        assert_eq!(task_tag(TaskKind::IngestionOnly, "complete"), "pipeline:ingestion-only:complete");
    }
}
