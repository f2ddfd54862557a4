use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::auth::OrgContext;
use super::chart::ChartOverrides;
use super::orchestrator::PipelineRunner;
use super::ws::EventSender;
use crate::errors::PipelineError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runner: PipelineRunner,
    pub events: EventSender,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        if !err.is_precondition() {
            tracing::error!(error = %message, "Request failed");
            return ApiError::Internal(message);
        }
        match err {
            PipelineError::MetricNotFound { .. }
            | PipelineError::IntegrationNotFound { .. }
            | PipelineError::ChartNotFound { .. } => ApiError::NotFound(message),
            PipelineError::ManualMetric { .. }
            | PipelineError::NoDataPoints { .. }
            | PipelineError::BadRequest(_) => ApiError::BadRequest(message),
            PipelineError::AlreadyRunning { .. } => ApiError::Conflict(message),
            _ => ApiError::Internal(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/pipeline/{metric_id}/refresh", post(refresh))
        .route("/api/pipeline/{metric_id}/regenerate", post(regenerate))
        .route(
            "/api/pipeline/{metric_id}/regenerate-ingestion",
            post(regenerate_ingestion),
        )
        .route("/api/pipeline/{metric_id}/regenerate-chart", post(regenerate_chart))
        .route("/api/pipeline/{metric_id}/progress", get(get_progress))
        .route("/api/pipeline/{metric_id}/dimensions", get(get_dimensions))
        .route("/api/pipeline/{metric_id}/transformers", get(get_transformers))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn refresh(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    org: OrgContext,
) -> Result<impl IntoResponse, ApiError> {
    let started = state.runner.refresh(&metric_id, &org.organization_id).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn regenerate(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    org: OrgContext,
) -> Result<impl IntoResponse, ApiError> {
    let started = state.runner.regenerate(&metric_id, &org.organization_id).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn regenerate_ingestion(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    org: OrgContext,
) -> Result<impl IntoResponse, ApiError> {
    let started = state
        .runner
        .regenerate_ingestion_only(&metric_id, &org.organization_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// Body is optional; an empty body regenerates without overrides.
async fn regenerate_chart(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    org: OrgContext,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let overrides: ChartOverrides = if body.iter().all(u8::is_ascii_whitespace) {
        ChartOverrides::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| PipelineError::BadRequest(format!("Invalid chart overrides: {}", e)))?
    };
    let started = state
        .runner
        .regenerate_chart_only(&metric_id, &org.organization_id, overrides)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

async fn get_progress(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    org: OrgContext,
) -> Result<impl IntoResponse, ApiError> {
    let progress = state.runner.get_progress(&metric_id, &org.organization_id).await?;
    Ok(Json(progress))
}

async fn get_dimensions(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    org: OrgContext,
) -> Result<impl IntoResponse, ApiError> {
    let dimensions = state
        .runner
        .get_available_dimensions(&metric_id, &org.organization_id)
        .await?;
    Ok(Json(dimensions))
}

async fn get_transformers(
    State(state): State<SharedState>,
    Path(metric_id): Path<String>,
    org: OrgContext,
) -> Result<impl IntoResponse, ApiError> {
    let info = state
        .runner
        .get_transformer_info(&metric_id, &org.organization_id)
        .await?;
    Ok(Json(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::auth::{ORGANIZATION_HEADER, OrganizationAuthorizer};
    use crate::pipeline::db::{DbHandle, PipelineDb};
    use crate::pipeline::models::{NewDashboardChart, NewMetric, TriggerResponse};
    use crate::pipeline::orchestrator::{Collaborators, PipelineSettings};
    use crate::pipeline::testing::{MockConnector, MockGenerator, RecordingInvalidator};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn test_state(connector: MockConnector) -> SharedState {
        let db = PipelineDb::new_in_memory().unwrap();
        db.create_integration("int_1", "org_1", "posthog", "conn_1").unwrap();
        db.create_metric(&NewMetric {
            id: Some("m1".into()),
            organization_id: "org_1".into(),
            name: "Signups".into(),
            integration_id: Some("int_1".into()),
            template_id: Some("m1".into()),
            endpoint_config: json!({"endpoint": "/api/events"}),
            ..Default::default()
        })
        .unwrap();
        db.create_metric(&NewMetric {
            id: Some("manual".into()),
            organization_id: "org_1".into(),
            name: "NPS".into(),
            is_manual: true,
            ..Default::default()
        })
        .unwrap();
        db.create_dashboard_chart(&NewDashboardChart {
            id: Some("c1".into()),
            metric_id: "m1".into(),
            name: "Signups".into(),
            ..Default::default()
        })
        .unwrap();

        let (events, _) = broadcast::channel(64);
        let runner = PipelineRunner::new(
            DbHandle::new(db),
            events.clone(),
            Collaborators {
                connector: Arc::new(connector),
                generator: Arc::new(MockGenerator::default()),
                authorizer: Arc::new(OrganizationAuthorizer),
                invalidator: Arc::new(RecordingInvalidator::default()),
            },
            PipelineSettings::default(),
        );
        Arc::new(AppState { runner, events })
    }

    fn items() -> serde_json::Value {
        json!({"items": [{"created_at": "2026-05-01T08:00:00Z"}, {"created_at": "2026-05-01T09:00:00Z"}]})
    }

    fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(ORGANIZATION_HEADER, "org_1")
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = api_router().with_state(test_state(MockConnector::new(items())));
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_organization_is_unauthorized() {
        let app = api_router().with_state(test_state(MockConnector::new(items())));
        let request = Request::builder()
            .method("POST")
            .uri("/api/pipeline/m1/refresh")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains(ORGANIZATION_HEADER));
    }

    #[tokio::test]
    async fn test_refresh_accepted_then_conflict() {
        let (connector, gate) = MockConnector::gated(items());
        let state = test_state(connector);
        let app = api_router().with_state(state.clone());

        let response = app
            .clone()
            .oneshot(request("POST", "/api/pipeline/m1/refresh", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let started: TriggerResponse = body_json(response.into_body()).await;
        assert!(started.success && started.started);

        let response = app
            .clone()
            .oneshot(request("POST", "/api/pipeline/m1/regenerate", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/pipeline/m1/progress", Body::empty()))
            .await
            .unwrap();
        let progress: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(progress["isProcessing"], true);
        assert_eq!(progress["currentStep"], "fetching-api-data");

        gate.notify_one();
        state.runner.wait("m1").await;

        let response = app
            .oneshot(request("GET", "/api/pipeline/m1/transformers", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(info["dataPoints"]["count"], 1);
        assert!(info["ingestionTransformer"].is_object());
        assert!(info["chartTransformer"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_metric_is_not_found() {
        let app = api_router().with_state(test_state(MockConnector::new(items())));
        let response = app
            .oneshot(request("GET", "/api/pipeline/missing/progress", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_manual_metric_ingestion_is_bad_request() {
        let app = api_router().with_state(test_state(MockConnector::new(items())));
        let response = app
            .oneshot(request(
                "POST",
                "/api/pipeline/manual/regenerate-ingestion",
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_regenerate_chart_validates_body() {
        let app = api_router().with_state(test_state(MockConnector::new(items())));
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/pipeline/m1/regenerate-chart",
                Body::from(json!({"chartType": "donut"}).to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request: Invalid chart overrides"));

        // Valid overrides, but the metric has no points yet.
        let response = app
            .oneshot(request(
                "POST",
                "/api/pipeline/m1/regenerate-chart",
                Body::from(json!({"chartType": "bar", "cadence": "WEEKLY"}).to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("no data points"));
    }

    #[tokio::test]
    async fn test_dimensions_empty() {
        let app = api_router().with_state(test_state(MockConnector::new(items())));
        let response = app
            .oneshot(request("GET", "/api/pipeline/m1/dimensions", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let dims: Vec<String> = body_json(response.into_body()).await;
        assert!(dims.is_empty());
    }
}
