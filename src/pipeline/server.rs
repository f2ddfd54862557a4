use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::auth::OrganizationAuthorizer;
use super::cache::BroadcastInvalidator;
use super::connector::NangoConnector;
use super::db::{DbHandle, PipelineDb};
use super::generator::HttpTransformerGenerator;
use super::orchestrator::{Collaborators, PipelineRunner, PipelineSettings};
use super::ws;

/// Everything `start_server` needs, already resolved from file, env and CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub nango_base_url: String,
    pub nango_secret_key: String,
    pub connector_timeout: Option<Duration>,
    pub generator_base_url: String,
    pub generator_api_key: Option<String>,
    pub generator_timeout: Option<Duration>,
    /// Delay before dashboard caches are invalidated a second time.
    pub cache_resend_after: Option<Duration>,
    pub pipeline: PipelineSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4180,
            db_path: PathBuf::from(".metricflow/metricflow.db"),
            dev_mode: false,
            nango_base_url: "https://api.nango.dev".to_string(),
            nango_secret_key: String::new(),
            connector_timeout: Some(Duration::from_secs(30)),
            generator_base_url: "http://127.0.0.1:4181".to_string(),
            generator_api_key: None,
            generator_timeout: Some(Duration::from_secs(120)),
            cache_resend_after: Some(Duration::from_millis(5000)),
            pipeline: PipelineSettings::default(),
        }
    }
}

/// Build the full application router: RPC routes plus the event socket.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the pipeline server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = PipelineDb::new(&config.db_path).context("Failed to initialize pipeline database")?;
    let db = DbHandle::new(db);
    let (events, _rx) = broadcast::channel::<String>(256);

    if config.nango_secret_key.is_empty() {
        tracing::warn!("No Nango secret key configured; provider fetches will be rejected");
    }
    let connector = NangoConnector::new(
        &config.nango_base_url,
        &config.nango_secret_key,
        config.connector_timeout,
    )?;
    let generator = HttpTransformerGenerator::new(
        &config.generator_base_url,
        config.generator_api_key.clone(),
        config.generator_timeout,
    )?;
    let runner = PipelineRunner::new(
        db,
        events.clone(),
        Collaborators {
            connector: Arc::new(connector),
            generator: Arc::new(generator),
            authorizer: Arc::new(OrganizationAuthorizer),
            invalidator: Arc::new(BroadcastInvalidator::new(
                events.clone(),
                config.cache_resend_after,
            )),
        },
        config.pipeline.clone(),
    );
    runner
        .recover_interrupted()
        .await
        .context("Failed to reset interrupted pipeline runs")?;

    let state = Arc::new(AppState {
        runner: runner.clone(),
        events,
    });

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db_path = %config.db_path.display(), "Metric pipeline server listening");
    println!("metricflow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    runner.shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
