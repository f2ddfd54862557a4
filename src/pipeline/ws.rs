use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::AppState;
use super::models::{RefreshStep, TaskKind};

const PING_INTERVAL: Duration = Duration::from_secs(30);

const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Sending half of the process-wide event channel. Payloads are serialized
/// `PipelineEvent`s.
pub type EventSender = broadcast::Sender<String>;

// ── Push events ──────────────────────────────────────────────────────

/// Events pushed to `/ws` subscribers. Polling `progress` stays the
/// authoritative view; these only save clients a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum PipelineEvent {
    RunStarted {
        metric_id: String,
        run_id: String,
        kind: TaskKind,
        step: RefreshStep,
    },
    StepStarted {
        metric_id: String,
        run_id: String,
        step: RefreshStep,
    },
    RunCompleted {
        metric_id: String,
        run_id: String,
        kind: TaskKind,
    },
    RunFailed {
        metric_id: String,
        run_id: String,
        kind: TaskKind,
        error: String,
    },
    CacheInvalidated {
        tags: Vec<String>,
        /// Second, delayed notification for eventually consistent readers.
        delayed: bool,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    let rx = state.events.subscribe();
    tracing::debug!("WebSocket client connected");
    run_socket_loop(sender, receiver, rx).await;
    tracing::debug!("WebSocket client disconnected");
}

async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "WebSocket client lagging, events dropped");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

pub fn broadcast_event(tx: &EventSender, event: &PipelineEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            // No subscribers is not an error.
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize pipeline event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failed_serialization() {
        let event = PipelineEvent::RunFailed {
            metric_id: "m1".into(),
            run_id: "r1".into(),
            kind: TaskKind::HardRefresh,
            error: "upstream 500".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"RunFailed\""));
        assert!(json.contains("\"metricId\":\"m1\""));
        assert!(json.contains("\"kind\":\"hard-refresh\""));
    }

    #[test]
    fn test_step_started_round_trip() {
        let event = PipelineEvent::StepStarted {
            metric_id: "m1".into(),
            run_id: "r1".into(),
            step: RefreshStep::SavingChartConfig,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"step\":\"saving-chart-config\""));
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_broadcast_event_reaches_subscribers() {
        let (tx, mut rx) = broadcast::channel(4);
        broadcast_event(
            &tx,
            &PipelineEvent::CacheInvalidated {
                tags: vec!["dashboard_org_1".into()],
                delayed: false,
            },
        );
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("CacheInvalidated"));
        assert!(msg.contains("dashboard_org_1"));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let (tx, rx) = broadcast::channel::<String>(4);
        drop(rx);
        broadcast_event(
            &tx,
            &PipelineEvent::RunCompleted {
                metric_id: "m1".into(),
                run_id: "r1".into(),
                kind: TaskKind::SoftRefresh,
            },
        );
    }
}
