//! Worker list route + the worker WebSocket transport (spec.md §6;
//! `coordinator/api/workers.py`'s `websocket_endpoint`). The axum mechanics
//! (`WebSocketUpgrade::on_upgrade`, text/close frame handling) are the only
//! ones in the example pack, from golem's debugging-service websocket
//! handler; the message-dispatch semantics come from the Python original.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use async_trait::async_trait;
use conduit_core::{CoordinatorMessage, Worker, WorkerMessage};
use conduit_engine::{ConnectionSink, SendError};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workers", get(list_workers))
        .route("/workers/:worker_id", get(worker_socket))
        .with_state(state)
}

/// GET /workers
pub async fn list_workers(State(state): State<AppState>) -> Json<Vec<Worker>> {
    Json(state.store.list_workers().await)
}

/// GET /workers/:worker_id — upgrades to a WebSocket, the worker's single
/// long-lived connection for its entire registered lifetime (spec.md §6:
/// the worker id is the final path segment).
pub async fn worker_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, worker_id))
}

struct AxumSink(Mutex<futures::stream::SplitSink<WebSocket, Message>>);

#[async_trait]
impl ConnectionSink for AxumSink {
    async fn send(&self, message: CoordinatorMessage) -> Result<(), SendError> {
        let text = serde_json::to_string(&message).map_err(|e| SendError(e.to_string()))?;
        self.0
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| SendError(e.to_string()))
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, worker_id: String) {
    let (sink_half, mut stream_half) = socket.split();
    let sink: Arc<dyn ConnectionSink> = Arc::new(AxumSink(Mutex::new(sink_half)));
    state.registry.connect(&worker_id, sink.clone()).await;

    while let Some(frame) = stream_half.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%worker_id, %err, "websocket read error");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                let message: Result<WorkerMessage, _> = serde_json::from_str(&text);
                match message {
                    Ok(message) => {
                        if let Some(ack) = state.registry.handle_message(&worker_id, message).await {
                            let _ = ConnectionSink::send(&*sink, ack).await;
                        }
                    }
                    Err(err) => {
                        warn!(%worker_id, %err, "ignoring malformed worker frame");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(%worker_id, "worker disconnected");
    state.registry.disconnect(&worker_id).await;
}
