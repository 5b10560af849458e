use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::handlers::AppState;
use crate::router::{EventKind, RoutedEvent};
use crate::types::RunId;

#[derive(Deserialize)]
pub struct WsQuery {
    pub run_id: Option<RunId>,
    /// Streaming chunks are skipped unless requested.
    #[serde(default)]
    pub chunks: bool,
}

impl WsQuery {
    fn wants(&self, event: &RoutedEvent) -> bool {
        if event.kind == EventKind::StreamingResult && !self.chunks {
            return false;
        }
        self.run_id.map_or(true, |id| event.payload.run_id() == id)
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state, query))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, query: WsQuery) {
    let events = BroadcastStream::new(state.events_tx.subscribe());
    let (mut sender, mut receiver) = socket.split();
    info!(run_id = ?query.run_id, "WebSocket connected");

    let progress = match query.run_id {
        Some(id) => state.orchestrator.progress(id),
        None => state.orchestrator.get_progress(),
    };
    let snapshot = serde_json::json!({
        "event": "snapshot",
        "active_run": state.orchestrator.active_run(),
        "progress": progress.ok(),
    });
    let snapshot_json = serde_json::to_string(&snapshot).unwrap_or_default();
    if sender.send(Message::Text(snapshot_json)).await.is_err() {
        return;
    }

    let send_task = tokio::spawn(async move {
        let mut events = events;
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    debug!("WebSocket lagged by {} events", n);
                    continue;
                }
            };
            if !query.wants(&event) {
                continue;
            }
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(_) => continue,
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender
            .send(Message::Text(r#"{"event":"stream_closed"}"#.to_string()))
            .await;
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{EventPayload, Subject};
    use chrono::Utc;

    fn event(kind: EventKind, run_id: RunId) -> RoutedEvent {
        RoutedEvent {
            seq: 1,
            subject: Subject::Run(run_id),
            kind,
            emitted_at: Utc::now(),
            payload: EventPayload::Dropped {
                run_id,
                model: "m".into(),
                task_id: "t".into(),
            },
        }
    }

    #[test]
    fn test_query_filters_by_run_and_chunks() {
        let all = WsQuery {
            run_id: None,
            chunks: false,
        };
        assert!(all.wants(&event(EventKind::Dropped, 3)));
        assert!(!all.wants(&event(EventKind::StreamingResult, 3)));

        let one = WsQuery {
            run_id: Some(2),
            chunks: true,
        };
        assert!(one.wants(&event(EventKind::StreamingResult, 2)));
        assert!(!one.wants(&event(EventKind::Dropped, 3)));
    }
}
