//! Change feed (`/realtime/v1/{table}`).
//!
//! A WebSocket that receives every [`ChangeEvent`](site_common::ChangeEvent)
//! for one table as a JSON text frame. The feed is read-only; anything the
//! client sends besides ping/close is ignored.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt as FuturesStreamExt};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt as TokioStreamExt;

use site_common::Table;

use crate::error::ApiError;
use crate::AppState;

/// GET /realtime/v1/{table}
async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> Response {
    let Some(table) = Table::from_name(&table) else {
        return ApiError::NotFound(format!("relation \"{}\" does not exist", table)).into_response();
    };
    ws.on_upgrade(move |socket| stream_changes(socket, state, table))
}

async fn stream_changes(socket: WebSocket, state: Arc<AppState>, table: Table) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = BroadcastStream::new(state.records.subscribe());

    tracing::debug!("Change feed subscriber connected for {}", table);

    let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(event) = TokioStreamExt::next(&mut events) => {
                match event {
                    Ok(event) if event.table == table => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("Failed to encode change event: {}", e);
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        tracing::warn!("Change feed subscriber for {} lagged, skipped {} events", table, n);
                    }
                }
            }

            Some(msg) = FuturesStreamExt::next(&mut ws_rx) => {
                match msg {
                    Ok(Message::Ping(data)) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Change feed socket error: {}", e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }

            else => break,
        }
    }

    tracing::debug!("Change feed subscriber for {} disconnected", table);
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/:table", get(subscribe))
        .with_state(state)
}
