//! WebSocket transport: one socket is one channel on the user's session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::registry::SessionRegistry;
use crate::session::Session;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    user_id: String,
}

/// `/ws` for sessions plus `/health`.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(registry)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    let user_id = params.user_id.trim();
    if user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    }

    let session = match registry.get_or_create(user_id).await {
        Ok(session) => session,
        Err(e) => {
            error!(
                component = "websocket",
                event = "ws.session.create_failed",
                user_id = %user_id,
                error = %e,
                "Failed to create session"
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "session unavailable").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, session))
}

async fn handle_socket(socket: WebSocket, session: Arc<Session>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        user_id = %session.user_id(),
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (channel, mut outbound_rx) = Channel::new();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Bytes>();

    let send_task = tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match serde_json::to_string(&msg) {
                        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                        Err(e) => {
                            error!(
                                component = "websocket",
                                event = "ws.send.serialize_failed",
                                connection_id = conn_id,
                                error = %e,
                                "Failed to serialize server message"
                            );
                            continue;
                        }
                    }
                }
                data = pong_rx.recv() => {
                    let Some(data) = data else { break };
                    ws_tx.send(Message::Pong(data)).await
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    if !session.attach_channel(&channel) {
        warn!(
            component = "websocket",
            event = "ws.attach.refused",
            connection_id = conn_id,
            user_id = %session.user_id(),
            "Session refused channel"
        );
        send_task.abort();
        return;
    }

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = pong_tx.send(data);
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        // Each frame runs on its own task so a slow RPC never blocks the socket.
        let session = session.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            session.handle_message(&channel, text.as_str()).await;
        });
    }

    session.detach_channel(&channel);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        user_id = %session.user_id(),
        "WebSocket connection closed"
    );
    send_task.abort();
}
