//! Transport loop: connect, pump frames, reconnect after a fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mirrorline_protocol::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::mirror::Mirror;

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Delay before reconnecting after the transport drops
    pub reconnect_backoff: Duration,
    /// Default deadline for `RpcStub::call`; `None` waits forever.
    pub rpc_timeout: Option<Duration>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(1),
            rpc_timeout: None,
        }
    }
}

/// `ws://host:port` or `ws://host:port/ws` → `.../ws?user_id=<id>`
pub(crate) fn connect_url(endpoint: &str, user_id: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    let path = if base.ends_with("/ws") { "" } else { "/ws" };
    format!("{base}{path}?user_id={}", urlencoding::encode(user_id))
}

enum Exit {
    Dropped,
    Reconnect,
    Shutdown,
}

impl Mirror {
    /// Create a mirror and start its transport loop.
    pub fn spawn(endpoint: &str, user_id: &str, config: MirrorConfig) -> Arc<Mirror> {
        let mirror = Arc::new(Mirror::new(endpoint, user_id, config));
        tokio::spawn(run(mirror.clone()));
        mirror
    }

    /// Close the transport for good. Pending calls report `Closed`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn run(mirror: Arc<Mirror>) {
    let url = connect_url(mirror.endpoint(), mirror.user_id());
    let mut shutdown = mirror.shutdown.subscribe();

    while !mirror.is_shut_down() {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!(
                    component = "mirror",
                    event = "mirror.connected",
                    user_id = %mirror.user_id(),
                    "Transport connected"
                );
                let exit = pump(&mirror, socket).await;
                mirror.transport_down();
                match exit {
                    Exit::Shutdown => break,
                    // Forced reconnects skip the backoff.
                    Exit::Reconnect => continue,
                    Exit::Dropped => info!(
                        component = "mirror",
                        event = "mirror.disconnected",
                        user_id = %mirror.user_id(),
                        pending = mirror.pending_calls(),
                        "Transport closed, reconnecting after backoff"
                    ),
                }
            }
            Err(e) => warn!(
                component = "mirror",
                event = "mirror.connect_failed",
                user_id = %mirror.user_id(),
                error = %e,
                "Connect failed"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(mirror.config.reconnect_backoff) => {}
            _ = mirror.wake.notified() => {}
            _ = stopped(&mut shutdown) => break,
        }
    }

    mirror.transport_down();
    mirror.abandon_pending();
    debug!(
        component = "mirror",
        event = "mirror.stopped",
        user_id = %mirror.user_id(),
        "Transport loop stopped"
    );
}

async fn pump<S>(mirror: &Mirror, socket: S) -> Exit
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message>
        + Unpin,
{
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
    mirror.transport_up(outbound_tx);
    let mut shutdown = mirror.shutdown.subscribe();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(msg) = outgoing else { return Exit::Dropped };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(
                            component = "mirror",
                            error = %e,
                            "Failed to serialize client message"
                        );
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    return Exit::Dropped;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(msg) => mirror.apply(msg),
                            Err(e) => warn!(
                                component = "mirror",
                                event = "mirror.message.parse_failed",
                                error = %e,
                                payload_bytes = text.len(),
                                "Dropping malformed server message"
                            ),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            return Exit::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            component = "mirror",
                            error = %e,
                            "Transport error"
                        );
                        return Exit::Dropped;
                    }
                }
            }
            _ = mirror.wake.notified() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Exit::Reconnect;
            }
            _ = stopped(&mut shutdown) => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Exit::Shutdown;
            }
        }
    }
}
