//! Local, read-only copy of a session's state plus RPC stubs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use mirrorline_protocol::{
    new_id, rpc_outcome, ClientMessage, RpcFailure, ServerMessage, Snapshot,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::debug;

use crate::connection::MirrorConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("not connected")]
    NotConnected,

    #[error("RPC timed out: {manager}.{method}")]
    Timeout { manager: String, method: String },

    #[error(transparent)]
    Rpc(#[from] RpcFailure),

    /// The mirror shut down before the response arrived.
    #[error("mirror closed")]
    Closed,
}

type PendingReply = oneshot::Sender<Result<Value, RpcFailure>>;

pub struct Mirror {
    endpoint: String,
    user_id: String,
    pub(crate) config: MirrorConfig,
    state: RwLock<Snapshot>,
    version: watch::Sender<u64>,
    connected: watch::Sender<bool>,
    pending: Mutex<HashMap<String, PendingReply>>,
    outbound: ArcSwapOption<mpsc::UnboundedSender<ClientMessage>>,
    pub(crate) wake: Notify,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl Mirror {
    pub(crate) fn new(endpoint: &str, user_id: &str, config: MirrorConfig) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            user_id: user_id.to_string(),
            config,
            state: RwLock::new(Snapshot::new()),
            version: watch::Sender::new(0),
            connected: watch::Sender::new(false),
            pending: Mutex::new(HashMap::new()),
            outbound: ArcSwapOption::empty(),
            wake: Notify::new(),
            shutdown: watch::Sender::new(false),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Follows connect/disconnect transitions.
    pub fn watch_connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Monotonic counter bumped on every applied state message.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Copy of the whole mirrored snapshot.
    pub fn state(&self) -> Snapshot {
        self.state.read().clone()
    }

    pub fn manager(self: &Arc<Self>, name: &str) -> ManagerMirror {
        ManagerMirror {
            mirror: self.clone(),
            name: name.to_string(),
        }
    }

    /// Skip the remaining reconnect backoff, or drop a live transport and
    /// reconnect at once.
    pub fn reconnect(&self) {
        self.wake.notify_one();
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn transport_up(&self, outbound: mpsc::UnboundedSender<ClientMessage>) {
        self.outbound.store(Some(Arc::new(outbound)));
        self.connected.send_replace(true);
    }

    pub(crate) fn transport_down(&self) {
        self.outbound.store(None);
        self.connected.send_replace(false);
    }

    /// Drop every pending call; their callers see `MirrorError::Closed`.
    pub(crate) fn abandon_pending(&self) {
        self.pending.lock().clear();
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    pub(crate) fn apply(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Connected => self.bump(),
            ServerMessage::Snapshot { state } => {
                *self.state.write() = state;
                self.bump();
            }
            ServerMessage::StateChange {
                manager,
                property,
                value,
            } => {
                {
                    let mut state = self.state.write();
                    let slot = state
                        .entry(manager)
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !slot.is_object() {
                        *slot = Value::Object(Map::new());
                    }
                    if let Value::Object(fields) = slot {
                        fields.insert(property, value);
                    }
                }
                self.bump();
            }
            ServerMessage::RpcResponse {
                id,
                result,
                error,
                code,
            } => {
                let reply = self.pending.lock().remove(&id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(rpc_outcome(result, error, code));
                    }
                    None => debug!(
                        component = "mirror",
                        event = "mirror.rpc.unmatched_response",
                        request_id = %id,
                        "Response for unknown request id"
                    ),
                }
            }
        }
    }

    /// Send an `rpc_request` and wait for its response.
    pub async fn call(
        &self,
        manager: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, MirrorError> {
        let outbound = self.outbound.load_full().ok_or(MirrorError::NotConnected)?;

        let id = new_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), reply_tx);
        // Removes the entry however this future ends, dropped callers included.
        let _pending = PendingGuard { mirror: self, id: &id };

        let request = ClientMessage::RpcRequest {
            id: id.clone(),
            manager: manager.to_string(),
            method: method.to_string(),
            args,
        };
        if outbound.send(request).is_err() {
            return Err(MirrorError::NotConnected);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(MirrorError::Timeout {
                        manager: manager.to_string(),
                        method: method.to_string(),
                    })
                }
            },
            None => reply_rx.await,
        };

        match outcome {
            Ok(result) => result.map_err(MirrorError::from),
            Err(_) => Err(MirrorError::Closed),
        }
    }
}

struct PendingGuard<'a> {
    mirror: &'a Mirror,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.mirror.pending.lock().remove(self.id);
    }
}

/// One manager's slice of the mirror.
#[derive(Clone)]
pub struct ManagerMirror {
    mirror: Arc<Mirror>,
    name: String,
}

/// What a member name resolves to on a manager mirror.
pub enum Member {
    Field(Value),
    Method(RpcStub),
}

impl ManagerMirror {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mirrored value of `field`, without a round trip.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.mirror
            .state
            .read()
            .get(&self.name)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    /// All mirrored fields of this manager.
    pub fn fields(&self) -> Option<Map<String, Value>> {
        match self.mirror.state.read().get(&self.name) {
            Some(Value::Object(fields)) => Some(fields.clone()),
            _ => None,
        }
    }

    /// Known fields read locally; anything else is treated as a method.
    pub fn member(&self, name: &str) -> Member {
        match self.get(name) {
            Some(value) => Member::Field(value),
            None => Member::Method(self.method(name)),
        }
    }

    pub fn method(&self, name: &str) -> RpcStub {
        RpcStub {
            mirror: self.mirror.clone(),
            manager: self.name.clone(),
            method: name.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RpcStub {
    mirror: Arc<Mirror>,
    manager: String,
    method: String,
}

impl RpcStub {
    /// Call using the mirror's configured timeout.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, MirrorError> {
        let timeout = self.mirror.config.rpc_timeout;
        self.mirror
            .call(&self.manager, &self.method, args, timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, MirrorError> {
        self.mirror
            .call(&self.manager, &self.method, args, Some(timeout))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorline_protocol::ErrorCode;
    use serde_json::json;

    fn mirror() -> Arc<Mirror> {
        Arc::new(Mirror::new(
            "ws://127.0.0.1:1",
            "alice",
            MirrorConfig::default(),
        ))
    }

    fn snapshot(value: Value) -> ServerMessage {
        match value {
            Value::Object(state) => ServerMessage::Snapshot { state },
            _ => panic!("snapshot must be an object"),
        }
    }

    #[test]
    fn snapshot_replaces_and_changes_merge() {
        let mirror = mirror();
        mirror.apply(snapshot(json!({
            "userId": "alice",
            "counter": {"value": 1},
            "stale": {"x": 1}
        })));
        mirror.apply(ServerMessage::StateChange {
            manager: "counter".into(),
            property: "value".into(),
            value: json!(2),
        });
        mirror.apply(ServerMessage::StateChange {
            manager: "notes".into(),
            property: "notes".into(),
            value: json!([]),
        });

        let counter = mirror.manager("counter");
        assert_eq!(counter.get("value"), Some(json!(2)));
        assert_eq!(mirror.manager("notes").get("notes"), Some(json!([])));
        assert_eq!(mirror.version(), 3);

        mirror.apply(snapshot(json!({"userId": "alice", "counter": {"value": 9}})));
        assert_eq!(counter.get("value"), Some(json!(9)));
        assert!(mirror.state().get("stale").is_none());
        assert!(mirror.manager("notes").fields().is_none());
    }

    #[test]
    fn members_resolve_to_fields_or_methods() {
        let mirror = mirror();
        mirror.apply(snapshot(json!({"counter": {"value": 3}})));
        let counter = mirror.manager("counter");

        assert!(matches!(counter.member("value"), Member::Field(v) if v == json!(3)));
        assert!(matches!(counter.member("increment"), Member::Method(_)));
    }

    #[tokio::test]
    async fn calls_without_transport_fail_fast() {
        let mirror = mirror();
        let err = mirror
            .manager("counter")
            .method("increment")
            .call(vec![json!(1)])
            .await
            .expect_err("no transport");
        assert_eq!(err, MirrorError::NotConnected);
        assert_eq!(mirror.pending_calls(), 0);
    }

    fn request_id(msg: ClientMessage) -> String {
        match msg {
            ClientMessage::RpcRequest { id, .. } => id,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn responses_resolve_the_matching_call() {
        let mirror = mirror();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mirror.transport_up(tx);
        assert!(mirror.is_connected());

        let stub = mirror.manager("counter").method("increment");
        let call = tokio::spawn(async move { stub.call(vec![json!(5)]).await });

        let id = request_id(rx.recv().await.unwrap());
        mirror.apply(ServerMessage::rpc_ok("someone-else", json!(0)));
        mirror.apply(ServerMessage::rpc_ok(id, json!(5)));

        assert_eq!(call.await.unwrap(), Ok(json!(5)));
        assert_eq!(mirror.pending_calls(), 0);
    }

    #[tokio::test]
    async fn error_responses_carry_message_and_code() {
        let mirror = mirror();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mirror.transport_up(tx);

        let stub = mirror.manager("ghost").method("run");
        let call = tokio::spawn(async move { stub.call(vec![]).await });
        let id = request_id(rx.recv().await.unwrap());
        mirror.apply(ServerMessage::rpc_err(
            id,
            "Unknown manager: ghost",
            ErrorCode::UnknownManager,
        ));

        match call.await.unwrap() {
            Err(MirrorError::Rpc(failure)) => {
                assert_eq!(failure.message, "Unknown manager: ghost");
                assert_eq!(failure.code, Some(ErrorCode::UnknownManager));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn pending_calls_survive_disconnect_until_timeout() {
        let mirror = mirror();
        let (tx, _rx) = mpsc::unbounded_channel();
        mirror.transport_up(tx);

        let stub = mirror.manager("counter").method("increment");
        let call = tokio::spawn(async move {
            stub.call_with_timeout(vec![], Duration::from_millis(50)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mirror.transport_down();
        assert_eq!(mirror.pending_calls(), 1);

        assert_eq!(
            call.await.unwrap(),
            Err(MirrorError::Timeout {
                manager: "counter".into(),
                method: "increment".into()
            })
        );
        assert_eq!(mirror.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropped_call_leaves_nothing_pending() {
        let mirror = mirror();
        let (tx, _rx) = mpsc::unbounded_channel();
        mirror.transport_up(tx);

        let stub = mirror.manager("counter").method("increment");
        let call = tokio::spawn(async move { stub.call(vec![]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mirror.pending_calls(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(mirror.pending_calls(), 0);
    }

    #[tokio::test]
    async fn abandoned_calls_report_closed() {
        let mirror = mirror();
        let (tx, _rx) = mpsc::unbounded_channel();
        mirror.transport_up(tx);

        let stub = mirror.manager("counter").method("reset");
        let call = tokio::spawn(async move { stub.call(vec![]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mirror.abandon_pending();

        assert_eq!(call.await.unwrap(), Err(MirrorError::Closed));
    }
}
