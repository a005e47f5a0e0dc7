//! Session: every manager of one identity plus its attached channels.
//!
//! Lifecycle: `Unhydrated → Hydrated → Disposed`. The manager set is fixed
//! once the session is shared (registration needs `&mut Session`); channels
//! come and go freely and never affect manager state.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use mirrorline_protocol::{
    ClientMessage, ErrorCode, ServerMessage, Snapshot, StateMap, SNAPSHOT_USER_KEY,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelSet};
use crate::dispatch::DispatchTable;
use crate::error::{DispatchError, EngineError, RpcError};
use crate::manager::{Args, Manager, Publisher};
use crate::serial::SerialGate;

/// Derives extra session-level snapshot keys from the base snapshot.
pub type SnapshotExtension = Box<dyn Fn(&Snapshot) -> StateMap + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Per-request deadline for RPC handlers (gate wait included)
    pub rpc_timeout: Option<Duration>,
}

struct ManagerEntry {
    name: Arc<str>,
    manager: Arc<dyn Manager>,
    gate: SerialGate,
}

struct Autosave {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct Session {
    user_id: String,
    options: SessionOptions,
    managers: Vec<ManagerEntry>,
    routes: DispatchTable,
    channels: Arc<ChannelSet>,
    hydration: OnceCell<()>,
    disposed: AtomicBool,
    extension: Option<SnapshotExtension>,
    autosave: Mutex<Option<Autosave>>,
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self::with_options(user_id, SessionOptions::default())
    }

    pub fn with_options(user_id: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            user_id: user_id.into(),
            options,
            managers: Vec::new(),
            routes: DispatchTable::default(),
            channels: Arc::new(ChannelSet::default()),
            hydration: OnceCell::new(),
            disposed: AtomicBool::new(false),
            extension: None,
            autosave: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Register a manager under `name`. `build` receives the manager's
    /// publisher; the built manager is returned for direct use.
    pub fn register_manager<M, F>(&mut self, name: &str, build: F) -> Result<Arc<M>, EngineError>
    where
        M: Manager,
        F: FnOnce(Publisher) -> M,
    {
        if self.routes.contains(name) || name == SNAPSHOT_USER_KEY {
            return Err(EngineError::DuplicateManager(name.to_string()));
        }
        if self.hydration.initialized() {
            return Err(EngineError::LateRegistration(name.to_string()));
        }

        let descriptor = M::descriptor();
        let name: Arc<str> = Arc::from(name);
        let publisher = Publisher::new(name.clone(), descriptor, self.channels.clone());
        let manager = Arc::new(build(publisher));

        self.routes.insert(&name, self.managers.len(), descriptor);
        self.managers.push(ManagerEntry {
            name,
            manager: manager.clone(),
            gate: SerialGate::new(),
        });
        Ok(manager)
    }

    pub fn set_snapshot_extension(&mut self, extension: SnapshotExtension) {
        self.extension = Some(extension);
    }

    /// Registered manager names, in registration order.
    pub fn manager_names(&self) -> Vec<&str> {
        self.managers.iter().map(|entry| &*entry.name).collect()
    }

    pub fn manager(&self, name: &str) -> Option<Arc<dyn Manager>> {
        self.managers
            .iter()
            .find(|entry| &*entry.name == name)
            .map(|entry| entry.manager.clone())
    }

    /// Hydrate every manager in registration order. Runs once; later or
    /// concurrent calls wait for the first and do nothing.
    pub async fn hydrate(&self) {
        self.hydration
            .get_or_init(|| async {
                let started = Instant::now();
                for entry in &self.managers {
                    match AssertUnwindSafe(entry.manager.hydrate()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(
                            component = "session",
                            event = "session.hydrate.manager_failed",
                            user_id = %self.user_id,
                            manager = %entry.name,
                            error = %e,
                            "Manager hydration failed, keeping defaults"
                        ),
                        Err(_) => warn!(
                            component = "session",
                            event = "session.hydrate.manager_panicked",
                            user_id = %self.user_id,
                            manager = %entry.name,
                            "Manager hydration panicked, keeping defaults"
                        ),
                    }
                }
                info!(
                    component = "session",
                    event = "session.hydrated",
                    user_id = %self.user_id,
                    managers = self.managers.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Session hydrated"
                );
            })
            .await;
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydration.initialized()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// `{ userId, <manager>: <state>, .. }` plus any extension keys.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            SNAPSHOT_USER_KEY.to_string(),
            Value::String(self.user_id.clone()),
        );
        for entry in &self.managers {
            snapshot.insert(entry.name.to_string(), Value::Object(entry.manager.state()));
        }

        if let Some(extend) = &self.extension {
            for (key, value) in extend(&snapshot) {
                if snapshot.contains_key(&key) {
                    warn!(
                        component = "session",
                        user_id = %self.user_id,
                        key = %key,
                        "Snapshot extension cannot replace a base key"
                    );
                    continue;
                }
                snapshot.insert(key, value);
            }
        }
        snapshot
    }

    /// Attach a channel: it receives `connected`, then a full snapshot, then
    /// live diffs. Returns false if the session is disposed or the channel
    /// is already closed.
    pub fn attach_channel(&self, channel: &Channel) -> bool {
        if self.is_disposed() {
            debug!(
                component = "session",
                user_id = %self.user_id,
                channel_id = channel.id(),
                "Refusing attach to disposed session"
            );
            return false;
        }
        if channel.send(ServerMessage::Connected).is_err() {
            return false;
        }

        // Diffs racing with the snapshot are held for this channel and
        // flushed right behind it.
        self.channels.insert_priming(channel.clone());
        // dispose() marks before it clears; seeing the mark here means the
        // clear may already have missed this channel.
        if self.is_disposed() {
            self.channels.remove(channel.id());
            return false;
        }
        let state = self.snapshot();
        self.channels
            .go_live(channel.id(), ServerMessage::Snapshot { state });

        info!(
            component = "session",
            event = "session.channel.attached",
            user_id = %self.user_id,
            channel_id = channel.id(),
            channels = self.channels.len(),
            "Channel attached"
        );
        self.channels.contains(channel.id())
    }

    pub fn detach_channel(&self, channel: &Channel) -> bool {
        let removed = self.channels.remove(channel.id());
        if removed {
            info!(
                component = "session",
                event = "session.channel.detached",
                user_id = %self.user_id,
                channel_id = channel.id(),
                channels = self.channels.len(),
                "Channel detached"
            );
        }
        removed
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Send a `state_change` for a declared field to every attached channel.
    pub fn broadcast_state_change(
        &self,
        manager: &str,
        field: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let descriptor = self
            .routes
            .descriptor(manager)
            .ok_or_else(|| DispatchError::UnknownManager(manager.to_string()))?;
        if !descriptor.has_field(field) {
            return Err(EngineError::UndeclaredField {
                manager: manager.to_string(),
                field: field.to_string(),
            });
        }
        self.channels.broadcast(&ServerMessage::StateChange {
            manager: manager.to_string(),
            property: field.to_string(),
            value,
        });
        Ok(())
    }

    /// Handle one raw inbound frame from `channel`.
    pub async fn handle_message(&self, channel: &Channel, raw: &str) {
        let msg: ClientMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    component = "session",
                    event = "session.message.parse_failed",
                    user_id = %self.user_id,
                    channel_id = channel.id(),
                    error = %e,
                    payload_bytes = raw.len(),
                    payload_preview = %truncate_for_log(raw, 240),
                    "Dropping malformed client message"
                );
                return;
            }
        };
        self.handle_client_message(channel, msg).await;
    }

    pub async fn handle_client_message(&self, channel: &Channel, msg: ClientMessage) {
        match msg {
            ClientMessage::RequestSnapshot => {
                let state = self.snapshot();
                let _ = channel.send(ServerMessage::Snapshot { state });
            }
            ClientMessage::RpcRequest {
                id,
                manager,
                method,
                args,
            } => {
                let response = match self.invoke(&manager, &method, Args::new(args)).await {
                    Ok(result) => ServerMessage::rpc_ok(id, result),
                    Err(err) => ServerMessage::rpc_err(id, err.message(), err.code()),
                };
                if channel.send(response).is_err() {
                    debug!(
                        component = "session",
                        user_id = %self.user_id,
                        channel_id = channel.id(),
                        manager = %manager,
                        method = %method,
                        "Requester gone before rpc_response"
                    );
                }
            }
            ClientMessage::Unknown => {
                debug!(
                    component = "session",
                    user_id = %self.user_id,
                    channel_id = channel.id(),
                    "Ignoring unrecognized message type"
                );
            }
        }
    }

    /// Resolve and run an exposed method. Exclusive methods wait for the
    /// manager's gate; handler panics become errors.
    pub async fn invoke(&self, manager: &str, method: &str, args: Args) -> Result<Value, RpcError> {
        let route = match self.routes.resolve(manager, method) {
            Ok(route) => route,
            Err(err) => {
                debug!(
                    component = "session",
                    event = "session.rpc.rejected",
                    user_id = %self.user_id,
                    error = %err,
                    "RPC rejected"
                );
                return Err(err.into());
            }
        };
        let entry = &self.managers[route.slot];

        // The handler owns its own task: a deadline abandons the response,
        // never a half-finished write.
        let target = entry.manager.clone();
        let gate = route.method.exclusive.then(|| entry.gate.clone());
        let name = method.to_string();
        let mut handler = tokio::spawn(async move {
            match gate {
                Some(gate) => gate.run(target.call(&name, args)).await,
                None => target.call(&name, args).await,
            }
        });

        let joined = match self.options.rpc_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, &mut handler).await {
                Ok(joined) => joined,
                Err(_) => {
                    info!(
                        component = "session",
                        event = "session.rpc.deadline_passed",
                        user_id = %self.user_id,
                        manager = %manager,
                        method = %method,
                        "RPC deadline passed, handler left to finish"
                    );
                    Ok(Err(RpcError::timed_out(manager, method)))
                }
            },
            None => handler.await,
        };

        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(RpcError::new(format!(
                "RPC handler panicked: {manager}.{method}"
            ))),
            Err(_) => Err(RpcError::new(format!(
                "RPC handler cancelled: {manager}.{method}"
            ))),
        };

        if let Err(err) = &result {
            let level_is_warn = !matches!(err.code(), ErrorCode::InvalidArgs);
            if level_is_warn {
                warn!(
                    component = "session",
                    event = "session.rpc.failed",
                    user_id = %self.user_id,
                    manager = %manager,
                    method = %method,
                    code = %err.code(),
                    error = %err,
                    "RPC handler failed"
                );
            } else {
                debug!(
                    component = "session",
                    event = "session.rpc.invalid_args",
                    user_id = %self.user_id,
                    manager = %manager,
                    method = %method,
                    error = %err,
                    "RPC called with invalid arguments"
                );
            }
        }
        result
    }

    /// Run `persist()` on every manager; failures are logged.
    /// Returns the number of managers that failed.
    ///
    /// Each persist holds the manager's gate, so it never interleaves with
    /// an exclusive RPC writing the same state.
    pub async fn persist_all(&self) -> usize {
        let mut failures = 0;
        for entry in &self.managers {
            if let Err(e) = entry.gate.run(entry.manager.persist()).await {
                failures += 1;
                warn!(
                    component = "session",
                    event = "session.persist.failed",
                    user_id = %self.user_id,
                    manager = %entry.name,
                    error = %e,
                    "Manager persist failed"
                );
            }
        }
        failures
    }

    /// Persist periodically until disposed. Replaces any running autosave.
    pub fn start_autosave(self: &Arc<Self>, period: Duration) {
        if period.is_zero() || self.is_disposed() {
            return;
        }

        let session = Arc::downgrade(self);
        let stop = Arc::new(Notify::new());
        let stop_rx = stop.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.notified() => break,
                }
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.persist_all().await;
            }
        });

        if let Some(previous) = self.autosave.lock().replace(Autosave { stop, task }) {
            previous.stop.notify_one();
        }
    }

    /// Persist every manager and drop all channels. Does not touch any
    /// registry. Calling it again only re-runs the persist pass.
    pub async fn dispose(&self) {
        let first = !self.disposed.swap(true, Ordering::AcqRel);

        let autosave = self.autosave.lock().take();
        if let Some(autosave) = autosave {
            autosave.stop.notify_one();
            // Let an in-flight save finish before the final pass.
            let _ = autosave.task.await;
        }

        let failures = self.persist_all().await;
        self.channels.clear();

        if first {
            info!(
                component = "session",
                event = "session.disposed",
                user_id = %self.user_id,
                persist_failures = failures,
                "Session disposed"
            );
        }
    }
}
