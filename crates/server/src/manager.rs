//! Managers: named slices of session state plus remotely callable methods.
//!
//! A manager declares its synced fields and RPC methods once per type in a
//! `static ManagerDescriptor`. Field writes go through the `Publisher` it was
//! built with, which compares old and new values and broadcasts a
//! `state_change` before the write returns.

use std::sync::Arc;

use async_trait::async_trait;
use mirrorline_protocol::{ServerMessage, StateMap};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::channel::ChannelSet;
use crate::error::{EngineError, RpcError};

/// One remotely callable method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcMethod {
    pub name: &'static str,
    /// Runs under the manager's `SerialGate`.
    pub exclusive: bool,
}

impl RpcMethod {
    pub const fn shared(name: &'static str) -> Self {
        Self {
            name,
            exclusive: false,
        }
    }

    pub const fn exclusive(name: &'static str) -> Self {
        Self {
            name,
            exclusive: true,
        }
    }
}

/// Static, per-type declaration of synced fields and RPC methods.
#[derive(Debug)]
pub struct ManagerDescriptor {
    fields: &'static [&'static str],
    methods: &'static [RpcMethod],
}

impl ManagerDescriptor {
    pub const fn new(fields: &'static [&'static str], methods: &'static [RpcMethod]) -> Self {
        Self { fields, methods }
    }

    pub fn fields(&self) -> &'static [&'static str] {
        self.fields
    }

    pub fn methods(&self) -> &'static [RpcMethod] {
        self.methods
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| *f == field)
    }

    pub fn method(&self, name: &str) -> Option<&'static RpcMethod> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Positional RPC arguments, exactly as they arrived on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Required argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self
            .0
            .get(index)
            .ok_or_else(|| RpcError::invalid_args(format!("Missing argument {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| RpcError::invalid_args(format!("Invalid argument {index}: {e}")))
    }

    /// Optional argument; absent and `null` both map to `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, RpcError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Narrow broadcast capability handed to a manager at construction.
#[derive(Clone)]
pub struct Publisher {
    manager: Arc<str>,
    descriptor: &'static ManagerDescriptor,
    channels: Arc<ChannelSet>,
}

impl Publisher {
    pub(crate) fn new(
        manager: Arc<str>,
        descriptor: &'static ManagerDescriptor,
        channels: Arc<ChannelSet>,
    ) -> Self {
        Self {
            manager,
            descriptor,
            channels,
        }
    }

    /// A publisher attached to no session; writes are observed by nobody.
    pub fn detached(manager: &str, descriptor: &'static ManagerDescriptor) -> Self {
        Self::new(Arc::from(manager), descriptor, Arc::new(ChannelSet::default()))
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    /// Write `value` into `slot`. Returns whether the value changed.
    ///
    /// A change to a declared field is broadcast before this returns. Writes
    /// to undeclared fields are applied but never broadcast.
    pub fn assign<T>(&self, field: &str, slot: &mut T, value: T) -> bool
    where
        T: PartialEq + Serialize,
    {
        if *slot == value {
            return false;
        }
        *slot = value;
        self.notify(field, slot);
        true
    }

    /// Mutate `slot` in place and always report the field as changed.
    pub fn update<T, R>(&self, field: &str, slot: &mut T, mutate: impl FnOnce(&mut T) -> R) -> R
    where
        T: Serialize,
    {
        let out = mutate(slot);
        self.notify(field, slot);
        out
    }

    /// Broadcast an explicit value for a declared field.
    pub fn publish(&self, field: &str, value: Value) -> Result<(), EngineError> {
        if !self.descriptor.has_field(field) {
            return Err(EngineError::UndeclaredField {
                manager: self.manager.to_string(),
                field: field.to_string(),
            });
        }
        self.channels.broadcast(&ServerMessage::StateChange {
            manager: self.manager.to_string(),
            property: field.to_string(),
            value,
        });
        Ok(())
    }

    fn notify<T: Serialize>(&self, field: &str, value: &T) {
        if !self.descriptor.has_field(field) {
            trace!(
                component = "manager",
                manager = %self.manager,
                field,
                "Write to undeclared field, not broadcast"
            );
            return;
        }
        match serde_json::to_value(value) {
            Ok(value) => {
                // Declared, so this cannot fail.
                let _ = self.publish(field, value);
            }
            Err(e) => warn!(
                component = "manager",
                event = "manager.serialize_failed",
                manager = %self.manager,
                field,
                error = %e,
                "Failed to serialize field, change not broadcast"
            ),
        }
    }
}

/// A stateful unit owned by a session.
///
/// Implementations keep their fields behind interior mutability and write
/// them through their `Publisher`. Locks guarding fields must not be held
/// across an `.await`.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// The type's descriptor; read once at registration.
    fn descriptor() -> &'static ManagerDescriptor
    where
        Self: Sized;

    /// Current value of every synced field. Must not fail or block.
    fn state(&self) -> StateMap;

    /// Load initial values. Errors are logged by the session and the
    /// manager keeps its defaults.
    async fn hydrate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Flush pending state. Must be safe to call repeatedly.
    async fn persist(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run an exposed method. Only reached for names in the descriptor.
    async fn call(&self, method: &str, args: Args) -> Result<Value, RpcError>;
}
