//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every attach
    Connected,

    // Full state sync
    Snapshot {
        state: Snapshot,
    },

    // Incremental updates
    StateChange {
        manager: String,
        property: String,
        value: Value,
    },

    // RPC
    RpcResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl ServerMessage {
    /// Successful response. A `null` result is still sent as `"result": null`.
    pub fn rpc_ok(id: impl Into<String>, result: Value) -> Self {
        ServerMessage::RpcResponse {
            id: id.into(),
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn rpc_err(id: impl Into<String>, error: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::RpcResponse {
            id: id.into(),
            result: None,
            error: Some(error.into()),
            code: Some(code),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected => "connected",
            ServerMessage::Snapshot { .. } => "snapshot",
            ServerMessage::StateChange { .. } => "state_change",
            ServerMessage::RpcResponse { .. } => "rpc_response",
        }
    }
}

/// Collapse the `result`/`error` pair of a response into a `Result`.
///
/// `"result": null` deserializes to `None`, so a missing error always means
/// success with `Value::Null` as the fallback.
pub fn rpc_outcome(
    result: Option<Value>,
    error: Option<String>,
    code: Option<ErrorCode>,
) -> Result<Value, RpcFailure> {
    match error {
        Some(message) => Err(RpcFailure { message, code }),
        None => Ok(result.unwrap_or(Value::Null)),
    }
}
