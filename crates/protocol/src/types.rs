//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which a snapshot carries the owning identity.
pub const SNAPSHOT_USER_KEY: &str = "userId";

/// Field name -> value, as produced by a manager's `state()`.
pub type StateMap = Map<String, Value>;

/// Full session state: `{ "userId": .., "<manager>": { "<field>": .. }, .. }`
pub type Snapshot = Map<String, Value>;

/// Category attached to a failed RPC next to its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownManager,
    MethodNotExposed,
    InvalidArgs,
    HandlerError,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownManager => "unknown_manager",
            ErrorCode::MethodNotExposed => "method_not_exposed",
            ErrorCode::InvalidArgs => "invalid_args",
            ErrorCode::HandlerError => "handler_error",
            ErrorCode::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure half of an `rpc_response`, as seen by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RpcFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::MethodNotExposed).expect("serialize");
        assert_eq!(json, "\"method_not_exposed\"");
        assert_eq!(ErrorCode::Timeout.to_string(), "timeout");
    }
}
