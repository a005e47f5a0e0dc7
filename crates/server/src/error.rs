//! Engine error types

use mirrorline_protocol::ErrorCode;
use thiserror::Error;

/// Programmer and lifecycle errors raised by the engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Manager already registered: {0}")]
    DuplicateManager(String),

    #[error("Manager registered after hydration: {0}")]
    LateRegistration(String),

    #[error("Field not declared: {manager}.{field}")]
    UndeclaredField { manager: String, field: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Failed to build session for {user_id}: {source}")]
    Build {
        user_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Resolution failures for an incoming `rpc_request`.
///
/// The `Display` text is what goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown manager: {0}")]
    UnknownManager(String),

    #[error("Method not exposed: {manager}.{method}")]
    MethodNotExposed { manager: String, method: String },
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::UnknownManager(_) => ErrorCode::UnknownManager,
            DispatchError::MethodNotExposed { .. } => ErrorCode::MethodNotExposed,
        }
    }
}

/// Error returned by an RPC method body. Only the message crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RpcError {
    message: String,
    code: ErrorCode,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::HandlerError,
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::InvalidArgs,
        }
    }

    pub fn timed_out(manager: &str, method: &str) -> Self {
        Self {
            message: format!("RPC timed out: {manager}.{method}"),
            code: ErrorCode::Timeout,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<DispatchError> for RpcError {
    fn from(err: DispatchError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        // Top-level message only; context chains and backtraces stay server-side.
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<crate::store::StoreError> for RpcError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::new(err.to_string())
    }
}
