//! Error types for the ferroclaw domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; tool-call failures carry a
//! stable `kind` string because they are transcribed back to the model as
//! structured JSON and must stay recognizable across versions.

use serde_json::{json, Value};
use thiserror::Error;

/// The top-level error type for all ferroclaw operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Tool call error: {0}")]
    ToolCall(#[from] ToolCallError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Everything that can go wrong with a single tool call.
///
/// These are values, not exceptions: the fan-out collects one per call and
/// transcribes it for the model, so the enum is `Clone` and every variant
/// maps to a stable kind string via [`ToolCallError::kind`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolCallError {
    #[error("no such tool: {server}.{tool}")]
    NoSuchTool { server: String, tool: String },

    #[error("server '{0}' is not available")]
    ServerUnavailable(String),

    #[error("call to {server}.{tool} timed out after {timeout_secs}s")]
    CallTimeout {
        server: String,
        tool: String,
        timeout_secs: u64,
    },

    #[error("server '{0}' exited with the call in flight")]
    ServerCrashed(String),

    #[error("protocol error on server '{server}': {detail}")]
    ProtocolError { server: String, detail: String },

    #[error("tool reported error {code}: {message}")]
    RemoteError { code: i64, message: String },

    #[error("tool-call budget exhausted")]
    BudgetExceeded,
}

impl ToolCallError {
    /// Stable machine-readable kind, as shown to the model.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoSuchTool { .. } => "NoSuchTool",
            Self::ServerUnavailable(_) => "ServerUnavailable",
            Self::CallTimeout { .. } => "CallTimeout",
            Self::ServerCrashed(_) => "ServerCrashed",
            Self::ProtocolError { .. } => "ProtocolError",
            Self::RemoteError { .. } => "RemoteError",
            Self::BudgetExceeded => "BudgetExceeded",
        }
    }

    /// Render as the uniform synthetic tool-result payload:
    /// `{"error":{"kind":"...","message":"..."}}`.
    pub fn to_error_value(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

/// Failures from the LLM bridge.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("model backend unavailable: {0}")]
    ModelUnavailable(String),

    #[error("model refused the request: {0}")]
    ModelRefused(String),

    #[error("could not decode a plan from the model response: {0}")]
    MalformedPlan(String),
}

/// Failures from the conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("no tool servers configured (set TOOL_SERVER_1_CMD)")]
    NoToolServers,
}
