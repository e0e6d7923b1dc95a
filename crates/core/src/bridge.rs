//! Bridge trait — the abstraction over LLM backends.
//!
//! A Bridge submits a transcript plus tool declarations to a generative
//! model and returns a [`Plan`]: either a set of tool calls to execute or a
//! final natural-language answer. The bridge is the only component aware of
//! the model's wire format; the planner sees the polymorphic result only.

use crate::error::BridgeError;
use crate::message::Transcript;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Separator between server and tool in bridge-facing call names.
///
/// Tool names themselves may contain single underscores, so the separator
/// is doubled and split on the first occurrence.
pub const CALL_NAME_SEPARATOR: &str = "__";

/// A tool declaration sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Qualified name, `server__tool`
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A tool call requested by the model, not yet dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCall {
    pub server: String,
    pub tool: String,
    pub params: serde_json::Value,
}

impl PlannedCall {
    /// The qualified name the model used to request this call.
    pub fn qualified_name(&self) -> String {
        format!("{}{}{}", self.server, CALL_NAME_SEPARATOR, self.tool)
    }
}

/// Split a qualified call name back into `(server, tool)`.
pub fn split_call_name(name: &str) -> Option<(&str, &str)> {
    let idx = name.find(CALL_NAME_SEPARATOR)?;
    let (server, rest) = name.split_at(idx);
    let tool = &rest[CALL_NAME_SEPARATOR.len()..];
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// What the planner submits to the bridge each iteration.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    /// System directive describing the workflow and error conventions
    pub system: String,

    /// Ordered transcript so far
    pub transcript: Transcript,

    /// Tools the planner exposes this iteration (empty to force prose)
    pub declarations: Vec<ToolDeclaration>,

    /// Generation temperature
    pub temperature: f32,

    /// Output token cap, if any
    pub max_output_tokens: Option<u32>,
}

/// The model's decision for one iteration.
#[derive(Debug, Clone)]
pub enum Plan {
    /// Execute these calls, then come back with the results.
    /// Non-empty by construction: bridges decode an empty call set as
    /// `Final` instead.
    ToolCalls(Vec<PlannedCall>),

    /// Terminal natural-language answer.
    Final(String),
}

/// The core Bridge trait.
///
/// Implementations translate to and from one model's wire format. They do
/// not retry: retry policy is the planner's.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// A human-readable backend name (e.g. "gemini").
    fn name(&self) -> &str;

    /// Submit one planning request and decode the model's decision.
    async fn plan(&self, request: BridgeRequest) -> std::result::Result<Plan, BridgeError>;
}
