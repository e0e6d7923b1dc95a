//! Tool catalog and the broker seam.
//!
//! Tool servers declare their tools at discovery; the manager folds every
//! ready server's declarations into a [`ToolCatalog`] snapshot. The planner
//! takes one snapshot per run and routes calls through the [`ToolBroker`]
//! trait — it never touches a subprocess directly.

use crate::bridge::{ToolDeclaration, CALL_NAME_SEPARATOR};
use crate::error::ToolCallError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for one tool call within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallId(pub String);

impl ToolCallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ToolCallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ToolCallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tool declared by a server at discovery time.
///
/// Immutable after discovery; replaced wholesale when the owning server
/// restarts and re-declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Name of the owning server
    pub server: String,

    /// Tool name, unique within the server
    pub name: String,

    /// Human description, forwarded to the model
    pub description: String,

    /// JSON Schema for the tool's parameters
    pub input_schema: serde_json::Value,
}

/// One requested invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub server: String,
    pub tool: String,
    pub params: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(
        server: impl Into<String>,
        tool: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: ToolCallId::new(),
            server: server.into(),
            tool: tool.into(),
            params,
            issued_at: Utc::now(),
        }
    }
}

/// The outcome of one dispatched call.
///
/// Failures are carried as values so one bad call in a fan-out never masks
/// its siblings.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub id: ToolCallId,
    pub elapsed: Duration,
    pub result: std::result::Result<serde_json::Value, ToolCallError>,
}

impl ToolOutcome {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// An immutable snapshot of every tool across all ready servers.
///
/// Consumers hold an `Arc<ToolCatalog>`; the manager swaps the shared
/// snapshot atomically on discovery and restart, so a reader sees either
/// the old or the new full view, never a partial one.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: BTreeMap<(String, String), ToolSpec>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from declared specs. A later spec with the same
    /// `(server, name)` replaces an earlier one, which keeps the global
    /// uniqueness invariant even across re-discovery.
    pub fn from_specs(specs: impl IntoIterator<Item = ToolSpec>) -> Self {
        let mut entries = BTreeMap::new();
        for spec in specs {
            entries.insert((spec.server.clone(), spec.name.clone()), spec);
        }
        Self { entries }
    }

    pub fn get(&self, server: &str, tool: &str) -> Option<&ToolSpec> {
        self.entries.get(&(server.to_string(), tool.to_string()))
    }

    pub fn contains(&self, server: &str, tool: &str) -> bool {
        self.get(server, tool).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.entries.values()
    }

    /// Names of servers contributing at least one tool.
    pub fn servers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(|(s, _)| s.as_str()).collect();
        names.dedup();
        names
    }

    /// Flatten into bridge-facing declarations, tools named
    /// `server__tool` so the model's call names route back unambiguously.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.entries
            .values()
            .map(|spec| ToolDeclaration {
                name: format!("{}{}{}", spec.server, CALL_NAME_SEPARATOR, spec.name),
                description: spec.description.clone(),
                parameters: spec.input_schema.clone(),
            })
            .collect()
    }
}

/// The broker seam between the planner and the tool-server manager.
#[async_trait]
pub trait ToolBroker: Send + Sync {
    /// Current catalog snapshot. The planner takes one per run and keeps it
    /// for the whole run.
    fn catalog(&self) -> Arc<ToolCatalog>;

    /// Dispatch one call with a per-call deadline. Never panics and never
    /// returns a transport-level `Err`: every failure mode is a
    /// [`ToolCallError`] inside the outcome.
    async fn call(&self, call: ToolCall, timeout: Duration) -> ToolOutcome;
}
