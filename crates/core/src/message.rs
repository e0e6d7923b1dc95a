//! Transcript domain types.
//!
//! A [`Transcript`] is the ordered sequence of turns a planner run submits
//! to the LLM bridge on every iteration. It grows monotonically within one
//! run: user text, assistant turns (prose or tool-call requests), and one
//! synthetic tool entry per executed call.

use crate::bridge::PlannedCall;
use crate::tool::ToolCallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// Synthetic tool-result entry
    Tool,
}

impl Role {
    /// Storage representation, matching the `role` column of the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The result of one executed tool call, as fed back to the model.
///
/// `payload` is either the (possibly truncated) tool result or the uniform
/// `{"error":{"kind","message"}}` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub call_id: ToolCallId,
    pub server: String,
    pub tool: String,
    pub payload: serde_json::Value,
}

/// One turn in a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,

    /// Prose content. Empty for pure tool-call turns and tool entries.
    pub content: String,

    /// Tool calls requested by the assistant in this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<PlannedCall>,

    /// Present on `Role::Tool` entries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_record: Option<ToolRecord>,

    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_record: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant prose turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_record: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant turn that requests tool calls.
    pub fn assistant_calls(calls: Vec<PlannedCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: calls,
            tool_record: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a synthetic tool-result turn.
    pub fn tool_result(record: ToolRecord) -> Self {
        Self {
            role: Role::Tool,
            content: String::new(),
            tool_calls: Vec::new(),
            tool_record: Some(record),
            timestamp: Utc::now(),
        }
    }

    /// Create a synthetic tool-role note with no call linkage, e.g. the
    /// feedback given to the model after an invalid plan.
    pub fn tool_note(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_record: None,
            timestamp: Utc::now(),
        }
    }
}

/// The ordered sequence of turns submitted to the bridge.
///
/// Strictly sequential across planner iterations; entries are never removed
/// or reordered within a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent assistant prose, if any. Used for best-effort
    /// synthesis when a run exits without a clean final answer.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.role == Role::Assistant && !e.content.is_empty())
            .map(|e| e.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_round_trip_through_strings() {
        for role in [Role::User, Role::Assistant, Role::Tool] {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn transcript_preserves_order() {
        let mut t = Transcript::new();
        t.push(TranscriptEntry::user("hi"));
        t.push(TranscriptEntry::assistant_calls(vec![PlannedCall {
            server: "a".into(),
            tool: "x".into(),
            params: json!({}),
        }]));
        t.push(TranscriptEntry::tool_result(ToolRecord {
            call_id: ToolCallId::new(),
            server: "a".into(),
            tool: "x".into(),
            payload: json!({"ok": true}),
        }));
        t.push(TranscriptEntry::assistant("done"));

        let roles: Vec<Role> = t.entries().iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
    }

    #[test]
    fn last_assistant_text_skips_call_turns() {
        let mut t = Transcript::new();
        t.push(TranscriptEntry::assistant("first"));
        t.push(TranscriptEntry::assistant_calls(vec![]));
        assert_eq!(t.last_assistant_text(), Some("first"));
    }

    #[test]
    fn entry_serialization_roundtrip() {
        let entry = TranscriptEntry::user("What's PEPE doing?");
        let json = serde_json::to_string(&entry).unwrap();
        let back: TranscriptEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::User);
        assert_eq!(back.content, "What's PEPE doing?");
    }
}
