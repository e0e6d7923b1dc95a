//! Line-delimited JSON-RPC 2.0 subset spoken with tool servers.
//!
//! Every message is a single JSON object terminated by `\n`; there is no
//! framing header. Requests carry an integer `id`; notifications carry none
//! and get no reply. Responses correlate to requests by `id` only — arrival
//! order is unspecified.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Well-known discovery method every server must implement.
pub const METHOD_LIST_TOOLS: &str = "tools/list";

/// Reserved notification method forwarded to the host's logging sink.
pub const METHOD_LOG: &str = "log";

/// An outgoing request. Field order matters on the wire only in that we
/// always emit `jsonrpc` first, which some naive servers key on.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Encode a request as a single wire line (no trailing newline).
pub fn encode_request(id: u64, method: &str, params: &Value) -> String {
    let request = Request {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    };
    // Serialization of these shapes cannot fail: every field is a string,
    // integer, or already-valid Value.
    serde_json::to_string(&request).unwrap_or_default()
}

/// Business-level failure reported by a server inside a response.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoteFailure {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A successfully parsed inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// Response to one of our requests.
    Response {
        id: u64,
        result: Result<Value, RemoteFailure>,
    },

    /// A notification (no `id`); only `log` is meaningful to us.
    Notification { method: String, params: Value },

    /// Valid JSON that fits neither shape (e.g. a server-initiated
    /// request). Dropped after logging; not a protocol fault.
    Ignored,
}

/// Outcome of parsing one stdout line.
#[derive(Debug)]
pub enum ParsedLine {
    /// Blank line — skipped silently.
    Empty,
    Message(Inbound),
    /// Unparseable as JSON, or violates the subset (non-integer `id`,
    /// error object missing `message`, ...). Counts toward the
    /// consecutive-fault restart trigger.
    Malformed(String),
}

/// Parse one line from a server's stdout.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Empty;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return ParsedLine::Malformed(format!("invalid JSON: {e}")),
    };

    let Some(obj) = value.as_object() else {
        return ParsedLine::Malformed("line is not a JSON object".into());
    };

    match obj.get("id") {
        Some(id_value) => {
            let Some(id) = id_value.as_u64() else {
                return ParsedLine::Malformed(format!("non-integer id: {id_value}"));
            };
            if obj.contains_key("method") {
                // A server-initiated request; the subset has no verbs for
                // the client to answer, so it is dropped upstream.
                return ParsedLine::Message(Inbound::Ignored);
            }
            if let Some(error) = obj.get("error") {
                let failure: RemoteFailure = match serde_json::from_value(error.clone()) {
                    Ok(f) => f,
                    Err(e) => {
                        return ParsedLine::Malformed(format!("unreadable error object: {e}"))
                    }
                };
                return ParsedLine::Message(Inbound::Response {
                    id,
                    result: Err(failure),
                });
            }
            let result = obj.get("result").cloned().unwrap_or(Value::Null);
            ParsedLine::Message(Inbound::Response {
                id,
                result: Ok(result),
            })
        }
        None => match obj.get("method").and_then(Value::as_str) {
            Some(method) => ParsedLine::Message(Inbound::Notification {
                method: method.to_string(),
                params: obj.get("params").cloned().unwrap_or(Value::Null),
            }),
            None => ParsedLine::Malformed("object has neither id nor method".into()),
        },
    }
}

/// Shape of a `tools/list` result.
#[derive(Debug, Deserialize)]
pub struct ToolListing {
    #[serde(default)]
    pub tools: Vec<DeclaredTool>,
}

/// One tool as declared by a server.
#[derive(Debug, Deserialize)]
pub struct DeclaredTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object" })
}
