//! Gemini `generateContent` bridge.
//!
//! Speaks the REST API with native function calling:
//! - system directive as `system_instruction`
//! - transcript as `contents` with `user`/`model` roles; tool outcomes go
//!   back as `functionResponse` parts
//! - the tool catalog as `function_declarations`
//!
//! The bridge decodes the response into a [`Plan`] and validates every
//! requested call's parameters against the declared schema before the
//! planner ever sees it. It never retries; retry policy is the planner's.

use crate::validate::validate_params;
use async_trait::async_trait;
use ferroclaw_core::bridge::{split_call_name, Bridge, BridgeRequest, Plan, PlannedCall, ToolDeclaration};
use ferroclaw_core::error::BridgeError;
use ferroclaw_core::message::{Role, TranscriptEntry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const API_VERSION: &str = "v1beta";

/// Gemini REST bridge.
pub struct GeminiBridge {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiBridge {
    /// Create a new bridge for the given model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            name: "gemini".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    /// Point the bridge at a different endpoint, e.g. a proxy or a local
    /// mock in tests. Trailing slashes are normalized away so `endpoint()`
    /// can join paths blindly.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut url = base_url.into();
        while url.ends_with('/') {
            url.pop();
        }
        self.base_url = url;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}/models/{}:generateContent",
            self.base_url, API_VERSION, self.model
        )
    }

    /// Convert the transcript to Gemini `contents`.
    fn to_contents(entries: &[TranscriptEntry]) -> Vec<Content> {
        let mut contents = Vec::new();

        for entry in entries {
            match entry.role {
                Role::User => contents.push(Content {
                    role: "user".into(),
                    parts: vec![Part::text(&entry.content)],
                }),
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !entry.content.is_empty() {
                        parts.push(Part::text(&entry.content));
                    }
                    for call in &entry.tool_calls {
                        parts.push(Part {
                            function_call: Some(FunctionCall {
                                name: call.qualified_name(),
                                args: call.params.clone(),
                            }),
                            ..Default::default()
                        });
                    }
                    if parts.is_empty() {
                        continue;
                    }
                    contents.push(Content {
                        role: "model".into(),
                        parts,
                    });
                }
                Role::Tool => match &entry.tool_record {
                    Some(record) => contents.push(Content {
                        role: "user".into(),
                        parts: vec![Part {
                            function_response: Some(FunctionResponse {
                                name: format!(
                                    "{}{}{}",
                                    record.server,
                                    ferroclaw_core::bridge::CALL_NAME_SEPARATOR,
                                    record.tool
                                ),
                                response: json!({ "result": record.payload }),
                            }),
                            ..Default::default()
                        }],
                    }),
                    // A tool note without call linkage (plan feedback)
                    // travels as plain user-role context.
                    None if !entry.content.is_empty() => contents.push(Content {
                        role: "user".into(),
                        parts: vec![Part::text(&entry.content)],
                    }),
                    None => {}
                },
            }
        }

        contents
    }

    /// Decode a raw API response body into a plan, validating any requested
    /// calls against the declarations that were sent.
    fn decode(
        body: &GenerateContentResponse,
        declarations: &[ToolDeclaration],
    ) -> Result<Plan, BridgeError> {
        if let Some(feedback) = &body.prompt_feedback {
            if let Some(reason) = &feedback.block_reason {
                return Err(BridgeError::ModelRefused(format!(
                    "prompt blocked: {reason}"
                )));
            }
        }

        let Some(candidate) = body.candidates.first() else {
            return Err(BridgeError::MalformedPlan(
                "response contained no candidates".into(),
            ));
        };

        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(BridgeError::ModelRefused(
                "candidate blocked for safety".into(),
            ));
        }

        let schemas: HashMap<&str, &Value> = declarations
            .iter()
            .map(|d| (d.name.as_str(), &d.parameters))
            .collect();

        let mut calls = Vec::new();
        let mut text_parts = Vec::new();

        for part in &candidate.content.parts {
            if let Some(fc) = &part.function_call {
                let Some((server, tool)) = split_call_name(&fc.name) else {
                    return Err(BridgeError::MalformedPlan(format!(
                        "unroutable call name '{}'",
                        fc.name
                    )));
                };

                let params = if fc.args.is_null() {
                    json!({})
                } else {
                    fc.args.clone()
                };

                if let Some(schema) = schemas.get(fc.name.as_str()) {
                    if let Err(reason) = validate_params(schema, &params) {
                        return Err(BridgeError::MalformedPlan(format!(
                            "call '{}' has invalid parameters: {reason}",
                            fc.name
                        )));
                    }
                }

                calls.push(PlannedCall {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    params,
                });
            } else if let Some(text) = &part.text {
                if !text.is_empty() {
                    text_parts.push(text.as_str());
                }
            }
        }

        if !calls.is_empty() {
            // Tool calls win; prose is kept for the log only.
            if !text_parts.is_empty() {
                debug!(
                    text = %text_parts.join("\n"),
                    "model emitted prose alongside tool calls, discarding"
                );
            }
            return Ok(Plan::ToolCalls(calls));
        }

        Ok(Plan::Final(text_parts.join("\n")))
    }
}

#[async_trait]
impl Bridge for GeminiBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn plan(&self, request: BridgeRequest) -> Result<Plan, BridgeError> {
        let mut body = json!({
            "contents": Self::to_contents(request.transcript.entries()),
            "generationConfig": {
                "temperature": request.temperature,
            },
        });

        if !request.system.is_empty() {
            body["system_instruction"] = json!({ "parts": [{ "text": request.system }] });
        }
        if let Some(max) = request.max_output_tokens {
            body["generationConfig"]["maxOutputTokens"] = json!(max);
        }
        if !request.declarations.is_empty() {
            body["tools"] = json!([{ "function_declarations": request.declarations }]);
        }

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::ModelUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(status = %status, "model call failed");
            return Err(BridgeError::ModelUnavailable(format!(
                "HTTP {status}: {}",
                truncate(&detail, 300)
            )));
        }

        let decoded: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::MalformedPlan(format!("unreadable response body: {e}")))?;

        Self::decode(&decoded, &request.declarations)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// --- Wire shapes ---

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,

    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,

    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(content: &str) -> Self {
        Self {
            text: Some(content.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,

    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,

    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason", default)]
    block_reason: Option<String>,
}
