//! Configuration loading and validation for ferroclaw.
//!
//! Everything comes from the environment; there is no config file. The
//! core consumes exactly the keys documented here — anything else belongs
//! to the embedding host.
//!
//! | Key | Default |
//! |---|---|
//! | `LLM_API_KEY` | required |
//! | `LLM_MODEL_NAME` | `gemini-1.5-flash-latest` |
//! | `TOOL_SERVER_<N>_CMD` (N = 1, 2, …) | at least one required |
//! | `AGENTIC_MAX_ITERATIONS` | 8 |
//! | `AGENTIC_MAX_TOOL_CALLS` | 30 |
//! | `AGENTIC_TIMEOUT_SECONDS` | 90 |
//! | `PER_CALL_TIMEOUT_SECONDS` | 30 |
//! | `SESSION_IDLE_TIMEOUT_MINUTES` | 30 |
//! | `HISTORY_RETENTION_HOURS` | 24 |
//! | `CONVERSATION_DB_PATH` | `./state.db` |

use ferroclaw_core::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";
const DEFAULT_DB_PATH: &str = "./state.db";

/// One configured tool server: a routing name plus the command to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolServerEntry {
    pub name: String,
    pub command: String,
}

/// The runtime configuration of the core.
#[derive(Clone)]
pub struct AppConfig {
    /// API key for the generative model
    pub llm_api_key: String,

    /// Model identifier passed to the bridge
    pub llm_model: String,

    /// Tool servers, in declaration order
    pub tool_servers: Vec<ToolServerEntry>,

    /// Planner iteration budget
    pub max_iterations: u32,

    /// Planner total tool-call budget
    pub max_tool_calls: u32,

    /// Wall-clock bound per planner run
    pub run_timeout: Duration,

    /// Per-call deadline in the tool-server manager
    pub per_call_timeout: Duration,

    /// Session idle window
    pub session_idle_timeout: Duration,

    /// Conversation retention horizon
    pub history_retention: Duration,

    /// Location of the conversation store
    pub db_path: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("llm_api_key", &"[REDACTED]")
            .field("llm_model", &self.llm_model)
            .field("tool_servers", &self.tool_servers)
            .field("max_iterations", &self.max_iterations)
            .field("max_tool_calls", &self.max_tool_calls)
            .field("run_timeout", &self.run_timeout)
            .field("per_call_timeout", &self.per_call_timeout)
            .field("session_idle_timeout", &self.session_idle_timeout)
            .field("history_retention", &self.history_retention)
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl AppConfig {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm_api_key =
            std::env::var("LLM_API_KEY").map_err(|_| ConfigError::Missing("LLM_API_KEY"))?;
        if llm_api_key.trim().is_empty() {
            return Err(ConfigError::Missing("LLM_API_KEY"));
        }

        let llm_model =
            std::env::var("LLM_MODEL_NAME").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let tool_servers = Self::scan_tool_servers()?;
        if tool_servers.is_empty() {
            return Err(ConfigError::NoToolServers);
        }

        let max_iterations = parse_env("AGENTIC_MAX_ITERATIONS", 8u32)?;
        let max_tool_calls = parse_env("AGENTIC_MAX_TOOL_CALLS", 30u32)?;
        let run_timeout = Duration::from_secs(parse_env("AGENTIC_TIMEOUT_SECONDS", 90u64)?);
        let per_call_timeout = Duration::from_secs(parse_env("PER_CALL_TIMEOUT_SECONDS", 30u64)?);
        let session_idle_timeout =
            Duration::from_secs(parse_env("SESSION_IDLE_TIMEOUT_MINUTES", 30u64)? * 60);
        let history_retention =
            Duration::from_secs(parse_env("HISTORY_RETENTION_HOURS", 24u64)? * 3600);
        let db_path =
            std::env::var("CONVERSATION_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let config = Self {
            llm_api_key,
            llm_model,
            tool_servers,
            max_iterations,
            max_tool_calls,
            run_timeout,
            per_call_timeout,
            session_idle_timeout,
            history_retention,
            db_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Scan `TOOL_SERVER_1_CMD`, `TOOL_SERVER_2_CMD`, … until the first
    /// missing index.
    fn scan_tool_servers() -> Result<Vec<ToolServerEntry>, ConfigError> {
        let mut entries = Vec::new();
        for n in 1.. {
            let key = format!("TOOL_SERVER_{n}_CMD");
            let Ok(raw) = std::env::var(&key) else {
                break;
            };
            if raw.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "empty command".into(),
                });
            }
            entries.push(parse_server_entry(&raw, n));
        }
        Ok(entries)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                key: "AGENTIC_MAX_ITERATIONS".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.run_timeout.is_zero() || self.per_call_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "AGENTIC_TIMEOUT_SECONDS / PER_CALL_TIMEOUT_SECONDS".into(),
                reason: "timeouts must be positive".into(),
            });
        }

        let mut names: Vec<&str> = self.tool_servers.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.tool_servers.len() {
            return Err(ConfigError::Invalid {
                key: "TOOL_SERVER_<N>_CMD".into(),
                reason: "duplicate server names; disambiguate with a 'name=' prefix".into(),
            });
        }
        Ok(())
    }
}

/// Split an entry into name and command. An explicit `name=command` prefix
/// wins; otherwise the name is derived from the command's basename, with
/// the index as a last resort.
fn parse_server_entry(raw: &str, index: usize) -> ToolServerEntry {
    if let Some((name, command)) = raw.split_once('=') {
        let name = name.trim();
        // Only treat it as a name prefix if it looks like one (no spaces,
        // no path separators) — otherwise '=' belonged to the command.
        if !name.is_empty() && !name.contains([' ', '/', '\\']) {
            return ToolServerEntry {
                name: name.to_string(),
                command: command.trim().to_string(),
            };
        }
    }

    // Prefer the first path-looking token (the script, usually) over the
    // interpreter; "node servers/base.js" should be called "base", not
    // "node".
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let candidate = tokens
        .iter()
        .find(|t| {
            t.contains('/')
                || t.contains('\\')
                || t.ends_with(".js")
                || t.ends_with(".py")
                || t.ends_with(".sh")
        })
        .or_else(|| tokens.first());

    let basename = candidate
        .and_then(|t| t.rsplit(['/', '\\']).next())
        .map(|base| {
            base.trim_end_matches(".js")
                .trim_end_matches(".py")
                .trim_end_matches(".sh")
        })
        .filter(|base| !base.is_empty())
        .map(str::to_string);

    ToolServerEntry {
        name: basename.unwrap_or_else(|| format!("server{index}")),
        command: raw.trim().to_string(),
    }
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
            key: key.into(),
            reason: format!("{e}"),
        }),
        Err(_) => Ok(default),
    }
}
