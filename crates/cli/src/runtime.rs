//! Host-side assembly of the core.
//!
//! Wires config → tool-server manager → bridge → store → planner and
//! exposes the three-verb programmatic API: `run`, `clear`, `shutdown`.

use ferroclaw_bridge::GeminiBridge;
use ferroclaw_config::AppConfig;
use ferroclaw_core::error::Error;
use ferroclaw_core::event::EventBus;
use ferroclaw_planner::{Planner, PlannerConfig, RunOutcome};
use ferroclaw_store::{ConversationStore, StoredMessage, Sweeper};
use ferroclaw_toolserver::{ServerConfig, ServerStatus, ToolServerManager};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The assembled core: planner on top, manager/bridge/store underneath.
pub struct FerroclawCore {
    planner: Planner,
    manager: Arc<ToolServerManager>,
    store: Arc<ConversationStore>,
    events: Arc<EventBus>,
    sweeper: JoinHandle<()>,
}

impl FerroclawCore {
    /// Start every subsystem. Tool servers are spawned and discovered
    /// before this returns; failed ones are reported via `statuses`.
    pub async fn start(config: &AppConfig) -> Result<Self, Error> {
        let events = Arc::new(EventBus::default());

        let server_configs: Vec<ServerConfig> = config
            .tool_servers
            .iter()
            .map(|entry| ServerConfig {
                name: entry.name.clone(),
                command: entry.command.clone(),
            })
            .collect();
        let manager =
            Arc::new(ToolServerManager::start(server_configs, Arc::clone(&events)).await);

        let store = Arc::new(
            ConversationStore::open(&config.db_path)
                .await
                .map_err(Error::Store)?
                .with_idle_timeout(config.session_idle_timeout),
        );

        let sweeper = Sweeper::new(Arc::clone(&store))
            .with_retention(config.history_retention)
            .spawn();

        let bridge = Arc::new(GeminiBridge::new(
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        ));

        let planner_config = PlannerConfig {
            max_iterations: config.max_iterations,
            max_tool_calls: config.max_tool_calls,
            wall_clock: config.run_timeout,
            per_call_timeout: config.per_call_timeout,
            ..Default::default()
        };
        let planner = Planner::new(
            bridge,
            Arc::clone(&manager) as Arc<dyn ferroclaw_core::ToolBroker>,
            Arc::clone(&store),
            Arc::clone(&events),
        )
        .with_config(planner_config);

        Ok(Self {
            planner,
            manager,
            store,
            events,
            sweeper,
        })
    }

    /// One user utterance in, one assistant response out.
    pub async fn run(&self, user_key: &str, user_text: &str) -> RunOutcome {
        self.planner.run(user_key, user_text).await
    }

    /// Forget a user's conversation history. Returns the purged row count.
    pub async fn clear(&self, user_key: &str) -> Result<u64, Error> {
        self.store.clear(user_key).await.map_err(Error::Store)
    }

    /// Recent history for a user, oldest first.
    pub async fn history(&self, user_key: &str, limit: usize) -> Result<Vec<StoredMessage>, Error> {
        self.store.recent(user_key, limit).await.map_err(Error::Store)
    }

    /// Per-server readiness, for the startup report.
    pub fn server_statuses(&self) -> Vec<(String, ServerStatus)> {
        self.manager.statuses()
    }

    /// Subscribe to domain events.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Terminate tool servers and background tasks.
    pub async fn shutdown(self) {
        self.sweeper.abort();
        self.manager.shutdown().await;
    }
}
