//! The manager: a pool of tool servers behind one uniform call interface.
//!
//! Owns every server's lifecycle and the shared [`ToolCatalog`] snapshot.
//! The catalog cell is swapped atomically on discovery and restart, so
//! consumers see either the old or the new full view, never a partial one.

use crate::server::{ServerConfig, ServerStatus, ToolServer};
use async_trait::async_trait;
use ferroclaw_core::error::ToolCallError;
use ferroclaw_core::event::{DomainEvent, EventBus};
use ferroclaw_core::tool::{ToolBroker, ToolCall, ToolCatalog, ToolOutcome, ToolSpec};
use futures::future::join_all;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

type CatalogCell = Arc<RwLock<Arc<ToolCatalog>>>;

/// Launches, observes, and multiplexes the configured tool servers.
pub struct ToolServerManager {
    servers: Arc<Vec<ToolServer>>,
    catalog: CatalogCell,
    events: Arc<EventBus>,
}

impl ToolServerManager {
    /// Spawn every configured server and run capability discovery
    /// concurrently. Servers that fail discovery are reported and left
    /// `Failed`; servers that come up get a supervisor task that restarts
    /// them with backoff if they later exit.
    pub async fn start(configs: Vec<ServerConfig>, events: Arc<EventBus>) -> Self {
        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<()>();

        let servers: Arc<Vec<ToolServer>> = Arc::new(
            configs
                .into_iter()
                .map(|config| ToolServer::new(config, refresh_tx.clone()))
                .collect(),
        );
        let catalog: CatalogCell = Arc::new(RwLock::new(Arc::new(ToolCatalog::new())));

        let launches = servers.iter().map(|server| server.launch());
        let results = join_all(launches).await;
        for (server, result) in servers.iter().zip(results) {
            match result {
                Ok(count) => {
                    events.publish(DomainEvent::ServerReady {
                        server: server.name().to_string(),
                        tool_count: count,
                        timestamp: chrono::Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(server = %server.name(), error = %e, "tool server unusable");
                }
            }
        }
        Self::rebuild_catalog(&servers, &catalog);

        // Catalog refresh task: servers poke this channel on every
        // discovery and crash.
        {
            let servers = Arc::clone(&servers);
            let catalog = Arc::clone(&catalog);
            tokio::spawn(async move {
                while refresh_rx.recv().await.is_some() {
                    Self::rebuild_catalog(&servers, &catalog);
                }
            });
        }

        // Supervisors for the servers that actually came up.
        for server in servers.iter() {
            if server.status() == ServerStatus::Ready {
                let server = server.clone();
                let events = Arc::clone(&events);
                tokio::spawn(async move {
                    server.supervise(events).await;
                });
            }
        }

        let ready = servers
            .iter()
            .filter(|s| s.status() == ServerStatus::Ready)
            .count();
        info!(
            ready,
            total = servers.len(),
            "tool server pool started"
        );

        Self {
            servers,
            catalog,
            events,
        }
    }

    fn rebuild_catalog(servers: &Arc<Vec<ToolServer>>, catalog: &CatalogCell) {
        let specs: Vec<ToolSpec> = servers.iter().flat_map(|s| s.specs()).collect();
        let snapshot = Arc::new(ToolCatalog::from_specs(specs));
        *catalog.write().unwrap() = snapshot;
    }

    /// Every tool across all ready servers, from the current snapshot.
    pub fn list_all_tools(&self) -> Vec<ToolSpec> {
        self.catalog().iter().cloned().collect()
    }

    /// Per-server status, for readiness reporting.
    pub fn statuses(&self) -> Vec<(String, ServerStatus)> {
        self.servers
            .iter()
            .map(|s| (s.name().to_string(), s.status()))
            .collect()
    }

    /// Terminate every server: SIGTERM, 5 s grace, SIGKILL.
    pub async fn shutdown(&self) {
        join_all(self.servers.iter().map(|s| s.shutdown())).await;
        info!("tool server pool shut down");
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        timeout: Duration,
    ) -> Result<Value, ToolCallError> {
        let Some(server) = self.servers.iter().find(|s| s.name() == call.server) else {
            return Err(ToolCallError::NoSuchTool {
                server: call.server.clone(),
                tool: call.tool.clone(),
            });
        };

        if server.status() != ServerStatus::Ready {
            return Err(ToolCallError::ServerUnavailable(call.server.clone()));
        }

        // Pre-dispatch catalog check: an unknown (server, tool) pair never
        // reaches a subprocess.
        if !self.catalog().contains(&call.server, &call.tool) {
            return Err(ToolCallError::NoSuchTool {
                server: call.server.clone(),
                tool: call.tool.clone(),
            });
        }

        server.call_tool(&call.tool, &call.params, timeout).await
    }
}

#[async_trait]
impl ToolBroker for ToolServerManager {
    fn catalog(&self) -> Arc<ToolCatalog> {
        self.catalog.read().unwrap().clone()
    }

    async fn call(&self, call: ToolCall, timeout: Duration) -> ToolOutcome {
        let started = Instant::now();
        let result = self.dispatch(&call, timeout).await;
        let elapsed = started.elapsed();

        self.events.publish(DomainEvent::ToolCallCompleted {
            server: call.server.clone(),
            tool: call.tool.clone(),
            ok: result.is_ok(),
            duration_ms: elapsed.as_millis() as u64,
            timestamp: chrono::Utc::now(),
        });

        ToolOutcome {
            id: call.id,
            elapsed,
            result,
        }
    }
}
