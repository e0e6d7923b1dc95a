//! Domain event system — decoupled observability for the host.
//!
//! Events are published when something interesting happens in the core.
//! Hosts can subscribe to react (status lines, metrics) without the core
//! knowing about them. Every publish is also mirrored to the trace log
//! under the event's label, so a host that never subscribes still gets a
//! timeline for free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A tool call finished (success or failure)
    ToolCallCompleted {
        server: String,
        tool: String,
        ok: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A planner run finished
    RunFinished {
        session_id: String,
        terminal_state: String,
        iterations: u32,
        tool_calls: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool server came up and declared its tools
    ServerReady {
        server: String,
        tool_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A tool server exited and a restart was scheduled
    ServerRestarting {
        server: String,
        attempt: u32,
        backoff_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Stable label used in trace output and host-side filtering.
    pub fn label(&self) -> &'static str {
        match self {
            DomainEvent::ToolCallCompleted { .. } => "tool_call_completed",
            DomainEvent::RunFinished { .. } => "run_finished",
            DomainEvent::ServerReady { .. } => "server_ready",
            DomainEvent::ServerRestarting { .. } => "server_restarting",
        }
    }
}

/// Multi-consumer pub/sub for domain events, on `tokio::sync::broadcast`.
///
/// Publishing never blocks and never fails: with nobody subscribed the
/// event only reaches the trace log, and a lagging subscriber loses old
/// events rather than slowing the core down.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to the trace log and every current subscriber.
    pub fn publish(&self, event: DomainEvent) {
        trace!(event = event.label(), "domain event");
        // A send error only means there is no subscriber right now.
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }

    /// How many subscribers are currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
