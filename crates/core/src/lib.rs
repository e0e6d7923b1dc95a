//! # Ferroclaw Core
//!
//! Domain types, traits, and error definitions for the ferroclaw
//! tool-orchestration runtime. This crate has **zero framework dependencies**
//! — it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The two seams of the system are defined as traits here:
//! [`ToolBroker`] (implemented by the tool-server manager) and [`Bridge`]
//! (implemented by LLM adapters). The planner only ever talks to those
//! traits, which keeps it testable with in-process fakes and keeps the
//! dependency graph pointing inward.

pub mod bridge;
pub mod error;
pub mod event;
pub mod message;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bridge::{Bridge, BridgeRequest, Plan, PlannedCall, ToolDeclaration};
pub use error::{BridgeError, ConfigError, Error, Result, StoreError, ToolCallError};
pub use event::{DomainEvent, EventBus};
pub use message::{Role, Transcript, TranscriptEntry};
pub use tool::{ToolBroker, ToolCall, ToolCallId, ToolCatalog, ToolOutcome, ToolSpec};
