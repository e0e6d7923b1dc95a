//! Conversation persistence for ferroclaw.
//!
//! A single SQLite table holds the append-only message log; sessions are
//! bookkeeping over it (a session is "whatever happened within the idle
//! window"), and a periodic sweeper enforces the retention horizon.

pub mod sqlite;
pub mod sweeper;

pub use sqlite::{ConversationStore, MessageMetadata, StoredMessage, ToolCallSummary};
pub use sweeper::Sweeper;
