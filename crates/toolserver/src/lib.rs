//! Tool-server management for ferroclaw.
//!
//! A *tool server* is a child process speaking a line-delimited JSON-RPC 2.0
//! subset on stdin/stdout. This crate owns the whole lifecycle: spawning,
//! capability discovery, concurrent request/response correlation, per-call
//! deadlines, crash detection with backoff restart, and shutdown.
//!
//! The rest of the system only sees [`ToolServerManager`] through the
//! `ToolBroker` trait from `ferroclaw-core`.

pub mod manager;
pub mod protocol;
pub mod server;

pub use manager::ToolServerManager;
pub use server::{ServerConfig, ServerStatus, ToolServer};
