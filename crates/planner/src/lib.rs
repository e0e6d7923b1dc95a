//! The agentic planning loop.
//!
//! Turns one user utterance into a final assistant response by iterating
//! between the LLM bridge (think) and the tool-server broker (act), feeding
//! observations back until the model produces prose or a budget runs out.

pub mod directive;
pub mod loop_runner;
pub mod truncate;

pub use loop_runner::{Planner, PlannerConfig, RunOutcome, TerminalState};
