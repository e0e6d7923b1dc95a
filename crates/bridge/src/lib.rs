//! LLM bridge implementations for ferroclaw.
//!
//! The planner sees only `ferroclaw_core::Bridge`; this crate holds the
//! model-specific wire formats. One backend ships today: Gemini's
//! `generateContent` API with native function calling.

pub mod gemini;
pub mod validate;

pub use gemini::GeminiBridge;
