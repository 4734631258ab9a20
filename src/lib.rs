//! Stock Chat Assistant
//!
//! A streaming chat backend for stock analysis:
//! - Streams model responses to the client fragment by fragment
//! - Lets the model call market data tools (price, history, balance sheet, news)
//! - Persists threads and messages when a conversation store is configured
//! - Degrades to stream-only mode when it is not
//!
//! TURN LOOP:
//! ENSURE THREAD → PERSIST USER → STREAM (TOOLS) → PERSIST ASSISTANT → TOUCH

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod market;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod tools;

pub use error::{ChatError, Result};

// Re-export common types
pub use models::*;
