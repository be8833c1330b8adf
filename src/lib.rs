//! Agent Relay: message relay and delivery coordination for agents
//!
//! Agents that can only make a blocking tool call talk to each other through
//! a shared durable store. A call submits a message, registers the caller as
//! waiting, and returns when a message addressed back to it is delivered or
//! the wait times out.

pub mod cli;
pub mod concurrency;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod flow;
pub mod janitor;
pub mod logging;
pub mod message;
pub mod relay;
pub mod router;
pub mod store;
pub mod types;

pub use config::RelayConfig;
pub use error::{RelayError, StorageError};
pub use flow::WaitOutcome;
pub use relay::{Relay, ToolCall, ToolReply};
