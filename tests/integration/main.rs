//! Integration tests for the agent relay

mod cli_process;
mod concurrency;
mod properties;
mod relay_flow;
mod retention;
mod support;
