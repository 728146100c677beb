//! Agent workers
//!
//! A worker subscribes to `agent.<name>.request`, hands each routed request
//! to an [`AgentHandler`] and publishes the answer to
//! `user.message.processed`.

pub mod handler;
pub mod worker;

pub use handler::{AgentHandler, LlmAgentHandler};
pub use worker::AgentWorker;
