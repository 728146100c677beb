//! LLM access for the intent classifier and agent workers

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;
