//! Concrete LLM providers

pub mod openai;

pub use openai::*;
