//! Intent classification and routing of inbound user messages

pub mod classifier;
pub mod dispatcher;
pub mod prompts;

pub use classifier::{extract_first_code_block, Classifier, LlmClassifier};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use prompts::{ERROR_REPLY, MAIA_DISPATCHER_PROMPT};
