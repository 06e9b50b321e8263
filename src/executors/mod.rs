//! Built-in step executors.
//!
//! Every executor is a serde-decodable struct so the declarative loader can
//! deep-decode a `with_config` map into a fresh instance, call `init`, and
//! drop it into a step.

pub mod command;
pub mod condition;
pub mod filters;
pub mod llm;
pub mod setters;

pub use command::RunCommandExecutor;
pub use condition::ConditionalFlowExecutor;
pub use filters::DeepSeekStyleResponseFilter;
pub use llm::LlmExecutor;
pub use setters::{SetContextExecutor, SetVariablesExecutor};
