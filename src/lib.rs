//! # Anyi
//!
//! A workflow engine and autonomous agent framework: chain LLM calls,
//! validators, shell commands, sub-flows and MCP tools into repeatable
//! pipelines, and let an LLM-driven agent select and sequence those pipelines
//! toward a goal.
//!
//! The crate is organised around three pillars:
//! - a step engine (`flow`) with validator-gated retries and typed contexts,
//! - a process-wide component `registry` with declarative `config` loading,
//! - an `mcp` client subsystem speaking JSON-RPC 2.0 over HTTP, SSE and
//!   STDIO transports.
//!
//! Call [`init`] once at startup to install the built-in executor and
//! validator types and the agent's planning flows.

pub mod agent;
pub mod chat;
pub mod config;
pub mod errors;
pub mod executors;
pub mod flow;
pub mod llm;
pub mod mcp;
pub mod registry;
pub mod validators;

pub use agent::{Agent, AgentResult};
pub use chat::formatter::{PromptFormatter, TemplateFormatter};
pub use chat::{ChatOptions, ContentPart, Message, Role, Usage};
pub use errors::{AgentError, ConfigError, FlowError, RegistryError};
pub use flow::{Flow, FlowContext, Step, StepExecutor, StepValidator};
pub use llm::{Client, ClientRef};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the built-in component types and flows.
///
/// Registers the executor prototypes (`llm`, `setContext`, `setVariables`,
/// `condition`, `exec`, `mcp`, `deepSeekStyleResponseFilter`), the validator
/// prototypes (`string`, `json`) and the agent's planning and reflection
/// flows. Idempotent; safe to call more than once.
pub fn init() -> Result<(), anyhow::Error> {
    registry::install_builtins()?;
    agent::planning::register_builtin_flows()?;
    log::debug!("anyi {} initialized", VERSION);
    Ok(())
}
