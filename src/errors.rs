//! Error types shared across the workflow engine, registry and loader.

use thiserror::Error;

/// Errors raised by flow construction and the step engine.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A flow was constructed with an empty step list.
    #[error("flow '{name}' must contain at least one step")]
    NoSteps { name: String },

    /// A step's validator rejected every attempt within the retry budget.
    #[error("step '{step}' output rejected after {attempts} attempts, retry budget exhausted")]
    RetryExhausted { step: String, attempts: u32 },

    /// An LLM step had neither a step client override nor a flow default client.
    #[error("no client available for step '{step}'")]
    MissingClient { step: String },
}

/// Errors raised by the process-wide component registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Registration or lookup with an empty name.
    #[error("{kind} name cannot be empty")]
    EmptyName { kind: &'static str },

    /// Strict registration found an existing entry with the same name.
    #[error("{kind} '{name}' is already registered")]
    Duplicate { kind: &'static str, name: String },

    /// Lookup failed.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// No default client could be resolved.
    #[error("no default client: set a default client name, register exactly one client, or register a client named 'default'")]
    NoDefaultClient,
}

/// Errors raised while loading a declarative configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {cause}")]
    Io {
        path: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("unsupported config file extension '{0}' (expected yaml, yml, json or toml)")]
    UnsupportedFormat(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("unknown {kind} type '{name}'")]
    UnknownType { kind: &'static str, name: String },

    #[error("failed to build {kind} '{name}': {cause}")]
    Component {
        kind: &'static str,
        name: String,
        cause: anyhow::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Errors raised by the agent planning and execution layer.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The planning LLM did not produce a parseable JSON plan.
    #[error("planning output is not a valid JSON plan: {0}")]
    PlanUnparseable(String),

    /// The plan referenced a flow the registry does not know.
    #[error("plan references unknown flow '{0}'")]
    UnknownFlow(String),

    /// The plan referenced a flow outside the agent's allow-list.
    #[error("flow '{0}' is not available to this agent")]
    FlowNotAllowed(String),

    /// A plan step declared more dependencies than completed prior steps.
    #[error("step '{step_id}' declares {required} dependencies but only {completed} steps have completed")]
    DependencyUnsatisfied {
        step_id: String,
        required: usize,
        completed: usize,
    },

    /// A plan step's flow invocation failed.
    #[error("plan step '{step_id}' failed: {cause}")]
    StepFailed {
        step_id: String,
        cause: anyhow::Error,
    },
}
