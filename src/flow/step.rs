//! Steps and the executor/validator contracts they are built from.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::flow::context::FlowContext;
use crate::llm::ClientRef;

/// Default retry budget for a step whose validator keeps rejecting.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// A polymorphic operation that transforms a flow context.
///
/// Executors are registered as prototypes and cloned on lookup, so each flow
/// run works on its own instance. `init` validates configuration and compiles
/// templates; it is re-entrant and idempotent, and `run` must cope with init
/// having been bypassed (compile transiently rather than fail).
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Validate configuration and prepare internal state.
    fn init(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Transform the context in place.
    async fn run(&self, ctx: &mut FlowContext, step: &Step) -> Result<(), anyhow::Error>;

    /// Fresh copy with equal configuration and distinct identity.
    fn clone_box(&self) -> Box<dyn StepExecutor>;

    /// Replace this instance's configuration from a decoded config value.
    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error>;
}

impl Clone for Box<dyn StepExecutor> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

// ---------------------------------------------------------------------------
// StepValidator
// ---------------------------------------------------------------------------

/// A boolean gate over a step's output text.
///
/// Validators see only the context's text; a rejection sends the step back
/// into its executor until the retry budget runs out.
pub trait StepValidator: Send + Sync {
    fn init(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn validate(&self, text: &str, step: &Step) -> bool;

    fn clone_box(&self) -> Box<dyn StepValidator>;

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error>;
}

impl Clone for Box<dyn StepValidator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work within a flow.
#[derive(Clone)]
pub struct Step {
    /// Free-form name, used in diagnostics only.
    pub name: String,
    pub executor: Box<dyn StepExecutor>,
    pub validator: Option<Box<dyn StepValidator>>,
    /// Overrides the owning flow's default client for this step.
    pub client_override: Option<ClientRef>,
    /// How many validator rejections to absorb before giving up.
    /// 0 means a single attempt.
    pub max_retries: u32,
    /// When set, variable-writing executors must no-op.
    pub vars_immutable: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, executor: Box<dyn StepExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
            validator: None,
            client_override: None,
            max_retries: DEFAULT_MAX_RETRIES,
            vars_immutable: false,
        }
    }

    pub fn with_validator(mut self, validator: Box<dyn StepValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_client(mut self, client: ClientRef) -> Self {
        self.client_override = Some(client);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_vars_immutable(mut self, vars_immutable: bool) -> Self {
        self.vars_immutable = vars_immutable;
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("validator", &self.validator.as_ref().map(|_| "<validator>"))
            .field(
                "client_override",
                &self.client_override.as_ref().map(|_| "<client>"),
            )
            .field("max_retries", &self.max_retries)
            .field("vars_immutable", &self.vars_immutable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct NoopExecutor;

    #[async_trait]
    impl StepExecutor for NoopExecutor {
        async fn run(&self, _ctx: &mut FlowContext, _step: &Step) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn StepExecutor> {
            Box::new(self.clone())
        }

        fn load_config(&mut self, _config: &Value) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_step_defaults() {
        let step = Step::new("s", Box::new(NoopExecutor));
        assert_eq!(step.name, "s");
        assert_eq!(step.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!step.vars_immutable);
        assert!(step.validator.is_none());
        assert!(step.client_override.is_none());
    }

    #[test]
    fn test_step_debug_omits_internals() {
        let step = Step::new("debuggable", Box::new(NoopExecutor)).with_max_retries(1);
        let out = format!("{:?}", step);
        assert!(out.contains("debuggable"));
        assert!(out.contains("max_retries: 1"));
    }
}
