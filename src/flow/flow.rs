//! The sequential step engine.
//!
//! A `Flow` runs its steps in order against one `FlowContext`. Each step's
//! executor transforms the context; an optional validator gates acceptance of
//! the result and drives retries. Executor errors abort the run immediately;
//! only validator rejections consume retry budget.

use std::fmt;
use std::sync::Arc;

use crate::errors::FlowError;
use crate::flow::context::FlowContext;
use crate::flow::step::Step;
use crate::llm::ClientRef;

/// A named, ordered sequence of steps sharing a default LLM client.
#[derive(Clone)]
pub struct Flow {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    /// Used by LLM steps that carry no client override. May be absent when
    /// every step brings its own client.
    pub default_client: Option<ClientRef>,
}

impl Flow {
    /// Build a flow. A flow with no steps is invalid at construction.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, FlowError> {
        let name = name.into();
        if steps.is_empty() {
            return Err(FlowError::NoSteps { name });
        }
        Ok(Self {
            name,
            description: None,
            steps,
            default_client: None,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_client(mut self, client: ClientRef) -> Self {
        self.default_client = Some(client);
        self
    }

    /// Run the flow against a fresh context built from an input string.
    pub async fn run_with_input(
        self: &Arc<Self>,
        input: &str,
    ) -> Result<FlowContext, anyhow::Error> {
        self.run(FlowContext::new(input)).await
    }

    /// Run the flow, threading `ctx` through every step in order.
    ///
    /// The context's `flow` backref is bound to this flow before each step,
    /// so executors that dispatch into sub-flows cannot leave a stale
    /// backref behind for the steps that follow.
    pub async fn run(self: &Arc<Self>, mut ctx: FlowContext) -> Result<FlowContext, anyhow::Error> {
        log::debug!("flow '{}' starting with {} steps", self.name, self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            ctx.flow = Some(self.clone());
            log::debug!("flow '{}' running step {} '{}'", self.name, index, step.name);
            self.try_step(step, &mut ctx).await?;
        }
        log::debug!("flow '{}' finished", self.name);
        Ok(ctx)
    }

    /// Run one step, retrying on validator rejection.
    ///
    /// The retried input is the rejected context, not a snapshot of the
    /// original; executors must be idempotent enough to be re-run. With a
    /// retry budget of `k`, a validator that always rejects sees the executor
    /// run exactly `k + 1` times before the step fails.
    async fn try_step(&self, step: &Step, ctx: &mut FlowContext) -> Result<(), anyhow::Error> {
        let mut attempts: u32 = 0;
        loop {
            step.executor.run(ctx, step).await?;
            attempts += 1;

            let Some(validator) = &step.validator else {
                return Ok(());
            };
            if validator.validate(&ctx.text, step) {
                return Ok(());
            }
            if attempts > step.max_retries {
                return Err(FlowError::RetryExhausted {
                    step: step.name.clone(),
                    attempts,
                }
                .into());
            }
            log::debug!(
                "step '{}' output rejected, retrying ({}/{})",
                step.name,
                attempts,
                step.max_retries
            );
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("steps", &self.steps)
            .field(
                "default_client",
                &self.default_client.as_ref().map(|_| "<client>"),
            )
            .finish()
    }
}
