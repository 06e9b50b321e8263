//! Executors that write directly into the flow context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::flow::step::{Step, StepExecutor};
use crate::flow::FlowContext;

// ---------------------------------------------------------------------------
// SetContextExecutor
// ---------------------------------------------------------------------------

/// Overwrites the context's text and/or memory.
///
/// Without `force`, empty text and null memory are left alone so the executor
/// can be used to set just one of the two. Never returns an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SetContextExecutor {
    pub text: String,
    pub memory: Value,
    pub force: bool,
}

#[async_trait]
impl StepExecutor for SetContextExecutor {
    async fn run(&self, ctx: &mut FlowContext, _step: &Step) -> Result<(), anyhow::Error> {
        if !self.text.is_empty() || self.force {
            ctx.text = self.text.clone();
        }
        if !self.memory.is_null() || self.force {
            ctx.memory = self.memory.clone();
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepExecutor> {
        Box::new(self.clone())
    }

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error> {
        *self = serde_json::from_value(config.clone())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SetVariablesExecutor
// ---------------------------------------------------------------------------

/// Assigns a batch of variables into the context.
///
/// Steps flagged `vars_immutable` turn the whole run into a no-op. Empty keys
/// are skipped silently; everything else overwrites unconditionally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SetVariablesExecutor {
    pub variables: HashMap<String, Value>,
}

#[async_trait]
impl StepExecutor for SetVariablesExecutor {
    async fn run(&self, ctx: &mut FlowContext, step: &Step) -> Result<(), anyhow::Error> {
        if step.vars_immutable {
            log::debug!(
                "step '{}' has immutable variables, skipping {} assignments",
                step.name,
                self.variables.len()
            );
            return Ok(());
        }
        for (key, value) in &self.variables {
            if key.is_empty() {
                continue;
            }
            ctx.variables.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepExecutor> {
        Box::new(self.clone())
    }

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error> {
        *self = serde_json::from_value(config.clone())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
