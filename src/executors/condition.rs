//! Conditional branching into registered flows.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::step::{Step, StepExecutor};
use crate::flow::FlowContext;
use crate::registry;

/// Routes the context into another registered flow based on its text.
///
/// Holds flow names, not flow handles: construction-time cycles are
/// impossible, runtime cycles (A routes to B routes to A) are the user's
/// responsibility. The target flow receives the current context and its
/// result becomes this step's output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionalFlowExecutor {
    /// Text (after trimming) to flow name.
    pub switch: HashMap<String, String>,
    /// Fallback flow when no switch entry matches.
    #[serde(rename = "default")]
    pub default_flow: Option<String>,
    /// Characters trimmed from both ends of the text before matching.
    pub trim: String,
}

impl ConditionalFlowExecutor {
    fn trimmed<'a>(&self, text: &'a str) -> &'a str {
        if self.trim.is_empty() {
            return text;
        }
        let strip: Vec<char> = self.trim.chars().collect();
        text.trim_matches(|c| strip.contains(&c))
    }
}

#[async_trait]
impl StepExecutor for ConditionalFlowExecutor {
    fn init(&mut self) -> Result<(), anyhow::Error> {
        if self.switch.is_empty() {
            return Err(anyhow::anyhow!("condition executor requires a non-empty switch"));
        }
        for (key, flow_name) in &self.switch {
            if !registry::flow_exists(flow_name) {
                return Err(anyhow::anyhow!(
                    "condition executor switch entry '{}' references unregistered flow '{}'",
                    key,
                    flow_name
                ));
            }
        }
        if let Some(default_flow) = &self.default_flow {
            if !registry::flow_exists(default_flow) {
                return Err(anyhow::anyhow!(
                    "condition executor default references unregistered flow '{}'",
                    default_flow
                ));
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: &mut FlowContext, step: &Step) -> Result<(), anyhow::Error> {
        let key = self.trimmed(&ctx.text).to_string();
        let target = match self.switch.get(&key) {
            Some(flow_name) => flow_name,
            None => self.default_flow.as_ref().ok_or_else(|| {
                anyhow::anyhow!(
                    "step '{}': no switch entry for '{}' and no default flow",
                    step.name,
                    key
                )
            })?,
        };

        log::debug!("step '{}' routing '{}' into flow '{}'", step.name, key, target);
        let flow = registry::get_flow(target)?;
        let result = flow.run(ctx.clone()).await?;
        *ctx = result;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::executors::SetContextExecutor;
    use crate::flow::Flow;

    fn register_text_flow(name: &str, text: &str) {
        let executor = SetContextExecutor {
            text: text.to_string(),
            ..Default::default()
        };
        let flow =
            Arc::new(Flow::new(name, vec![Step::new("set", Box::new(executor))]).unwrap());
        registry::install_flow(name, flow).unwrap();
    }

    fn routing_executor() -> ConditionalFlowExecutor {
        register_text_flow("condition_left", "L");
        register_text_flow("condition_right", "R");

        let mut switch = HashMap::new();
        switch.insert("a".to_string(), "condition_left".to_string());
        switch.insert("b".to_string(), "condition_right".to_string());
        ConditionalFlowExecutor {
            switch,
            default_flow: Some("condition_left".to_string()),
            trim: " ".to_string(),
        }
    }

    #[test]
    fn test_init_requires_switch_entries() {
        let mut executor = ConditionalFlowExecutor::default();
        assert!(executor.init().is_err());
    }

    #[test]
    fn test_init_requires_registered_flows() {
        let mut switch = HashMap::new();
        switch.insert("x".to_string(), "condition_not_registered".to_string());
        let mut executor = ConditionalFlowExecutor {
            switch,
            ..Default::default()
        };
        let err = executor.init().unwrap_err();
        assert!(err.to_string().contains("condition_not_registered"));
    }

    #[tokio::test]
    async fn test_trimmed_match_routes_to_switch_entry() {
        let mut executor = routing_executor();
        executor.init().unwrap();
        let step = Step::new("route", executor.clone_box());

        let mut ctx = FlowContext::new(" b ");
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "R");
    }

    #[tokio::test]
    async fn test_no_match_uses_default() {
        let mut executor = routing_executor();
        executor.init().unwrap();
        let step = Step::new("route", executor.clone_box());

        let mut ctx = FlowContext::new("z");
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "L");
    }

    #[tokio::test]
    async fn test_no_match_no_default_fails() {
        let mut executor = routing_executor();
        executor.default_flow = None;
        executor.init().unwrap();
        let step = Step::new("route", executor.clone_box());

        let mut ctx = FlowContext::new("z");
        let err = executor.run(&mut ctx, &step).await.unwrap_err();
        assert!(err.to_string().contains("no switch entry"));
    }

    #[tokio::test]
    async fn test_subflow_output_becomes_step_output() {
        register_text_flow("condition_branch", "branched");
        let mut switch = HashMap::new();
        switch.insert("go".to_string(), "condition_branch".to_string());
        let mut executor = ConditionalFlowExecutor {
            switch,
            ..Default::default()
        };
        executor.init().unwrap();
        let step = Step::new("route", executor.clone_box());

        let mut ctx = FlowContext::new("go");
        ctx.set_variable("carried", serde_json::json!(7));
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "branched");
        // The sub-flow runs on the same context; variables survive.
        assert_eq!(ctx.get_variable("carried"), Some(&serde_json::json!(7)));
    }
}
