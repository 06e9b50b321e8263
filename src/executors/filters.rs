//! Response filters for models that emit reasoning traces.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::step::{Step, StepExecutor};
use crate::flow::FlowContext;

static THINK_RE: Lazy<Regex> = Lazy::new(|| {
    // Non-greedy and dot-matches-newline: traces span lines.
    Regex::new(r"(?s)<think>(.*?)</think>").unwrap()
});

/// Extracts `<think>…</think>` traces out of the context text.
///
/// The trace lands in `ctx.think`; the cleaned reply replaces `ctx.text`.
/// With `output_json` the text becomes `{"think": …, "result": …}`. In plain
/// mode a second application is a no-op, since no tags remain.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepSeekStyleResponseFilter {
    pub output_json: bool,
}

#[async_trait]
impl StepExecutor for DeepSeekStyleResponseFilter {
    async fn run(&self, ctx: &mut FlowContext, _step: &Step) -> Result<(), anyhow::Error> {
        let mut traces: Vec<&str> = Vec::new();
        for capture in THINK_RE.captures_iter(&ctx.text) {
            if let Some(m) = capture.get(1) {
                traces.push(m.as_str());
            }
        }
        let think = traces.join("\n");
        let cleaned = THINK_RE.replace_all(&ctx.text, "").trim().to_string();

        if !think.is_empty() {
            ctx.think = think.clone();
        }

        if self.output_json {
            ctx.text = serde_json::json!({
                "think": think,
                "result": cleaned,
            })
            .to_string();
        } else {
            ctx.text = cleaned;
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepExecutor> {
        Box::new(*self)
    }

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error> {
        *self = serde_json::from_value(config.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> Step {
        Step::new(
            "filter",
            Box::new(DeepSeekStyleResponseFilter::default()),
        )
    }

    #[tokio::test]
    async fn test_extracts_trace_and_cleans_text() {
        let executor = DeepSeekStyleResponseFilter::default();
        let mut ctx =
            FlowContext::new("<think>step one\nstep two</think>\nThe answer is 42.");
        executor.run(&mut ctx, &step()).await.unwrap();
        assert_eq!(ctx.think, "step one\nstep two");
        assert_eq!(ctx.text, "The answer is 42.");
    }

    #[tokio::test]
    async fn test_multiple_traces_joined() {
        let executor = DeepSeekStyleResponseFilter::default();
        let mut ctx = FlowContext::new("<think>a</think>mid<think>b</think>end");
        executor.run(&mut ctx, &step()).await.unwrap();
        assert_eq!(ctx.think, "a\nb");
        assert_eq!(ctx.text, "midend");
    }

    #[tokio::test]
    async fn test_no_trace_leaves_think_alone() {
        let executor = DeepSeekStyleResponseFilter::default();
        let mut ctx = FlowContext::new("plain reply");
        ctx.think = "earlier".to_string();
        executor.run(&mut ctx, &step()).await.unwrap();
        assert_eq!(ctx.think, "earlier");
        assert_eq!(ctx.text, "plain reply");
    }

    #[tokio::test]
    async fn test_plain_mode_is_idempotent() {
        let executor = DeepSeekStyleResponseFilter::default();
        let mut ctx = FlowContext::new("<think>t</think> result text ");
        executor.run(&mut ctx, &step()).await.unwrap();
        let once = ctx.text.clone();
        executor.run(&mut ctx, &step()).await.unwrap();
        assert_eq!(ctx.text, once);
    }

    #[tokio::test]
    async fn test_json_output_shape() {
        let executor = DeepSeekStyleResponseFilter { output_json: true };
        let mut ctx = FlowContext::new("<think>reasoning</think>answer");
        executor.run(&mut ctx, &step()).await.unwrap();

        let parsed: Value = serde_json::from_str(&ctx.text).unwrap();
        assert_eq!(parsed["think"], "reasoning");
        assert_eq!(parsed["result"], "answer");
        assert_eq!(ctx.think, "reasoning");
    }
}
