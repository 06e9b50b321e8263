//! Plan and reflection data types, parsing, and the built-in flows.
//!
//! The planning LLM's output is untrusted: parsing locates the outermost
//! `{…}` substring, attempts a strict JSON parse, and the agent then checks
//! every referenced flow against its allow-list and the registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AgentError;
use crate::executors::LlmExecutor;
use crate::flow::step::StepExecutor;
use crate::flow::{Flow, Step};
use crate::registry;

/// Registry name of the built-in planning flow.
pub const PLANNING_FLOW_NAME: &str = "Anyi_AgentPlanningFlow";
/// Registry name of the built-in reflection flow.
pub const REFLECTION_FLOW_NAME: &str = "Anyi_AgentReflectionFlow";

/// Fixed system instruction for the planning flow; the output-format
/// directive lives here so the user prompt carries only the agent's data.
pub(crate) const PLANNING_SYSTEM_MESSAGE: &str = r#"You are a planning assistant. Break the goal into an ordered sequence of invocations of the workflows listed by the user. Respond with strict JSON only, no prose, in exactly this form:
{"steps": [{"step_id": "1", "flow_name": "...", "description": "...", "inputs": {}, "depends_on": []}]}"#;

pub(crate) const PLANNING_TEMPLATE: &str = r#"You are {{ memory.role }}.
{% if memory.back_story %}Background: {{ memory.back_story }}
{% endif %}Your goal: {{ memory.goal }}

You can invoke these workflows:
{% for flow in memory.available_flows %}- {{ flow.name }}: {{ flow.description }}
{% endfor %}{% if memory.preferred_language %}Write every description in {{ memory.preferred_language }}.{% endif %}"#;

/// Fixed system instruction for the reflection flow.
pub(crate) const REFLECTION_SYSTEM_MESSAGE: &str = r#"You judge whether a goal has been achieved given the steps completed so far. Respond with strict JSON only, in exactly this form:
{"goal_achieved": true, "reason": "..."}"#;

pub(crate) const REFLECTION_TEMPLATE: &str = r#"You are {{ memory.role }} reviewing progress toward a goal.
Goal: {{ memory.goal }}

Completed steps:
{% for record in memory.history %}{{ loop.index }}. [{{ record.flow_name }}] {{ record.output }}
{% endfor %}"#;

// ---------------------------------------------------------------------------
// Planning data
// ---------------------------------------------------------------------------

/// A name/description pair describing one flow in the agent's action space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// The bag rendered into the planning prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningData {
    pub role: String,
    pub back_story: String,
    pub preferred_language: String,
    pub goal: String,
    pub available_flows: Vec<FlowSummary>,
}

/// The bag rendered into the reflection prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectionData {
    pub role: String,
    pub goal: String,
    pub history: Vec<ExecutionRecord>,
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// One step of an LLM-produced plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    #[serde(default)]
    pub step_id: String,
    pub flow_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The plan consumed by the agent's execution loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// A completed plan step, kept in the agent's running history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step_id: String,
    pub flow_name: String,
    pub output: String,
    pub finished_at: DateTime<Utc>,
}

/// The reflection flow's answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReflectionVerdict {
    pub goal_achieved: bool,
    #[serde(default)]
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// The outermost `{…}` substring of `text`, if any.
pub fn extract_outermost_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

pub(crate) fn parse_plan(text: &str) -> Result<ExecutionPlan, AgentError> {
    let json = extract_outermost_json(text)
        .ok_or_else(|| AgentError::PlanUnparseable("no JSON object found".to_string()))?;
    serde_json::from_str(json).map_err(|e| AgentError::PlanUnparseable(e.to_string()))
}

pub(crate) fn parse_verdict(text: &str) -> Result<ReflectionVerdict, AgentError> {
    let json = extract_outermost_json(text)
        .ok_or_else(|| AgentError::PlanUnparseable("no JSON object found".to_string()))?;
    serde_json::from_str(json).map_err(|e| AgentError::PlanUnparseable(e.to_string()))
}

// ---------------------------------------------------------------------------
// Built-in flows
// ---------------------------------------------------------------------------

/// Install the planning and reflection flows. Idempotent; called by `init`.
///
/// Each flow is a single LLM step: the fixed system message carries the
/// strict-JSON output instruction and the user-prompt template renders the
/// agent's data from `ctx.memory`. Neither flow carries a client: the agent
/// clones the flow and installs its own client as the clone's default before
/// running it.
pub fn register_builtin_flows() -> Result<(), anyhow::Error> {
    let mut planner = LlmExecutor::with_template(PLANNING_TEMPLATE)
        .with_system_message(PLANNING_SYSTEM_MESSAGE)
        .with_output_json(true);
    planner.init()?;
    let planning_flow = Flow::new(
        PLANNING_FLOW_NAME,
        vec![Step::new("plan", Box::new(planner))],
    )?
    .with_description("Decomposes an agent goal into a sequence of workflow invocations");
    registry::install_flow(PLANNING_FLOW_NAME, Arc::new(planning_flow))?;

    let mut reflector = LlmExecutor::with_template(REFLECTION_TEMPLATE)
        .with_system_message(REFLECTION_SYSTEM_MESSAGE)
        .with_output_json(true);
    reflector.init()?;
    let reflection_flow = Flow::new(
        REFLECTION_FLOW_NAME,
        vec![Step::new("reflect", Box::new(reflector))],
    )?
    .with_description("Judges whether an agent's execution history satisfies its goal");
    registry::install_flow(REFLECTION_FLOW_NAME, Arc::new(reflection_flow))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_outermost_json() {
        assert_eq!(extract_outermost_json(r#"{"a":1}"#), Some(r#"{"a":1}"#));
        assert_eq!(
            extract_outermost_json("Sure! Here is the plan:\n{\"steps\":[]}\nDone."),
            Some("{\"steps\":[]}")
        );
        assert_eq!(extract_outermost_json("no json here"), None);
        assert_eq!(extract_outermost_json("} reversed {"), None);
    }

    #[test]
    fn test_parse_plan_with_surrounding_prose() {
        let text = r#"The plan is: {"steps":[{"step_id":"1","flow_name":"research","description":"look"}]}"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].flow_name, "research");
        assert!(plan.steps[0].depends_on.is_empty());
    }

    #[test]
    fn test_parse_plan_missing_flow_name_is_unparseable() {
        let text = r#"{"steps":[{"step_id":"1"}]}"#;
        assert!(matches!(
            parse_plan(text),
            Err(AgentError::PlanUnparseable(_))
        ));
    }

    #[test]
    fn test_parse_plan_garbage() {
        assert!(parse_plan("no plan at all").is_err());
        assert!(parse_plan("{not json}").is_err());
    }

    #[test]
    fn test_parse_verdict() {
        let verdict = parse_verdict(r#"{"goal_achieved": false, "reason": "missing data"}"#).unwrap();
        assert!(!verdict.goal_achieved);
        assert_eq!(verdict.reason, "missing data");
    }

    #[test]
    fn test_builtin_flows_register_idempotently() {
        register_builtin_flows().unwrap();
        register_builtin_flows().unwrap();
        assert!(registry::flow_exists(PLANNING_FLOW_NAME));
        assert!(registry::flow_exists(REFLECTION_FLOW_NAME));
    }

    #[test]
    fn test_planning_template_renders() {
        use crate::chat::formatter::TemplateFormatter;

        let formatter = TemplateFormatter::from_string(PLANNING_TEMPLATE).unwrap();
        let data = PlanningData {
            role: "a research assistant".to_string(),
            back_story: "works for a lab".to_string(),
            preferred_language: "English".to_string(),
            goal: "Report on X".to_string(),
            available_flows: vec![FlowSummary {
                name: "research".to_string(),
                description: "gathers sources".to_string(),
            }],
        };
        let bound = serde_json::json!({
            "text": "Report on X",
            "memory": data,
            "variables": {},
            "image_urls": [],
            "think": "",
        });
        let prompt = formatter.format_serializable(&bound).unwrap();
        assert!(prompt.contains("a research assistant"));
        assert!(prompt.contains("- research: gathers sources"));
        assert!(prompt.contains("English"));
    }

    #[test]
    fn test_system_messages_demand_strict_json() {
        assert!(PLANNING_SYSTEM_MESSAGE.contains("strict JSON"));
        assert!(PLANNING_SYSTEM_MESSAGE.contains("\"steps\""));
        assert!(PLANNING_SYSTEM_MESSAGE.contains("\"depends_on\""));
        assert!(REFLECTION_SYSTEM_MESSAGE.contains("strict JSON"));
        assert!(REFLECTION_SYSTEM_MESSAGE.contains("\"goal_achieved\""));
    }

    #[tokio::test]
    async fn test_planning_flow_sends_system_instruction() {
        use async_trait::async_trait;

        use crate::chat::{ChatOptions, Message, Role, Usage};
        use crate::flow::FlowContext;
        use crate::llm::Client;

        struct MessageProbe {
            captured: std::sync::Mutex<Vec<Message>>,
        }

        #[async_trait]
        impl Client for MessageProbe {
            async fn chat(
                &self,
                messages: Vec<Message>,
                _options: Option<&ChatOptions>,
            ) -> Result<(Message, Option<Usage>), anyhow::Error> {
                *self.captured.lock().unwrap() = messages;
                Ok((Message::assistant(r#"{"steps":[]}"#), None))
            }
        }

        register_builtin_flows().unwrap();
        let probe = Arc::new(MessageProbe {
            captured: std::sync::Mutex::new(Vec::new()),
        });

        let registered = registry::get_flow(PLANNING_FLOW_NAME).unwrap();
        let mut derived = (*registered).clone();
        derived.default_client = Some(probe.clone());
        let derived = Arc::new(derived);

        let data = PlanningData {
            role: "a planner".to_string(),
            back_story: String::new(),
            preferred_language: String::new(),
            goal: "do the thing".to_string(),
            available_flows: Vec::new(),
        };
        let ctx =
            FlowContext::new("do the thing").with_memory(serde_json::to_value(&data).unwrap());
        derived.run(ctx).await.unwrap();

        let messages = probe.captured.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("strict JSON"));
        assert_eq!(messages[1].role, Role::User);
        assert!(messages[1].content.contains("a planner"));
    }

    #[test]
    fn test_reflection_template_renders() {
        use crate::chat::formatter::TemplateFormatter;

        let formatter = TemplateFormatter::from_string(REFLECTION_TEMPLATE).unwrap();
        let data = ReflectionData {
            role: "a planner".to_string(),
            goal: "ship it".to_string(),
            history: vec![ExecutionRecord {
                step_id: "1".to_string(),
                flow_name: "build".to_string(),
                output: "built".to_string(),
                finished_at: Utc::now(),
            }],
        };
        let bound = serde_json::json!({
            "text": "ship it",
            "memory": data,
            "variables": {},
            "image_urls": [],
            "think": "",
        });
        let prompt = formatter.format_serializable(&bound).unwrap();
        assert!(prompt.contains("[build] built"));
        assert!(prompt.contains("ship it"));
    }
}
