//! The planning-and-execution agent layer.
//!
//! An agent turns a goal into a plan by running the built-in planning flow
//! against its own client, validates the plan against its flow allow-list and
//! the registry, then executes the plan's steps through the named flows in
//! declared order. An optional reflection phase re-plans until the goal is
//! judged achieved or the round budget runs out.

pub mod planning;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::errors::AgentError;
use crate::flow::{Flow, FlowContext};
use crate::llm::ClientRef;
use crate::registry;

pub use planning::{
    extract_outermost_json, ExecutionPlan, ExecutionRecord, FlowSummary, PlanStep, PlanningData,
    ReflectionVerdict, PLANNING_FLOW_NAME, REFLECTION_FLOW_NAME,
};

/// Default bound on planning rounds when reflection is enabled.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// What an agent run produced: the last step's text plus the full history.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub output: String,
    pub history: Vec<ExecutionRecord>,
}

/// An LLM-driven planner over a set of available flows.
///
/// An empty `flows` list, or a list entry named `"*"`, leaves the action
/// space open: any registered flow may then appear in a plan. Otherwise
/// plans may only reference the listed flows.
#[derive(Clone)]
pub struct Agent {
    pub role: String,
    pub backstory: String,
    pub preferred_language: String,
    pub client: ClientRef,
    pub flows: Vec<Arc<Flow>>,
    /// Re-plan after reflection judges the goal unmet.
    pub reflect: bool,
    /// Bound on planning rounds; only meaningful with `reflect`.
    pub max_rounds: u32,
}

impl Agent {
    pub fn new(role: impl Into<String>, client: ClientRef) -> Self {
        Self {
            role: role.into(),
            backstory: String::new(),
            preferred_language: String::new(),
            client,
            flows: Vec::new(),
            reflect: false,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_preferred_language(mut self, language: impl Into<String>) -> Self {
        self.preferred_language = language.into();
        self
    }

    pub fn with_flows(mut self, flows: Vec<Arc<Flow>>) -> Self {
        self.flows = flows;
        self
    }

    pub fn add_flow(mut self, flow: Arc<Flow>) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_reflection(mut self, reflect: bool) -> Self {
        self.reflect = reflect;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Plan and execute until done.
    pub async fn execute(&self, goal: &str) -> Result<AgentResult, AgentError> {
        let mut history: Vec<ExecutionRecord> = Vec::new();
        let mut last_output = String::new();
        let mut round: u32 = 0;

        loop {
            round += 1;
            let plan = self.plan(goal).await?;
            self.validate_plan(&plan)?;
            log::info!(
                "agent '{}' executing plan with {} steps (round {})",
                self.role,
                plan.steps.len(),
                round
            );

            let mut completed_this_round = 0usize;
            for plan_step in &plan.steps {
                if plan_step.depends_on.len() > completed_this_round {
                    return Err(AgentError::DependencyUnsatisfied {
                        step_id: plan_step.step_id.clone(),
                        required: plan_step.depends_on.len(),
                        completed: completed_this_round,
                    });
                }

                let flow = registry::get_flow(&plan_step.flow_name)
                    .map_err(|_| AgentError::UnknownFlow(plan_step.flow_name.clone()))?;

                // The prompt is the step description plus whatever the
                // previous step produced.
                let prompt = if last_output.is_empty() {
                    plan_step.description.clone()
                } else {
                    format!("{}\n\n{}", plan_step.description, last_output)
                };

                let result = flow.run_with_input(&prompt).await.map_err(|e| {
                    AgentError::StepFailed {
                        step_id: plan_step.step_id.clone(),
                        cause: e,
                    }
                })?;

                last_output = result.text.clone();
                history.push(ExecutionRecord {
                    step_id: plan_step.step_id.clone(),
                    flow_name: plan_step.flow_name.clone(),
                    output: result.text,
                    finished_at: Utc::now(),
                });
                completed_this_round += 1;
            }

            if !self.reflect || round >= self.max_rounds {
                break;
            }
            match self.reflect_on(goal, &history).await {
                Ok(verdict) if verdict.goal_achieved => {
                    log::info!("agent '{}' goal achieved: {}", self.role, verdict.reason);
                    break;
                }
                Ok(verdict) => {
                    log::info!(
                        "agent '{}' goal not achieved ({}), replanning",
                        self.role,
                        verdict.reason
                    );
                }
                Err(e) => {
                    log::warn!("agent '{}' reflection not usable, stopping: {}", self.role, e);
                    break;
                }
            }
        }

        Ok(AgentResult {
            output: last_output,
            history,
        })
    }

    /// Run the built-in planning flow with this agent's client and parse the
    /// resulting JSON plan.
    async fn plan(&self, goal: &str) -> Result<ExecutionPlan, AgentError> {
        let data = PlanningData {
            role: self.role.clone(),
            back_story: self.backstory.clone(),
            preferred_language: self.preferred_language.clone(),
            goal: goal.to_string(),
            available_flows: self
                .flows
                .iter()
                .map(|f| FlowSummary {
                    name: f.name.clone(),
                    description: f.description.clone().unwrap_or_default(),
                })
                .collect(),
        };
        let memory = serde_json::to_value(&data).map_err(|e| {
            AgentError::PlanUnparseable(format!("planning data not serializable: {}", e))
        })?;

        let text = self
            .run_builtin_flow(PLANNING_FLOW_NAME, goal, memory)
            .await?;
        planning::parse_plan(&text)
    }

    /// Run the built-in reflection flow over the execution history.
    async fn reflect_on(
        &self,
        goal: &str,
        history: &[ExecutionRecord],
    ) -> Result<ReflectionVerdict, AgentError> {
        let data = planning::ReflectionData {
            role: self.role.clone(),
            goal: goal.to_string(),
            history: history.to_vec(),
        };
        let memory = serde_json::to_value(&data).map_err(|e| {
            AgentError::PlanUnparseable(format!("reflection data not serializable: {}", e))
        })?;

        let text = self
            .run_builtin_flow(REFLECTION_FLOW_NAME, goal, memory)
            .await?;
        planning::parse_verdict(&text)
    }

    /// Clone a registered built-in flow, install this agent's client as its
    /// default, and run it with `memory` bound.
    async fn run_builtin_flow(
        &self,
        flow_name: &str,
        goal: &str,
        memory: Value,
    ) -> Result<String, AgentError> {
        let registered = registry::get_flow(flow_name)
            .map_err(|_| AgentError::UnknownFlow(flow_name.to_string()))?;
        let mut derived = (*registered).clone();
        derived.default_client = Some(self.client.clone());
        let derived = Arc::new(derived);

        let ctx = FlowContext::new(goal).with_memory(memory);
        let result = derived.run(ctx).await.map_err(|e| AgentError::StepFailed {
            step_id: flow_name.to_string(),
            cause: e,
        })?;
        Ok(result.text)
    }

    /// Check every plan step against the allow-list and the registry.
    ///
    /// A list entry named `"*"` is the wildcard: it opens the action space
    /// the same way an empty list does. Registry existence is checked either
    /// way.
    fn validate_plan(&self, plan: &ExecutionPlan) -> Result<(), AgentError> {
        for step in &plan.steps {
            let allowed = self.flows.is_empty()
                || self
                    .flows
                    .iter()
                    .any(|f| f.name == "*" || f.name == step.flow_name);
            if !allowed {
                return Err(AgentError::FlowNotAllowed(step.flow_name.clone()));
            }
            if !registry::flow_exists(&step.flow_name) {
                return Err(AgentError::UnknownFlow(step.flow_name.clone()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("role", &self.role)
            .field("preferred_language", &self.preferred_language)
            .field(
                "flows",
                &self.flows.iter().map(|fl| fl.name.clone()).collect::<Vec<_>>(),
            )
            .field("reflect", &self.reflect)
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::chat::{ChatOptions, Message, Usage};
    use crate::executors::SetContextExecutor;
    use crate::flow::Step;
    use crate::llm::Client;

    /// Replies with a canned plan, then a canned reflection verdict.
    struct ScriptedClient {
        replies: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: std::sync::Mutex::new(
                    replies.into_iter().rev().map(String::from).collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl Client for ScriptedClient {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _options: Option<&ChatOptions>,
        ) -> Result<(Message, Option<Usage>), anyhow::Error> {
            let mut replies = self.replies.lock().unwrap();
            let reply = replies
                .pop()
                .ok_or_else(|| anyhow::anyhow!("scripted client ran out of replies"))?;
            Ok((Message::assistant(reply), None))
        }
    }

    fn register_stub_flow(name: &str, output: &str) -> Arc<Flow> {
        let executor = SetContextExecutor {
            text: output.to_string(),
            ..Default::default()
        };
        let flow = Arc::new(
            Flow::new(name, vec![Step::new("stub", Box::new(executor))])
                .unwrap()
                .with_description(format!("stub flow returning {}", output)),
        );
        registry::install_flow(name, flow.clone()).unwrap();
        flow
    }

    #[tokio::test]
    async fn test_agent_planning_happy_path() {
        planning::register_builtin_flows().unwrap();
        let research = register_stub_flow("agent_test_research", "R");
        let write = register_stub_flow("agent_test_write", "W");

        let plan = r#"{"steps":[
            {"step_id":"1","flow_name":"agent_test_research","description":"gather facts"},
            {"step_id":"2","flow_name":"agent_test_write","description":"write it up","depends_on":["1"]}
        ]}"#;
        let client = Arc::new(ScriptedClient::new(vec![plan]));
        let agent = Agent::new("a writer", client).with_flows(vec![research, write]);

        let result = agent.execute("Report on X").await.unwrap();
        assert_eq!(result.output, "W");
        let outputs: Vec<&str> = result.history.iter().map(|r| r.output.as_str()).collect();
        assert_eq!(outputs, vec!["R", "W"]);
        assert_eq!(result.history[0].flow_name, "agent_test_research");
        assert_eq!(result.history[1].flow_name, "agent_test_write");
    }

    #[tokio::test]
    async fn test_agent_rejects_disallowed_flow() {
        planning::register_builtin_flows().unwrap();
        let allowed = register_stub_flow("agent_test_allowed", "A");
        register_stub_flow("agent_test_forbidden", "F");

        let plan = r#"{"steps":[{"step_id":"1","flow_name":"agent_test_forbidden","description":"x"}]}"#;
        let client = Arc::new(ScriptedClient::new(vec![plan]));
        let agent = Agent::new("strict", client).with_flows(vec![allowed]);

        let err = agent.execute("goal").await.unwrap_err();
        assert!(matches!(err, AgentError::FlowNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_agent_wildcard_entry_opens_action_space() {
        planning::register_builtin_flows().unwrap();
        register_stub_flow("agent_test_wild", "X");

        // The wildcard entry is part of the allow-list, not the registry.
        let wildcard = Arc::new(
            Flow::new(
                "*",
                vec![Step::new("noop", Box::new(SetContextExecutor::default()))],
            )
            .unwrap(),
        );

        let plan =
            r#"{"steps":[{"step_id":"1","flow_name":"agent_test_wild","description":"go"}]}"#;
        let client = Arc::new(ScriptedClient::new(vec![plan]));
        let agent = Agent::new("permissive", client).with_flows(vec![wildcard]);

        let result = agent.execute("goal").await.unwrap();
        assert_eq!(result.output, "X");
    }

    #[tokio::test]
    async fn test_agent_rejects_unknown_flow() {
        planning::register_builtin_flows().unwrap();
        let plan = r#"{"steps":[{"step_id":"1","flow_name":"agent_test_ghost","description":"x"}]}"#;
        let client = Arc::new(ScriptedClient::new(vec![plan]));
        // Open action space, but the flow is not registered.
        let agent = Agent::new("open", client);

        let err = agent.execute("goal").await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownFlow(_)));
    }

    #[tokio::test]
    async fn test_agent_unparseable_plan_fails() {
        planning::register_builtin_flows().unwrap();
        let client = Arc::new(ScriptedClient::new(vec!["I cannot plan that."]));
        let agent = Agent::new("confused", client);

        let err = agent.execute("goal").await.unwrap_err();
        assert!(matches!(err, AgentError::PlanUnparseable(_)));
    }

    #[tokio::test]
    async fn test_agent_dependency_counting() {
        planning::register_builtin_flows().unwrap();
        register_stub_flow("agent_test_dep", "D");

        // First step already declares a dependency; nothing has completed.
        let plan = r#"{"steps":[{"step_id":"1","flow_name":"agent_test_dep","description":"x","depends_on":["0"]}]}"#;
        let client = Arc::new(ScriptedClient::new(vec![plan]));
        let agent = Agent::new("dependent", client);

        let err = agent.execute("goal").await.unwrap_err();
        assert!(matches!(err, AgentError::DependencyUnsatisfied { .. }));
    }

    #[tokio::test]
    async fn test_agent_reflection_replans_until_achieved() {
        planning::register_builtin_flows().unwrap();
        register_stub_flow("agent_test_iter", "I");

        let plan = r#"{"steps":[{"step_id":"1","flow_name":"agent_test_iter","description":"try"}]}"#;
        let not_done = r#"{"goal_achieved": false, "reason": "needs another pass"}"#;
        let done = r#"{"goal_achieved": true, "reason": "complete"}"#;
        // plan, reflect(no), plan, reflect(yes)
        let client = Arc::new(ScriptedClient::new(vec![plan, not_done, plan, done]));
        let agent = Agent::new("persistent", client)
            .with_reflection(true)
            .with_max_rounds(5);

        let result = agent.execute("goal").await.unwrap();
        assert_eq!(result.output, "I");
        // Two rounds ran the stub flow twice.
        assert_eq!(result.history.len(), 2);
    }

    #[tokio::test]
    async fn test_agent_unusable_reflection_stops_loop() {
        planning::register_builtin_flows().unwrap();
        register_stub_flow("agent_test_halt", "H");

        let plan = r#"{"steps":[{"step_id":"1","flow_name":"agent_test_halt","description":"go"}]}"#;
        let client = Arc::new(ScriptedClient::new(vec![plan, "not json at all"]));
        let agent = Agent::new("resigned", client)
            .with_reflection(true)
            .with_max_rounds(5);

        let result = agent.execute("goal").await.unwrap();
        assert_eq!(result.output, "H");
        assert_eq!(result.history.len(), 1);
    }
}
