//! The MCP step executor: one protocol action per invocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::flow::step::{Step, StepExecutor};
use crate::flow::FlowContext;
use crate::mcp::presets;
use crate::mcp::transports::{self, McpTransport};
use crate::mcp::types::{McpAction, McpRequest, McpServerConfig};

/// Default per-call deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default transport retry budget.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
/// Variable the result lands in unless configured otherwise.
pub const DEFAULT_RESULT_VAR: &str = "mcpResult";

/// Linear back-off unit between transport retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

static VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Performs one MCP action against one server per run.
///
/// The server comes from a preset name or a full configuration, never both.
/// Transport failures and timeouts retry with linear back-off; JSON-RPC error
/// responses surface immediately. The result is stored under
/// `result_var_name` and optionally rendered into the context text.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct McpExecutor {
    pub action: McpAction,
    pub preset: Option<String>,
    pub server: Option<McpServerConfig>,
    pub tool_name: Option<String>,
    pub resource: Option<String>,
    pub prompt: Option<String>,
    pub tool_args: HashMap<String, Value>,
    pub result_var_name: String,
    pub output_to_context: bool,
    /// Per-call deadline in seconds; a server-level timeout overrides it.
    pub timeout: u64,
    pub retry_attempts: u32,
    #[serde(skip)]
    resolved: Option<McpServerConfig>,
    #[serde(skip)]
    transport: OnceCell<Arc<dyn McpTransport>>,
}

impl Default for McpExecutor {
    fn default() -> Self {
        Self {
            action: McpAction::default(),
            preset: None,
            server: None,
            tool_name: None,
            resource: None,
            prompt: None,
            tool_args: HashMap::new(),
            result_var_name: DEFAULT_RESULT_VAR.to_string(),
            output_to_context: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            resolved: None,
            transport: OnceCell::new(),
        }
    }
}

impl Clone for McpExecutor {
    fn clone(&self) -> Self {
        Self {
            action: self.action,
            preset: self.preset.clone(),
            server: self.server.clone(),
            tool_name: self.tool_name.clone(),
            resource: self.resource.clone(),
            prompt: self.prompt.clone(),
            tool_args: self.tool_args.clone(),
            result_var_name: self.result_var_name.clone(),
            output_to_context: self.output_to_context,
            timeout: self.timeout,
            retry_attempts: self.retry_attempts,
            resolved: self.resolved.clone(),
            // Clones never share a live connection.
            transport: OnceCell::new(),
        }
    }
}

impl fmt::Debug for McpExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpExecutor")
            .field("action", &self.action)
            .field("preset", &self.preset)
            .field("server", &self.server.as_ref().map(|s| s.server_identifier()))
            .field("tool_name", &self.tool_name)
            .field("result_var_name", &self.result_var_name)
            .field("output_to_context", &self.output_to_context)
            .field("timeout", &self.timeout)
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

impl McpExecutor {
    /// Resolve preset or inline configuration into a validated server config.
    fn resolve_config(&self) -> Result<McpServerConfig, anyhow::Error> {
        let mut config = match (&self.preset, &self.server) {
            (Some(_), Some(_)) => {
                return Err(anyhow::anyhow!(
                    "mcp executor accepts only one of preset and server"
                ))
            }
            (Some(name), None) => presets::preset(name)
                .ok_or_else(|| anyhow::anyhow!("unknown MCP preset '{}'", name))?,
            (None, Some(server)) => server.clone(),
            (None, None) => {
                return Err(anyhow::anyhow!(
                    "mcp executor requires one of preset or server"
                ))
            }
        };

        config.substitute_env();
        if !config.enabled {
            return Err(anyhow::anyhow!("MCP server '{}' is disabled", config.name));
        }
        config.validate()?;

        match self.action {
            McpAction::CallTool => {
                let tool = self
                    .tool_name
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("call_tool action requires tool_name"))?;
                if !config.tools.is_empty() && !config.tools.iter().any(|t| t == tool) {
                    return Err(anyhow::anyhow!(
                        "tool '{}' is not in the allow-list of MCP server '{}'",
                        tool,
                        config.name
                    ));
                }
            }
            McpAction::ReadResource => {
                if self.resource.as_deref().unwrap_or("").is_empty() {
                    return Err(anyhow::anyhow!("read_resource action requires resource"));
                }
            }
            McpAction::GetPrompt => {
                if self.prompt.as_deref().unwrap_or("").is_empty() {
                    return Err(anyhow::anyhow!("get_prompt action requires prompt"));
                }
            }
            McpAction::ListTools | McpAction::ListResources => {}
        }
        Ok(config)
    }

    /// Build the JSON-RPC params for the configured action.
    fn build_params(
        &self,
        ctx: &FlowContext,
    ) -> Result<Option<Value>, anyhow::Error> {
        match self.action {
            McpAction::CallTool => {
                let tool = self
                    .tool_name
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("call_tool action requires tool_name"))?;
                Ok(Some(serde_json::json!({
                    "name": tool,
                    "arguments": expand_args(&self.tool_args, &ctx.variables),
                })))
            }
            McpAction::ReadResource => {
                let resource = self
                    .resource
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("read_resource action requires resource"))?;
                Ok(Some(serde_json::json!({ "uri": resource })))
            }
            McpAction::GetPrompt => {
                let prompt = self
                    .prompt
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("get_prompt action requires prompt"))?;
                Ok(Some(serde_json::json!({
                    "name": prompt,
                    "arguments": expand_args(&self.tool_args, &ctx.variables),
                })))
            }
            McpAction::ListTools | McpAction::ListResources => Ok(None),
        }
    }

    fn store_result(&self, ctx: &mut FlowContext, result: Value) {
        if self.output_to_context {
            ctx.text = render_result(&result);
        }
        ctx.variables.insert(self.result_var_name.clone(), result);
    }

    #[cfg(test)]
    pub(crate) fn inject_transport(&self, transport: Arc<dyn McpTransport>) {
        self.transport
            .set(transport)
            .unwrap_or_else(|_| panic!("transport already set"));
    }
}

#[async_trait]
impl StepExecutor for McpExecutor {
    fn init(&mut self) -> Result<(), anyhow::Error> {
        self.resolved = Some(self.resolve_config()?);
        Ok(())
    }

    async fn run(&self, ctx: &mut FlowContext, step: &Step) -> Result<(), anyhow::Error> {
        let config = match &self.resolved {
            Some(config) => config.clone(),
            // Init was bypassed; resolve transiently.
            None => self.resolve_config()?,
        };
        if !config.auto_approve {
            log::debug!(
                "mcp step '{}': auto-approve disabled for server '{}', proceeding without an approval hook",
                step.name,
                config.name
            );
        }

        let transport = self
            .transport
            .get_or_try_init(|| async { transports::build_transport(&config) })
            .await?
            .clone();

        let params = self.build_params(ctx)?;
        let deadline = Duration::from_secs(config.timeout.unwrap_or(self.timeout));
        let attempts = self.retry_attempts.max(1);
        let method = self.action.method();

        let mut last_error = None;
        for attempt in 1..=attempts {
            // Fresh id per attempt so a late reply to a timed-out try cannot
            // be mistaken for this one.
            let request = McpRequest::new(method, params.clone());
            let started = Instant::now();
            log::debug!(
                "mcp step '{}' {} on {} (attempt {}/{})",
                step.name,
                method,
                transport.server_identifier(),
                attempt,
                attempts
            );

            let outcome = tokio::time::timeout(deadline, async {
                transport.initialize().await?;
                transport.send_request(request).await
            })
            .await;

            match outcome {
                Ok(Ok(response)) => match response.into_result() {
                    Ok(result) => {
                        log::info!(
                            "mcp step '{}' {} completed ({}ms)",
                            step.name,
                            method,
                            started.elapsed().as_millis()
                        );
                        self.store_result(ctx, result);
                        return Ok(());
                    }
                    // JSON-RPC errors are answers, not transport faults.
                    Err(rpc_error) => return Err(rpc_error.into()),
                },
                Ok(Err(e)) => {
                    log::warn!(
                        "mcp step '{}' {} failed (attempt {}/{}): {}",
                        step.name,
                        method,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    last_error = Some(anyhow::anyhow!(
                        "MCP call timed out after {}s",
                        deadline.as_secs()
                    ));
                }
            }

            if attempt < attempts {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("MCP call failed after {} attempts", attempts)))
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
// Argument expansion & result rendering
// ---------------------------------------------------------------------------

/// Expand `${var}` references against flow variables in every string value.
///
/// A value that is exactly one reference takes the variable's JSON value,
/// type preserved; embedded references interpolate as text. Undefined
/// variables are left verbatim.
pub(crate) fn expand_args(
    args: &HashMap<String, Value>,
    variables: &HashMap<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut expanded = serde_json::Map::new();
    for (key, value) in args {
        expanded.insert(key.clone(), expand_value(value, variables));
    }
    expanded
}

fn expand_value(value: &Value, variables: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(name) = s
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                if !name.contains(['{', '}', '$']) {
                    if let Some(variable) = variables.get(name) {
                        return variable.clone();
                    }
                }
            }
            let interpolated = VAR_RE.replace_all(s, |caps: &regex::Captures<'_>| {
                match variables.get(&caps[1]) {
                    Some(Value::String(v)) => v.clone(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                }
            });
            Value::String(interpolated.into_owned())
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| expand_value(v, variables)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render an MCP result for the context text: a `text` field first, then
/// `content` (string or text-part list), else pretty JSON.
pub(crate) fn render_result(result: &Value) -> String {
    if let Some(text) = result.get("text").and_then(|v| v.as_str()) {
        return text.to_string();
    }
    if let Some(content) = result.get("content") {
        if let Some(s) = content.as_str() {
            return s.to_string();
        }
        if let Some(items) = content.as_array() {
            let texts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect();
            if !texts.is_empty() {
                return texts.join("\n");
            }
        }
    }
    serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
