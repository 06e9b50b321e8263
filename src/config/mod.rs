//! Declarative configuration: schema, loader and environment substitution.
//!
//! A configuration file (YAML, JSON or TOML, selected by extension) declares
//! clients, formatters, flows and agents. Loading instantiates each entry and
//! registers it in the process-wide registry. `${VAR_NAME}` references inside
//! any string value are substituted from the environment before decoding;
//! undefined variables are left verbatim.

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::Agent;
use crate::chat::formatter::TemplateFormatter;
use crate::errors::ConfigError;
use crate::flow::{Flow, Step};
use crate::registry;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnyiConfig {
    pub clients: Vec<ClientConfig>,
    pub flows: Vec<FlowConfig>,
    pub formatters: Vec<FormatterConfig>,
    pub agents: Vec<AgentConfig>,
}

/// A client to build through a registered client factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub client_type: String,
    pub config: Value,
}

/// A formatter to build from one of the built-in formatter types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub formatter_type: String,
    pub config: Value,
}

/// A flow and its steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub name: String,
    pub client_name: Option<String>,
    pub steps: Vec<StepConfig>,
}

/// One step inside a flow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub name: Option<String>,
    pub executor: ComponentConfig,
    pub validator: Option<ComponentConfig>,
    pub client_name: Option<String>,
    pub max_retry_times: Option<u32>,
    pub vars_immutable: Option<bool>,
}

/// Type name plus configuration map for an executor or validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    pub with_config: Value,
}

/// An agent, its client and its flow allow-list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub role: String,
    pub preferred_language: String,
    pub back_story: String,
    pub client_name: Option<String>,
    pub flows: Vec<String>,
}

// ---------------------------------------------------------------------------
// Environment substitution
// ---------------------------------------------------------------------------

static ENV_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replace every `${VAR_NAME}` in `input` with the variable's value.
/// Undefined variables are left unchanged.
pub fn substitute_env_str(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Recursively substitute environment references in every string scalar.
pub fn substitute_env(value: &mut Value) {
    match value {
        Value::String(s) => {
            let replaced = substitute_env_str(s);
            *s = replaced;
        }
        Value::Array(items) => {
            for item in items {
                substitute_env(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl AnyiConfig {
    /// Parse a configuration file; the extension selects the format.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            cause: e,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let mut value: Value = match ext.as_str() {
            "yaml" | "yml" => {
                serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            "json" => serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?,
            "toml" => {
                let parsed: toml::Value =
                    toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
                serde_json::to_value(parsed).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        substitute_env(&mut value);
        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Parse a configuration file and register everything it declares.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = AnyiConfig::from_file(path)?;
    load(&config)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Instantiate and register every entry of a parsed configuration.
///
/// Order matters: clients first, then formatters, then flows (whose steps may
/// reference clients), then agents (which reference clients and flows). The
/// first failure aborts the load.
pub fn load(config: &AnyiConfig) -> Result<(), ConfigError> {
    for client_cfg in &config.clients {
        let factory = registry::get_client_factory(&client_cfg.client_type).map_err(|_| {
            ConfigError::UnknownType {
                kind: "client",
                name: client_cfg.client_type.clone(),
            }
        })?;
        let client = factory(&client_cfg.config).map_err(|e| ConfigError::Component {
            kind: "client",
            name: client_cfg.name.clone(),
            cause: e,
        })?;
        registry::register_client(&client_cfg.name, client)?;
        log::info!("registered client '{}'", client_cfg.name);
    }

    for formatter_cfg in &config.formatters {
        let formatter = build_formatter(formatter_cfg)?;
        registry::register_formatter(&formatter_cfg.name, formatter)?;
        log::info!("registered formatter '{}'", formatter_cfg.name);
    }

    for flow_cfg in &config.flows {
        let flow = build_flow(flow_cfg)?;
        registry::register_flow(&flow_cfg.name, Arc::new(flow))?;
        log::info!(
            "registered flow '{}' with {} steps",
            flow_cfg.name,
            flow_cfg.steps.len()
        );
    }

    for agent_cfg in &config.agents {
        let agent = build_agent(agent_cfg)?;
        registry::register_agent(&agent_cfg.name, Arc::new(agent))?;
        log::info!("registered agent '{}'", agent_cfg.name);
    }

    Ok(())
}

fn build_formatter(cfg: &FormatterConfig) -> Result<Arc<TemplateFormatter>, ConfigError> {
    let string_field = |key: &str| -> Result<&str, ConfigError> {
        cfg.config
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConfigError::Component {
                kind: "formatter",
                name: cfg.name.clone(),
                cause: anyhow::anyhow!("missing required config key '{}'", key),
            })
    };

    let formatter = match cfg.formatter_type.as_str() {
        "template" => TemplateFormatter::from_string(string_field("template")?),
        "template_file" => TemplateFormatter::from_file(string_field("file")?),
        other => {
            return Err(ConfigError::UnknownType {
                kind: "formatter",
                name: other.to_string(),
            })
        }
    }
    .map_err(|e| ConfigError::Component {
        kind: "formatter",
        name: cfg.name.clone(),
        cause: e,
    })?;
    Ok(Arc::new(formatter))
}

/// Config maps may be absent entirely; executors decode from an empty map
/// in that case.
fn component_config(value: &Value) -> Value {
    if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value.clone()
    }
}

fn build_flow(flow_cfg: &FlowConfig) -> Result<Flow, ConfigError> {
    let default_client = match &flow_cfg.client_name {
        Some(name) => Some(registry::get_client(name)?),
        None => registry::get_default_client().ok(),
    };

    let mut steps = Vec::with_capacity(flow_cfg.steps.len());
    for (index, step_cfg) in flow_cfg.steps.iter().enumerate() {
        let step_name = step_cfg
            .name
            .clone()
            .unwrap_or_else(|| format!("step-{}", index));

        let mut executor =
            registry::get_executor(&step_cfg.executor.type_name).map_err(|_| {
                ConfigError::UnknownType {
                    kind: "executor",
                    name: step_cfg.executor.type_name.clone(),
                }
            })?;
        executor
            .load_config(&component_config(&step_cfg.executor.with_config))
            .and_then(|_| executor.init())
            .map_err(|e| ConfigError::Component {
                kind: "executor",
                name: format!("{}/{}", flow_cfg.name, step_name),
                cause: e,
            })?;

        let mut step = Step::new(step_name.clone(), executor);

        if let Some(validator_cfg) = &step_cfg.validator {
            let mut validator =
                registry::get_validator(&validator_cfg.type_name).map_err(|_| {
                    ConfigError::UnknownType {
                        kind: "validator",
                        name: validator_cfg.type_name.clone(),
                    }
                })?;
            validator
                .load_config(&component_config(&validator_cfg.with_config))
                .and_then(|_| validator.init())
                .map_err(|e| ConfigError::Component {
                    kind: "validator",
                    name: format!("{}/{}", flow_cfg.name, step_name),
                    cause: e,
                })?;
            step = step.with_validator(validator);
        }

        if let Some(client_name) = &step_cfg.client_name {
            step = step.with_client(registry::get_client(client_name)?);
        }
        if let Some(max_retry_times) = step_cfg.max_retry_times {
            step = step.with_max_retries(max_retry_times);
        }
        if let Some(vars_immutable) = step_cfg.vars_immutable {
            step = step.with_vars_immutable(vars_immutable);
        }
        steps.push(step);
    }

    let mut flow = Flow::new(flow_cfg.name.clone(), steps)?;
    flow.default_client = default_client;
    Ok(flow)
}

fn build_agent(agent_cfg: &AgentConfig) -> Result<Agent, ConfigError> {
    let client = match &agent_cfg.client_name {
        Some(name) => registry::get_client(name)?,
        None => registry::get_default_client()?,
    };
    let mut flows = Vec::with_capacity(agent_cfg.flows.len());
    for flow_name in &agent_cfg.flows {
        flows.push(registry::get_flow(flow_name)?);
    }
    Ok(Agent::new(agent_cfg.role.clone(), client)
        .with_backstory(agent_cfg.back_story.clone())
        .with_preferred_language(agent_cfg.preferred_language.clone())
        .with_flows(flows))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
