//! The process-wide component registry.
//!
//! One global store of named clients, flows, executors, validators,
//! formatters and agents, plus client factories for the declarative loader.
//! Reads take a read lock and release before returning; writes take a write
//! lock for the map update. Executor and validator lookups return a fresh
//! clone so concurrent flow runs never share mutable executor state; other
//! kinds are shared `Arc` handles.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::agent::Agent;
use crate::chat::formatter::PromptFormatter;
use crate::errors::RegistryError;
use crate::flow::step::{StepExecutor, StepValidator};
use crate::flow::Flow;
use crate::llm::ClientRef;

/// Builds a client from a decoded `config` map. Provider adapters register
/// one factory per client type name.
pub type ClientFactory = Arc<dyn Fn(&Value) -> Result<ClientRef, anyhow::Error> + Send + Sync>;

#[derive(Default)]
struct Registry {
    clients: HashMap<String, ClientRef>,
    flows: HashMap<String, Arc<Flow>>,
    executors: HashMap<String, Box<dyn StepExecutor>>,
    validators: HashMap<String, Box<dyn StepValidator>>,
    formatters: HashMap<String, Arc<dyn PromptFormatter>>,
    agents: HashMap<String, Arc<Agent>>,
    client_factories: HashMap<String, ClientFactory>,
    default_client_name: Option<String>,
}

static GLOBAL: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));

fn check_name(kind: &'static str, name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::EmptyName { kind });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// Register a client. Duplicate names are rejected.
pub fn register_client(name: &str, client: ClientRef) -> Result<(), RegistryError> {
    check_name("client", name)?;
    let mut reg = GLOBAL.write().unwrap();
    if reg.clients.contains_key(name) {
        return Err(RegistryError::Duplicate {
            kind: "client",
            name: name.to_string(),
        });
    }
    reg.clients.insert(name.to_string(), client);
    Ok(())
}

pub fn get_client(name: &str) -> Result<ClientRef, RegistryError> {
    check_name("client", name)?;
    let reg = GLOBAL.read().unwrap();
    reg.clients
        .get(name)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound {
            kind: "client",
            name: name.to_string(),
        })
}

/// Name the client that `get_default_client` should prefer.
pub fn set_default_client_name(name: &str) {
    let mut reg = GLOBAL.write().unwrap();
    reg.default_client_name = Some(name.to_string());
}

/// Resolve the default client: the configured default name, else the only
/// registered client, else a client literally named "default".
pub fn get_default_client() -> Result<ClientRef, RegistryError> {
    let reg = GLOBAL.read().unwrap();
    if let Some(name) = &reg.default_client_name {
        if let Some(client) = reg.clients.get(name) {
            return Ok(client.clone());
        }
    }
    if reg.clients.len() == 1 {
        if let Some(client) = reg.clients.values().next() {
            return Ok(client.clone());
        }
    }
    if let Some(client) = reg.clients.get("default") {
        return Ok(client.clone());
    }
    Err(RegistryError::NoDefaultClient)
}

// ---------------------------------------------------------------------------
// Client factories
// ---------------------------------------------------------------------------

/// Register a factory for a client type name used in configuration files.
/// Re-registration replaces the previous factory.
pub fn register_client_factory(type_name: &str, factory: ClientFactory) -> Result<(), RegistryError> {
    check_name("client factory", type_name)?;
    let mut reg = GLOBAL.write().unwrap();
    reg.client_factories.insert(type_name.to_string(), factory);
    Ok(())
}

pub fn get_client_factory(type_name: &str) -> Result<ClientFactory, RegistryError> {
    check_name("client factory", type_name)?;
    let reg = GLOBAL.read().unwrap();
    reg.client_factories
        .get(type_name)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound {
            kind: "client factory",
            name: type_name.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// Register a flow. Duplicate names are rejected.
pub fn register_flow(name: &str, flow: Arc<Flow>) -> Result<(), RegistryError> {
    check_name("flow", name)?;
    let mut reg = GLOBAL.write().unwrap();
    if reg.flows.contains_key(name) {
        return Err(RegistryError::Duplicate {
            kind: "flow",
            name: name.to_string(),
        });
    }
    reg.flows.insert(name.to_string(), flow);
    Ok(())
}

/// Register or replace a flow; used for the built-in flows installed by
/// `init` so repeated initialization stays idempotent.
pub fn install_flow(name: &str, flow: Arc<Flow>) -> Result<(), RegistryError> {
    check_name("flow", name)?;
    let mut reg = GLOBAL.write().unwrap();
    reg.flows.insert(name.to_string(), flow);
    Ok(())
}

pub fn get_flow(name: &str) -> Result<Arc<Flow>, RegistryError> {
    check_name("flow", name)?;
    let reg = GLOBAL.read().unwrap();
    reg.flows
        .get(name)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound {
            kind: "flow",
            name: name.to_string(),
        })
}

pub fn flow_exists(name: &str) -> bool {
    GLOBAL.read().unwrap().flows.contains_key(name)
}

// ---------------------------------------------------------------------------
// Executors & validators (clone-on-get prototypes)
// ---------------------------------------------------------------------------

/// Register an executor prototype. Duplicate names are rejected.
pub fn register_executor(name: &str, executor: Box<dyn StepExecutor>) -> Result<(), RegistryError> {
    check_name("executor", name)?;
    let mut reg = GLOBAL.write().unwrap();
    if reg.executors.contains_key(name) {
        return Err(RegistryError::Duplicate {
            kind: "executor",
            name: name.to_string(),
        });
    }
    reg.executors.insert(name.to_string(), executor);
    Ok(())
}

/// Register or replace an executor prototype; the permissive path used for
/// the built-in types.
pub fn install_executor(name: &str, executor: Box<dyn StepExecutor>) -> Result<(), RegistryError> {
    check_name("executor", name)?;
    let mut reg = GLOBAL.write().unwrap();
    reg.executors.insert(name.to_string(), executor);
    Ok(())
}

/// A fresh copy of the named executor prototype.
pub fn get_executor(name: &str) -> Result<Box<dyn StepExecutor>, RegistryError> {
    check_name("executor", name)?;
    let reg = GLOBAL.read().unwrap();
    reg.executors
        .get(name)
        .map(|e| e.clone_box())
        .ok_or_else(|| RegistryError::NotFound {
            kind: "executor",
            name: name.to_string(),
        })
}

/// Register a validator prototype. Duplicate names are rejected.
pub fn register_validator(name: &str, validator: Box<dyn StepValidator>) -> Result<(), RegistryError> {
    check_name("validator", name)?;
    let mut reg = GLOBAL.write().unwrap();
    if reg.validators.contains_key(name) {
        return Err(RegistryError::Duplicate {
            kind: "validator",
            name: name.to_string(),
        });
    }
    reg.validators.insert(name.to_string(), validator);
    Ok(())
}

/// Register or replace a validator prototype.
pub fn install_validator(name: &str, validator: Box<dyn StepValidator>) -> Result<(), RegistryError> {
    check_name("validator", name)?;
    let mut reg = GLOBAL.write().unwrap();
    reg.validators.insert(name.to_string(), validator);
    Ok(())
}

/// A fresh copy of the named validator prototype.
pub fn get_validator(name: &str) -> Result<Box<dyn StepValidator>, RegistryError> {
    check_name("validator", name)?;
    let reg = GLOBAL.read().unwrap();
    reg.validators
        .get(name)
        .map(|v| v.clone_box())
        .ok_or_else(|| RegistryError::NotFound {
            kind: "validator",
            name: name.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Formatters
// ---------------------------------------------------------------------------

pub fn register_formatter(
    name: &str,
    formatter: Arc<dyn PromptFormatter>,
) -> Result<(), RegistryError> {
    check_name("formatter", name)?;
    let mut reg = GLOBAL.write().unwrap();
    if reg.formatters.contains_key(name) {
        return Err(RegistryError::Duplicate {
            kind: "formatter",
            name: name.to_string(),
        });
    }
    reg.formatters.insert(name.to_string(), formatter);
    Ok(())
}

pub fn get_formatter(name: &str) -> Result<Arc<dyn PromptFormatter>, RegistryError> {
    check_name("formatter", name)?;
    let reg = GLOBAL.read().unwrap();
    reg.formatters
        .get(name)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound {
            kind: "formatter",
            name: name.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

pub fn register_agent(name: &str, agent: Arc<Agent>) -> Result<(), RegistryError> {
    check_name("agent", name)?;
    let mut reg = GLOBAL.write().unwrap();
    if reg.agents.contains_key(name) {
        return Err(RegistryError::Duplicate {
            kind: "agent",
            name: name.to_string(),
        });
    }
    reg.agents.insert(name.to_string(), agent);
    Ok(())
}

pub fn get_agent(name: &str) -> Result<Arc<Agent>, RegistryError> {
    check_name("agent", name)?;
    let reg = GLOBAL.read().unwrap();
    reg.agents
        .get(name)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound {
            kind: "agent",
            name: name.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Built-in type installation
// ---------------------------------------------------------------------------

/// Executor type name constants as used in configuration files.
pub const EXECUTOR_LLM: &str = "llm";
pub const EXECUTOR_SET_CONTEXT: &str = "setContext";
pub const EXECUTOR_SET_VARIABLES: &str = "setVariables";
pub const EXECUTOR_CONDITION: &str = "condition";
pub const EXECUTOR_EXEC: &str = "exec";
pub const EXECUTOR_MCP: &str = "mcp";
pub const EXECUTOR_DEEPSEEK_FILTER: &str = "deepSeekStyleResponseFilter";

/// Validator type name constants.
pub const VALIDATOR_STRING: &str = "string";
pub const VALIDATOR_JSON: &str = "json";

/// Install the built-in executor and validator prototypes. Idempotent:
/// existing entries under the built-in names are replaced.
pub fn install_builtins() -> Result<(), RegistryError> {
    use crate::executors::{
        ConditionalFlowExecutor, DeepSeekStyleResponseFilter, LlmExecutor, RunCommandExecutor,
        SetContextExecutor, SetVariablesExecutor,
    };
    use crate::mcp::McpExecutor;
    use crate::validators::{JsonValidator, StringValidator};

    install_executor(EXECUTOR_LLM, Box::new(LlmExecutor::default()))?;
    install_executor(EXECUTOR_SET_CONTEXT, Box::new(SetContextExecutor::default()))?;
    install_executor(
        EXECUTOR_SET_VARIABLES,
        Box::new(SetVariablesExecutor::default()),
    )?;
    install_executor(
        EXECUTOR_CONDITION,
        Box::new(ConditionalFlowExecutor::default()),
    )?;
    install_executor(EXECUTOR_EXEC, Box::new(RunCommandExecutor::default()))?;
    install_executor(EXECUTOR_MCP, Box::new(McpExecutor::default()))?;
    install_executor(
        EXECUTOR_DEEPSEEK_FILTER,
        Box::new(DeepSeekStyleResponseFilter::default()),
    )?;

    install_validator(VALIDATOR_STRING, Box::new(StringValidator::default()))?;
    install_validator(VALIDATOR_JSON, Box::new(JsonValidator))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
