//! Per-run mutable state carried between steps.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::Flow;

/// The state a flow run threads through its steps.
///
/// `text` is the primary payload: the input to a step and, by default, its
/// output. `memory` is opaque application-defined state carried end to end.
/// `variables` is a typed key-value store that executors read and write and
/// templates can reference. `think` is populated only by the think-tag
/// filter executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowContext {
    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub memory: Value,

    #[serde(default)]
    pub variables: HashMap<String, Value>,

    #[serde(default)]
    pub image_urls: Vec<String>,

    #[serde(default)]
    pub think: String,

    /// The flow currently executing this context; bound by the engine so
    /// executors can discover the flow's default client.
    #[serde(skip)]
    pub flow: Option<Arc<Flow>>,
}

impl FlowContext {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_memory(mut self, memory: Value) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_image_urls(mut self, image_urls: Vec<String>) -> Self {
        self.image_urls = image_urls;
        self
    }

    /// Set a variable, overwriting any previous value.
    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// A variable rendered as plain text: strings come back verbatim, other
    /// values in their JSON form.
    pub fn get_variable_string(&self, key: &str) -> Option<String> {
        self.variables.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
