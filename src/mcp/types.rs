//! JSON-RPC 2.0 wire types and server configuration for the Model Context
//! Protocol.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::substitute_env_str;

/// The JSON-RPC version every message carries.
pub const JSONRPC_VERSION: &str = "2.0";
/// Protocol version declared in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_PROMPTS_GET: &str = "prompts/get";

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request.
///
/// IDs are opaque strings, unique per call; response correlation is exact
/// string equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    /// Build a request with a fresh action-prefixed id.
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: new_request_id(method),
            method: method.to_string(),
            params,
        }
    }

    /// Build a request with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// A unique request id, prefixed by the originating method for log
/// readability.
pub fn new_request_id(method: &str) -> String {
    format!("{}-{}", method.replace('/', "-"), Uuid::new_v4())
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpRpcError>,
}

impl McpResponse {
    /// Unwrap into the result payload, surfacing JSON-RPC errors.
    pub fn into_result(self) -> Result<Value, McpRpcError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("MCP error {code}: {message}")]
pub struct McpRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// The one operation an MCP executor performs per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpAction {
    CallTool,
    ReadResource,
    GetPrompt,
    ListTools,
    ListResources,
}

impl Default for McpAction {
    fn default() -> Self {
        McpAction::CallTool
    }
}

impl McpAction {
    /// The JSON-RPC method this action maps to.
    pub fn method(&self) -> &'static str {
        match self {
            McpAction::CallTool => METHOD_TOOLS_CALL,
            McpAction::ReadResource => METHOD_RESOURCES_READ,
            McpAction::GetPrompt => METHOD_PROMPTS_GET,
            McpAction::ListTools => METHOD_TOOLS_LIST,
            McpAction::ListResources => METHOD_RESOURCES_LIST,
        }
    }
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// Transport family of an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportType {
    Http,
    Sse,
    Stdio,
}

impl Default for McpTransportType {
    fn default() -> Self {
        McpTransportType::Stdio
    }
}

impl fmt::Display for McpTransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpTransportType::Http => write!(f, "http"),
            McpTransportType::Sse => write!(f, "sse"),
            McpTransportType::Stdio => write!(f, "stdio"),
        }
    }
}

/// Full configuration of one MCP server.
///
/// Stdio servers need `command` (plus `args`/`env`); http and sse servers
/// need `url` (plus `headers`/`api_key`). `tools` is an optional allow-list
/// for `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: McpTransportType,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub api_key: Option<String>,
    /// Per-call timeout in seconds; falls back to the executor default.
    pub timeout: Option<u64>,
    pub enabled: bool,
    pub tools: Vec<String>,
    pub auto_approve: bool,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            transport: McpTransportType::default(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            url: String::new(),
            headers: HashMap::new(),
            api_key: None,
            timeout: None,
            enabled: true,
            tools: Vec::new(),
            auto_approve: false,
        }
    }
}

impl McpServerConfig {
    /// Apply `${VAR}` environment substitution to every string field.
    pub fn substitute_env(&mut self) {
        self.command = substitute_env_str(&self.command);
        for arg in &mut self.args {
            *arg = substitute_env_str(arg);
        }
        for value in self.env.values_mut() {
            *value = substitute_env_str(value);
        }
        self.url = substitute_env_str(&self.url);
        for value in self.headers.values_mut() {
            *value = substitute_env_str(value);
        }
        if let Some(key) = &self.api_key {
            self.api_key = Some(substitute_env_str(key));
        }
    }

    /// Check transport-specific required fields.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        match self.transport {
            McpTransportType::Stdio => {
                if self.command.is_empty() {
                    return Err(anyhow::anyhow!(
                        "stdio MCP server '{}' requires a command",
                        self.name
                    ));
                }
            }
            McpTransportType::Http | McpTransportType::Sse => {
                if self.url.is_empty() {
                    return Err(anyhow::anyhow!(
                        "{} MCP server '{}' requires a url",
                        self.transport,
                        self.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// Identifier used in logs and cache keys.
    pub fn server_identifier(&self) -> String {
        match self.transport {
            McpTransportType::Stdio => format!("stdio:{}:{}", self.command, self.args.join(":")),
            McpTransportType::Http => format!("http:{}", self.url),
            McpTransportType::Sse => format!("sse:{}", self.url),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
