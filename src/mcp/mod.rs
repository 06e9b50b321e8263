//! Model Context Protocol client subsystem.
//!
//! JSON-RPC 2.0 over three transports (HTTP request/response, Server-Sent
//! Events, STDIO child process), built-in server presets, and the `mcp` step
//! executor that performs one protocol action per invocation.

pub mod executor;
pub mod presets;
pub mod transports;
pub mod types;

pub use executor::McpExecutor;
pub use transports::stdio::shutdown_all;
pub use transports::McpTransport;
pub use types::{
    McpAction, McpRequest, McpResponse, McpRpcError, McpServerConfig, McpTransportType,
    MCP_PROTOCOL_VERSION,
};
