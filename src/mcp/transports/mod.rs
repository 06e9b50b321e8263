//! JSON-RPC transports: HTTP request/response, Server-Sent Events and a
//! STDIO child process.
//!
//! All three implement the same `send_request` contract; the stream-owning
//! transports (SSE, STDIO) correlate responses to callers through a shared
//! pending-request map keyed by request id.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::mcp::types::{McpRequest, McpResponse, McpServerConfig, McpTransportType};

/// The transport contract shared by HTTP, SSE and STDIO clients.
#[async_trait]
pub trait McpTransport: Send + Sync {
    fn transport_type(&self) -> McpTransportType;

    /// Identifier used in logs.
    fn server_identifier(&self) -> String;

    /// Bring the connection up. Idempotent; called before every request.
    async fn initialize(&self) -> Result<(), anyhow::Error>;

    /// Send one request and wait for its correlated response.
    async fn send_request(&self, request: McpRequest) -> Result<McpResponse, anyhow::Error>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Build the transport matching a validated server configuration.
pub fn build_transport(config: &McpServerConfig) -> Result<Arc<dyn McpTransport>, anyhow::Error> {
    match config.transport {
        McpTransportType::Http => Ok(Arc::new(http::HttpTransport::new(config)?)),
        McpTransportType::Sse => Ok(Arc::new(sse::SseTransport::new(config)?)),
        McpTransportType::Stdio => {
            let transport = Arc::new(stdio::StdioTransport::new(config));
            stdio::register_live(&transport);
            Ok(transport)
        }
    }
}

// ---------------------------------------------------------------------------
// Pending-request correlation
// ---------------------------------------------------------------------------

/// In-flight requests waiting for a response, keyed by request id.
///
/// Receivers are registered before the request is sent; the reader task
/// dispatches each incoming response to exactly the waiter whose id matches.
/// Entries are removed on dispatch, on explicit deregistration, or when the
/// stream dies.
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<McpResponse>>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in a response id.
    pub(crate) fn register(&self, id: &str) -> oneshot::Receiver<McpResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id.to_string(), tx);
        rx
    }

    /// Forget a pending id, e.g. after a deadline fired.
    pub(crate) fn deregister(&self, id: &str) {
        self.waiters.lock().unwrap().remove(id);
    }

    /// Route a response to its waiter. Returns false when nobody is waiting
    /// for that id.
    pub(crate) fn dispatch(&self, response: McpResponse) -> bool {
        let sender = self.waiters.lock().unwrap().remove(&response.id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn fail_all(&self) {
        self.waiters.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

/// Deregisters a pending id unless disarmed.
///
/// Wrapping the wait in this guard keeps the map clean when a caller's
/// deadline cancels the future mid-await.
pub(crate) struct PendingGuard {
    pending: Arc<PendingRequests>,
    id: String,
    armed: bool,
}

impl PendingGuard {
    pub(crate) fn new(pending: Arc<PendingRequests>, id: String) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    /// The response arrived; nothing to clean up.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending.deregister(&self.id);
        }
    }
}
