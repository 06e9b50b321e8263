//! STDIO child-process transport.
//!
//! Spawns the configured command with piped stdio, writes one JSON-RPC
//! request per line to its stdin and correlates newline-delimited responses
//! from its stdout through the shared pending map. Stderr lines are logged
//! as opaque diagnostics. The first use performs the `initialize` handshake.
//!
//! Close drops stdin (EOF is the stop signal stdio servers honour), waits up
//! to five seconds, then force-kills and reaps. Children are additionally
//! killed when the handle drops, and `shutdown_all` closes every live
//! transport registered in the process-wide list.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::mcp::transports::{McpTransport, PendingGuard, PendingRequests};
use crate::mcp::types::{
    McpRequest, McpResponse, McpServerConfig, McpTransportType, MCP_PROTOCOL_VERSION,
    METHOD_INITIALIZE,
};

/// How long Close waits for a voluntary exit before force-killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Deadline for the initialize handshake.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Live-transport registry
// ---------------------------------------------------------------------------

static LIVE_TRANSPORTS: Lazy<Mutex<Vec<Weak<StdioTransport>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Track a transport so `shutdown_all` can reach it.
pub(crate) fn register_live(transport: &Arc<StdioTransport>) {
    let mut live = LIVE_TRANSPORTS.lock().unwrap();
    live.retain(|weak| weak.strong_count() > 0);
    live.push(Arc::downgrade(transport));
}

/// Close every live STDIO transport. Hosts should call this on teardown so
/// child servers cannot orphan.
pub async fn shutdown_all() {
    let transports: Vec<Arc<StdioTransport>> = {
        let mut live = LIVE_TRANSPORTS.lock().unwrap();
        live.drain(..).filter_map(|weak| weak.upgrade()).collect()
    };
    for transport in transports {
        if let Err(e) = transport.close().await {
            log::warn!(
                "error closing stdio transport {}: {}",
                transport.server_identifier(),
                e
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Reader loops
// ---------------------------------------------------------------------------

/// Consume newline-delimited JSON-RPC responses and route them by id.
///
/// Generic over the reader so tests can drive it with an in-memory stream.
/// When the stream ends, outstanding waiters observe a closed channel.
async fn read_loop<R>(reader: BufReader<R>, pending: Arc<PendingRequests>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<McpResponse>(line) {
                    Ok(response) => {
                        if !pending.dispatch(response) {
                            log::debug!("stdio response with no waiting request, skipped");
                        }
                    }
                    Err(e) => log::warn!("skipping unparseable stdio line: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("stdio read error: {}", e);
                break;
            }
        }
    }
    pending.fail_all();
}

/// Log the child's stderr lines as diagnostics.
async fn stderr_loop<R>(reader: BufReader<R>, server_name: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("mcp[{}] stderr: {}", server_name, line);
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StdioState {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<()>>,
    initialized: bool,
}

/// Transport owning one child process and its response stream.
pub struct StdioTransport {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    pending: Arc<PendingRequests>,
    state: tokio::sync::Mutex<StdioState>,
}

impl StdioTransport {
    pub fn new(config: &McpServerConfig) -> Self {
        Self {
            name: if config.name.is_empty() {
                config.command.clone()
            } else {
                config.name.clone()
            },
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            pending: Arc::new(PendingRequests::new()),
            state: tokio::sync::Mutex::new(StdioState::default()),
        }
    }

    /// Spawn the child and run the initialize handshake.
    async fn start_locked(&self, state: &mut StdioState) -> Result<(), anyhow::Error> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            anyhow::anyhow!("failed to start MCP server process '{}': {}", self.command, e)
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stderr not piped"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("child stdin not piped"))?;

        state.reader = Some(tokio::spawn(read_loop(
            BufReader::new(stdout),
            self.pending.clone(),
        )));
        state.stderr_reader = Some(tokio::spawn(stderr_loop(
            BufReader::new(stderr),
            self.name.clone(),
        )));
        state.stdin = Some(stdin);
        state.child = Some(child);

        log::info!(
            "stdio transport started: {} {}",
            self.command,
            self.args.join(" ")
        );

        // Handshake before anything else goes over the pipe.
        let request = McpRequest::new(
            METHOD_INITIALIZE,
            Some(serde_json::json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        );
        let receiver = self.pending.register(&request.id);
        if let Err(e) = Self::write_request_locked(state, &request).await {
            self.pending.deregister(&request.id);
            self.stop_locked(state).await;
            return Err(e);
        }

        match tokio::time::timeout(INITIALIZE_TIMEOUT, receiver).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    self.stop_locked(state).await;
                    return Err(anyhow::anyhow!("MCP initialize failed: {}", error));
                }
            }
            Ok(Err(_)) => {
                self.stop_locked(state).await;
                return Err(anyhow::anyhow!(
                    "MCP server '{}' closed before completing initialize",
                    self.name
                ));
            }
            Err(_) => {
                self.pending.deregister(&request.id);
                self.stop_locked(state).await;
                return Err(anyhow::anyhow!(
                    "MCP initialize timed out after {}s",
                    INITIALIZE_TIMEOUT.as_secs()
                ));
            }
        }

        state.initialized = true;
        Ok(())
    }

    async fn write_request_locked(
        state: &mut StdioState,
        request: &McpRequest,
    ) -> Result<(), anyhow::Error> {
        let stdin = state
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("stdio transport is closed"))?;
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Tear down the child: EOF on stdin, graceful wait, force-kill, join.
    async fn stop_locked(&self, state: &mut StdioState) {
        state.initialized = false;
        // Dropping stdin delivers EOF, the stop signal for stdio servers.
        state.stdin.take();

        if let Some(mut child) = state.child.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    log::debug!("mcp[{}] exited with {}", self.name, status);
                }
                Ok(Err(e)) => {
                    log::warn!("mcp[{}] wait failed: {}", self.name, e);
                }
                Err(_) => {
                    log::warn!(
                        "mcp[{}] did not exit within {}s, force-killing",
                        self.name,
                        SHUTDOWN_GRACE.as_secs()
                    );
                    let _ = child.kill().await;
                }
            }
        }

        for handle in [state.reader.take(), state.stderr_reader.take()]
            .into_iter()
            .flatten()
        {
            // Readers end on EOF once the child is gone; reap, don't hang.
            let mut handle = handle;
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        self.pending.fail_all();
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn transport_type(&self) -> McpTransportType {
        McpTransportType::Stdio
    }

    fn server_identifier(&self) -> String {
        format!("stdio:{}:{}", self.command, self.args.join(":"))
    }

    async fn initialize(&self) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }
        self.start_locked(&mut state).await
    }

    async fn send_request(&self, request: McpRequest) -> Result<McpResponse, anyhow::Error> {
        self.initialize().await?;

        let receiver = self.pending.register(&request.id);
        let guard = PendingGuard::new(self.pending.clone(), request.id.clone());
        {
            let mut state = self.state.lock().await;
            Self::write_request_locked(&mut state, &request).await?;
        }

        let response = receiver
            .await
            .map_err(|_| anyhow::anyhow!("MCP server '{}' closed before responding", self.name))?;
        guard.disarm();
        Ok(response)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        if state.child.is_none() && !state.initialized {
            return Ok(());
        }
        self.stop_locked(&mut state).await;
        log::info!("stdio transport closed: {}", self.command);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
