//! Server-Sent Events transport.
//!
//! One long-lived GET carries the server's responses as SSE events; requests
//! go out as POSTs to a sibling endpoint. A scanner task assembles `data:`
//! fragments into complete events at blank-line boundaries and feeds them
//! through a bounded channel to a dispatcher task, which parses each event as
//! a JSON-RPC response and routes it to the caller whose request id matches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mcp::transports::{McpTransport, PendingGuard, PendingRequests};
use crate::mcp::types::{McpRequest, McpResponse, McpServerConfig, McpTransportType};

/// Capacity of the internal assembled-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Stream-end sentinel some servers emit before closing.
const DONE_SENTINEL: &str = "[DONE]";

/// Derive the sibling POST endpoint from the events URL.
pub(crate) fn derive_request_url(events_url: &str) -> String {
    if let Some(base) = events_url.strip_suffix("/events") {
        format!("{}/request", base)
    } else {
        format!("{}/request", events_url.trim_end_matches('/'))
    }
}

// ---------------------------------------------------------------------------
// Event assembly
// ---------------------------------------------------------------------------

/// Incremental SSE parser: bytes in, complete event payloads out.
///
/// `data:` lines accumulate until a blank line completes the event; other
/// SSE fields are ignored. The `[DONE]` sentinel marks the stream finished.
pub(crate) struct SseScanner {
    buffer: String,
    data_lines: Vec<String>,
    done: bool,
}

impl SseScanner {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            data_lines: Vec::new(),
            done: false,
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.done
    }

    /// Feed a chunk; returns every event completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let raw: String = self.buffer.drain(..=newline).collect();
            let line = raw.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                if data == DONE_SENTINEL {
                    self.done = true;
                    break;
                }
                self.data_lines.push(data.to_string());
            }
            // event:/id:/retry: fields are irrelevant to correlation.
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SseState {
    running: bool,
    scanner: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

/// SSE transport owning one event stream and its reader tasks.
pub struct SseTransport {
    events_url: String,
    request_url: String,
    headers: HashMap<String, String>,
    api_key: Option<String>,
    http: reqwest::Client,
    pending: Arc<PendingRequests>,
    state: tokio::sync::Mutex<SseState>,
}

impl SseTransport {
    pub fn new(config: &McpServerConfig) -> Result<Self, anyhow::Error> {
        if config.url.is_empty() {
            return Err(anyhow::anyhow!("sse MCP transport requires a url"));
        }
        Ok(Self {
            events_url: config.url.clone(),
            request_url: derive_request_url(&config.url),
            headers: config.headers.clone(),
            api_key: config.api_key.clone(),
            http: reqwest::Client::new(),
            pending: Arc::new(PendingRequests::new()),
            state: tokio::sync::Mutex::new(SseState::default()),
        })
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        builder
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    fn transport_type(&self) -> McpTransportType {
        McpTransportType::Sse
    }

    fn server_identifier(&self) -> String {
        format!("sse:{}", self.events_url)
    }

    async fn initialize(&self) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        if state.running {
            return Ok(());
        }

        let response = self
            .apply_headers(self.http.get(&self.events_url))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!("failed to open SSE stream {}: {}", self.events_url, e)
            })?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "SSE endpoint {} returned HTTP {}",
                self.events_url,
                response.status()
            ));
        }

        let mut byte_stream = response.bytes_stream();
        let (event_tx, mut event_rx) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);

        let events_url = self.events_url.clone();
        let scanner = tokio::spawn(async move {
            let mut assembler = SseScanner::new();
            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in assembler.push(&bytes) {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        if assembler.finished() {
                            log::debug!("sse stream {} finished", events_url);
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("sse stream {} error: {}", events_url, e);
                        break;
                    }
                }
            }
        });

        let pending = self.pending.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match serde_json::from_str::<McpResponse>(&event) {
                    Ok(response) => {
                        if !pending.dispatch(response) {
                            log::debug!("sse event with no waiting request, skipped");
                        }
                    }
                    Err(e) => log::debug!("skipping non-JSON-RPC sse event: {}", e),
                }
            }
            // Stream gone; nothing further will resolve.
            pending.fail_all();
        });

        state.running = true;
        state.scanner = Some(scanner);
        state.dispatcher = Some(dispatcher);
        log::info!("sse transport connected: {}", self.events_url);
        Ok(())
    }

    async fn send_request(&self, request: McpRequest) -> Result<McpResponse, anyhow::Error> {
        self.initialize().await?;

        let receiver = self.pending.register(&request.id);
        let guard = PendingGuard::new(self.pending.clone(), request.id.clone());

        let response = self
            .apply_headers(self.http.post(&self.request_url))
            .header(CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!("MCP SSE request to {} failed: {}", self.request_url, e)
            })?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "MCP SSE endpoint {} returned HTTP {}",
                self.request_url,
                response.status()
            ));
        }

        let correlated = receiver
            .await
            .map_err(|_| anyhow::anyhow!("SSE stream closed before the response arrived"))?;
        guard.disarm();
        Ok(correlated)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.scanner.take() {
            handle.abort();
        }
        if let Some(handle) = state.dispatcher.take() {
            handle.abort();
        }
        state.running = false;
        self.pending.fail_all();
        log::info!("sse transport disconnected: {}", self.events_url);
        Ok(())
    }
}
