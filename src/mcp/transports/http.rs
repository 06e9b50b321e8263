//! HTTP request/response transport: one POST per JSON-RPC call.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::mcp::transports::McpTransport;
use crate::mcp::types::{McpRequest, McpResponse, McpServerConfig, McpTransportType};

/// Stateless transport posting each request to a single endpoint.
///
/// Naturally concurrent: there is no shared stream and no correlation state.
pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &McpServerConfig) -> Result<Self, anyhow::Error> {
        if config.url.is_empty() {
            return Err(anyhow::anyhow!("http MCP transport requires a url"));
        }
        Ok(Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    fn transport_type(&self) -> McpTransportType {
        McpTransportType::Http
    }

    fn server_identifier(&self) -> String {
        format!("http:{}", self.url)
    }

    async fn initialize(&self) -> Result<(), anyhow::Error> {
        // Nothing to bring up; each request is independent.
        Ok(())
    }

    async fn send_request(&self, request: McpRequest) -> Result<McpResponse, anyhow::Error> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json");
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("MCP HTTP request to {} failed: {}", self.url, e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(anyhow::anyhow!(
                "MCP server {} returned HTTP {}",
                self.url,
                status
            ));
        }

        response
            .json::<McpResponse>()
            .await
            .map_err(|e| anyhow::anyhow!("invalid JSON-RPC response from {}: {}", self.url, e))
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! One-shot mock HTTP server shared by transport and executor tests.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP responder; returns the full captured request
    /// (headers and body) for inspection.
    pub(crate) async fn spawn_one_shot_server(
        body: String,
        status_line: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let request_text = loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if raw.len() >= header_end + 4 + content_length {
                        break text;
                    }
                }
            };
            let reply = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request_text
        });
        (format!("http://{}", addr), handle)
    }

    /// The body part of a captured request.
    pub(crate) fn body_of(request_text: &str) -> &str {
        request_text
            .split_once("\r\n\r\n")
            .map(|(_, body)| body)
            .unwrap_or("")
    }
}
