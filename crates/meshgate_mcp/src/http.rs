//! HTTP transport.
//!
//! A small HTTP/1.1 server over a TCP listener: bounded request parsing,
//! a read timeout per request, JSON responses with explicit lengths, and a
//! long-lived SSE write path. Anything protocol-shaped (sessions, JSON-RPC,
//! tool semantics) belongs to the router; this module only moves bytes and
//! maps transport failures to status codes.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::router::{JsonReply, Router};

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// MCP endpoint path
    pub path: String,
    pub max_body_bytes: usize,
    pub max_header_bytes: usize,
    pub read_timeout_ms: u64,
    /// Drain budget for in-flight handlers during shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8736,
            path: "/mcp".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
            max_header_bytes: 64 * 1024,
            read_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// A parsed request.
#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    /// Lowercased header names
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

enum ParseOutcome {
    Request(HttpRequest),
    /// Peer closed between requests
    Closed,
    Malformed(String),
    HeadersTooLarge,
    PayloadTooLarge,
}

/// A bound, not-yet-serving HTTP server.
pub struct HttpServer {
    config: HttpConfig,
    router: Arc<Router>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HttpServer {
    /// Bind the configured address. Port 0 picks an ephemeral port.
    pub async fn bind(config: HttpConfig, router: Arc<Router>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let local_addr = listener.local_addr().context("Failed to read local addr")?;
        Ok(Self {
            config,
            router,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Returns after `shutdown` flips, once the grace period
    /// for in-flight handlers has elapsed.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "MCP endpoint listening on http://{}{}",
            self.local_addr, self.config.path
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("Accept failed: {err}");
                            continue;
                        }
                    };
                    debug!("Connection from {peer}");
                    let config = self.config.clone();
                    let router = Arc::clone(&self.router);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, config, router, shutdown).await;
                    });
                }
            }
        }

        // Stop accepting, then let in-flight handlers finish.
        drop(self.listener);
        tokio::time::sleep(Duration::from_millis(self.config.shutdown_grace_ms)).await;
        info!("HTTP server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: HttpConfig,
    router: Arc<Router>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let parsed = match tokio::time::timeout(
            Duration::from_millis(config.read_timeout_ms),
            parse_request(&mut reader, &config),
        )
        .await
        {
            Ok(parsed) => parsed,
            Err(_) => break, // idle past the read timeout
        };

        let request = match parsed {
            ParseOutcome::Request(request) => request,
            ParseOutcome::Closed => break,
            ParseOutcome::Malformed(reason) => {
                let _ = write_json(
                    &mut write_half,
                    400,
                    &serde_json::json!({ "error": reason }),
                    None,
                )
                .await;
                break;
            }
            ParseOutcome::HeadersTooLarge => {
                let _ = write_json(
                    &mut write_half,
                    400,
                    &serde_json::json!({ "error": "headers too large" }),
                    None,
                )
                .await;
                break;
            }
            ParseOutcome::PayloadTooLarge => {
                let _ = write_json(
                    &mut write_half,
                    413,
                    &serde_json::json!({ "error": "payload too large" }),
                    None,
                )
                .await;
                break;
            }
        };

        if request.path != config.path {
            let ok = write_json(
                &mut write_half,
                404,
                &serde_json::json!({ "error": "not found" }),
                None,
            )
            .await;
            if ok.is_err() {
                break;
            }
            continue;
        }

        match request.method.as_str() {
            "OPTIONS" => {
                if write_preflight(&mut write_half).await.is_err() {
                    break;
                }
            }
            "GET" => {
                let accepts_sse = request
                    .headers
                    .get("accept")
                    .map(|a| a.contains("text/event-stream"))
                    .unwrap_or(false);
                if !accepts_sse {
                    let _ = write_json(
                        &mut write_half,
                        405,
                        &serde_json::json!({ "error": "method not allowed" }),
                        None,
                    )
                    .await;
                    break;
                }

                match router.handle_sse_attach(&request.headers, &request.query).await {
                    Ok(mut stream) => {
                        if write_sse_preamble(&mut write_half).await.is_err() {
                            break;
                        }
                        // Long-lived write loop; the connection is dedicated
                        // to this stream from here on.
                        loop {
                            tokio::select! {
                                frame = stream.rx.recv() => match frame {
                                    Some(frame) => {
                                        if write_half.write_all(frame.as_bytes()).await.is_err()
                                            || write_half.flush().await.is_err()
                                        {
                                            break;
                                        }
                                    }
                                    None => break,
                                },
                                _ = shutdown.changed() => break,
                            }
                        }
                        break;
                    }
                    Err(reply) => {
                        if write_reply(&mut write_half, reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            "POST" => {
                let is_json = request
                    .headers
                    .get("content-type")
                    .map(|ct| ct.contains("application/json"))
                    .unwrap_or(false);
                if !is_json {
                    let _ = write_json(
                        &mut write_half,
                        400,
                        &serde_json::json!({ "error": "Content-Type must be application/json" }),
                        None,
                    )
                    .await;
                    break;
                }

                let reply = router.handle_post(&request.headers, &request.body).await;
                if write_reply(&mut write_half, reply).await.is_err() {
                    break;
                }
            }
            "DELETE" => {
                let reply = router.handle_delete(&request.headers).await;
                if write_reply(&mut write_half, reply).await.is_err() {
                    break;
                }
            }
            _ => {
                let _ = write_json(
                    &mut write_half,
                    405,
                    &serde_json::json!({ "error": "method not allowed" }),
                    None,
                )
                .await;
                break;
            }
        }
    }
}

async fn parse_request(
    reader: &mut BufReader<OwnedReadHalf>,
    config: &HttpConfig,
) -> ParseOutcome {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => return ParseOutcome::Closed,
        Ok(_) => {}
        Err(_) => return ParseOutcome::Closed,
    }

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return ParseOutcome::Malformed("invalid request line".to_string());
    };
    let method = method.to_ascii_uppercase();
    let (path, query) = split_target(target);

    let mut headers = HashMap::new();
    let mut header_bytes = 0usize;
    loop {
        let mut header_line = String::new();
        match reader.read_line(&mut header_line).await {
            Ok(0) => return ParseOutcome::Closed,
            Ok(n) => header_bytes += n,
            Err(_) => return ParseOutcome::Closed,
        }
        if header_bytes > config.max_header_bytes {
            return ParseOutcome::HeadersTooLarge;
        }

        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return ParseOutcome::Malformed("invalid header line".to_string());
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > config.max_body_bytes {
        return ParseOutcome::PayloadTooLarge;
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 && reader.read_exact(&mut body).await.is_err() {
        return ParseOutcome::Closed;
    }

    ParseOutcome::Request(HttpRequest {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    match target.split_once('?') {
        Some((path, raw_query)) => {
            let query = raw_query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            (path.to_string(), query)
        }
        None => (target.to_string(), HashMap::new()),
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

async fn write_reply(writer: &mut OwnedWriteHalf, reply: JsonReply) -> std::io::Result<()> {
    write_json(
        writer,
        reply.status,
        &reply.body,
        reply.session_header.as_deref(),
    )
    .await
}

async fn write_json(
    writer: &mut OwnedWriteHalf,
    status: u16,
    body: &Value,
    session_header: Option<&str>,
) -> std::io::Result<()> {
    let payload = if body.is_null() {
        Vec::new()
    } else {
        serde_json::to_vec(body).unwrap_or_default()
    };

    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\n",
        status,
        status_reason(status),
        payload.len()
    );
    if let Some(session) = session_header {
        head.push_str(&format!("Mcp-Session-Id: {session}\r\n"));
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

async fn write_preflight(writer: &mut OwnedWriteHalf) -> std::io::Result<()> {
    let head = "HTTP/1.1 204 No Content\r\n\
        Access-Control-Allow-Origin: *\r\n\
        Access-Control-Allow-Methods: GET, POST, DELETE, OPTIONS\r\n\
        Access-Control-Allow-Headers: Content-Type, Authorization, Mcp-Session-Id, MCP-Protocol-Version, Last-Event-ID\r\n\
        Content-Length: 0\r\n\r\n";
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

async fn write_sse_preamble(writer: &mut OwnedWriteHalf) -> std::io::Result<()> {
    let head = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/event-stream\r\n\
        Cache-Control: no-cache\r\n\
        Connection: keep-alive\r\n\
        Access-Control-Allow-Origin: *\r\n\r\n";
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_target() {
        let (path, query) = split_target("/mcp?projectId=prj_1&cursor=3");
        assert_eq!(path, "/mcp");
        assert_eq!(query["projectId"], "prj_1");
        assert_eq!(query["cursor"], "3");

        let (path, query) = split_target("/mcp");
        assert_eq!(path, "/mcp");
        assert!(query.is_empty());
    }

    #[test]
    fn test_status_reasons() {
        assert_eq!(status_reason(200), "OK");
        assert_eq!(status_reason(413), "Payload Too Large");
        assert_eq!(status_reason(500), "Internal Server Error");
    }
}
