use std::sync::Arc;

use clap::Subcommand;
use serde_json::{Map, Value, json};
use tokio::io::{
    self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

pub mod auth;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod resources;
pub mod tools;
mod util;

use client::MetabaseClient;
use config::RuntimeConfig;
use error::RpcError;
use tools::{ToolRequest, tool_definitions};
use util::to_pretty_json;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "metabase-mcp";
const JSONRPC_PARSE_ERROR: i64 = -32700;

#[derive(Subcommand, Clone, Debug)]
pub enum McpCommands {
    /// Run the Metabase MCP server over stdio (default)
    Serve,
    /// Validate configuration, authenticate and list databases, then print a JSON report
    Check,
}

pub async fn run(config: RuntimeConfig, command: McpCommands) -> i32 {
    let server = Arc::new(McpServer::new(&config));
    match command {
        McpCommands::Serve => match server.serve_stdio().await {
            Ok(()) => 0,
            Err(err) => {
                error!(error = %err, "MCP server stopped with an error");
                1
            }
        },
        McpCommands::Check => match server.run_check().await {
            Ok(report) => {
                println!("{}", to_pretty_json(&report));
                0
            }
            Err(err) => {
                error!(error = %err, "Metabase connectivity check failed");
                println!("{}", to_pretty_json(&json!({
                    "status": "error",
                    "error": err.to_value()
                })));
                1
            }
        },
    }
}

/// How a message arrived on stdin; responses are written back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    NewlineDelimited,
    ContentLength,
}

pub struct McpServer {
    client: MetabaseClient,
}

impl McpServer {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            client: MetabaseClient::new(config),
        }
    }

    /// Reads requests until EOF or a shutdown signal. Every message is handled
    /// on its own task; a single writer task serialises responses onto stdout.
    /// Requests already in flight when reading stops still get answered.
    pub async fn serve_stdio(self: Arc<Self>) -> Result<(), String> {
        info!(
            server = MCP_SERVER_NAME,
            version = env!("CARGO_PKG_VERSION"),
            metabase_url = %self.client.base_url(),
            "MCP server listening on stdio"
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<(Framing, Value)>();
        let writer = tokio::spawn(async move {
            let mut stdout = io::stdout();
            while let Some((framing, response)) = rx.recv().await {
                write_frame(&mut stdout, framing, &response).await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut reader = BufReader::new(io::stdin());
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        let read_result = loop {
            let frame = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting requests");
                    break Ok(());
                }
                frame = read_frame(&mut reader) => frame,
            };
            let (framing, payload) = match frame {
                Ok(Some(Frame::Message(framing, payload))) => (framing, payload),
                Ok(Some(Frame::Invalid(framing, detail))) => {
                    warn!(error = %detail, "Discarding unreadable frame");
                    let _ = tx.send((framing, parse_error_response(&detail)));
                    continue;
                }
                Ok(None) => {
                    info!("stdin closed");
                    break Ok(());
                }
                Err(e) => break Err(format!("Failed to read MCP message: {e}")),
            };

            let incoming: Value = match serde_json::from_slice(&payload) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "Discarding message that is not valid JSON");
                    let _ = tx.send((framing, parse_error_response(&e.to_string())));
                    continue;
                }
            };

            let server = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let fallback_id = incoming
                    .as_object()
                    .filter(|obj| obj.contains_key("method"))
                    .and_then(|obj| obj.get("id").cloned());
                let handled =
                    tokio::spawn(async move { server.handle_incoming_message(incoming).await })
                        .await;
                let responses = match handled {
                    Ok(responses) => responses,
                    Err(err) => {
                        error!(fatal = true, error = %err, "Request handler panicked");
                        fallback_id
                            .map(|id| {
                                vec![error_response(
                                    id,
                                    RpcError::internal("Request handler failed unexpectedly"),
                                )]
                            })
                            .unwrap_or_default()
                    }
                };
                for response in responses {
                    let _ = tx.send((framing, response));
                }
            });
        };

        drop(tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("Failed to write MCP response: {e}")),
            Err(e) => return Err(format!("MCP writer task failed: {e}")),
        }
        info!("MCP server shut down");
        read_result
    }

    async fn run_check(&self) -> Result<Value, RpcError> {
        let databases = self.client.get("/api/database").await?;
        let database_count = databases
            .as_array()
            .or_else(|| databases.get("data").and_then(Value::as_array))
            .map(Vec::len)
            .unwrap_or(0);
        Ok(json!({
            "status": "ready",
            "server": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "metabase_url": self.client.base_url(),
            "auth_method": self.client.credentials().method().as_str(),
            "database_count": database_count,
            "tool_count": tool_definitions().len()
        }))
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never issues outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            debug!(method, "Handling request");
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => {
                    warn!(method, error = %err, "Request failed");
                    error_response(id, err)
                }
            })
        } else {
            self.handle_notification(method);
            None
        }
    }

    fn handle_notification(&self, method: &str) {
        if method == "notifications/initialized" {
            info!("Client initialized");
        } else {
            debug!(method, "Ignoring notification");
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => resources::list_resources(&self.client).await,
            "resources/templates/list" | "resources/list_templates" => {
                Ok(resources::resource_templates_payload())
            }
            "resources/read" => resources::read_resource(&self.client, &params).await,
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }

    /// Tool failures never become protocol errors: they come back as a
    /// regular result with `isError: true` and the classified error inlined.
    /// Only a malformed `tools/call` envelope is rejected at protocol level.
    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let request_id = Uuid::now_v7().to_string();
        let span = info_span!("tool_call", request_id = %request_id, tool = %name);
        async move {
            info!("Tool call started");
            let result = match ToolRequest::parse(name, &args) {
                Ok(request) => request.execute(&self.client).await,
                Err(err) => Err(err),
            };
            Ok(match result {
                Ok(payload) => {
                    info!("Tool call completed");
                    build_tool_call_response(&payload, false)
                }
                Err(err) => {
                    warn!(error = %err, "Tool call failed");
                    let mut envelope = err.to_value();
                    envelope["tool"] = Value::String(name.to_string());
                    envelope["request_id"] = Value::String(request_id);
                    build_tool_call_response(&envelope, true)
                }
            })
        }
        .instrument(span)
        .await
    }
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn build_tool_call_response(payload: &Value, is_error: bool) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": to_pretty_json(payload)
        }],
        "isError": is_error
    })
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code(),
            "message": error.message
        }
    });
    if let Some(data) = error.rpc_data() {
        payload["error"]["data"] = data;
    }
    payload
}

fn parse_error_response(detail: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": Value::Null,
        "error": {
            "code": JSONRPC_PARSE_ERROR,
            "message": format!("Parse error: {detail}")
        }
    })
}

/// Largest `Content-Length` body accepted. Bigger frames are skipped unread.
const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug)]
enum Frame {
    Message(Framing, Vec<u8>),
    /// Input that cannot carry a message; answered with a parse error.
    Invalid(Framing, String),
}

/// Reads one message. Accepts newline-delimited JSON as well as
/// header framed payloads; blank lines between messages are skipped.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut in_headers = false;
    let mut content_length: Option<u64> = None;
    let mut header_error: Option<String> = None;

    loop {
        let mut raw = Vec::new();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            if !in_headers {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        let line = raw.trim_ascii();
        if !in_headers {
            if line.is_empty() {
                continue;
            }
            if !is_header_line(line) {
                return Ok(Some(Frame::Message(
                    Framing::NewlineDelimited,
                    line.to_vec(),
                )));
            }
            in_headers = true;
        }

        if line.is_empty() {
            break;
        }
        let Ok(line) = std::str::from_utf8(line) else {
            header_error = Some("Header line is not valid UTF-8".to_string());
            continue;
        };
        let Some((name, value)) = line.split_once(':') else {
            header_error = Some(format!("Malformed header line '{line}'"));
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            match value.trim().parse::<u64>() {
                Ok(length) => content_length = Some(length),
                Err(_) => {
                    header_error = Some(format!("Invalid Content-Length '{}'", value.trim()));
                }
            }
        }
    }

    if let Some(detail) = header_error {
        return Ok(Some(Frame::Invalid(Framing::ContentLength, detail)));
    }
    let Some(length) = content_length else {
        return Ok(Some(Frame::Invalid(
            Framing::ContentLength,
            "Missing Content-Length header".to_string(),
        )));
    };
    if length > MAX_FRAME_BYTES {
        let mut body = (&mut *reader).take(length);
        io::copy(&mut body, &mut io::sink()).await?;
        return Ok(Some(Frame::Invalid(
            Framing::ContentLength,
            format!("Frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit"),
        )));
    }

    let mut payload = vec![0_u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame::Message(Framing::ContentLength, payload)))
}

/// `Name: value` with an RFC 7230 style token name. JSON never matches.
fn is_header_line(line: &[u8]) -> bool {
    let Some(colon) = line.iter().position(|b| *b == b':') else {
        return false;
    };
    let name = &line[..colon];
    !name.is_empty() && name.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

async fn write_frame<W>(
    writer: &mut W,
    framing: Framing,
    value: &Value,
) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    match framing {
        Framing::NewlineDelimited => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
