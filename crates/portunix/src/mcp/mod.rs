use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use portunix_consts::MCP_DEFAULT_PORT;

pub(crate) mod protocol;
pub(crate) mod tools;

use protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    PROTOCOL_VERSION, Request, Response, SERVER_NOT_INITIALIZED,
};
use tools::{ToolContext, ToolError};

/// Server-defined code for permission denials.
const PERMISSION_DENIED: i64 = -32001;

/// Request deadline on tcp and unix transports. Stdio has none.
const NETWORK_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum TransportMode {
    #[default]
    Stdio,
    Tcp,
    Unix,
}

#[derive(Debug)]
pub(crate) struct ServerConfig {
    pub(crate) mode: TransportMode,
    pub(crate) port: u16,
    pub(crate) socket: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Stdio,
            port: MCP_DEFAULT_PORT,
            socket: None,
        }
    }
}

/// Lifecycle of one client connection. Stdio has exactly one; every tcp or
/// unix connection gets its own.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lifecycle {
    Listening,
    Initialized,
    Shutdown,
}

/// The MCP server: one JSON object per line, stdout reserved for protocol
/// frames in stdio mode. Diagnostics go to stderr via tracing.
pub(crate) struct McpServer {
    ctx: Arc<ToolContext>,
}

impl McpServer {
    pub(crate) fn new(ctx: ToolContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub(crate) async fn serve(&self, config: &ServerConfig) -> Result<()> {
        match config.mode {
            TransportMode::Stdio => self.serve_stdio().await,
            TransportMode::Tcp => self.serve_tcp(config.port).await,
            TransportMode::Unix => {
                let socket = config
                    .socket
                    .clone()
                    .context("--socket is required for unix transport")?;
                self.serve_unix(&socket).await
            }
        }
    }

    /// Strictly sequential: one dispatch at a time, responses in request order.
    async fn serve_stdio(&self) -> Result<()> {
        info!(permissions = %self.ctx.permission, "MCP server listening on stdio");

        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lifecycle = Lifecycle::Listening;
        let mut lines = stdin.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = dispatch_line(&self.ctx, &mut lifecycle, &line).await {
                stdout.write_all(response.to_line().as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            if lifecycle == Lifecycle::Shutdown {
                break;
            }
        }

        debug!("MCP stdio session ended");
        Ok(())
    }

    async fn serve_tcp(&self, port: u16) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind tcp port {port}"))?;
        info!(port, permissions = %self.ctx.permission, "MCP server listening on tcp");

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "Client connected");
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(err) =
                    serve_connection(ctx, reader, writer, Some(NETWORK_REQUEST_TIMEOUT)).await
                {
                    warn!(%peer, "Connection error: {err:#}");
                }
            });
        }
    }

    #[cfg(unix)]
    async fn serve_unix(&self, socket: &std::path::Path) -> Result<()> {
        // A stale socket file from a previous run blocks the bind.
        if socket.exists() {
            fs_err::remove_file(socket)?;
        }
        let listener = tokio::net::UnixListener::bind(socket)
            .with_context(|| format!("Failed to bind unix socket `{}`", socket.display()))?;
        info!(socket = %socket.display(), permissions = %self.ctx.permission, "MCP server listening on unix socket");

        loop {
            let (stream, _) = listener.accept().await?;
            debug!("Client connected");
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(err) =
                    serve_connection(ctx, reader, writer, Some(NETWORK_REQUEST_TIMEOUT)).await
                {
                    warn!("Connection error: {err:#}");
                }
            });
        }
    }

    #[cfg(not(unix))]
    async fn serve_unix(&self, _socket: &std::path::Path) -> Result<()> {
        anyhow::bail!("Unix domain sockets are not supported on this platform")
    }
}

/// Serve one client connection with its own lifecycle state.
async fn serve_connection(
    ctx: Arc<ToolContext>,
    reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut lifecycle = Lifecycle::Listening;
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, dispatch_line(&ctx, &mut lifecycle, &line))
                    .await
                {
                    Ok(response) => response,
                    Err(_) => Some(Response::error(
                        Value::Null,
                        INTERNAL_ERROR,
                        "Request timed out",
                    )),
                }
            }
            None => dispatch_line(&ctx, &mut lifecycle, &line).await,
        };

        if let Some(response) = response {
            writer.write_all(response.to_line().as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        if lifecycle == Lifecycle::Shutdown {
            break;
        }
    }
    Ok(())
}

/// Turn one input line into at most one response. Notifications produce
/// none. A bad message never terminates the server.
async fn dispatch_line(
    ctx: &ToolContext,
    lifecycle: &mut Lifecycle,
    line: &str,
) -> Option<Response> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            debug!("Parse error: {err}");
            return Some(Response::error(Value::Null, PARSE_ERROR, "Parse error"));
        }
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    if !request.is_well_formed() {
        return Some(Response::error(id, INVALID_REQUEST, "Invalid request"));
    }
    let method = request.method.as_deref().expect("well-formed request");

    // Notifications carry no id and get no response.
    if request.is_notification() {
        debug!(method, "Ignoring notification");
        return None;
    }

    match (*lifecycle, method) {
        (Lifecycle::Listening, "initialize") => {
            *lifecycle = Lifecycle::Initialized;
            Some(Response::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": "portunix",
                        "version": crate::version::version(),
                    },
                    "capabilities": {
                        "tools": {}
                    },
                }),
            ))
        }
        (Lifecycle::Listening, _) => Some(Response::error(
            id,
            SERVER_NOT_INITIALIZED,
            "server not initialized",
        )),
        (Lifecycle::Initialized, "tools/list") => Some(Response::success(id, tools::list_tools())),
        (Lifecycle::Initialized, "tools/call") => {
            let params = request.params.unwrap_or(Value::Null);
            let name = params["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                return Some(Response::error(
                    id,
                    INVALID_PARAMS,
                    "tools/call requires a tool name",
                ));
            }
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

            match tools::call_tool(ctx, name, &arguments).await {
                Ok(result) => Some(Response::success(id, result)),
                Err(err) => Some(tool_error_response(id, &err)),
            }
        }
        (Lifecycle::Initialized, "shutdown") => {
            *lifecycle = Lifecycle::Shutdown;
            Some(Response::success(id, Value::Null))
        }
        (Lifecycle::Initialized, "initialize") => Some(Response::error(
            id,
            INVALID_REQUEST,
            "server already initialized",
        )),
        (Lifecycle::Initialized, _) => Some(Response::error(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )),
        (Lifecycle::Shutdown, _) => None,
    }
}

fn tool_error_response(id: Value, err: &ToolError) -> Response {
    match err {
        ToolError::NotFound(name) => Response::error(
            id,
            INVALID_PARAMS,
            format!("Unknown tool `{name}`"),
        ),
        ToolError::Permission { tool, required } => Response::error_with_data(
            id,
            PERMISSION_DENIED,
            format!("Tool `{tool}` denied at the current permission level"),
            Some(json!({"required_level": required.to_string()})),
        ),
        ToolError::InvalidParams(message) => Response::error(id, INVALID_PARAMS, message.clone()),
        ToolError::Handler(cause) => Response::error_with_data(
            id,
            INTERNAL_ERROR,
            "Tool execution failed",
            Some(json!({"message": format!("{cause:#}")})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::tools::PermissionLevel;
    use crate::registry::Registry;
    use crate::store::Store;
    use pretty_assertions::assert_eq;

    fn context(permission: PermissionLevel) -> (tempfile::TempDir, ToolContext) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::from_path(tmp.path().join("home")).init().unwrap();
        let registry = Registry::load(None).unwrap();
        (
            tmp,
            ToolContext {
                store,
                registry,
                permission,
            },
        )
    }

    async fn roundtrip(
        ctx: &ToolContext,
        lifecycle: &mut Lifecycle,
        line: &str,
    ) -> Option<Value> {
        dispatch_line(ctx, lifecycle, line)
            .await
            .map(|response| serde_json::from_str(&response.to_line()).unwrap())
    }

    #[tokio::test]
    async fn initialize_then_echo() {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let mut lifecycle = Lifecycle::Listening;

        let init = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(init["id"], 1);
        assert_eq!(init["jsonrpc"], "2.0");
        assert_eq!(init["result"]["serverInfo"]["name"], "portunix");
        assert_eq!(lifecycle, Lifecycle::Initialized);

        let echo = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"message":"Hello"}}}"#,
        )
        .await
        .unwrap();
        assert_eq!(echo["id"], 2);
        assert_eq!(echo["result"]["content"][0]["text"], "Hello");
    }

    #[tokio::test]
    async fn method_before_initialize_is_rejected() {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let mut lifecycle = Lifecycle::Listening;

        let response = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], SERVER_NOT_INITIALIZED);
        assert_eq!(lifecycle, Lifecycle::Listening);
    }

    #[tokio::test]
    async fn invalid_json_yields_parse_error_and_server_survives() {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let mut lifecycle = Lifecycle::Listening;

        let response = roundtrip(&ctx, &mut lifecycle, "{invalid json}").await.unwrap();
        assert_eq!(response["error"]["code"], PARSE_ERROR);
        assert_eq!(response["id"], Value::Null);

        // Still ready for further messages.
        let init = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#,
        )
        .await
        .unwrap();
        assert!(init.get("result").is_some());
    }

    #[tokio::test]
    async fn unknown_method_after_initialize() {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let mut lifecycle = Lifecycle::Initialized;

        let response = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":5,"method":"resources/list"}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(response["id"], 5);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let mut lifecycle = Lifecycle::Initialized;

        let response = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let mut lifecycle = Lifecycle::Initialized;

        let response = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":9,"method":"shutdown"}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["result"], Value::Null);
        assert_eq!(lifecycle, Lifecycle::Shutdown);

        let after = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":10,"method":"tools/list"}"#,
        )
        .await;
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn permission_denial_carries_required_level() {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let mut lifecycle = Lifecycle::Initialized;

        let response = roundtrip(
            &ctx,
            &mut lifecycle,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"container_exec","arguments":{"name":"c1","argv":["node","--version"]}}}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], PERMISSION_DENIED);
        assert_eq!(response["error"]["data"]["required_level"], "full");
    }

    #[tokio::test]
    async fn connection_loop_over_in_memory_stream() -> anyhow::Result<()> {
        let (_tmp, ctx) = context(PermissionLevel::Readonly);
        let ctx = Arc::new(ctx);

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"shutdown"}"#,
            "\n",
        );
        let mut output = Vec::new();
        serve_connection(ctx, input.as_bytes(), &mut output, None).await?;

        // Every line written is a complete JSON-RPC message with the
        // request's id echoed back.
        let lines: Vec<Value> = String::from_utf8(output)?
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        for (index, line) in lines.iter().enumerate() {
            assert_eq!(line["jsonrpc"], "2.0");
            assert_eq!(line["id"], (index + 1) as u64);
        }
        Ok(())
    }
}
