use anyhow::Result;
use tracing::info;

use crate::cli::{ExitStatus, McpServeArgs};
use crate::mcp::tools::{PermissionLevel, ToolContext};
use crate::mcp::{McpServer, ServerConfig};
use crate::registry::Registry;
use crate::store::Store;

/// Start the MCP server. In stdio mode nothing may be printed to stdout
/// except protocol frames, so all feedback goes through tracing.
pub(crate) async fn mcp_serve(
    store: &Store,
    assets_dir: Option<&std::path::Path>,
    args: McpServeArgs,
) -> Result<ExitStatus> {
    let permission = PermissionLevel::from_settings(args.permissions);
    let registry = Registry::load(assets_dir)?;
    info!(
        packages = registry.len(),
        %permission,
        "Starting MCP server"
    );

    let server = McpServer::new(ToolContext {
        store: store.clone(),
        registry,
        permission,
    });
    server
        .serve(&ServerConfig {
            mode: args.mode,
            port: args.port,
            socket: args.socket,
        })
        .await?;

    Ok(ExitStatus::Success)
}
