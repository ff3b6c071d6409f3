use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::container::{ContainerDriver, ListFilters};
use crate::download::DownloadCache;
use crate::install::{ExecuteContext, SilentProgress, execute_plan};
use crate::ledger::Ledger;
use crate::platform::Platform;
use crate::registry::Registry;
use crate::registry::resolver::{InstallRequest, resolve};
use crate::runtime;
use crate::store::Store;

/// Server-side gate on tool invocation.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum PermissionLevel {
    #[default]
    Readonly,
    Development,
    Full,
}

impl PermissionLevel {
    /// Resolve the effective level: CLI flag, then environment, then the
    /// readonly default. Invalid environment values fall back silently.
    pub(crate) fn from_settings(flag: Option<PermissionLevel>) -> PermissionLevel {
        use portunix_consts::env_vars::EnvVars;

        if let Some(level) = flag {
            return level;
        }
        EnvVars::var(EnvVars::PORTUNIX_PERMISSION_LEVEL)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub(crate) enum ToolError {
    #[error("Unknown tool `{0}`")]
    NotFound(String),
    #[error("Tool `{tool}` requires permission level `{required}`")]
    Permission {
        tool: String,
        required: PermissionLevel,
    },
    #[error("Invalid arguments: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// One entry in the static tool table.
pub(crate) struct ToolSpec {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) permission: PermissionLevel,
    pub(crate) input_schema: fn() -> Value,
}

/// The registry is read-only after server start; dispatch needs no
/// synchronization beyond per-tool semantics.
pub(crate) static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "echo",
        description: "Echo a message back, for connectivity checks",
        permission: PermissionLevel::Readonly,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Text to echo back"}
                },
                "required": ["message"]
            })
        },
    },
    ToolSpec {
        name: "get_system_info",
        description: "Report the detected platform: OS, architecture, distribution",
        permission: PermissionLevel::Readonly,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {}
            })
        },
    },
    ToolSpec {
        name: "install_package",
        description: "Resolve and install a package from the registry",
        permission: PermissionLevel::Development,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "package": {"type": "string", "description": "Package name"},
                    "variant": {"type": "string", "description": "Variant override"},
                    "dry_run": {"type": "boolean", "description": "Resolve only, make no changes"}
                },
                "required": ["package"]
            })
        },
    },
    ToolSpec {
        name: "container_list",
        description: "List containers known to the preferred runtime",
        permission: PermissionLevel::Readonly,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "all": {"type": "boolean", "description": "Include stopped containers"}
                }
            })
        },
    },
    ToolSpec {
        name: "container_exec",
        description: "Run a command inside a container; argv is passed verbatim",
        permission: PermissionLevel::Full,
        input_schema: || {
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Container name or id"},
                    "argv": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Command and arguments"
                    }
                },
                "required": ["name", "argv"]
            })
        },
    },
];

/// The `tools/list` projection.
pub(crate) fn list_tools() -> Value {
    json!({
        "tools": TOOLS
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": (tool.input_schema)(),
                })
            })
            .collect::<Vec<_>>()
    })
}

/// Everything tool handlers may touch.
pub(crate) struct ToolContext {
    pub(crate) store: Store,
    pub(crate) registry: Registry,
    pub(crate) permission: PermissionLevel,
}

/// Validate `args` against the declared schema: required properties present,
/// primitive types as declared.
fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let object = args
        .as_object()
        .ok_or_else(|| ToolError::InvalidParams("arguments must be an object".into()))?;

    for required in schema["required"].as_array().into_iter().flatten() {
        let name = required.as_str().unwrap_or_default();
        if !object.contains_key(name) {
            return Err(ToolError::InvalidParams(format!(
                "missing required argument `{name}`"
            )));
        }
    }

    for (name, value) in object {
        let Some(declared) = schema["properties"].get(name) else {
            return Err(ToolError::InvalidParams(format!("unknown argument `{name}`")));
        };
        let matches = match declared["type"].as_str() {
            Some("string") => value.is_string(),
            Some("boolean") => value.is_boolean(),
            Some("number") => value.is_number(),
            Some("array") => value.is_array(),
            Some("object") => value.is_object(),
            _ => true,
        };
        if !matches {
            return Err(ToolError::InvalidParams(format!(
                "argument `{name}` has the wrong type"
            )));
        }
    }
    Ok(())
}

fn text_content(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

fn json_content(value: Value) -> Value {
    json!({"content": [{"type": "json", "json": value}]})
}

/// Dispatch a `tools/call`: gate by permission, validate arguments against
/// the schema, run the handler.
pub(crate) async fn call_tool(
    ctx: &ToolContext,
    name: &str,
    args: &Value,
) -> Result<Value, ToolError> {
    let spec = TOOLS
        .iter()
        .find(|tool| tool.name == name)
        .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

    if ctx.permission < spec.permission {
        return Err(ToolError::Permission {
            tool: name.to_string(),
            required: spec.permission,
        });
    }
    validate_args(&(spec.input_schema)(), args)?;
    debug!(tool = name, "Dispatching tool call");

    match name {
        "echo" => {
            let message = args["message"].as_str().unwrap_or_default();
            Ok(text_content(message))
        }
        "get_system_info" => {
            let platform = Platform::current();
            Ok(json_content(
                serde_json::to_value(platform).map_err(anyhow::Error::from)?,
            ))
        }
        "install_package" => {
            let package = args["package"].as_str().unwrap_or_default();
            let request = InstallRequest {
                package: package.to_string(),
                variant_override: args["variant"].as_str().map(ToString::to_string),
                ..Default::default()
            };
            let ledger = Ledger::new(&ctx.store);
            let plan = resolve(
                Platform::current(),
                &ctx.registry,
                &ledger.index(),
                &request,
            )
            .map_err(anyhow::Error::from)?;

            if args["dry_run"].as_bool().unwrap_or(false) {
                let steps: Vec<String> = plan
                    .installs
                    .iter()
                    .flat_map(|install| {
                        install.steps.iter().map(|step| {
                            format!("{} {}: {}", install.package, install.variant.id, step.describe())
                        })
                    })
                    .collect();
                return Ok(json_content(json!({
                    "package": plan.root,
                    "dry_run": true,
                    "steps": steps,
                })));
            }

            let cache = DownloadCache::new(&ctx.store);
            let exec_ctx = ExecuteContext {
                store: &ctx.store,
                ledger: &ledger,
                cache: &cache,
                env_overrides: Vec::new(),
                download_reporter: None,
            };
            let report = execute_plan(&plan, &exec_ctx, &SilentProgress)
                .await
                .map_err(anyhow::Error::from)?;
            Ok(json_content(json!({
                "package": plan.root,
                "run_id": report.run_id,
                "installed": report
                    .installs
                    .iter()
                    .map(|outcome| json!({
                        "package": outcome.package,
                        "variant": outcome.variant,
                        "skipped": outcome.skipped,
                    }))
                    .collect::<Vec<_>>(),
            })))
        }
        "container_list" => {
            let report = runtime::detect(&ctx.store, false, None).await;
            let driver = ContainerDriver::select(&report).map_err(anyhow::Error::from)?;
            let handles = driver
                .list(&ListFilters {
                    all: args["all"].as_bool().unwrap_or(false),
                    ..Default::default()
                })
                .await
                .map_err(anyhow::Error::from)?;
            Ok(json_content(json!({
                "containers": handles
                    .iter()
                    .map(|handle| json!({
                        "id": handle.id,
                        "name": handle.name,
                        "image": handle.image,
                        "state": handle.state.as_str(),
                    }))
                    .collect::<Vec<_>>(),
            })))
        }
        "container_exec" => {
            let container = args["name"].as_str().unwrap_or_default();
            let argv: Vec<String> = args["argv"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|value| value.as_str().map(ToString::to_string))
                .collect();
            if argv.is_empty() {
                return Err(ToolError::InvalidParams("argv must not be empty".into()));
            }

            let report = runtime::detect(&ctx.store, false, None).await;
            let driver = ContainerDriver::select(&report).map_err(anyhow::Error::from)?;
            let exec = driver
                .exec(container, &argv, None)
                .await
                .map_err(anyhow::Error::from)?;
            Ok(json_content(json!({
                "exit_code": exec.code,
                "stdout": String::from_utf8_lossy(&exec.stdout),
                "stderr": String::from_utf8_lossy(&exec.stderr),
            })))
        }
        _ => Err(ToolError::NotFound(name.to_string())),
    }
}
