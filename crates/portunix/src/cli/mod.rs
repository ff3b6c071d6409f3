use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use crate::mcp::TransportMode;
use crate::mcp::tools::PermissionLevel;
use crate::playbook::engine::Environment;
use crate::runtime::RuntimeKind;

mod cache;
mod container;
mod install;
mod mcp;
mod playbook;
pub(crate) mod reporter;

pub(crate) use cache::{cache_clean, cache_dir, cache_gc};
pub(crate) use container::{
    container_check, container_cp, container_exec, container_list, container_remove,
    container_run, run_in_container,
};
pub(crate) use install::install;
pub(crate) use mcp::mcp_serve;
pub(crate) use playbook::{
    playbook_check, playbook_init, playbook_list, playbook_run, playbook_validate,
};

/// Exit codes: 0 success, 1 user or plan error, 2 execution failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ExitStatus {
    Success,
    Failure,
    Error,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => Self::from(0),
            ExitStatus::Failure => Self::from(1),
            ExitStatus::Error => Self::from(2),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

impl From<ColorChoice> for anstream::ColorChoice {
    fn from(choice: ColorChoice) -> Self {
        match choice {
            ColorChoice::Auto => Self::Auto,
            ColorChoice::Always => Self::Always,
            ColorChoice::Never => Self::Never,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "portunix",
    author,
    version,
    about = "Cross-platform developer environment orchestrator"
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) globals: GlobalArgs,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Args)]
pub(crate) struct GlobalArgs {
    /// Use verbose output. Repeat for more detail.
    #[arg(global = true, short, long, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Use quiet output. Repeat to silence everything.
    #[arg(global = true, short, long, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    pub(crate) quiet: u8,

    /// Control the use of color in output.
    #[arg(global = true, long, value_enum, env = "PORTUNIX_COLOR", default_value_t)]
    pub(crate) color: ColorChoice,

    /// Hide progress bars.
    #[arg(global = true, long)]
    pub(crate) no_progress: bool,

    /// Change to this directory before doing anything.
    #[arg(global = true, long, value_name = "DIR")]
    pub(crate) cd: Option<PathBuf>,

    /// Load additional package manifests from this directory.
    #[arg(global = true, long, value_name = "DIR", env = "PORTUNIX_ASSETS_DIR")]
    pub(crate) assets_dir: Option<PathBuf>,

    /// Write logs to this file instead of the store default.
    #[arg(global = true, long, value_name = "FILE")]
    pub(crate) log_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Install a package from the registry.
    Install(InstallArgs),
    /// Manage containers through Docker or Podman.
    #[command(subcommand)]
    Container(ContainerCommand),
    /// Run the MCP server for AI assistants.
    #[command(subcommand)]
    Mcp(McpCommand),
    /// Run and validate `.ptxbook` playbooks.
    #[command(subcommand)]
    Playbook(PlaybookCommand),
    /// Manage the download cache and store.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Generate shell completion scripts.
    #[command(hide = true)]
    GenerateShellCompletion(GenerateShellCompletionArgs),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum InstallTarget {
    #[default]
    Local,
    Container,
    Virt,
}

#[derive(Debug, Args)]
pub(crate) struct InstallArgs {
    /// The package to install.
    pub(crate) package: String,

    /// Select a specific variant instead of matching the platform.
    #[arg(long)]
    pub(crate) variant: Option<String>,

    /// Resolve and print the plan without making changes.
    #[arg(long)]
    pub(crate) dry_run: bool,

    /// Reinstall even when the ledger says this variant is present.
    #[arg(long)]
    pub(crate) force: bool,

    /// Where to install.
    #[arg(long, value_enum, default_value_t)]
    pub(crate) target: InstallTarget,

    /// Container image for `--target container`.
    #[arg(long)]
    pub(crate) image: Option<String>,

    /// Container name (`--target container`) or VM name (`--target virt`).
    #[arg(long)]
    pub(crate) name: Option<String>,

    /// Extra environment for executed steps, as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub(crate) env: Vec<String>,

    /// Keep the target container around after the install.
    #[arg(long)]
    pub(crate) keep: bool,
}

#[derive(Debug, Subcommand)]
pub(crate) enum ContainerCommand {
    /// Start a container.
    Run(ContainerRunArgs),
    /// Run a command inside a container.
    Exec(ContainerExecArgs),
    /// Copy files between host and container.
    Cp(ContainerCpArgs),
    /// List containers.
    List(ContainerListArgs),
    /// Remove a container.
    Remove(ContainerRemoveArgs),
    /// Report detected runtimes and their capabilities.
    Check(ContainerCheckArgs),
    /// Install a package inside a fresh container.
    RunInContainer(RunInContainerArgs),
}

#[derive(Debug, Args)]
pub(crate) struct ContainerRunArgs {
    /// Image to run.
    #[arg(long)]
    pub(crate) image: String,
    #[arg(long)]
    pub(crate) name: Option<String>,
    /// Environment variables, as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub(crate) env: Vec<String>,
    /// Port mappings, as HOST:CONTAINER.
    #[arg(long = "port", value_name = "HOST:CONTAINER")]
    pub(crate) ports: Vec<String>,
    /// Volume mounts, as SRC:DST.
    #[arg(long = "volume", value_name = "SRC:DST")]
    pub(crate) volumes: Vec<String>,
    /// Run detached.
    #[arg(long, short)]
    pub(crate) detach: bool,
    /// Keep the container alive when no command is given.
    #[arg(long)]
    pub(crate) keep_running: bool,
    /// Preferred runtime.
    #[arg(long, value_enum)]
    pub(crate) runtime: Option<RuntimeKind>,
    /// Command to run in the container.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}

#[derive(Debug, Args)]
pub(crate) struct ContainerExecArgs {
    /// Container name or id.
    pub(crate) name: String,
    /// Preferred runtime.
    #[arg(long, value_enum)]
    pub(crate) runtime: Option<RuntimeKind>,
    /// Command and arguments, passed to the container verbatim.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub(crate) argv: Vec<String>,
}

#[derive(Debug, Args)]
pub(crate) struct ContainerCpArgs {
    /// Source, optionally `container:path`.
    pub(crate) src: String,
    /// Destination, optionally `container:path`.
    pub(crate) dst: String,
    #[arg(long, value_enum)]
    pub(crate) runtime: Option<RuntimeKind>,
}

#[derive(Debug, Args)]
pub(crate) struct ContainerListArgs {
    /// Include stopped containers.
    #[arg(long, short)]
    pub(crate) all: bool,
    /// Filter by name pattern.
    #[arg(long)]
    pub(crate) name: Option<String>,
    /// Filter by label.
    #[arg(long)]
    pub(crate) label: Option<String>,
    /// Filter by state.
    #[arg(long)]
    pub(crate) state: Option<String>,
    #[arg(long, value_enum)]
    pub(crate) runtime: Option<RuntimeKind>,
}

#[derive(Debug, Args)]
pub(crate) struct ContainerRemoveArgs {
    pub(crate) name: String,
    /// Stop a running container before removing it.
    #[arg(long, short)]
    pub(crate) force: bool,
    #[arg(long, value_enum)]
    pub(crate) runtime: Option<RuntimeKind>,
}

#[derive(Debug, Args)]
pub(crate) struct ContainerCheckArgs {
    /// Re-probe instead of using cached results.
    #[arg(long)]
    pub(crate) refresh: bool,
}

#[derive(Debug, Args)]
pub(crate) struct RunInContainerArgs {
    /// The package to install inside the container.
    pub(crate) package: String,
    #[arg(long)]
    pub(crate) variant: Option<String>,
    /// Image to create the container from.
    #[arg(long)]
    pub(crate) image: String,
    #[arg(long)]
    pub(crate) name: Option<String>,
    /// Environment variables, as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub(crate) env: Vec<String>,
    /// Leave the container for inspection afterwards.
    #[arg(long)]
    pub(crate) keep: bool,
    #[arg(long, value_enum)]
    pub(crate) runtime: Option<RuntimeKind>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum McpCommand {
    /// Start the MCP server.
    Serve(McpServeArgs),
}

#[derive(Debug, Args)]
pub(crate) struct McpServeArgs {
    /// Transport to serve on.
    #[arg(long, value_enum, default_value_t)]
    pub(crate) mode: TransportMode,
    /// TCP port for `--mode tcp`.
    #[arg(long, default_value_t = portunix_consts::MCP_DEFAULT_PORT)]
    pub(crate) port: u16,
    /// Socket path for `--mode unix`.
    #[arg(long)]
    pub(crate) socket: Option<PathBuf>,
    /// Tool permission level.
    #[arg(long, value_enum)]
    pub(crate) permissions: Option<PermissionLevel>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum PlaybookCommand {
    /// Execute a playbook.
    Run(PlaybookRunArgs),
    /// Validate playbooks without running them.
    Validate(PlaybookValidateArgs),
    /// Validate and resolve a playbook against this platform.
    Check(PlaybookCheckArgs),
    /// List playbooks in a directory.
    List(PlaybookListArgs),
    /// Write a commented sample playbook.
    Init(PlaybookInitArgs),
}

#[derive(Debug, Args)]
pub(crate) struct PlaybookRunArgs {
    /// Path to the `.ptxbook` file.
    pub(crate) path: PathBuf,
    /// Where steps execute.
    #[arg(long = "environment", value_enum, default_value_t)]
    pub(crate) environment: Environment,
    /// Resolve and print every would-be step without executing.
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// VM name for `--environment virt`.
    #[arg(long)]
    pub(crate) target: Option<String>,
    /// Container image for `--environment container`.
    #[arg(long)]
    pub(crate) image: Option<String>,
    /// Reinstall packages even when already recorded in the ledger.
    #[arg(long)]
    pub(crate) force: bool,
}

#[derive(Debug, Args)]
pub(crate) struct PlaybookValidateArgs {
    /// Playbook files to validate.
    #[arg(required = true)]
    pub(crate) paths: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub(crate) struct PlaybookCheckArgs {
    pub(crate) path: PathBuf,
}

#[derive(Debug, Args)]
pub(crate) struct PlaybookListArgs {
    /// Directory to search (defaults to the current directory).
    pub(crate) dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub(crate) struct PlaybookInitArgs {
    /// Write to this file instead of stdout.
    pub(crate) file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CacheCommand {
    /// Print the store directory.
    Dir,
    /// Remove the whole store.
    Clean,
    /// Remove cache entries past their age limit.
    Gc(CacheGcArgs),
}

#[derive(Debug, Args)]
pub(crate) struct CacheGcArgs {
    /// Report what would be removed without removing it.
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Age limit in days.
    #[arg(long, default_value_t = 30)]
    pub(crate) max_age_days: u64,
}

#[derive(Debug, Args)]
pub(crate) struct GenerateShellCompletionArgs {
    pub(crate) shell: clap_complete::Shell,
}
