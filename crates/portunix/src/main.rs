use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Mutex;

use anstream::{ColorChoice, StripStream, eprintln};
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use portunix_consts::env_vars::EnvVars;
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::cli::{CacheCommand, Cli, Command, ContainerCommand, ExitStatus, McpCommand, PlaybookCommand};
use crate::printer::Printer;
use crate::store::Store;

mod archive;
mod cli;
mod container;
mod download;
mod fs;
mod install;
mod ledger;
mod mcp;
mod platform;
mod playbook;
mod printer;
mod process;
mod registry;
mod runtime;
mod store;
mod version;
mod warnings;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    /// Suppress all tracing output by default (overridable by `RUST_LOG`).
    #[default]
    Default,
    /// Show debug messages by default (overridable by `RUST_LOG`).
    Debug,
    /// Show trace messages by default (overridable by `RUST_LOG`).
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogOutput {
    Console,
    File,
    ConsoleAndFile,
}

impl LogOutput {
    /// `PORTUNIX_LOG_OUTPUT`: `console`, `file`, or `console,file`. Invalid
    /// values silently correct to the console default.
    fn from_env() -> Self {
        match EnvVars::var(EnvVars::PORTUNIX_LOG_OUTPUT).ok().as_deref() {
            Some("file") => LogOutput::File,
            Some("console,file" | "file,console") => LogOutput::ConsoleAndFile,
            _ => LogOutput::Console,
        }
    }

    fn to_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::ConsoleAndFile)
    }

    fn to_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::ConsoleAndFile)
    }
}

/// `PORTUNIX_LOG_LEVEL`: highest of the env value and `-v` flags wins.
/// Invalid values silently correct to the default.
fn effective_level(verbose: u8) -> Level {
    let from_env = match EnvVars::var(EnvVars::PORTUNIX_LOG_LEVEL)
        .ok()
        .map(|value| value.to_ascii_lowercase())
        .as_deref()
    {
        Some("debug") => Level::Debug,
        Some("trace") => Level::Trace,
        _ => Level::Default,
    };
    let from_flags = match verbose {
        0 | 1 => Level::Default,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    from_env.max(from_flags)
}

fn setup_logging(level: Level, output: LogOutput, log_file: Option<PathBuf>, store: &Store) -> Result<()> {
    let directive = match level {
        Level::Default => LevelFilter::OFF.into(),
        Level::Debug => Directive::from_str("portunix=debug")?,
        Level::Trace => Directive::from_str("portunix=trace")?,
    };

    let stderr_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env()
        .context("Invalid RUST_LOG directive")?;
    let stderr_format = tracing_subscriber::fmt::format().with_target(false);
    let stderr_layer = output.to_console().then(|| {
        tracing_subscriber::fmt::layer()
            .event_format(stderr_format)
            .with_writer(anstream::stderr)
            .with_filter(stderr_filter)
    });

    let registry = tracing_subscriber::registry().with(stderr_layer);

    if output.to_file() {
        let log_file_path = log_file
            .or_else(|| {
                EnvVars::var_os(EnvVars::PORTUNIX_LOG_FILE).map(PathBuf::from)
            })
            .unwrap_or_else(|| store.log_file());
        let log_file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path)
            .context("Failed to open log file")?;
        let log_file = Mutex::new(StripStream::new(log_file.into_file()));

        let file_format = tracing_subscriber::fmt::format()
            .with_target(false)
            .with_ansi(false);
        let file_layer = tracing_subscriber::fmt::layer()
            .event_format(file_format)
            .with_writer(log_file)
            .with_filter(EnvFilter::new("portunix=debug"));

        registry.with(file_layer).init();
    } else {
        registry.init();
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    // Enable ANSI colors on Windows.
    let _ = anstyle_query::windows::enable_ansi_colors();
    ColorChoice::write_global(cli.globals.color.into());

    let store = Store::from_settings()?;
    setup_logging(
        effective_level(cli.globals.verbose),
        LogOutput::from_env(),
        cli.globals.log_file.clone(),
        &store,
    )?;

    let printer = if cli.globals.quiet == 1 {
        Printer::Quiet
    } else if cli.globals.quiet > 1 {
        Printer::Silent
    } else if cli.globals.verbose > 0 {
        Printer::Verbose
    } else if cli.globals.no_progress {
        Printer::NoProgress
    } else {
        Printer::Default
    };

    if cli.globals.quiet > 0 {
        warnings::disable();
    } else {
        warnings::enable();
    }

    debug!("portunix: {}", version::version());

    if let Some(dir) = cli.globals.cd.as_ref() {
        debug!("Changing current directory to: `{}`", dir.display());
        std::env::set_current_dir(dir)?;
    }

    let assets_dir = cli.globals.assets_dir.as_deref();

    match cli.command {
        Command::Install(args) => cli::install(&store, assets_dir, args, printer).await,
        Command::Container(command) => match command {
            ContainerCommand::Run(args) => cli::container_run(&store, args, printer).await,
            ContainerCommand::Exec(args) => cli::container_exec(&store, args, printer).await,
            ContainerCommand::Cp(args) => cli::container_cp(&store, args, printer).await,
            ContainerCommand::List(args) => cli::container_list(&store, args, printer).await,
            ContainerCommand::Remove(args) => cli::container_remove(&store, args, printer).await,
            ContainerCommand::Check(args) => cli::container_check(&store, args, printer).await,
            ContainerCommand::RunInContainer(args) => {
                cli::run_in_container(&store, args, printer).await
            }
        },
        Command::Mcp(McpCommand::Serve(args)) => cli::mcp_serve(&store, assets_dir, args).await,
        Command::Playbook(command) => match command {
            PlaybookCommand::Run(args) => {
                cli::playbook_run(&store, assets_dir, args, printer).await
            }
            PlaybookCommand::Validate(args) => cli::playbook_validate(args, printer),
            PlaybookCommand::Check(args) => cli::playbook_check(&store, assets_dir, args, printer),
            PlaybookCommand::List(args) => cli::playbook_list(args, printer),
            PlaybookCommand::Init(args) => cli::playbook_init(args, printer),
        },
        Command::Cache(command) => match command {
            CacheCommand::Dir => cli::cache_dir(&store, printer),
            CacheCommand::Clean => cli::cache_clean(&store, printer),
            CacheCommand::Gc(args) => cli::cache_gc(&store, args, printer),
        },
        Command::GenerateShellCompletion(args) => {
            let mut command = Cli::command();
            let bin_name = command
                .get_bin_name()
                .unwrap_or_else(|| command.get_name())
                .to_owned();
            clap_complete::generate(args.shell, &mut command, bin_name, &mut std::io::stdout());
            Ok(ExitStatus::Success)
        }
    }
}

fn main() -> ExitCode {
    ctrlc::set_handler(move || {
        #[allow(clippy::exit, clippy::cast_possible_wrap)]
        std::process::exit(if cfg!(windows) {
            0xC000_013A_u32 as i32
        } else {
            130
        });
    })
    .expect("Error setting Ctrl-C handler");

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");
    let result = runtime.block_on(Box::pin(run(cli)));
    runtime.shutdown_background();

    match result {
        Ok(code) => code.into(),
        Err(err) => {
            let mut causes = err.chain();
            eprintln!(
                "{}: {}",
                "error".red().bold(),
                causes.next().map(ToString::to_string).unwrap_or_default()
            );
            for err in causes {
                eprintln!("  {}: {}", "caused by".red().bold(), err);
            }
            ExitStatus::Error.into()
        }
    }
}
