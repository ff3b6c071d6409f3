use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;

use portunix_consts::PLAYBOOK_EXTENSION;

use crate::cli::{
    ExitStatus, PlaybookCheckArgs, PlaybookInitArgs, PlaybookListArgs, PlaybookRunArgs,
    PlaybookValidateArgs,
};
use crate::ledger::Ledger;
use crate::platform::Platform;
use crate::playbook::engine::{self, RunOptions, StepOutcome};
use crate::playbook::{Playbook, ParseError};
use crate::printer::Printer;
use crate::registry::Registry;
use crate::registry::resolver::{InstallRequest, resolve};
use crate::store::Store;

const SAMPLE_PLAYBOOK: &str = include_str!("../../assets/sample.ptxbook");

pub(crate) async fn playbook_run(
    store: &Store,
    assets_dir: Option<&Path>,
    args: PlaybookRunArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let playbook = match Playbook::parse(&args.path) {
        Ok(playbook) => playbook,
        Err(err) => {
            writeln!(printer.stderr(), "{}: {err:#}", "error".red().bold())?;
            return Ok(ExitStatus::Failure);
        }
    };

    let diagnostics = playbook.validate(Platform::current());
    if !diagnostics.is_empty() {
        for diagnostic in &diagnostics {
            writeln!(printer.stderr(), "{}: {diagnostic}", "error".red().bold())?;
        }
        return Ok(ExitStatus::Failure);
    }

    let registry = Registry::load(assets_dir)?;
    let opts = RunOptions {
        environment: args.environment,
        dry_run: args.dry_run,
        image: args.image,
        target: args.target,
        force: args.force,
    };

    let result = engine::run(&playbook, &opts, store, &registry).await?;

    for step in &result.steps {
        let status = match step.outcome {
            StepOutcome::Ok => "ok".green().to_string(),
            StepOutcome::Planned => "planned".cyan().to_string(),
            StepOutcome::Skipped => "skipped".dimmed().to_string(),
            StepOutcome::Failed => "failed".red().to_string(),
        };
        if step.detail.is_empty() {
            writeln!(printer.stdout(), "{}: {status}", step.name)?;
        } else {
            writeln!(printer.stdout(), "{}: {status} ({})", step.name, step.detail)?;
        }
    }

    if let Some(rollback) = &result.rollback {
        writeln!(printer.stdout(), "\nRollback:")?;
        for (label, outcome) in &rollback.executed {
            writeln!(printer.stdout(), "  {label}: {}", outcome.as_str())?;
        }
    }

    match &result.error {
        None => {
            writeln!(
                printer.stdout(),
                "\n{} playbook `{}` (run {})",
                if args.dry_run { "Previewed" } else { "Completed" }.green().bold(),
                playbook.metadata.name,
                result.run_id,
            )?;
            Ok(ExitStatus::Success)
        }
        Some(error) => {
            writeln!(printer.stderr(), "{}: {error}", "error".red().bold())?;
            Ok(ExitStatus::Error)
        }
    }
}

pub(crate) fn playbook_validate(args: PlaybookValidateArgs, printer: Printer) -> Result<ExitStatus> {
    let mut failed = false;
    for path in &args.paths {
        match Playbook::parse(path) {
            Ok(playbook) => {
                let diagnostics = playbook.validate(Platform::current());
                if diagnostics.is_empty() {
                    writeln!(printer.stdout(), "{}: {}", path.display(), "valid".green())?;
                } else {
                    failed = true;
                    writeln!(printer.stdout(), "{}: {}", path.display(), "invalid".red())?;
                    for diagnostic in diagnostics {
                        writeln!(printer.stdout(), "  {diagnostic}")?;
                    }
                }
            }
            Err(err @ (ParseError::Read { .. } | ParseError::Yaml { .. })) => {
                failed = true;
                writeln!(printer.stdout(), "{}: {}", path.display(), "invalid".red())?;
                writeln!(printer.stdout(), "  {err:#}")?;
            }
        }
    }
    Ok(if failed {
        ExitStatus::Failure
    } else {
        ExitStatus::Success
    })
}

/// `check` goes one step past `validate`: every package referenced by the
/// playbook must resolve for this platform.
pub(crate) fn playbook_check(
    store: &Store,
    assets_dir: Option<&Path>,
    args: PlaybookCheckArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let playbook = match Playbook::parse(&args.path) {
        Ok(playbook) => playbook,
        Err(err) => {
            writeln!(printer.stderr(), "{}: {err:#}", "error".red().bold())?;
            return Ok(ExitStatus::Failure);
        }
    };

    let diagnostics = playbook.validate(Platform::current());
    for diagnostic in &diagnostics {
        writeln!(printer.stdout(), "{}: {diagnostic}", "invalid".red())?;
    }

    let registry = Registry::load(assets_dir)?;
    let ledger = Ledger::new(store);
    let index = ledger.index();
    let mut failed = !diagnostics.is_empty();

    for step in playbook
        .spec
        .portunix
        .iter()
        .flat_map(|section| &section.packages)
    {
        // Skip templated names; they need run-time variables.
        if step.name.contains("{{") {
            continue;
        }
        let request = InstallRequest {
            package: step.name.clone(),
            variant_override: step.variant.clone(),
            ..Default::default()
        };
        match resolve(Platform::current(), &registry, &index, &request) {
            Ok(plan) => {
                writeln!(
                    printer.stdout(),
                    "package {}: resolves to {} install{}",
                    step.name,
                    plan.installs.len(),
                    if plan.installs.len() == 1 { "" } else { "s" },
                )?;
            }
            Err(err) => {
                failed = true;
                writeln!(printer.stdout(), "package {}: {}", step.name, err.to_string().red())?;
            }
        }
    }

    if failed {
        Ok(ExitStatus::Failure)
    } else {
        writeln!(printer.stdout(), "{}", "Playbook checks out".green())?;
        Ok(ExitStatus::Success)
    }
}

pub(crate) fn playbook_list(args: PlaybookListArgs, printer: Printer) -> Result<ExitStatus> {
    let dir = args.dir.unwrap_or_else(|| std::path::PathBuf::from("."));
    let mut paths: Vec<_> = fs_err::read_dir(&dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == PLAYBOOK_EXTENSION)
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        writeln!(printer.stdout(), "No .{PLAYBOOK_EXTENSION} files in `{}`", dir.display())?;
        return Ok(ExitStatus::Success);
    }

    for path in paths {
        match Playbook::parse(&path) {
            Ok(playbook) => {
                let description = playbook
                    .metadata
                    .description
                    .unwrap_or_default();
                writeln!(
                    printer.stdout(),
                    "{}  {}  {}",
                    path.file_name().unwrap_or_default().to_string_lossy().bold(),
                    playbook.metadata.name,
                    description.dimmed(),
                )?;
            }
            Err(_) => {
                writeln!(
                    printer.stdout(),
                    "{}  {}",
                    path.file_name().unwrap_or_default().to_string_lossy().bold(),
                    "(unparseable)".red(),
                )?;
            }
        }
    }
    Ok(ExitStatus::Success)
}

pub(crate) fn playbook_init(args: PlaybookInitArgs, printer: Printer) -> Result<ExitStatus> {
    match args.file {
        Some(path) => {
            if path.exists() {
                writeln!(
                    printer.stderr(),
                    "{}: `{}` already exists",
                    "error".red().bold(),
                    path.display()
                )?;
                return Ok(ExitStatus::Failure);
            }
            fs_err::write(&path, SAMPLE_PLAYBOOK)?;
            writeln!(printer.stdout(), "Wrote `{}`", path.display())?;
        }
        None => {
            write!(printer.stdout(), "{SAMPLE_PLAYBOOK}")?;
        }
    }
    Ok(ExitStatus::Success)
}
