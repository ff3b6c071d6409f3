use std::fmt::Write as _;

use anyhow::Result;
use itertools::Itertools;
use owo_colors::OwoColorize;

use crate::cli::{
    ContainerCheckArgs, ContainerCpArgs, ContainerExecArgs, ContainerListArgs,
    ContainerRemoveArgs, ContainerRunArgs, ExitStatus, RunInContainerArgs,
};
use crate::container::{ContainerDriver, Error as ContainerError, ListFilters, RunOptions};
use crate::container::run_in::{self, RunInContainerRequest};
use crate::printer::Printer;
use crate::runtime::{self, RuntimeKind};
use crate::store::Store;

async fn select_driver(
    store: &Store,
    explicit: Option<RuntimeKind>,
    printer: Printer,
) -> Result<Option<ContainerDriver>> {
    let report = runtime::detect(store, false, explicit).await;
    match ContainerDriver::select(&report) {
        Ok(driver) => Ok(Some(driver)),
        Err(err) => {
            writeln!(printer.stderr(), "{}: {err}", "error".red().bold())?;
            Ok(None)
        }
    }
}

pub(crate) async fn container_run(
    store: &Store,
    args: ContainerRunArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let Some(driver) = select_driver(store, args.runtime, printer).await? else {
        return Ok(ExitStatus::Error);
    };

    let env = args
        .env
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    let handle = driver
        .run(&RunOptions {
            image: args.image,
            name: args.name,
            env,
            ports: args.ports,
            volumes: args.volumes,
            detach: args.detach,
            keep_running: args.keep_running,
            command: args.command,
        })
        .await?;

    writeln!(printer.stdout(), "{}", handle.id)?;
    Ok(ExitStatus::Success)
}

pub(crate) async fn container_exec(
    store: &Store,
    args: ContainerExecArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let Some(driver) = select_driver(store, args.runtime, printer).await? else {
        return Ok(ExitStatus::Error);
    };

    // argv reaches the runtime verbatim; inner flags like `-c` are not ours
    // to interpret.
    let exec = driver.exec(&args.name, &args.argv, None).await?;
    write!(printer.stdout(), "{}", String::from_utf8_lossy(&exec.stdout))?;
    write!(printer.stderr(), "{}", String::from_utf8_lossy(&exec.stderr))?;

    Ok(if exec.code == 0 {
        ExitStatus::Success
    } else {
        ExitStatus::Error
    })
}

pub(crate) async fn container_cp(
    store: &Store,
    args: ContainerCpArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let Some(driver) = select_driver(store, args.runtime, printer).await? else {
        return Ok(ExitStatus::Error);
    };

    match driver.copy(&args.src, &args.dst).await {
        Ok(()) => Ok(ExitStatus::Success),
        Err(err @ ContainerError::MissingSource(_)) => {
            writeln!(printer.stderr(), "{}: {err}", "error".red().bold())?;
            Ok(ExitStatus::Failure)
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) async fn container_list(
    store: &Store,
    args: ContainerListArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let Some(driver) = select_driver(store, args.runtime, printer).await? else {
        return Ok(ExitStatus::Error);
    };

    let handles = driver
        .list(&ListFilters {
            all: args.all,
            name: args.name,
            label: args.label,
            state: args.state,
        })
        .await?;

    if handles.is_empty() {
        writeln!(printer.stdout(), "No containers found")?;
        return Ok(ExitStatus::Success);
    }

    for handle in handles {
        writeln!(
            printer.stdout(),
            "{}  {}  {}  {}",
            &handle.id[..handle.id.len().min(12)],
            handle.name.bold(),
            handle.image,
            handle.state.as_str().dimmed(),
        )?;
    }
    Ok(ExitStatus::Success)
}

pub(crate) async fn container_remove(
    store: &Store,
    args: ContainerRemoveArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let Some(driver) = select_driver(store, args.runtime, printer).await? else {
        return Ok(ExitStatus::Error);
    };

    match driver.remove(&args.name, args.force).await {
        Ok(()) => {
            writeln!(printer.stdout(), "Removed `{}`", args.name)?;
            Ok(ExitStatus::Success)
        }
        Err(err @ (ContainerError::RemoveRunning(_) | ContainerError::NotFound(_))) => {
            writeln!(printer.stderr(), "{}: {err}", "error".red().bold())?;
            Ok(ExitStatus::Failure)
        }
        Err(err) => Err(err.into()),
    }
}

/// The `container check` report: per-runtime status, capabilities, and the
/// preferred selection, with an installation suggestion when nothing is
/// found.
pub(crate) async fn container_check(
    store: &Store,
    args: ContainerCheckArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let report = runtime::detect(store, args.refresh, None).await;

    writeln!(printer.stdout(), "{}", "Container Runtime Status".bold())?;
    writeln!(printer.stdout(), "========================")?;

    for (kind, status) in &report.statuses {
        writeln!(printer.stdout())?;
        writeln!(printer.stdout(), "{}:", kind.to_string().bold())?;
        if !status.available {
            writeln!(printer.stdout(), "  Status: {}", "not found".red())?;
            continue;
        }
        if status.active() {
            writeln!(printer.stdout(), "  Status: {}", "available (daemon running)".green())?;
        } else {
            writeln!(
                printer.stdout(),
                "  Status: {}",
                "available (daemon not reachable)".yellow()
            )?;
        }
        if let Some(version) = &status.version {
            writeln!(printer.stdout(), "  Version: {version}")?;
        }
        if !status.capabilities.is_empty() {
            writeln!(
                printer.stdout(),
                "  Capabilities: {}",
                status.capabilities.iter().map(ToString::to_string).join(", ")
            )?;
        }
    }

    writeln!(printer.stdout())?;
    match report.preferred {
        Some(kind) => {
            writeln!(printer.stdout(), "Preferred: {}", kind.to_string().cyan())?;
            Ok(ExitStatus::Success)
        }
        None => {
            writeln!(printer.stdout(), "Preferred: {}", "none".red())?;
            writeln!(
                printer.stdout(),
                "\nNo container runtime detected. Install Docker \
                 (https://docs.docker.com/get-docker/) or Podman \
                 (https://podman.io/docs/installation)."
            )?;
            Ok(ExitStatus::Failure)
        }
    }
}

pub(crate) async fn run_in_container(
    store: &Store,
    args: RunInContainerArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let Some(driver) = select_driver(store, args.runtime, printer).await? else {
        return Ok(ExitStatus::Error);
    };

    let env = args
        .env
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    writeln!(
        printer.stdout(),
        "Installing {} in a `{}` container...",
        args.package.bold(),
        args.image
    )?;
    let execution = run_in::run_in_container(
        &driver,
        &RunInContainerRequest {
            package: args.package,
            variant: args.variant,
            image: args.image,
            name: args.name,
            env,
            keep: args.keep,
        },
    )
    .await?;

    write!(printer.stdout(), "{}", execution.output)?;
    if execution.kept {
        writeln!(
            printer.stdout(),
            "Container `{}` kept for inspection",
            execution.handle.name
        )?;
    }
    Ok(if execution.exit_code == 0 {
        ExitStatus::Success
    } else {
        ExitStatus::Error
    })
}
