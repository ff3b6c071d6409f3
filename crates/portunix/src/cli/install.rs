use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::cli::{ExitStatus, InstallArgs, InstallTarget};
use crate::cli::reporter::InstallReporter;
use crate::container::run_in::{RunInContainerRequest, run_in_container};
use crate::container::ContainerDriver;
use crate::download::DownloadCache;
use crate::install::{ExecuteContext, execute_plan};
use crate::ledger::Ledger;
use crate::platform::Platform;
use crate::printer::Printer;
use crate::process::Cmd;
use crate::registry::Registry;
use crate::registry::resolver::{InstallPlan, InstallRequest, ResolveError, resolve};
use crate::runtime;
use crate::store::Store;

/// The `install` command: resolve, then execute (or preview) the plan.
pub(crate) async fn install(
    store: &Store,
    assets_dir: Option<&Path>,
    args: InstallArgs,
    printer: Printer,
) -> Result<ExitStatus> {
    let env_overrides = match parse_env_overrides(&args.env) {
        Ok(env) => env,
        Err(message) => {
            writeln!(printer.stderr(), "{}: {message}", "error".red().bold())?;
            return Ok(ExitStatus::Failure);
        }
    };

    match args.target {
        InstallTarget::Local => {
            install_local(store, assets_dir, &args, env_overrides, printer).await
        }
        InstallTarget::Container => install_in_container(store, &args, env_overrides, printer).await,
        InstallTarget::Virt => install_on_vm(&args, printer).await,
    }
}

async fn install_local(
    store: &Store,
    assets_dir: Option<&Path>,
    args: &InstallArgs,
    env_overrides: Vec<(String, String)>,
    printer: Printer,
) -> Result<ExitStatus> {
    let registry = Registry::load(assets_dir)?;
    let platform = Platform::current();
    let ledger = Ledger::new(store);

    let request = InstallRequest {
        package: args.package.clone(),
        variant_override: args.variant.clone(),
        force: args.force,
        env_overrides,
    };

    let plan = match resolve(platform, &registry, &ledger.index(), &request) {
        Ok(plan) => plan,
        Err(err) => {
            writeln!(printer.stderr(), "{}: {err}", "error".red().bold())?;
            if let ResolveError::UnknownPackage(name) = &err {
                if let Some(suggestion) = closest_package(&registry, name) {
                    writeln!(printer.stderr(), "  did you mean `{suggestion}`?")?;
                }
            }
            return Ok(ExitStatus::Failure);
        }
    };

    if args.dry_run {
        print_dry_run(&plan, platform, printer)?;
        return Ok(ExitStatus::Success);
    }

    let cache = DownloadCache::new(store);
    let reporter = InstallReporter::new(printer);
    let ctx = ExecuteContext {
        store,
        ledger: &ledger,
        cache: &cache,
        env_overrides: request.env_overrides.clone(),
        download_reporter: Some(&reporter),
    };

    match execute_plan(&plan, &ctx, &reporter).await {
        Ok(report) => {
            let installed = report
                .installs
                .iter()
                .filter(|outcome| !outcome.skipped)
                .count();
            let skipped = report.installs.len() - installed;
            let mut summary = format!("Installed {installed} package{}", plural(installed));
            if skipped > 0 {
                write!(summary, " ({skipped} already present)")?;
            }
            writeln!(printer.stdout(), "{}", summary.green())?;
            Ok(ExitStatus::Success)
        }
        Err(err) => {
            writeln!(printer.stderr(), "{}: {err:#}", "error".red().bold())?;
            Ok(ExitStatus::Error)
        }
    }
}

async fn install_in_container(
    store: &Store,
    args: &InstallArgs,
    env_overrides: Vec<(String, String)>,
    printer: Printer,
) -> Result<ExitStatus> {
    let Some(image) = args.image.clone() else {
        writeln!(
            printer.stderr(),
            "{}: --target container requires --image",
            "error".red().bold()
        )?;
        return Ok(ExitStatus::Failure);
    };

    let report = runtime::detect(store, false, None).await;
    let driver = match ContainerDriver::select(&report) {
        Ok(driver) => driver,
        Err(err) => {
            writeln!(printer.stderr(), "{}: {err}", "error".red().bold())?;
            return Ok(ExitStatus::Error);
        }
    };

    let execution = run_in_container(
        &driver,
        &RunInContainerRequest {
            package: args.package.clone(),
            variant: args.variant.clone(),
            image,
            name: args.name.clone(),
            env: env_overrides,
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

async fn install_on_vm(args: &InstallArgs, printer: Printer) -> Result<ExitStatus> {
    let Some(target) = args.name.clone() else {
        writeln!(
            printer.stderr(),
            "{}: --target virt requires --name <vm>",
            "error".red().bold()
        )?;
        return Ok(ExitStatus::Failure);
    };

    // Remote exec; the VM must have portunix on PATH.
    let mut cmd = Cmd::new("ssh", format!("install {} on {target}", args.package));
    cmd.arg(&target).arg("portunix").arg("install").arg(&args.package);
    if let Some(variant) = &args.variant {
        cmd.arg("--variant").arg(variant);
    }
    if args.force {
        cmd.arg("--force");
    }

    match cmd.output().await {
        Ok(output) => {
            write!(printer.stdout(), "{}", String::from_utf8_lossy(&output.stdout))?;
            Ok(ExitStatus::Success)
        }
        Err(err) => {
            writeln!(printer.stderr(), "{}: {err:#}", "error".red().bold())?;
            Ok(ExitStatus::Error)
        }
    }
}

/// The stable dry-run block: package header, per-variant details, and the
/// closing dry-run banner.
fn print_dry_run(plan: &InstallPlan, platform: &Platform, printer: Printer) -> Result<()> {
    let root = plan
        .installs
        .iter()
        .find(|install| install.package == plan.root);
    let title = root
        .map(|install| install.description.as_str())
        .filter(|description| !description.is_empty())
        .unwrap_or(plan.root.as_str());
    writeln!(printer.stdout(), "📦 INSTALLING: {title}")?;

    if root.is_some_and(|install| install.redirected_from.is_some()) {
        writeln!(printer.stdout(), "🔀 Redirecting to package: {}", plan.root)?;
    }

    for install in &plan.installs {
        writeln!(printer.stdout(), "🔧 Variant: {}", install.variant.id)?;
        if install.package != plan.root {
            writeln!(printer.stdout(), "   Package: {} (prerequisite)", install.package)?;
        }
        writeln!(printer.stdout(), "   Type: {}", install.variant.installer.kind())?;
        if let Some(version) = &install.variant.version {
            writeln!(printer.stdout(), "   Version: {version}")?;
        }
        writeln!(printer.stdout(), "   Platform: {}", platform.summary())?;
        if install.skip {
            writeln!(printer.stdout(), "   Already installed, would skip")?;
            continue;
        }
        writeln!(printer.stdout(), "   Steps:")?;
        for step in &install.steps {
            writeln!(printer.stdout(), "     - {}", step.describe())?;
        }
    }

    for warning in &plan.warnings {
        writeln!(printer.stdout(), "⚠️  {warning}")?;
    }
    writeln!(
        printer.stdout(),
        "🔍 DRY-RUN MODE — no changes will be made"
    )?;
    Ok(())
}

fn parse_env_overrides(pairs: &[String]) -> Result<Vec<(String, String)>, String> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| format!("invalid --env `{pair}`, expected KEY=VALUE"))
        })
        .collect()
}

/// Cheapest-possible suggestion: a registry name sharing a 3-char prefix.
fn closest_package(registry: &Registry, name: &str) -> Option<String> {
    let prefix: String = name.to_ascii_lowercase().chars().take(3).collect();
    if prefix.is_empty() {
        return None;
    }
    registry
        .iter()
        .map(|package| package.name.as_str())
        .find(|candidate| candidate.starts_with(&prefix) || prefix.starts_with(*candidate))
        .map(ToString::to_string)
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn env_override_parsing() {
        let parsed = parse_env_overrides(&["A=1".into(), "B=two=three".into()]).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two=three".to_string())
            ]
        );
        assert!(parse_env_overrides(&["MISSING".into()]).is_err());
    }
}
