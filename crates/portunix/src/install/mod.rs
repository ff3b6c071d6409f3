use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::download::DownloadCache;
use crate::ledger::{Ledger, StepRecord, StepStatus, new_run_id, now_ts};
use crate::registry::resolver::{InstallPlan, PlannedInstall, StepAction};
use crate::store::Store;

mod archive;
mod manager;
mod script;

pub(crate) use script::run_shell_command;

#[derive(Debug, Error)]
pub(crate) enum PlanError {
    #[error("Step `{step}` of `{package}` failed")]
    Step {
        package: String,
        step: String,
        #[source]
        cause: anyhow::Error,
    },
    #[error(transparent)]
    Ledger(#[from] crate::ledger::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The shared result contract of all executors.
#[derive(Debug, Default)]
pub(crate) struct StepResult {
    pub(crate) status: StepStatus,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) artifacts: Vec<PathBuf>,
}

/// Progress events emitted while a plan executes. The CLI streams them to
/// stdout; the MCP server collects them into the tool-call response.
pub(crate) trait ProgressEvents: Send + Sync {
    fn on_install_start(&self, install: &PlannedInstall);
    fn on_install_skipped(&self, install: &PlannedInstall);
    fn on_step_start(&self, install: &PlannedInstall, step: &StepAction, index: usize, total: usize);
    fn on_step_complete(&self, install: &PlannedInstall, step: &StepAction, result: &StepResult);
}

/// A sink that drops all events.
pub(crate) struct SilentProgress;

impl ProgressEvents for SilentProgress {
    fn on_install_start(&self, _: &PlannedInstall) {}
    fn on_install_skipped(&self, _: &PlannedInstall) {}
    fn on_step_start(&self, _: &PlannedInstall, _: &StepAction, _: usize, _: usize) {}
    fn on_step_complete(&self, _: &PlannedInstall, _: &StepAction, _: &StepResult) {}
}

pub(crate) struct ExecuteContext<'a> {
    pub(crate) store: &'a Store,
    pub(crate) ledger: &'a Ledger,
    pub(crate) cache: &'a DownloadCache,
    pub(crate) env_overrides: Vec<(String, String)>,
    pub(crate) download_reporter: Option<&'a dyn crate::download::DownloadReporter>,
}

/// Outcome of one executed plan.
#[derive(Debug)]
pub(crate) struct PlanReport {
    pub(crate) run_id: String,
    pub(crate) installs: Vec<InstallOutcome>,
}

#[derive(Debug)]
pub(crate) struct InstallOutcome {
    pub(crate) package: String,
    pub(crate) variant: String,
    pub(crate) skipped: bool,
    pub(crate) steps: Vec<(String, StepStatus)>,
}

/// Execute a resolved plan, step by step, strictly in order.
///
/// Every step start and end is logged to the ledger with a monotonic
/// sequence number. The first failure stops the plan; there is no automatic
/// rollback at this layer (rollback is a playbook concern).
pub(crate) async fn execute_plan(
    plan: &InstallPlan,
    ctx: &ExecuteContext<'_>,
    events: &dyn ProgressEvents,
) -> Result<PlanReport, PlanError> {
    let run_id = new_run_id();
    let plan_hash = plan.hash();
    let mut seq = 0u64;
    let mut report = PlanReport {
        run_id: run_id.clone(),
        installs: Vec::new(),
    };

    for install in &plan.installs {
        // Writes to the same package serialize across processes; different
        // packages proceed in parallel.
        let _package_lock = ctx.store.lock_package(&install.package).await?;

        let mut outcome = InstallOutcome {
            package: install.package.clone(),
            variant: install.variant.id.clone(),
            skipped: install.skip,
            steps: Vec::new(),
        };

        if install.skip {
            events.on_install_skipped(install);
            ctx.ledger
                .append(&record(&run_id, seq, install, "plan", StepStatus::Skipped, None))
                .await?;
            seq += 1;
            report.installs.push(outcome);
            continue;
        }

        events.on_install_start(install);
        let mut executor = Executor::for_install(install, ctx);

        let total = install.steps.len();
        for (index, step) in install.steps.iter().enumerate() {
            events.on_step_start(install, step, index, total);
            ctx.ledger
                .append(&record(&run_id, seq, install, step.name(), StepStatus::Started, None))
                .await?;

            match executor.execute(step, ctx).await {
                Ok(result) => {
                    ctx.ledger
                        .append(&record(
                            &run_id,
                            seq,
                            install,
                            step.name(),
                            result.status,
                            Some(&result),
                        ))
                        .await?;
                    events.on_step_complete(install, step, &result);
                    outcome.steps.push((step.name().to_string(), result.status));
                    seq += 1;
                }
                Err(cause) => {
                    ctx.ledger
                        .append(&StepRecord {
                            error: Some(format!("{cause:#}")),
                            ..record(&run_id, seq, install, step.name(), StepStatus::Failed, None)
                        })
                        .await?;
                    return Err(PlanError::Step {
                        package: install.package.clone(),
                        step: step.name().to_string(),
                        cause,
                    });
                }
            }
        }

        ctx.ledger
            .record_installed(&install.package, &install.variant.id, &plan_hash)
            .await?;
        debug!(
            package = install.package,
            variant = install.variant.id,
            "Recorded install"
        );
        report.installs.push(outcome);
    }

    Ok(report)
}

fn record(
    run_id: &str,
    seq: u64,
    install: &PlannedInstall,
    step: &str,
    status: StepStatus,
    result: Option<&StepResult>,
) -> StepRecord {
    StepRecord {
        ts: now_ts(),
        run_id: run_id.to_string(),
        seq,
        package: install.package.clone(),
        variant: install.variant.id.clone(),
        step: step.to_string(),
        status,
        artifacts: result
            .filter(|result| !result.artifacts.is_empty())
            .map(|result| result.artifacts.clone()),
        error: None,
    }
}

/// One executor per installer kind. Archive steps share state (the
/// downloaded blob, the extracted tree), so the executor lives for the
/// whole install.
enum Executor {
    Archive(archive::ArchiveExecutor),
    Manager(manager::ManagerExecutor),
    Script(script::ScriptExecutor),
    /// Redirects are inlined by the resolver and must never reach execution.
    Redirect,
}

impl Executor {
    fn for_install(install: &PlannedInstall, ctx: &ExecuteContext<'_>) -> Self {
        match install.variant.installer.kind() {
            "archive" => Executor::Archive(archive::ArchiveExecutor::new(install, ctx)),
            "apt" | "dnf" | "pacman" | "snap" => {
                Executor::Manager(manager::ManagerExecutor::new())
            }
            "script" => Executor::Script(script::ScriptExecutor::new(install)),
            _ => Executor::Redirect,
        }
    }

    async fn execute(
        &mut self,
        step: &StepAction,
        ctx: &ExecuteContext<'_>,
    ) -> anyhow::Result<StepResult> {
        match self {
            Executor::Archive(executor) => executor.execute(step, ctx).await,
            Executor::Manager(executor) => executor.execute(step, ctx).await,
            Executor::Script(executor) => executor.execute(step, ctx).await,
            Executor::Redirect => {
                anyhow::bail!("redirect variants have no executable steps")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, DistroFamily, Os, Platform};
    use crate::registry::Registry;
    use crate::registry::resolver::{InstallRequest, resolve};
    use pretty_assertions::assert_eq;

    fn linux_amd64() -> Platform {
        Platform {
            os: Os::Linux,
            arch: Arch::Amd64,
            distro_family: DistroFamily::Apt,
            distro: "ubuntu".into(),
            version: "22.04".into(),
            inside_container: false,
        }
    }

    #[tokio::test]
    async fn script_plan_executes_and_is_idempotent() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;
        let ledger = Ledger::new(&store);
        let cache = DownloadCache::new(&store);
        let registry = Registry::load(None)?;

        let request = InstallRequest {
            package: "uname-probe".into(),
            ..Default::default()
        };
        let plan = resolve(&linux_amd64(), &registry, &ledger.index(), &request)?;

        let ctx = ExecuteContext {
            store: &store,
            ledger: &ledger,
            cache: &cache,
            env_overrides: Vec::new(),
            download_reporter: None,
        };
        let report = execute_plan(&plan, &ctx, &SilentProgress).await?;
        assert_eq!(report.installs.len(), 1);
        assert!(!report.installs[0].skipped);
        assert_eq!(report.installs[0].steps, [("run-cmd".to_string(), StepStatus::Ok)]);

        // Second run resolves to skipped-only.
        let plan = resolve(&linux_amd64(), &registry, &ledger.index(), &request)?;
        assert!(plan.installs[0].skip);
        let report = execute_plan(&plan, &ctx, &SilentProgress).await?;
        assert!(report.installs[0].skipped);

        // The ledger tail for the second run is a single skipped record.
        let records = ledger.records()?;
        let last = records.last().unwrap();
        assert_eq!(last.status, StepStatus::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn failing_step_stops_the_plan_and_is_recorded() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;
        let ledger = Ledger::new(&store);
        let cache = DownloadCache::new(&store);

        let registry = Registry::from_manifest(
            "<test>",
            indoc::indoc! {r"
                packages:
                  - name: doomed
                    variants:
                      - id: default
                        type: script
                        command: 'false'
            "},
        )?;

        let plan = resolve(
            &linux_amd64(),
            &registry,
            &ledger.index(),
            &InstallRequest {
                package: "doomed".into(),
                ..Default::default()
            },
        )?;

        let ctx = ExecuteContext {
            store: &store,
            ledger: &ledger,
            cache: &cache,
            env_overrides: Vec::new(),
            download_reporter: None,
        };
        let err = execute_plan(&plan, &ctx, &SilentProgress).await;
        assert!(matches!(err, Err(PlanError::Step { .. })));

        let records = ledger.records()?;
        let last = records.last().unwrap();
        assert_eq!(last.status, StepStatus::Failed);
        assert!(last.error.is_some());

        // Nothing was recorded as installed.
        assert!(!ledger.index().is_installed("doomed", "default"));
        Ok(())
    }
}
