use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::container::{ContainerDriver, run_in};
use crate::download::DownloadCache;
use crate::install::{ExecuteContext, SilentProgress, execute_plan, run_shell_command};
use crate::ledger::{Ledger, new_run_id};
use crate::platform::Platform;
use crate::playbook::template::Scope;
use crate::playbook::{Playbook, parse_duration, template};
use crate::process::Cmd;
use crate::registry::Registry;
use crate::registry::resolver::{InstallRequest, resolve};
use crate::runtime;
use crate::store::Store;

/// Default ceiling on the whole rollback phase.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Where a playbook's steps execute.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Environment {
    #[default]
    Local,
    Container,
    Virt,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct RunOptions {
    pub(crate) environment: Environment,
    pub(crate) dry_run: bool,
    /// Container image for `container`, VM name for `virt`.
    pub(crate) image: Option<String>,
    pub(crate) target: Option<String>,
    pub(crate) force: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Ok,
    Skipped,
    Planned,
    Failed,
}

impl StepOutcome {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Ok => "ok",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Planned => "planned",
            StepOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub(crate) struct StepReport {
    pub(crate) name: String,
    pub(crate) outcome: StepOutcome,
    pub(crate) detail: String,
}

#[derive(Debug)]
pub(crate) struct RollbackReport {
    pub(crate) executed: Vec<(String, StepOutcome)>,
}

/// A compound result: the step reports, the original error if any, and the
/// rollback status. A rollback failure never masks the original error.
#[derive(Debug)]
pub(crate) struct PlaybookResult {
    pub(crate) run_id: String,
    pub(crate) steps: Vec<StepReport>,
    pub(crate) error: Option<String>,
    pub(crate) rollback: Option<RollbackReport>,
    pub(crate) log_dir: Option<PathBuf>,
}

impl PlaybookResult {
    pub(crate) fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Run a playbook: evaluate guards, install packages in the chosen
/// environment, invoke Ansible, roll back on failure when enabled.
pub(crate) async fn run(
    playbook: &Playbook,
    opts: &RunOptions,
    store: &Store,
    registry: &Registry,
) -> Result<PlaybookResult> {
    let platform = Platform::current();
    let run_id = new_run_id();
    let log_dir = store.runs_dir().join(&run_id);
    fs_err::create_dir_all(&log_dir)?;
    let mut log = RunLog::create(&log_dir)?;

    if opts.environment == Environment::Virt && opts.target.is_none() {
        anyhow::bail!("`virt` execution requires --target <vm-name>");
    }

    log.line(&format!(
        "playbook {} run {run_id} ({:?})",
        playbook.metadata.name, opts.environment
    ))?;

    let mut result = PlaybookResult {
        run_id: run_id.clone(),
        steps: Vec::new(),
        error: None,
        rollback: None,
        log_dir: Some(log_dir.clone()),
    };

    if let Err(err) = execute_stages(playbook, opts, store, registry, platform, &mut result, &mut log).await
    {
        let message = format!("{err:#}");
        log.line(&format!("error: {message}"))?;
        result.error = Some(message);

        if let Some(rollback) = &playbook.spec.rollback {
            if rollback.enabled && !opts.dry_run {
                let report = run_rollback(playbook, platform, &mut log).await;
                result.rollback = Some(report);
            }
        }
    }

    let preserve_logs = playbook
        .spec
        .rollback
        .as_ref()
        .is_none_or(|rollback| rollback.preserve_logs);
    if !preserve_logs {
        drop(log);
        fs_err::remove_dir_all(&log_dir).ok();
        result.log_dir = None;
    }

    Ok(result)
}

async fn execute_stages(
    playbook: &Playbook,
    opts: &RunOptions,
    store: &Store,
    registry: &Registry,
    platform: &Platform,
    result: &mut PlaybookResult,
    log: &mut RunLog,
) -> Result<()> {
    check_requirements(playbook, opts).await?;

    // Portunix packages first, then Ansible playbooks.
    for step in playbook
        .spec
        .portunix
        .iter()
        .flat_map(|section| &section.packages)
    {
        let empty = BTreeMap::new();
        let step_vars = step.vars.as_ref().unwrap_or(&empty);
        let scope = Scope::new(platform)
            .push(&playbook.spec.environment)
            .push(&playbook.spec.variables)
            .push(step_vars);

        let name = template::render(&step.name, &scope)?;
        let label = format!("package {name}");

        if let Some(when) = &step.when {
            if !template::eval_condition(when, &scope)? {
                log.line(&format!("{label}: skipped (when: {when})"))?;
                result.steps.push(StepReport {
                    name: label,
                    outcome: StepOutcome::Skipped,
                    detail: format!("when: {when}"),
                });
                continue;
            }
        }

        let variant = step
            .variant
            .as_ref()
            .map(|variant| template::render(variant, &scope))
            .transpose()?;
        let request = InstallRequest {
            package: name.clone(),
            variant_override: variant,
            force: opts.force,
            env_overrides: Vec::new(),
        };

        if opts.dry_run {
            let ledger = Ledger::new(store);
            let plan = resolve(platform, registry, &ledger.index(), &request)?;
            let planned = plan
                .installs
                .iter()
                .map(|install| format!("{} ({})", install.package, install.variant.id))
                .collect::<Vec<_>>()
                .join(", ");
            log.line(&format!("{label}: planned [{planned}]"))?;
            result.steps.push(StepReport {
                name: label,
                outcome: StepOutcome::Planned,
                detail: planned,
            });
            continue;
        }

        let detail = match opts.environment {
            Environment::Local => {
                let ledger = Ledger::new(store);
                let cache = DownloadCache::new(store);
                let plan = resolve(platform, registry, &ledger.index(), &request)?;
                let ctx = ExecuteContext {
                    store,
                    ledger: &ledger,
                    cache: &cache,
                    env_overrides: Vec::new(),
                    download_reporter: None,
                };
                let report = execute_plan(&plan, &ctx, &SilentProgress)
                    .await
                    .with_context(|| format!("Failed to install `{name}`"))?;
                format!("run {}", report.run_id)
            }
            Environment::Container => {
                let image = opts
                    .image
                    .clone()
                    .context("`container` execution requires --image")?;
                let report = runtime::detect(store, false, None).await;
                let driver = ContainerDriver::select(&report)?;
                let execution = run_in::run_in_container(
                    &driver,
                    &run_in::RunInContainerRequest {
                        package: name.clone(),
                        variant: request.variant_override.clone(),
                        image,
                        name: None,
                        env: Vec::new(),
                        keep: false,
                    },
                )
                .await?;
                anyhow::ensure!(
                    execution.exit_code == 0,
                    "install of `{name}` in container exited with {}",
                    execution.exit_code
                );
                format!("container {}", execution.handle.name)
            }
            Environment::Virt => {
                let target = opts.target.clone().expect("checked above");
                // Remote exec over SSH; the VM must have portunix on PATH.
                let mut cmd = Cmd::new("ssh", format!("install {name} on {target}"));
                cmd.arg(&target).arg("portunix").arg("install").arg(&name);
                if let Some(variant) = &request.variant_override {
                    cmd.arg("--variant").arg(variant);
                }
                cmd.output()
                    .await
                    .with_context(|| format!("Failed to install `{name}` on `{target}`"))?;
                format!("vm {target}")
            }
        };

        log.line(&format!("{label}: ok ({detail})"))?;
        result.steps.push(StepReport {
            name: label,
            outcome: StepOutcome::Ok,
            detail,
        });
    }

    for play in playbook
        .spec
        .ansible
        .iter()
        .flat_map(|section| &section.playbooks)
    {
        let empty = BTreeMap::new();
        let play_vars = play.vars.as_ref().unwrap_or(&empty);
        let scope = Scope::new(platform)
            .push(&playbook.spec.environment)
            .push(&playbook.spec.variables)
            .push(play_vars);

        let path = template::render(&play.path, &scope)?;
        let label = format!("ansible {path}");

        if let Some(when) = &play.when {
            if !template::eval_condition(when, &scope)? {
                log.line(&format!("{label}: skipped (when: {when})"))?;
                result.steps.push(StepReport {
                    name: label,
                    outcome: StepOutcome::Skipped,
                    detail: format!("when: {when}"),
                });
                continue;
            }
        }

        if opts.dry_run {
            log.line(&format!("{label}: planned"))?;
            result.steps.push(StepReport {
                name: label,
                outcome: StepOutcome::Planned,
                detail: String::new(),
            });
            continue;
        }

        run_ansible(opts, &path, play_vars, log).await?;
        result.steps.push(StepReport {
            name: label,
            outcome: StepOutcome::Ok,
            detail: String::new(),
        });
    }

    Ok(())
}

/// Enforce `spec.requirements` before any side effects.
async fn check_requirements(playbook: &Playbook, opts: &RunOptions) -> Result<()> {
    let Some(requirement) = playbook
        .spec
        .requirements
        .as_ref()
        .and_then(|requirements| requirements.ansible.as_ref())
    else {
        return Ok(());
    };
    let has_plays = playbook
        .spec
        .ansible
        .as_ref()
        .is_some_and(|section| !section.playbooks.is_empty());
    if !has_plays || opts.dry_run {
        return Ok(());
    }

    let min: semver::Version = requirement
        .min_version
        .parse()
        .context("Invalid ansible min_version")?;

    let output = Cmd::new("ansible", "check ansible version")
        .arg("--version")
        .output()
        .await
        .context("Ansible is required by this playbook but was not found")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    // First line: `ansible [core 2.16.3]` or `ansible 2.9.27`.
    let version = stdout
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find(|token| token.contains('.'))
        .and_then(|token| semver::Version::parse(token).ok());

    if let Some(version) = version {
        anyhow::ensure!(
            version >= min,
            "Ansible {version} is older than the required {min}"
        );
    } else {
        warn!("Could not parse ansible version from `ansible --version`");
    }
    Ok(())
}

/// Invoke `ansible-playbook` with an inventory matching the environment.
async fn run_ansible(
    opts: &RunOptions,
    path: &str,
    vars: &BTreeMap<String, serde_yaml::Value>,
    log: &mut RunLog,
) -> Result<()> {
    let inventory = write_inventory(opts, log)?;

    let mut cmd = Cmd::new("ansible-playbook", format!("ansible-playbook {path}"));
    cmd.arg("-i").arg(&inventory).arg(path);
    for (key, value) in vars {
        let value = serde_json::to_string(value).unwrap_or_default();
        cmd.arg("-e").arg(format!("{key}={value}"));
    }

    let output = cmd.output().await.context("ansible-playbook failed")?;
    log.line(&format!(
        "ansible-playbook {path}: {}",
        String::from_utf8_lossy(&output.stdout).trim_end()
    ))?;
    Ok(())
}

/// Generate an inventory file next to the run log.
fn write_inventory(opts: &RunOptions, log: &mut RunLog) -> Result<PathBuf> {
    let inventory = log.dir.join("inventory.ini");
    let content = match opts.environment {
        Environment::Local => "localhost ansible_connection=local\n".to_string(),
        Environment::Container => {
            let name = opts
                .target
                .clone()
                .or_else(|| opts.image.clone())
                .unwrap_or_else(|| "portunix".to_string());
            format!("{name} ansible_connection=docker\n")
        }
        Environment::Virt => {
            let target = opts.target.clone().unwrap_or_default();
            format!("{target} ansible_connection=ssh\n")
        }
    };
    fs_err::write(&inventory, content)?;
    Ok(inventory)
}

/// Execute `rollback.on_failure` entries in declaration order. Failures are
/// logged but never override the original error.
async fn run_rollback(playbook: &Playbook, platform: &Platform, log: &mut RunLog) -> RollbackReport {
    let rollback = playbook
        .spec
        .rollback
        .as_ref()
        .expect("caller checked rollback");
    let timeout = rollback
        .timeout
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(ROLLBACK_TIMEOUT);

    let scope = Scope::new(platform)
        .push(&playbook.spec.environment)
        .push(&playbook.spec.variables);

    let mut executed = Vec::new();
    for action in &rollback.on_failure {
        let label = action
            .description
            .clone()
            .or_else(|| action.command.clone())
            .unwrap_or_else(|| action.kind.clone());

        if let Some(when) = &action.when {
            match template::eval_condition(when, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    executed.push((label, StepOutcome::Skipped));
                    continue;
                }
                Err(err) => {
                    warn!("Rollback guard `{when}` failed to evaluate: {err}");
                    executed.push((label, StepOutcome::Failed));
                    continue;
                }
            }
        }

        // Rollback entries are commands, not inverse installers.
        let outcome = match &action.command {
            Some(command) => {
                let rendered = match template::render(command, &scope) {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        warn!("Rollback command failed to render: {err}");
                        executed.push((label, StepOutcome::Failed));
                        continue;
                    }
                };
                let run = tokio::time::timeout(timeout, run_shell_command(&rendered, &[], None));
                match run.await {
                    Ok(Ok(_)) => StepOutcome::Ok,
                    Ok(Err(err)) => {
                        warn!("Rollback command failed: {err:#}");
                        StepOutcome::Failed
                    }
                    Err(_) => {
                        warn!("Rollback command timed out after {timeout:?}");
                        StepOutcome::Failed
                    }
                }
            }
            None => StepOutcome::Skipped,
        };

        let _ = log.line(&format!("rollback `{label}`: {}", outcome.as_str()));
        executed.push((label, outcome));
    }

    RollbackReport { executed }
}

/// Append-only run log under `runs/<run-id>/run.log`.
struct RunLog {
    dir: PathBuf,
    buffer: String,
}

impl RunLog {
    fn create(dir: &std::path::Path) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            buffer: String::new(),
        })
    }

    fn line(&mut self, message: &str) -> Result<()> {
        debug!("{message}");
        writeln!(self.buffer, "{message}")?;
        fs_err::write(self.dir.join("run.log"), self.buffer.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn fixture(content: &str) -> Playbook {
        Playbook::parse_str(content, "<test>").unwrap()
    }

    const CONDITIONAL: &str = indoc! {r"
        apiVersion: portunix.ai/v1
        kind: Playbook
        metadata:
          name: conditional
        spec:
          variables:
            install_java: true
            install_node: false
          portunix:
            packages:
              - name: java
                when: install_java
              - name: nodejs
                when: install_node
    "};

    #[tokio::test]
    async fn dry_run_plans_and_skips_by_condition() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;
        let registry = Registry::load(None)?;
        let playbook = fixture(CONDITIONAL);

        let result = run(
            &playbook,
            &RunOptions {
                dry_run: true,
                ..Default::default()
            },
            &store,
            &registry,
        )
        .await?;

        assert!(result.succeeded());
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].name, "package java");
        assert_eq!(result.steps[0].outcome, StepOutcome::Planned);
        assert_eq!(result.steps[1].name, "package nodejs");
        assert_eq!(result.steps[1].outcome, StepOutcome::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn all_false_guards_succeed_with_all_skipped() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;
        let registry = Registry::load(None)?;
        let content = CONDITIONAL.replace("install_java: true", "install_java: false");
        let playbook = fixture(&content);

        let result = run(&playbook, &RunOptions::default(), &store, &registry).await?;
        assert!(result.succeeded());
        assert!(
            result
                .steps
                .iter()
                .all(|step| step.outcome == StepOutcome::Skipped)
        );
        Ok(())
    }

    #[tokio::test]
    async fn virt_without_target_is_an_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;
        let registry = Registry::load(None)?;
        let playbook = fixture(CONDITIONAL);

        let err = run(
            &playbook,
            &RunOptions {
                environment: Environment::Virt,
                dry_run: true,
                ..Default::default()
            },
            &store,
            &registry,
        )
        .await;
        assert!(err.is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_triggers_rollback_without_masking_the_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;
        let registry = Registry::load(None)?;

        let marker = tmp.path().join("rolled-back");
        let content = format!(
            indoc! {r"
                apiVersion: portunix.ai/v1
                kind: Playbook
                metadata:
                  name: doomed
                spec:
                  variables:
                    cleanup: true
                  portunix:
                    packages:
                      - name: no-such-package-anywhere
                  rollback:
                    enabled: true
                    preserve_logs: true
                    timeout: 30s
                    on_failure:
                      - type: command
                        command: touch {}
                        when: cleanup
                      - type: command
                        command: 'false'
            "},
            marker.display()
        );
        let playbook = fixture(&content);

        let result = run(&playbook, &RunOptions::default(), &store, &registry).await?;
        assert!(!result.succeeded());
        assert!(result.error.as_deref().unwrap().contains("no-such-package-anywhere"));

        let rollback = result.rollback.expect("rollback ran");
        assert_eq!(rollback.executed.len(), 2);
        assert_eq!(rollback.executed[0].1, StepOutcome::Ok);
        assert_eq!(rollback.executed[1].1, StepOutcome::Failed);
        assert!(marker.exists(), "rollback command ran");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn preserve_logs_false_removes_the_run_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;
        let registry = Registry::load(None)?;

        let content = indoc! {r"
            apiVersion: portunix.ai/v1
            kind: Playbook
            metadata:
              name: tidy
            spec:
              variables:
                go: false
              portunix:
                packages:
                  - name: java
                    when: go
              rollback:
                enabled: false
                preserve_logs: false
        "};
        let playbook = fixture(content);

        let result = run(&playbook, &RunOptions::default(), &store, &registry).await?;
        assert!(result.succeeded());
        assert!(result.log_dir.is_none());
        Ok(())
    }
}
