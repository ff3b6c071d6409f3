use std::path::Path;

use anyhow::Result;

use crate::install::{ExecuteContext, StepResult};
use crate::process::Cmd;
use crate::registry::resolver::{PlannedInstall, StepAction};

/// Executes `script` variants: one declared shell command, run in a fresh
/// temporary working directory with the current environment plus overrides.
pub(crate) struct ScriptExecutor {
    package: String,
}

impl ScriptExecutor {
    pub(crate) fn new(install: &PlannedInstall) -> Self {
        Self {
            package: install.package.clone(),
        }
    }

    pub(crate) async fn execute(
        &mut self,
        step: &StepAction,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StepResult> {
        match step {
            StepAction::RunCommand { command } => {
                let workdir = tempfile::tempdir_in(ctx.store.scratch_path())?;
                run_shell_command(command, &ctx.env_overrides, Some(workdir.path())).await
            }
            other => anyhow::bail!(
                "Internal error: step `{}` is not valid for a script variant of `{}`",
                other.name(),
                self.package
            ),
        }
    }
}

/// Run one declared shell command, capturing its output.
///
/// Declared commands are the single place where a shell interprets a
/// string; everything else in portunix passes argv verbatim.
pub(crate) async fn run_shell_command(
    command: &str,
    env_overrides: &[(String, String)],
    workdir: Option<&Path>,
) -> Result<StepResult> {
    #[cfg(unix)]
    let (shell, flag) = ("sh", "-c");
    #[cfg(windows)]
    let (shell, flag) = ("cmd", "/C");

    let mut cmd = Cmd::new(shell, format!("run `{command}`"));
    cmd.arg(flag).arg(command).envs(
        env_overrides
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str())),
    );
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    let output = cmd.output().await?;

    Ok(StepResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_env() -> anyhow::Result<()> {
        let result = run_shell_command(
            "echo \"$GREETING world\"",
            &[("GREETING".to_string(), "hello".to_string())],
            None,
        )
        .await?;
        assert_eq!(result.stdout.trim(), "hello world");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_the_given_workdir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let canonical = fs_err::canonicalize(tmp.path())?;
        let result = run_shell_command("pwd", &[], Some(&canonical)).await?;
        assert_eq!(result.stdout.trim(), canonical.to_string_lossy());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_propagates() {
        let result = run_shell_command("exit 3", &[], None).await;
        assert!(result.is_err());
    }
}
