use anyhow::Result;

use crate::install::{ExecuteContext, StepResult};
use crate::process::Cmd;
use crate::registry::resolver::StepAction;

/// Executes `apt`/`dnf`/`pacman`/`snap` variants by invoking the system
/// package manager with a non-interactive argv.
pub(crate) struct ManagerExecutor;

impl ManagerExecutor {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) async fn execute(
        &mut self,
        step: &StepAction,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StepResult> {
        match step {
            StepAction::InvokePackageManager { manager, argv, env } => {
                let [program, args @ ..] = argv.as_slice() else {
                    anyhow::bail!("Internal error: empty package-manager argv");
                };

                let output = Cmd::new(program, format!("{manager} install"))
                    .args(args)
                    .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .envs(
                        ctx.env_overrides
                            .iter()
                            .map(|(k, v)| (k.as_str(), v.as_str())),
                    )
                    .output()
                    .await?;

                Ok(StepResult {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    ..Default::default()
                })
            }
            StepAction::RunCommand { command } => {
                crate::install::run_shell_command(command, &ctx.env_overrides, None).await
            }
            other => anyhow::bail!(
                "Internal error: step `{}` is not valid for a package-manager variant",
                other.name()
            ),
        }
    }
}
