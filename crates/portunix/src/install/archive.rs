use std::path::PathBuf;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::archive::{ArchiveExtension, strip_components, unpack};
use crate::fs::create_symlink_or_copy;
use crate::install::{ExecuteContext, StepResult};
use crate::registry::resolver::{PlannedInstall, StepAction};

/// Executes the step sequence of an `archive` variant. The downloaded blob
/// and the unpacked tree carry over between steps.
pub(crate) struct ArchiveExecutor {
    package: String,
    variant: String,
    /// `<packages_dir>/<package>/<variant>`
    target_dir: PathBuf,
    url: Option<String>,
    blob: Option<PathBuf>,
}

impl ArchiveExecutor {
    pub(crate) fn new(install: &PlannedInstall, ctx: &ExecuteContext<'_>) -> Self {
        let target_dir = ctx
            .store
            .packages_dir()
            .join(&install.package)
            .join(&install.variant.id);
        Self {
            package: install.package.clone(),
            variant: install.variant.id.clone(),
            target_dir,
            url: None,
            blob: None,
        }
    }

    pub(crate) async fn execute(
        &mut self,
        step: &StepAction,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StepResult> {
        match step {
            StepAction::Download { url, checksum } => {
                let blob = ctx
                    .cache
                    .fetch(url, checksum.as_deref(), ctx.download_reporter)
                    .await
                    .with_context(|| format!("Failed to fetch `{url}`"))?;
                self.url = Some(url.clone());
                self.blob = Some(blob.clone());
                Ok(StepResult {
                    artifacts: vec![blob],
                    ..Default::default()
                })
            }
            StepAction::VerifyChecksum { checksum } => {
                let blob = self.blob.as_ref().context("No downloaded blob to verify")?;
                let bytes = fs_err::tokio::read(blob).await?;
                let actual = hex::encode(Sha256::digest(&bytes));
                anyhow::ensure!(
                    checksum.eq_ignore_ascii_case(&actual),
                    "Checksum mismatch: expected {checksum}, got {actual}"
                );
                trace!(package = self.package, "Checksum verified");
                Ok(StepResult::default())
            }
            StepAction::Extract { strip } => {
                let blob = self.blob.as_ref().context("No downloaded blob to extract")?;
                let url = self.url.as_deref().unwrap_or_default();
                let filename = url.rsplit('/').next().unwrap_or(url);
                let ext = ArchiveExtension::from_path(filename)?;

                let scratch = ctx.store.scratch_path();
                let temp = tempfile::tempdir_in(&scratch)?;
                unpack(blob, ext, temp.path()).await?;
                let content = strip_components(temp.path(), *strip)?;

                if self.target_dir.exists() {
                    debug!(target = %self.target_dir.display(), "Removing existing install");
                    fs_err::tokio::remove_dir_all(&self.target_dir).await?;
                }
                if let Some(parent) = self.target_dir.parent() {
                    fs_err::tokio::create_dir_all(parent).await?;
                }
                fs_err::tokio::rename(&content, &self.target_dir).await?;

                Ok(StepResult {
                    artifacts: vec![self.target_dir.clone()],
                    ..Default::default()
                })
            }
            StepAction::RegisterSymlinks { bins } => {
                let bin_dir = ctx.store.bin_dir();
                fs_err::tokio::create_dir_all(&bin_dir).await?;

                let mut artifacts = Vec::new();
                for bin in bins {
                    let source = self.target_dir.join(bin);
                    anyhow::ensure!(
                        source.exists(),
                        "Declared binary `{bin}` not found in extracted tree"
                    );
                    let name = source
                        .file_name()
                        .with_context(|| format!("Invalid binary path `{bin}`"))?;
                    let link = bin_dir.join(name);
                    create_symlink_or_copy(&source, &link).await?;
                    artifacts.push(link);
                }
                Ok(StepResult {
                    artifacts,
                    ..Default::default()
                })
            }
            StepAction::RunCommand { command } => {
                crate::install::run_shell_command(command, &ctx.env_overrides, None).await
            }
            other => anyhow::bail!(
                "Internal error: step `{}` is not valid for an archive variant of `{}` ({})",
                other.name(),
                self.package,
                self.variant,
            ),
        }
    }
}
