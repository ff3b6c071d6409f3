use std::fmt::Write as _;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;

use crate::download::DownloadReporter;
use crate::install::{ProgressEvents, StepResult};
use crate::ledger::StepStatus;
use crate::printer::Printer;
use crate::registry::resolver::{PlannedInstall, StepAction};

/// The progress display of the current command, if one is drawing. Lets
/// code far from the CLI (for example the lock wait warning) print without
/// tearing through active bars.
static ACTIVE_PROGRESS: Mutex<Option<MultiProgress>> = Mutex::new(None);

/// Run `f` with the active progress display suspended. A no-op passthrough
/// when nothing is drawing.
pub(crate) fn suspend<F: FnOnce() -> R, R>(f: F) -> R {
    let multi = ACTIVE_PROGRESS.lock().unwrap().clone();
    match multi {
        Some(multi) => multi.suspend(f),
        None => f(),
    }
}

/// Streams install progress to the terminal: one line per step, plus a byte
/// progress bar per active download.
pub(crate) struct InstallReporter {
    printer: Printer,
    multi: MultiProgress,
    bars: Mutex<Vec<ProgressBar>>,
}

impl InstallReporter {
    pub(crate) fn new(printer: Printer) -> Self {
        let multi = MultiProgress::with_draw_target(if printer.progress_enabled() {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        });
        *ACTIVE_PROGRESS.lock().unwrap() = Some(multi.clone());
        Self {
            printer,
            multi,
            bars: Mutex::new(Vec::new()),
        }
    }

    fn line(&self, message: &str) {
        let printer = self.printer;
        let message = message.to_string();
        self.multi.suspend(|| {
            let _ = writeln!(printer.stdout(), "{message}");
        });
    }
}

impl Drop for InstallReporter {
    fn drop(&mut self) {
        ACTIVE_PROGRESS.lock().unwrap().take();
    }
}

impl ProgressEvents for InstallReporter {
    fn on_install_start(&self, install: &PlannedInstall) {
        self.line(&format!(
            "Installing {} ({})",
            install.package.bold(),
            install.variant.id
        ));
    }

    fn on_install_skipped(&self, install: &PlannedInstall) {
        self.line(&format!(
            "{} ({}) is already installed, skipping",
            install.package.bold(),
            install.variant.id
        ));
    }

    fn on_step_start(
        &self,
        _install: &PlannedInstall,
        step: &StepAction,
        index: usize,
        total: usize,
    ) {
        self.line(&format!(
            "  {} {}",
            format!("[{}/{total}]", index + 1).dimmed(),
            step.describe()
        ));
    }

    fn on_step_complete(&self, _install: &PlannedInstall, step: &StepAction, result: &StepResult) {
        if result.status == StepStatus::Failed {
            self.line(&format!("  {} {}", "failed:".red().bold(), step.describe()));
        }
    }
}

impl DownloadReporter for InstallReporter {
    fn on_download_start(&self, url: &str, size: Option<u64>) -> usize {
        let bar = match size {
            Some(size) => {
                let bar = ProgressBar::new(size);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{msg:20} [{bar:30}] {bytes}/{total_bytes} ({eta})",
                    )
                    .expect("valid progress template")
                    .progress_chars("=> "),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("{msg:20} {spinner} {bytes}")
                        .expect("valid progress template"),
                );
                bar
            }
        };
        let name = url.rsplit('/').next().unwrap_or(url);
        bar.set_message(name.to_string());
        let bar = self.multi.add(bar);

        let mut bars = self.bars.lock().unwrap();
        bars.push(bar);
        bars.len() - 1
    }

    fn on_download_progress(&self, id: usize, bytes: u64) {
        if let Some(bar) = self.bars.lock().unwrap().get(id) {
            bar.inc(bytes);
        }
    }

    fn on_download_complete(&self, id: usize) {
        if let Some(bar) = self.bars.lock().unwrap().get(id) {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::suspend;

    #[test]
    fn suspend_passes_through_without_an_active_display() {
        assert_eq!(suspend(|| 7), 7);
    }
}
