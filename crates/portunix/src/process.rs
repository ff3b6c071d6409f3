// Copyright (c) 2023 Axo Developer Co.
//
// Permission is hereby granted, free of charge, to any
// person obtaining a copy of this software and associated
// documentation files (the "Software"), to deal in the
// Software without restriction, including without
// limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software
// is furnished to do so, subject to the following
// conditions:
//
// The above copyright notice and this permission notice
// shall be included in all copies or substantial portions
// of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF
// ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED
// TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A
// PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT
// SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY
// CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION
// OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR
// IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::ffi::OsStr;
use std::fmt::Display;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use owo_colors::OwoColorize;
use thiserror::Error;
use tracing::{trace, warn};

/// An error from executing a command.
#[derive(Debug, Error)]
pub(crate) enum Error {
    /// The command fundamentally failed to execute (usually means it didn't exist).
    #[error("Run command `{summary}` failed")]
    Exec {
        summary: String,
        #[source]
        cause: std::io::Error,
    },
    #[error("Command `{summary}` exited with an error:\n{error}")]
    Status { summary: String, error: StatusError },
    #[error("Command `{summary}` timed out after {timeout:?}")]
    Timeout { summary: String, timeout: Duration },
}

impl Error {
    /// The exit status of the failed command, if it ran to completion.
    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Error::Status { error, .. } => Some(error.status),
            _ => None,
        }
    }
}

/// The command ran but signaled an error condition via its exit code.
#[derive(Debug)]
pub(crate) struct StatusError {
    pub(crate) status: ExitStatus,
    pub(crate) output: Option<Output>,
}

impl Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{}\n{}", "[status]".red(), self.status)?;

        if let Some(output) = &self.output {
            for (name, bytes) in [("[stdout]", &output.stdout), ("[stderr]", &output.stderr)] {
                let text = String::from_utf8_lossy(bytes);
                let lines = text
                    .split('\n')
                    .filter_map(|line| {
                        let line = line.trim();
                        if line.is_empty() { None } else { Some(line) }
                    })
                    .collect::<Vec<_>>();
                if !lines.is_empty() {
                    writeln!(f, "\n{}\n{}", name.red(), lines.join("\n"))?;
                }
            }
        }

        Ok(())
    }
}

/// A command wrapper that logs invocations, checks exit statuses, and
/// enforces deadlines. All external processes go through this type;
/// arguments are always an explicit list, never a shell string.
pub(crate) struct Cmd {
    pub(crate) inner: tokio::process::Command,
    summary: String,
    check_status: bool,
    deadline: Option<Duration>,
}

impl Cmd {
    /// Create a new command with a "summary" of what it is trying to do.
    pub(crate) fn new(command: impl AsRef<OsStr>, summary: impl Into<String>) -> Self {
        let inner = tokio::process::Command::new(command);
        Self {
            summary: summary.into(),
            inner,
            check_status: true,
            deadline: None,
        }
    }

    /// Set whether `Status::success` should be checked after execution. Defaults to `true`.
    pub(crate) fn check(&mut self, checked: bool) -> &mut Self {
        self.check_status = checked;
        self
    }

    /// Terminate the command if it runs longer than `timeout`.
    ///
    /// On Unix the child first receives SIGTERM and is killed after a grace
    /// period; elsewhere it is killed outright.
    pub(crate) fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.deadline = Some(timeout);
        self
    }
}

/// Execution APIs
impl Cmd {
    pub(crate) async fn run(&mut self) -> Result<(), Error> {
        self.status().await?;
        Ok(())
    }

    pub(crate) fn spawn(&mut self) -> Result<tokio::process::Child, Error> {
        self.log_command();
        self.inner.spawn().map_err(|cause| Error::Exec {
            summary: self.summary.clone(),
            cause,
        })
    }

    /// Run the command and capture its output, honoring the deadline.
    pub(crate) async fn output(&mut self) -> Result<Output, Error> {
        self.log_command();
        self.inner.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = self.inner.spawn().map_err(|cause| Error::Exec {
            summary: self.summary.clone(),
            cause,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes drain while waiting, so the child can never block on a
        // full pipe. The wait future borrows the child; on expiry it is
        // dropped so the child can be signaled.
        let waited = {
            let wait = async {
                let (stdout, stderr) = tokio::join!(read_pipe(stdout), read_pipe(stderr));
                (child.wait().await, stdout, stderr)
            };
            match self.deadline {
                None => Some(wait.await),
                Some(timeout) => tokio::time::timeout(timeout, wait).await.ok(),
            }
        };

        let Some((status, stdout, stderr)) = waited else {
            let timeout = self.deadline.expect("expiry implies a deadline");
            terminate_gracefully(&mut child).await;
            return Err(Error::Timeout {
                summary: self.summary.clone(),
                timeout,
            });
        };

        let wrap = |cause: std::io::Error| Error::Exec {
            summary: self.summary.clone(),
            cause,
        };
        let output = Output {
            status: status.map_err(wrap)?,
            stdout: stdout.map_err(wrap)?,
            stderr: stderr.map_err(wrap)?,
        };
        self.maybe_check_output(&output)?;
        Ok(output)
    }

    /// Run the command with inherited stdio, honoring the deadline.
    pub(crate) async fn status(&mut self) -> Result<ExitStatus, Error> {
        self.log_command();
        let mut child = self.inner.spawn().map_err(|cause| Error::Exec {
            summary: self.summary.clone(),
            cause,
        })?;

        let status = match self.deadline {
            None => child.wait().await.map_err(|cause| Error::Exec {
                summary: self.summary.clone(),
                cause,
            })?,
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status.map_err(|cause| Error::Exec {
                    summary: self.summary.clone(),
                    cause,
                })?,
                Err(_) => {
                    terminate_gracefully(&mut child).await;
                    return Err(Error::Timeout {
                        summary: self.summary.clone(),
                        timeout,
                    });
                }
            },
        };

        self.maybe_check_status(status)?;
        Ok(status)
    }
}

/// Read a captured pipe to EOF.
async fn read_pipe<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

/// Send SIGTERM, wait a grace period, then SIGKILL.
async fn terminate_gracefully(child: &mut tokio::process::Child) {
    const GRACE: Duration = Duration::from_secs(5);

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("Child process did not exit after SIGTERM; sending SIGKILL");
    }

    if let Err(err) = child.kill().await {
        warn!("Failed to kill child process: {err}");
    }
}

/// Transparently forwarded [`std::process::Command`] APIs
impl Cmd {
    pub(crate) fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.inner.arg(arg);
        self
    }

    pub(crate) fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub(crate) fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.inner.env(key, val);
        self
    }

    pub(crate) fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.inner.envs(vars);
        self
    }

    pub(crate) fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.inner.current_dir(dir);
        self
    }

    pub(crate) fn stdin<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.inner.stdin(cfg);
        self
    }

    pub(crate) fn stdout<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.inner.stdout(cfg);
        self
    }

    pub(crate) fn stderr<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Self {
        self.inner.stderr(cfg);
        self
    }

    pub(crate) fn get_program(&self) -> &OsStr {
        self.inner.as_std().get_program()
    }

    fn get_args(&self) -> std::process::CommandArgs<'_> {
        self.inner.as_std().get_args()
    }

    fn get_current_dir(&self) -> Option<&Path> {
        self.inner.as_std().get_current_dir()
    }
}

/// Diagnostic APIs
impl Cmd {
    fn check_output_inner(&self, status: ExitStatus, output: Option<&Output>) -> Result<(), Error> {
        if status.success() {
            Ok(())
        } else {
            Err(Error::Status {
                summary: self.summary.clone(),
                error: StatusError {
                    status,
                    output: output.cloned(),
                },
            })
        }
    }

    pub(crate) fn maybe_check_status(&self, status: ExitStatus) -> Result<(), Error> {
        if self.check_status {
            self.check_output_inner(status, None)?;
        }
        Ok(())
    }

    pub(crate) fn maybe_check_output(&self, output: &Output) -> Result<(), Error> {
        if self.check_status {
            self.check_output_inner(output.status, Some(output))?;
        }
        Ok(())
    }

    fn log_command(&self) {
        trace!("Executing `{self}`");
    }
}

/// Simplified command display, with args truncated if they're too long.
impl Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(cwd) = self.get_current_dir() {
            write!(f, "cd {} && ", cwd.to_string_lossy())?;
        }
        write!(f, "{}", self.get_program().to_string_lossy())?;

        let mut len = 0;
        for arg in self.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
            len += arg.len() + 1;
            if len > 120 {
                write!(f, " [...]")?;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn output_captures_stdout() -> anyhow::Result<()> {
        let output = Cmd::new("echo", "echo test").arg("hello").output().await?;
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        Ok(())
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = Cmd::new("false", "fail on purpose").output().await;
        assert!(matches!(err, Err(Error::Status { .. })));
    }

    #[tokio::test]
    async fn unchecked_nonzero_exit_is_ok() -> anyhow::Result<()> {
        let output = Cmd::new("false", "fail on purpose")
            .check(false)
            .output()
            .await?;
        assert!(!output.status.success());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_enforced() {
        let err = Cmd::new("sleep", "sleep too long")
            .arg("30")
            .timeout(Duration::from_millis(100))
            .output()
            .await;
        assert!(matches!(err, Err(Error::Timeout { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn large_output_is_drained_under_a_deadline() -> anyhow::Result<()> {
        // 256 KiB, larger than a pipe buffer. The command finishes well
        // within the deadline only if the pipes drain while waiting.
        let output = Cmd::new("sh", "spam stdout")
            .arg("-c")
            .arg("yes x | head -c 262144")
            .timeout(Duration::from_secs(30))
            .output()
            .await?;
        assert_eq!(output.stdout.len(), 262_144);
        Ok(())
    }
}
