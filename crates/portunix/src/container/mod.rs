use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::process::Cmd;
use crate::runtime::{RuntimeKind, RuntimeReport};

pub(crate) mod run_in;

/// Default deadline for one container command.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(
        "No container runtime available. Install Docker (https://docs.docker.com/get-docker/) \
         or Podman (https://podman.io/docs/installation) and try again"
    )]
    NoRuntime,
    #[error("Container `{0}` not found")]
    NotFound(String),
    #[error("Container `{0}` is running; use --force to remove it")]
    RemoveRunning(String),
    #[error("Copy source `{0}` does not exist")]
    MissingSource(String),
    #[error("Failed to parse `{runtime} ps` output")]
    ListParse {
        runtime: RuntimeKind,
        #[source]
        cause: serde_json::Error,
    },
    #[error(transparent)]
    Process(#[from] crate::process::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ContainerState {
    Created,
    Running,
    Exited,
    Paused,
    Unknown,
}

impl FromStr for ContainerState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" | "up" => ContainerState::Running,
            "exited" | "stopped" => ContainerState::Exited,
            "paused" => ContainerState::Paused,
            _ => ContainerState::Unknown,
        })
    }
}

impl ContainerState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Paused => "paused",
            ContainerState::Unknown => "unknown",
        }
    }
}

/// A handle to one container. The driver owns no state beyond this.
#[derive(Debug, Clone)]
pub(crate) struct ContainerHandle {
    pub(crate) runtime: RuntimeKind,
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) image: String,
    pub(crate) state: ContainerState,
    pub(crate) ports: Vec<String>,
    pub(crate) mounts: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct RunOptions {
    pub(crate) image: String,
    pub(crate) name: Option<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) ports: Vec<String>,
    pub(crate) volumes: Vec<String>,
    pub(crate) detach: bool,
    /// Keep the container alive with a long sleep when no command is given.
    pub(crate) keep_running: bool,
    pub(crate) command: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ListFilters {
    pub(crate) all: bool,
    pub(crate) name: Option<String>,
    pub(crate) label: Option<String>,
    pub(crate) state: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ExecOutput {
    pub(crate) code: i32,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

/// The `{{json .}}` shape shared by `docker ps` and `podman ps`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Ports", default)]
    ports: String,
    #[serde(rename = "Mounts", default)]
    mounts: String,
}

/// A uniform surface over Docker and Podman.
///
/// Every operation is a single argv invocation of the runtime binary; no
/// shell sits in between, and exec arguments are passed verbatim.
#[derive(Debug, Clone)]
pub(crate) struct ContainerDriver {
    runtime: RuntimeKind,
    binary: String,
}

impl ContainerDriver {
    /// Select a runtime from a detection report. Runtime selection happens
    /// once per invocation.
    pub(crate) fn select(report: &RuntimeReport) -> Result<Self, Error> {
        let runtime = report.preferred.ok_or(Error::NoRuntime)?;
        let available = report
            .status(runtime)
            .is_some_and(|status| status.available);
        if !available {
            return Err(Error::NoRuntime);
        }
        debug!(%runtime, "Selected container runtime");
        Ok(Self {
            binary: runtime.binary(),
            runtime,
        })
    }

    pub(crate) fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    fn cmd(&self, summary: impl Into<String>) -> Cmd {
        Cmd::new(&self.binary, summary)
    }

    /// Start a container and return its handle.
    pub(crate) async fn run(&self, opts: &RunOptions) -> Result<ContainerHandle, Error> {
        let mut cmd = self.cmd(format!("run container from {}", opts.image));
        cmd.arg("run");
        if opts.detach {
            cmd.arg("--detach");
        }
        if let Some(name) = &opts.name {
            cmd.arg("--name").arg(name);
        }
        for (key, value) in &opts.env {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        for port in &opts.ports {
            cmd.arg("--publish").arg(port);
        }
        for volume in &opts.volumes {
            cmd.arg("--volume").arg(volume);
        }
        cmd.arg(&opts.image);
        if opts.command.is_empty() {
            if opts.keep_running {
                cmd.arg("sleep").arg("infinity");
            }
        } else {
            cmd.args(&opts.command);
        }

        let output = cmd.output().await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        trace!(id, image = opts.image, "Started container");

        Ok(ContainerHandle {
            runtime: self.runtime,
            name: opts.name.clone().unwrap_or_else(|| id.clone()),
            id,
            image: opts.image.clone(),
            state: if opts.detach {
                ContainerState::Running
            } else {
                ContainerState::Exited
            },
            ports: opts.ports.clone(),
            mounts: opts.volumes.clone(),
        })
    }

    /// Run a command inside a container.
    ///
    /// `argv` is handed to the runtime exactly as given. Flags that the
    /// inner command takes (such as `sh -c`) are never re-parsed here.
    pub(crate) async fn exec(
        &self,
        name: &str,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, Error> {
        let mut cmd = self.cmd(format!("exec in {name}"));
        cmd.arg("exec").arg(name).args(argv);
        cmd.timeout(timeout.unwrap_or(EXEC_TIMEOUT)).check(false);

        let output = cmd.output().await?;
        Ok(ExecOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Copy a file or tree. Either side may be `container:path`.
    pub(crate) async fn copy(&self, src: &str, dst: &str) -> Result<(), Error> {
        // A drive letter is not a container name.
        let is_container_ref =
            |side: &str| side.split_once(':').is_some_and(|(name, _)| name.len() > 1);

        if !is_container_ref(src) && !std::path::Path::new(src).exists() {
            return Err(Error::MissingSource(src.to_string()));
        }
        if let Some((_, path)) = dst.split_once(':') {
            let _ = path;
        } else if let Some(parent) = std::path::Path::new(dst).parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)?;
            }
        }

        // `cp -a` preserves permissions on both runtimes.
        self.cmd(format!("copy {src} to {dst}"))
            .arg("cp")
            .arg("--archive")
            .arg(src)
            .arg(dst)
            .output()
            .await?;
        Ok(())
    }

    /// List containers, optionally filtered by name pattern, label, or state.
    pub(crate) async fn list(&self, filters: &ListFilters) -> Result<Vec<ContainerHandle>, Error> {
        let mut cmd = self.cmd("list containers");
        cmd.arg("ps").arg("--format").arg("{{json .}}");
        if filters.all {
            cmd.arg("--all");
        }
        if let Some(name) = &filters.name {
            cmd.arg("--filter").arg(format!("name={name}"));
        }
        if let Some(label) = &filters.label {
            cmd.arg("--filter").arg(format!("label={label}"));
        }
        if let Some(state) = &filters.state {
            cmd.arg("--filter").arg(format!("status={state}"));
        }

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ps_lines(self.runtime, &stdout)
    }

    /// Remove a container. Refuses running containers unless `force`, which
    /// stops them first.
    pub(crate) async fn remove(&self, name: &str, force: bool) -> Result<(), Error> {
        let state = self.state_of(name).await?;
        if state == ContainerState::Running && !force {
            return Err(Error::RemoveRunning(name.to_string()));
        }

        let mut cmd = self.cmd(format!("remove container {name}"));
        cmd.arg("rm");
        if force {
            cmd.arg("--force");
        }
        cmd.arg(name);
        cmd.output().await?;
        Ok(())
    }

    /// The current state of a named container.
    pub(crate) async fn state_of(&self, name: &str) -> Result<ContainerState, Error> {
        let output = self
            .cmd(format!("inspect {name}"))
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Status}}")
            .check(false)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::NotFound(name.to_string()));
        }
        let state = String::from_utf8_lossy(&output.stdout);
        Ok(state.parse().expect("state parsing is infallible"))
    }
}

fn parse_ps_lines(runtime: RuntimeKind, stdout: &str) -> Result<Vec<ContainerHandle>, Error> {
    let mut handles = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let ps: PsLine =
            serde_json::from_str(line).map_err(|cause| Error::ListParse { runtime, cause })?;
        handles.push(ContainerHandle {
            runtime,
            id: ps.id,
            name: ps.names,
            image: ps.image,
            state: ps.state.parse().expect("state parsing is infallible"),
            ports: split_csv(&ps.ports),
            mounts: split_csv(&ps.mounts),
        });
    }
    Ok(handles)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn container_state_parsing() {
        assert_eq!(
            "running".parse::<ContainerState>().unwrap(),
            ContainerState::Running
        );
        assert_eq!(
            "Exited".parse::<ContainerState>().unwrap(),
            ContainerState::Exited
        );
        assert_eq!(
            "weird".parse::<ContainerState>().unwrap(),
            ContainerState::Unknown
        );
    }

    #[test]
    fn ps_lines_parse_both_runtimes() {
        // docker ps --format '{{json .}}'
        let docker = r#"{"ID":"1a2b3c","Names":"nodejs-ubuntu-22-04","Image":"ubuntu:22.04","State":"running","Ports":"0.0.0.0:8080->80/tcp","Mounts":"/data"}"#;
        // podman ps --format '{{json .}}' (same keys for these fields)
        let podman = r#"{"ID":"9f8e7d","Names":"probe","Image":"alpine:3.20","State":"exited","Ports":"","Mounts":""}"#;

        let handles =
            parse_ps_lines(RuntimeKind::Docker, &format!("{docker}\n{podman}\n")).unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].name, "nodejs-ubuntu-22-04");
        assert_eq!(handles[0].state, ContainerState::Running);
        assert_eq!(handles[0].ports, ["0.0.0.0:8080->80/tcp"]);
        assert_eq!(handles[1].state, ContainerState::Exited);
        assert!(handles[1].ports.is_empty());
    }

    #[test]
    fn malformed_ps_line_is_an_error() {
        let err = parse_ps_lines(RuntimeKind::Podman, "{not json}\n");
        assert!(matches!(err, Err(Error::ListParse { .. })));
    }
}
