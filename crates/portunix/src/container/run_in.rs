use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, trace};

use portunix_consts::CONTAINER_BINARY_PATH;

use crate::container::{ContainerDriver, ContainerHandle, ContainerState, RunOptions};

/// Readiness probe: `exec echo OK` until success or this many attempts.
const READY_ATTEMPTS: u32 = 30;
const READY_INTERVAL: Duration = Duration::from_secs(1);
/// The nested install may download and extract; give it room.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// What the caller asked run-in-container to do.
#[derive(Debug, Clone)]
pub(crate) struct RunInContainerRequest {
    pub(crate) package: String,
    pub(crate) variant: Option<String>,
    pub(crate) image: String,
    pub(crate) name: Option<String>,
    pub(crate) env: Vec<(String, String)>,
    /// Leave the container for inspection instead of removing it.
    pub(crate) keep: bool,
}

/// The pipeline's result: the container handle, the nested install's
/// combined output, and its exit status.
#[derive(Debug)]
pub(crate) struct ExecutionReport {
    pub(crate) handle: ContainerHandle,
    pub(crate) output: String,
    pub(crate) exit_code: i32,
    pub(crate) kept: bool,
}

/// Derive a deterministic container name from package and image, e.g.
/// `nodejs` + `ubuntu:22.04` -> `portunix-nodejs-ubuntu-22-04`.
pub(crate) fn default_container_name(package: &str, image: &str) -> String {
    let sanitized: String = image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let sanitized = sanitized.trim_matches('-');
    format!("portunix-{package}-{sanitized}")
}

/// Create a container, deploy the current portunix binary into it, and
/// re-invoke the installation inside. Each step is failure-terminating.
pub(crate) async fn run_in_container(
    driver: &ContainerDriver,
    request: &RunInContainerRequest,
) -> Result<ExecutionReport> {
    let name = request
        .name
        .clone()
        .unwrap_or_else(|| default_container_name(&request.package, &request.image));

    // Reuse a running container of the same name; the ledger inside it
    // makes the nested install a no-op when already satisfied.
    let handle = match driver.state_of(&name).await {
        Ok(ContainerState::Running) => {
            debug!(name, "Reusing running container");
            ContainerHandle {
                runtime: driver.runtime(),
                id: name.clone(),
                name: name.clone(),
                image: request.image.clone(),
                state: ContainerState::Running,
                ports: Vec::new(),
                mounts: Vec::new(),
            }
        }
        _ => {
            debug!(name, image = request.image, "Creating container");
            driver
                .run(&RunOptions {
                    image: request.image.clone(),
                    name: Some(name.clone()),
                    env: request.env.clone(),
                    detach: true,
                    keep_running: true,
                    ..Default::default()
                })
                .await
                .context("Failed to create container")?
        }
    };

    wait_ready(driver, &name)
        .await
        .context("Container did not become ready")?;

    // Deploy the current binary at a fixed in-container path.
    let binary = std::env::current_exe().context("Failed to locate the portunix binary")?;
    driver
        .copy(
            &binary.to_string_lossy(),
            &format!("{name}:{CONTAINER_BINARY_PATH}"),
        )
        .await
        .context("Failed to copy portunix into the container")?;
    driver
        .exec(
            &name,
            &[
                "chmod".to_string(),
                "+x".to_string(),
                CONTAINER_BINARY_PATH.to_string(),
            ],
            None,
        )
        .await
        .context("Failed to mark portunix executable")?;

    // Re-invoke the installation inside the container.
    let mut argv = vec![
        CONTAINER_BINARY_PATH.to_string(),
        "install".to_string(),
        request.package.clone(),
    ];
    if let Some(variant) = &request.variant {
        argv.push("--variant".to_string());
        argv.push(variant.clone());
    }
    let exec = driver
        .exec(&name, &argv, Some(INSTALL_TIMEOUT))
        .await
        .context("Failed to run portunix inside the container")?;

    let mut output = String::from_utf8_lossy(&exec.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&exec.stderr));

    let kept = request.keep || exec.code != 0;
    if !kept {
        driver
            .remove(&name, true)
            .await
            .context("Failed to remove container")?;
    }

    Ok(ExecutionReport {
        handle,
        output,
        exit_code: exec.code,
        kept,
    })
}

async fn wait_ready(driver: &ContainerDriver, name: &str) -> Result<()> {
    for attempt in 1..=READY_ATTEMPTS {
        let probe = driver
            .exec(
                name,
                &["echo".to_string(), "OK".to_string()],
                Some(Duration::from_secs(5)),
            )
            .await;
        match probe {
            Ok(exec) if exec.code == 0 => {
                trace!(name, attempt, "Container ready");
                return Ok(());
            }
            _ => tokio::time::sleep(READY_INTERVAL).await,
        }
    }
    anyhow::bail!("Container `{name}` did not answer after {READY_ATTEMPTS} attempts")
}
