use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use portunix_consts::env_vars::EnvVars;

use crate::fs::atomic_write;
use crate::ledger::now_ts;
use crate::process::Cmd;
use crate::store::Store;

/// Capability probes are cached on disk this long.
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// Deadline for each probe command.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A container engine implementation.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub(crate) enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// The binary to invoke.
    pub(crate) fn binary(self) -> String {
        // Test hook: `name=path` pairs separated by commas.
        if let Ok(spec) = EnvVars::var(EnvVars::PORTUNIX_INTERNAL__RUNTIME_BINARY) {
            for pair in spec.split(',') {
                if let Some((name, path)) = pair.split_once('=') {
                    if name == self.to_string() {
                        return path.to_string();
                    }
                }
            }
        }
        self.to_string()
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum Capability {
    Compose,
    VolumeMount,
    NetworkCreate,
    RuntimeActive,
    Buildx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RuntimeStatus {
    pub(crate) available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<Version>,
    #[serde(default)]
    pub(crate) capabilities: BTreeSet<Capability>,
    pub(crate) detected_at: u64,
}

impl RuntimeStatus {
    fn missing() -> Self {
        Self {
            available: false,
            version: None,
            capabilities: BTreeSet::new(),
            detected_at: now_ts(),
        }
    }

    /// Available and its daemon answers.
    pub(crate) fn active(&self) -> bool {
        self.available && self.capabilities.contains(&Capability::RuntimeActive)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RuntimeReport {
    pub(crate) statuses: BTreeMap<RuntimeKind, RuntimeStatus>,
    pub(crate) preferred: Option<RuntimeKind>,
}

impl RuntimeReport {
    pub(crate) fn status(&self, kind: RuntimeKind) -> Option<&RuntimeStatus> {
        self.statuses.get(&kind)
    }
}

/// Probe Docker and Podman, using the on-disk cache unless it is stale or
/// `force_refresh` is set.
pub(crate) async fn detect(
    store: &Store,
    force_refresh: bool,
    explicit: Option<RuntimeKind>,
) -> RuntimeReport {
    if !force_refresh {
        if let Some(mut cached) = read_cache(store) {
            trace!("Using cached runtime status");
            cached.preferred = preferred_runtime(&cached.statuses, explicit);
            return cached;
        }
    }

    let mut statuses = BTreeMap::new();
    for kind in [RuntimeKind::Docker, RuntimeKind::Podman] {
        statuses.insert(kind, probe(kind).await);
    }

    let report = RuntimeReport {
        preferred: preferred_runtime(&statuses, explicit),
        statuses,
    };
    write_cache(store, &report);
    report
}

/// Deterministic priority: explicit CLI choice, then docker, then podman.
fn preferred_runtime(
    statuses: &BTreeMap<RuntimeKind, RuntimeStatus>,
    explicit: Option<RuntimeKind>,
) -> Option<RuntimeKind> {
    if let Some(kind) = explicit {
        return Some(kind);
    }
    for kind in [RuntimeKind::Docker, RuntimeKind::Podman] {
        if statuses.get(&kind).is_some_and(|status| status.available) {
            return Some(kind);
        }
    }
    None
}

async fn probe(kind: RuntimeKind) -> RuntimeStatus {
    let binary = kind.binary();
    if which::which(&binary).is_err() {
        debug!(%kind, "Runtime binary not found on PATH");
        return RuntimeStatus::missing();
    }

    // `version` answers even when the daemon is down; only the client
    // version is read here.
    let version = Cmd::new(&binary, format!("{kind} version"))
        .arg("version")
        .arg("--format")
        .arg("{{.Client.Version}}")
        .timeout(PROBE_TIMEOUT)
        .check(false)
        .output()
        .await
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| parse_semverish(&String::from_utf8_lossy(&output.stdout)));

    let mut capabilities = BTreeSet::new();

    // Daemon reachability. A present binary with an unreachable daemon is
    // `available` without `runtime-active`.
    let active = Cmd::new(&binary, format!("{kind} info"))
        .arg("info")
        .arg("--format")
        .arg("{{.ServerVersion}}")
        .timeout(PROBE_TIMEOUT)
        .check(false)
        .output()
        .await
        .is_ok_and(|output| output.status.success());
    if active {
        capabilities.insert(Capability::RuntimeActive);
        capabilities.insert(Capability::VolumeMount);
        capabilities.insert(Capability::NetworkCreate);
    }

    for (arg, capability) in [("compose", Capability::Compose), ("buildx", Capability::Buildx)] {
        let supported = Cmd::new(&binary, format!("{kind} {arg} version"))
            .arg(arg)
            .arg("version")
            .timeout(PROBE_TIMEOUT)
            .check(false)
            .output()
            .await
            .is_ok_and(|output| output.status.success());
        if supported {
            capabilities.insert(capability);
        }
    }

    debug!(%kind, ?version, ?capabilities, "Probed runtime");
    RuntimeStatus {
        available: true,
        version,
        capabilities,
        detected_at: now_ts(),
    }
}

/// Parse version output leniently: strip a leading `v`, pad to three
/// components, drop anything after the first whitespace.
fn parse_semverish(raw: &str) -> Option<Version> {
    let token = raw.split_whitespace().next()?;
    let token = token.trim_start_matches('v');
    // Podman may report versions like `4.9.4-rhel`.
    let numeric: String = token
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts: Vec<&str> = numeric.trim_end_matches('.').split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts[..3].join(".")).ok()
}

fn read_cache(store: &Store) -> Option<RuntimeReport> {
    let content = fs_err::read_to_string(store.runtime_cache_file()).ok()?;
    let report: RuntimeReport = serde_json::from_str(&content).ok()?;

    let cutoff = now_ts().saturating_sub(CACHE_TTL.as_secs());
    let fresh = report
        .statuses
        .values()
        .all(|status| status.detected_at >= cutoff);
    fresh.then_some(report)
}

fn write_cache(store: &Store, report: &RuntimeReport) {
    match serde_json::to_string_pretty(report) {
        Ok(content) => {
            if let Err(err) = atomic_write(&store.runtime_cache_file(), content.as_bytes()) {
                warn!("Failed to write runtime cache: {err}");
            }
        }
        Err(err) => warn!("Failed to serialize runtime cache: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn status(available: bool) -> RuntimeStatus {
        RuntimeStatus {
            available,
            version: None,
            capabilities: BTreeSet::new(),
            detected_at: now_ts(),
        }
    }

    #[test]
    fn version_parsing_is_lenient() {
        assert_eq!(parse_semverish("24.0.7"), Some(Version::new(24, 0, 7)));
        assert_eq!(parse_semverish("v27.1"), Some(Version::new(27, 1, 0)));
        assert_eq!(parse_semverish("4.9.4-rhel"), Some(Version::new(4, 9, 4)));
        assert_eq!(
            parse_semverish("20.10.21 build baeda1f"),
            Some(Version::new(20, 10, 21))
        );
        assert_eq!(parse_semverish(""), None);
        assert_eq!(parse_semverish("not a version"), None);
    }

    #[test]
    fn preference_order() {
        let both: BTreeMap<_, _> = [
            (RuntimeKind::Docker, status(true)),
            (RuntimeKind::Podman, status(true)),
        ]
        .into();
        assert_eq!(preferred_runtime(&both, None), Some(RuntimeKind::Docker));
        assert_eq!(
            preferred_runtime(&both, Some(RuntimeKind::Podman)),
            Some(RuntimeKind::Podman)
        );

        let podman_only: BTreeMap<_, _> = [
            (RuntimeKind::Docker, status(false)),
            (RuntimeKind::Podman, status(true)),
        ]
        .into();
        assert_eq!(
            preferred_runtime(&podman_only, None),
            Some(RuntimeKind::Podman)
        );

        let neither: BTreeMap<_, _> = [
            (RuntimeKind::Docker, status(false)),
            (RuntimeKind::Podman, status(false)),
        ]
        .into();
        assert_eq!(preferred_runtime(&neither, None), None);
    }

    #[test]
    fn stale_cache_is_rejected() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = crate::store::Store::from_path(tmp.path().join("home")).init()?;

        let mut statuses = BTreeMap::new();
        statuses.insert(
            RuntimeKind::Docker,
            RuntimeStatus {
                available: true,
                version: Some(Version::new(24, 0, 7)),
                capabilities: BTreeSet::from([Capability::RuntimeActive]),
                detected_at: now_ts() - 3600,
            },
        );
        let report = RuntimeReport {
            statuses,
            preferred: Some(RuntimeKind::Docker),
        };
        write_cache(&store, &report);

        assert!(read_cache(&store).is_none(), "one-hour-old cache is stale");
        Ok(())
    }

    #[test]
    fn fresh_cache_round_trips() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = crate::store::Store::from_path(tmp.path().join("home")).init()?;

        let mut statuses = BTreeMap::new();
        statuses.insert(RuntimeKind::Docker, status(true));
        statuses.insert(RuntimeKind::Podman, status(false));
        let report = RuntimeReport {
            statuses,
            preferred: Some(RuntimeKind::Docker),
        };
        write_cache(&store, &report);

        let cached = read_cache(&store).expect("fresh cache is used");
        assert!(cached.status(RuntimeKind::Docker).unwrap().available);
        assert!(!cached.status(RuntimeKind::Podman).unwrap().available);
        Ok(())
    }
}
