use std::fmt::Display;
use std::path::Path;
use std::sync::LazyLock;

use serde::Serialize;
use tracing::{trace, warn};

use portunix_consts::env_vars::EnvVars;

/// Host operating system, as relevant to variant selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

impl Os {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        }
    }
}

impl Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Arch {
    Amd64,
    Arm64,
    X86,
    Unknown,
}

impl Arch {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::X86 => "386",
            Arch::Unknown => "unknown",
        }
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The native package-manager family of the host distribution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DistroFamily {
    Apt,
    Dnf,
    Pacman,
    Snap,
    None,
}

impl DistroFamily {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DistroFamily::Apt => "apt",
            DistroFamily::Dnf => "dnf",
            DistroFamily::Pacman => "pacman",
            DistroFamily::Snap => "snap",
            DistroFamily::None => "none",
        }
    }
}

impl Display for DistroFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the resolver needs to know about the host.
///
/// Created once per invocation and immutable thereafter. Detection never
/// fails: unknown fields degrade to `unknown` and selectors treat them as
/// non-matches.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Platform {
    pub(crate) os: Os,
    pub(crate) arch: Arch,
    pub(crate) distro_family: DistroFamily,
    pub(crate) distro: String,
    pub(crate) version: String,
    pub(crate) inside_container: bool,
}

static PLATFORM: LazyLock<Platform> = LazyLock::new(Platform::detect);

impl Platform {
    /// The memoized platform of the current process.
    pub(crate) fn current() -> &'static Platform {
        &PLATFORM
    }

    fn detect() -> Platform {
        // Internal override so tests are deterministic across hosts:
        // `os/arch/family/distro/version`.
        if let Ok(spec) = EnvVars::var(EnvVars::PORTUNIX_INTERNAL__PLATFORM) {
            if let Some(platform) = Self::from_override(&spec) {
                return platform;
            }
            warn!("Ignoring malformed {}", EnvVars::PORTUNIX_INTERNAL__PLATFORM);
        }

        let os = match std::env::consts::OS {
            "linux" => Os::Linux,
            "macos" => Os::Darwin,
            "windows" => Os::Windows,
            other => {
                trace!(os = other, "Unrecognized operating system");
                Os::Unknown
            }
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => Arch::Amd64,
            "aarch64" => Arch::Arm64,
            "x86" => Arch::X86,
            other => {
                trace!(arch = other, "Unrecognized architecture");
                Arch::Unknown
            }
        };

        let (distro, version, distro_family) = match os {
            Os::Linux => {
                let os_release = fs_err::read_to_string("/etc/os-release")
                    .or_else(|_| fs_err::read_to_string("/usr/lib/os-release"))
                    .ok();
                match os_release.as_deref().map(parse_os_release) {
                    Some((id, version, id_like)) => {
                        let family = family_for(&id, id_like.as_deref());
                        (id, version, family)
                    }
                    None => ("unknown".to_string(), String::new(), DistroFamily::None),
                }
            }
            Os::Darwin | Os::Windows | Os::Unknown => {
                ("unknown".to_string(), String::new(), DistroFamily::None)
            }
        };

        Platform {
            os,
            arch,
            distro_family,
            distro,
            version,
            inside_container: in_container(),
        }
    }

    fn from_override(spec: &str) -> Option<Platform> {
        let mut parts = spec.split('/');
        let os = match parts.next()? {
            "linux" => Os::Linux,
            "darwin" => Os::Darwin,
            "windows" => Os::Windows,
            _ => Os::Unknown,
        };
        let arch = match parts.next()? {
            "amd64" => Arch::Amd64,
            "arm64" => Arch::Arm64,
            "386" => Arch::X86,
            _ => Arch::Unknown,
        };
        let distro_family = match parts.next()? {
            "apt" => DistroFamily::Apt,
            "dnf" => DistroFamily::Dnf,
            "pacman" => DistroFamily::Pacman,
            "snap" => DistroFamily::Snap,
            _ => DistroFamily::None,
        };
        let distro = parts.next().unwrap_or("unknown").to_string();
        let version = parts.next().unwrap_or("").to_string();
        Some(Platform {
            os,
            arch,
            distro_family,
            distro,
            version,
            inside_container: false,
        })
    }

    /// A short human summary, e.g. `linux/amd64 (ubuntu 22.04, apt)`.
    pub(crate) fn summary(&self) -> String {
        if self.distro == "unknown" || self.distro.is_empty() {
            format!("{}/{}", self.os, self.arch)
        } else if self.version.is_empty() {
            format!("{}/{} ({}, {})", self.os, self.arch, self.distro, self.distro_family)
        } else {
            format!(
                "{}/{} ({} {}, {})",
                self.os, self.arch, self.distro, self.version, self.distro_family
            )
        }
    }
}

/// Parse `ID`, `VERSION_ID` and `ID_LIKE` out of an os-release file.
fn parse_os_release(content: &str) -> (String, String, Option<String>) {
    let mut id = "unknown".to_string();
    let mut version = String::new();
    let mut id_like = None;

    for line in content.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').trim_matches('\'');
        match key {
            "ID" => id = value.to_string(),
            "VERSION_ID" => version = value.to_string(),
            "ID_LIKE" => id_like = Some(value.to_string()),
            _ => {}
        }
    }

    (id, version, id_like)
}

/// Map a distribution id (and its `ID_LIKE` fallbacks) to a package-manager family.
fn family_for(id: &str, id_like: Option<&str>) -> DistroFamily {
    fn family_of(id: &str) -> Option<DistroFamily> {
        match id {
            "ubuntu" | "debian" | "linuxmint" | "pop" | "raspbian" => Some(DistroFamily::Apt),
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" | "amzn" => Some(DistroFamily::Dnf),
            "arch" | "manjaro" | "endeavouros" => Some(DistroFamily::Pacman),
            _ => None,
        }
    }

    if let Some(family) = family_of(id) {
        return family;
    }
    for like in id_like.unwrap_or_default().split_ascii_whitespace() {
        if let Some(family) = family_of(like) {
            return family;
        }
    }
    DistroFamily::None
}

/// Check if the current process is running inside a container.
///
/// see <https://stackoverflow.com/questions/23513045/how-to-check-if-a-process-is-running-inside-docker-container>
fn in_container() -> bool {
    in_container_from_paths(Path::new("/.dockerenv"), Path::new("/run/.containerenv"), Path::new("/proc/1/cgroup"))
}

fn in_container_from_paths(dockerenv: &Path, containerenv: &Path, cgroup: &Path) -> bool {
    if dockerenv.exists() || containerenv.exists() {
        return true;
    }
    // cgroup v1 leaves the runtime name in the hierarchy path.
    if let Ok(content) = fs_err::read_to_string(cgroup) {
        if content
            .lines()
            .any(|line| line.contains("/docker/") || line.contains("/libpod-") || line.contains("/lxc/"))
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const UBUNTU_OS_RELEASE: &str = r#"PRETTY_NAME="Ubuntu 22.04.4 LTS"
NAME="Ubuntu"
VERSION_ID="22.04"
VERSION="22.04.4 LTS (Jammy Jellyfish)"
ID=ubuntu
ID_LIKE=debian
"#;

    const ROCKY_OS_RELEASE: &str = r#"NAME="Rocky Linux"
VERSION="9.3 (Blue Onyx)"
ID="rocky"
ID_LIKE="rhel centos fedora"
VERSION_ID="9.3"
"#;

    #[test]
    fn parses_ubuntu_os_release() {
        let (id, version, id_like) = parse_os_release(UBUNTU_OS_RELEASE);
        assert_eq!(id, "ubuntu");
        assert_eq!(version, "22.04");
        assert_eq!(id_like.as_deref(), Some("debian"));
        assert_eq!(family_for(&id, id_like.as_deref()), DistroFamily::Apt);
    }

    #[test]
    fn parses_rocky_os_release() {
        let (id, version, id_like) = parse_os_release(ROCKY_OS_RELEASE);
        assert_eq!(id, "rocky");
        assert_eq!(version, "9.3");
        assert_eq!(family_for(&id, id_like.as_deref()), DistroFamily::Dnf);
    }

    #[test]
    fn unknown_distro_falls_back_to_id_like() {
        assert_eq!(family_for("neon", Some("ubuntu debian")), DistroFamily::Apt);
        assert_eq!(family_for("mystery", None), DistroFamily::None);
    }

    #[test]
    fn container_markers() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dockerenv = tmp.path().join(".dockerenv");
        let containerenv = tmp.path().join(".containerenv");
        let cgroup = tmp.path().join("cgroup");

        assert!(!in_container_from_paths(&dockerenv, &containerenv, &cgroup));

        fs_err::write(&cgroup, "12:pids:/docker/6d81fc3a1c26\n")?;
        assert!(in_container_from_paths(&dockerenv, &containerenv, &cgroup));

        fs_err::write(&cgroup, "0::/init.scope\n")?;
        assert!(!in_container_from_paths(&dockerenv, &containerenv, &cgroup));

        fs_err::write(&dockerenv, "")?;
        assert!(in_container_from_paths(&dockerenv, &containerenv, &cgroup));
        Ok(())
    }

    #[test]
    fn platform_override_parses() {
        let platform = Platform::from_override("linux/amd64/apt/ubuntu/22.04").unwrap();
        assert_eq!(platform.os, Os::Linux);
        assert_eq!(platform.arch, Arch::Amd64);
        assert_eq!(platform.distro_family, DistroFamily::Apt);
        assert_eq!(platform.distro, "ubuntu");
        assert_eq!(platform.version, "22.04");
        assert_eq!(platform.summary(), "linux/amd64 (ubuntu 22.04, apt)");
    }
}
