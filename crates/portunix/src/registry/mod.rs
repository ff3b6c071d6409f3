use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use portunix_consts::{MANIFEST_FILE, MANIFEST_OVERLAY_DIR};

use crate::platform::Platform;
use crate::warn_user;

pub(crate) mod resolver;

/// The manifest compiled into the binary. Assets directories layer on top.
const BUILTIN_MANIFEST: &str = include_str!("../../assets/packages.yaml");

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Failed to read manifest `{path}`")]
    Read {
        path: String,
        #[source]
        cause: std::io::Error,
    },
    #[error("Failed to parse manifest `{path}`: {cause}")]
    Parse {
        path: String,
        #[source]
        cause: serde_yaml::Error,
    },
}

/// Raw manifest shape: a list of package entries.
#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    packages: Vec<serde_yaml::Value>,
}

/// A named installable unit with one or more variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Package {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) category: String,
    #[serde(default)]
    pub(crate) prerequisites: Vec<String>,
    pub(crate) variants: Vec<Variant>,
}

/// A platform- and method-specific way to install a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Variant {
    pub(crate) id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
    #[serde(flatten)]
    pub(crate) installer: Installer,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) platforms: Vec<Selector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) bin: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) post_install: Vec<String>,
}

/// The installation method, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum Installer {
    Archive {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        #[serde(default)]
        extract_strip: u32,
    },
    Apt {
        packages: Vec<String>,
    },
    Dnf {
        packages: Vec<String>,
    },
    Pacman {
        packages: Vec<String>,
    },
    Snap {
        packages: Vec<String>,
    },
    Script {
        command: String,
    },
    Redirect {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_variant: Option<String>,
    },
}

impl Installer {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Installer::Archive { .. } => "archive",
            Installer::Apt { .. } => "apt",
            Installer::Dnf { .. } => "dnf",
            Installer::Pacman { .. } => "pacman",
            Installer::Snap { .. } => "snap",
            Installer::Script { .. } => "script",
            Installer::Redirect { .. } => "redirect",
        }
    }
}

/// A structured predicate over [`Platform`]. Empty fields match anything;
/// an `unknown` platform attribute never satisfies a constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) distro_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) distro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
}

impl Selector {
    pub(crate) fn matches(&self, platform: &Platform) -> bool {
        fn field_matches(want: Option<&str>, have: &str) -> bool {
            match want {
                None => true,
                Some(_) if have == "unknown" || have.is_empty() => false,
                Some(want) => want == have,
            }
        }

        field_matches(self.os.as_deref(), platform.os.as_str())
            && field_matches(self.arch.as_deref(), platform.arch.as_str())
            && field_matches(self.distro_family.as_deref(), platform.distro_family.as_str())
            && field_matches(self.distro.as_deref(), &platform.distro)
            && self
                .version
                .as_deref()
                .is_none_or(|range| version_matches(range, &platform.version))
    }
}

/// Match a version range expression against a dotted numeric version.
///
/// Supported forms: exact (`22.04`), minimum (`>=22.04`), maximum
/// (`<=22.04`). Non-numeric components compare lexicographically.
fn version_matches(range: &str, version: &str) -> bool {
    if version.is_empty() {
        return false;
    }

    fn compare(a: &str, b: &str) -> std::cmp::Ordering {
        let mut left = a.split('.');
        let mut right = b.split('.');
        loop {
            match (left.next(), right.next()) {
                (None, None) => return std::cmp::Ordering::Equal,
                (Some(_), None) => return std::cmp::Ordering::Greater,
                (None, Some(_)) => return std::cmp::Ordering::Less,
                (Some(l), Some(r)) => {
                    let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                        (Ok(l), Ok(r)) => l.cmp(&r),
                        _ => l.cmp(r),
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }

    if let Some(min) = range.strip_prefix(">=") {
        compare(version, min.trim()) != std::cmp::Ordering::Less
    } else if let Some(max) = range.strip_prefix("<=") {
        compare(version, max.trim()) != std::cmp::Ordering::Greater
    } else {
        compare(version, range.trim()) == std::cmp::Ordering::Equal
    }
}

/// The loaded package registry. Immutable after load; a hot reload is a
/// full re-load.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    packages: BTreeMap<String, Package>,
    warnings: Vec<String>,
}

impl Registry {
    /// Load the built-in manifest, then overlay `assets_dir` when given
    /// (`packages.yaml` plus `packages.d/*.yaml`, later files win).
    ///
    /// Invalid packages are dropped with a warning; one bad entry does not
    /// abort the load.
    pub(crate) fn load(assets_dir: Option<&Path>) -> Result<Self, Error> {
        let mut registry = Registry::default();
        registry.merge_manifest("<builtin>", BUILTIN_MANIFEST)?;

        if let Some(dir) = assets_dir {
            let canonical = dir.join(MANIFEST_FILE);
            if canonical.is_file() {
                let content = fs_err::read_to_string(&canonical).map_err(|cause| Error::Read {
                    path: canonical.display().to_string(),
                    cause,
                })?;
                registry.merge_manifest(&canonical.display().to_string(), &content)?;
            }

            let overlay_dir = dir.join(MANIFEST_OVERLAY_DIR);
            if overlay_dir.is_dir() {
                let mut overlays: Vec<_> = fs_err::read_dir(&overlay_dir)
                    .map_err(|cause| Error::Read {
                        path: overlay_dir.display().to_string(),
                        cause,
                    })?
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| {
                        path.extension()
                            .is_some_and(|ext| ext == "yaml" || ext == "yml")
                    })
                    .collect();
                overlays.sort();

                for path in overlays {
                    let content = fs_err::read_to_string(&path).map_err(|cause| Error::Read {
                        path: path.display().to_string(),
                        cause,
                    })?;
                    registry.merge_manifest(&path.display().to_string(), &content)?;
                }
            }
        }

        registry.validate_graphs();

        for warning in &registry.warnings {
            warn_user!("{warning}");
        }
        debug!(packages = registry.packages.len(), "Loaded package registry");
        Ok(registry)
    }

    /// Build a registry from a single manifest string. Used by overlay-free
    /// callers and tests.
    pub(crate) fn from_manifest(source: &str, content: &str) -> Result<Self, Error> {
        let mut registry = Registry::default();
        registry.merge_manifest(source, content)?;
        registry.validate_graphs();
        Ok(registry)
    }

    /// Parse one manifest and merge its valid packages, replacing earlier
    /// definitions of the same name.
    fn merge_manifest(&mut self, source: &str, content: &str) -> Result<(), Error> {
        let manifest: ManifestFile =
            serde_yaml::from_str(content).map_err(|cause| Error::Parse {
                path: source.to_string(),
                cause,
            })?;

        for (index, value) in manifest.packages.into_iter().enumerate() {
            let package: Package = match serde_yaml::from_value(value) {
                Ok(package) => package,
                Err(err) => {
                    self.warnings.push(format!(
                        "{source}: dropping invalid package at index {index}: {err}"
                    ));
                    continue;
                }
            };
            if let Err(reason) = validate_package(&package) {
                self.warnings
                    .push(format!("{source}: dropping package `{}`: {reason}", package.name));
                continue;
            }
            if self.packages.contains_key(&package.name) && source != "<builtin>" {
                debug!(package = package.name, source, "Overriding package definition");
            }
            self.packages.insert(package.name.clone(), package);
        }
        Ok(())
    }

    /// Drop packages participating in redirect or prerequisite cycles, and
    /// redirects whose target does not resolve.
    fn validate_graphs(&mut self) {
        // Redirect targets must exist.
        let dangling: Vec<String> = self
            .packages
            .values()
            .filter_map(|package| {
                package.variants.iter().find_map(|variant| {
                    if let Installer::Redirect { target, .. } = &variant.installer {
                        if !self.packages.contains_key(target) {
                            return Some((package.name.clone(), target.clone()));
                        }
                    }
                    None
                })
            })
            .map(|(name, target)| {
                self.warnings.push(format!(
                    "dropping package `{name}`: redirect target `{target}` does not exist"
                ));
                name
            })
            .collect();
        for name in dangling {
            self.packages.remove(&name);
        }

        // Cyclic redirects: follow first redirect variant per package.
        let redirect_edges: BTreeMap<String, String> = self
            .packages
            .values()
            .filter_map(|package| {
                package.variants.iter().find_map(|variant| match &variant.installer {
                    Installer::Redirect { target, .. } => {
                        Some((package.name.clone(), target.clone()))
                    }
                    _ => None,
                })
            })
            .collect();
        for name in cycle_members(&redirect_edges) {
            self.warnings
                .push(format!("dropping package `{name}`: cyclic redirect"));
            self.packages.remove(&name);
        }

        // Cyclic prerequisites.
        let prereq_edges: BTreeMap<String, Vec<String>> = self
            .packages
            .values()
            .map(|package| (package.name.clone(), package.prerequisites.clone()))
            .collect();
        for name in multi_cycle_members(&prereq_edges) {
            self.warnings
                .push(format!("dropping package `{name}`: cyclic prerequisites"));
            self.packages.remove(&name);
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.packages.len()
    }

    pub(crate) fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Structural validation of a single package entry.
fn validate_package(package: &Package) -> Result<(), String> {
    if package.name.trim().is_empty() {
        return Err("package name must not be empty".into());
    }
    if package.variants.is_empty() {
        return Err("package must declare at least one variant".into());
    }

    let mut seen = std::collections::BTreeSet::new();
    for variant in &package.variants {
        if !seen.insert(&variant.id) {
            return Err(format!("duplicate variant id `{}`", variant.id));
        }
        match &variant.installer {
            Installer::Archive { url, .. } if url.trim().is_empty() => {
                return Err(format!("variant `{}`: archive requires a url", variant.id));
            }
            Installer::Apt { packages }
            | Installer::Dnf { packages }
            | Installer::Pacman { packages }
            | Installer::Snap { packages }
                if packages.is_empty() =>
            {
                return Err(format!(
                    "variant `{}`: {} requires a non-empty package list",
                    variant.id,
                    variant.installer.kind()
                ));
            }
            Installer::Script { command } if command.trim().is_empty() => {
                return Err(format!("variant `{}`: script requires a command", variant.id));
            }
            Installer::Redirect { target, .. } if target.trim().is_empty() => {
                return Err(format!("variant `{}`: redirect requires a target", variant.id));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Nodes participating in a cycle in a single-successor graph.
fn cycle_members(edges: &BTreeMap<String, String>) -> Vec<String> {
    let mut members = std::collections::BTreeSet::new();
    for start in edges.keys() {
        let mut seen = vec![start.clone()];
        let mut current = start;
        while let Some(next) = edges.get(current) {
            if let Some(pos) = seen.iter().position(|name| name == next) {
                members.extend(seen[pos..].iter().cloned());
                break;
            }
            seen.push(next.clone());
            current = next;
        }
    }
    members.into_iter().collect()
}

/// Nodes participating in a cycle in a multi-successor graph.
fn multi_cycle_members(edges: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    #[derive(Copy, Clone, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        node: &str,
        edges: &BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<String, Mark>,
        members: &mut std::collections::BTreeSet<String>,
        stack: &mut Vec<String>,
    ) {
        match marks.get(node).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return,
            Mark::InProgress => {
                if let Some(pos) = stack.iter().position(|name| name == node) {
                    members.extend(stack[pos..].iter().cloned());
                }
                return;
            }
            Mark::Unvisited => {}
        }
        marks.insert(node.to_string(), Mark::InProgress);
        stack.push(node.to_string());
        for next in edges.get(node).into_iter().flatten() {
            visit(next, edges, marks, members, stack);
        }
        stack.pop();
        marks.insert(node.to_string(), Mark::Done);
    }

    let mut marks = BTreeMap::new();
    let mut members = std::collections::BTreeSet::new();
    let mut stack = Vec::new();
    for node in edges.keys() {
        visit(node, edges, &mut marks, &mut members, &mut stack);
    }
    members.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn registry_from(content: &str) -> Registry {
        Registry::from_manifest("<test>", content).unwrap()
    }

    #[test]
    fn builtin_manifest_loads_cleanly() {
        let registry = Registry::load(None).unwrap();
        assert!(registry.warnings().is_empty(), "{:?}", registry.warnings());
        assert!(registry.get("hugo").is_some());
        assert!(registry.get("hugo-extended").is_some());
        assert!(registry.get("nodejs").is_some());
    }

    #[test]
    fn invalid_packages_are_dropped_not_fatal() {
        let registry = registry_from(indoc! {r"
            packages:
              - name: good
                variants:
                  - id: default
                    type: script
                    command: echo ok
              - name: bad-archive
                variants:
                  - id: default
                    type: archive
                    url: ''
              - name: bad-type
                variants:
                  - id: default
                    type: flatpak
        "});

        assert!(registry.get("good").is_some());
        assert!(registry.get("bad-archive").is_none());
        assert!(registry.get("bad-type").is_none());
        assert_eq!(registry.warnings().len(), 2);
    }

    #[test]
    fn empty_package_list_is_rejected() {
        let registry = registry_from(indoc! {r"
            packages:
              - name: empty-apt
                variants:
                  - id: default
                    type: apt
                    packages: []
        "});
        assert!(registry.get("empty-apt").is_none());
    }

    #[test]
    fn dangling_redirects_are_dropped() {
        let registry = registry_from(indoc! {r"
            packages:
              - name: alias
                variants:
                  - id: default
                    type: redirect
                    target: nowhere
        "});
        assert!(registry.get("alias").is_none());
        assert!(registry.warnings()[0].contains("does not exist"));
    }

    #[test]
    fn redirect_cycles_are_dropped_at_load() {
        let registry = registry_from(indoc! {r"
            packages:
              - name: a
                variants:
                  - id: default
                    type: redirect
                    target: b
              - name: b
                variants:
                  - id: default
                    type: redirect
                    target: a
        "});
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn prerequisite_cycles_are_dropped_at_load() {
        let registry = registry_from(indoc! {r"
            packages:
              - name: x
                prerequisites: [y]
                variants:
                  - id: default
                    type: script
                    command: echo x
              - name: y
                prerequisites: [x]
                variants:
                  - id: default
                    type: script
                    command: echo y
              - name: standalone
                variants:
                  - id: default
                    type: script
                    command: echo ok
        "});
        assert!(registry.get("x").is_none());
        assert!(registry.get("y").is_none());
        assert!(registry.get("standalone").is_some());
    }

    #[test]
    fn selector_matching() {
        let platform = Platform {
            os: crate::platform::Os::Linux,
            arch: crate::platform::Arch::Amd64,
            distro_family: crate::platform::DistroFamily::Apt,
            distro: "ubuntu".into(),
            version: "22.04".into(),
            inside_container: false,
        };

        let empty = Selector::default();
        assert!(empty.matches(&platform));

        let linux_amd64 = Selector {
            os: Some("linux".into()),
            arch: Some("amd64".into()),
            ..Default::default()
        };
        assert!(linux_amd64.matches(&platform));

        let darwin = Selector {
            os: Some("darwin".into()),
            ..Default::default()
        };
        assert!(!darwin.matches(&platform));

        let versioned = Selector {
            distro: Some("ubuntu".into()),
            version: Some(">=20.04".into()),
            ..Default::default()
        };
        assert!(versioned.matches(&platform));

        let too_new = Selector {
            version: Some(">=24.04".into()),
            ..Default::default()
        };
        assert!(!too_new.matches(&platform));
    }

    #[test]
    fn unknown_platform_fields_never_match_constraints() {
        let platform = Platform {
            os: crate::platform::Os::Unknown,
            arch: crate::platform::Arch::Amd64,
            distro_family: crate::platform::DistroFamily::None,
            distro: "unknown".into(),
            version: String::new(),
            inside_container: false,
        };
        let selector = Selector {
            os: Some("unknown".into()),
            ..Default::default()
        };
        assert!(!selector.matches(&platform));
    }

    #[test]
    fn version_range_comparisons() {
        assert!(version_matches("22.04", "22.04"));
        assert!(!version_matches("22.04", "22.10"));
        assert!(version_matches(">=20.04", "22.04"));
        assert!(version_matches(">=22.04", "22.04"));
        assert!(!version_matches(">=24.04", "22.04"));
        assert!(version_matches("<=9.3", "9.3"));
        assert!(!version_matches("<=9.3", "9.10"));
        // Numeric, not lexicographic: 9.10 > 9.3.
        assert!(version_matches(">=9.3", "9.10"));
    }
}
