use std::collections::{BTreeMap, BTreeSet, VecDeque};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::trace;

use crate::ledger::LedgerIndex;
use crate::platform::Platform;
use crate::registry::{Installer, Package, Registry, Variant};

/// Redirect chains longer than this are refused. Cycles are rejected at
/// load time; the cap is a defensive re-check.
const MAX_REDIRECT_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub(crate) enum ResolveError {
    #[error("Package name must not be empty")]
    EmptyPackageName,
    #[error("Unknown package `{0}`")]
    UnknownPackage(String),
    #[error("Unknown variant `{variant}` for package `{package}`")]
    UnknownVariant { package: String, variant: String },
    #[error("No variant of `{package}` matches this platform ({platform})")]
    NoMatchingVariant { package: String, platform: String },
    #[error("Redirect chain too deep: {}", chain.join(" -> "))]
    RedirectTooDeep { chain: Vec<String> },
    #[error("Cyclic redirect: {}", chain.join(" -> "))]
    RedirectCycle { chain: Vec<String> },
    #[error("Cyclic prerequisites: {}", cycle.join(" -> "))]
    CyclicPrerequisites { cycle: Vec<String> },
}

/// What the caller asked to install.
#[derive(Debug, Clone, Default)]
pub(crate) struct InstallRequest {
    pub(crate) package: String,
    pub(crate) variant_override: Option<String>,
    pub(crate) force: bool,
    pub(crate) env_overrides: Vec<(String, String)>,
}

/// One action within a plan.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepAction {
    Download {
        url: String,
        checksum: Option<String>,
    },
    VerifyChecksum {
        checksum: String,
    },
    Extract {
        strip: u32,
    },
    RegisterSymlinks {
        bins: Vec<String>,
    },
    RunCommand {
        command: String,
    },
    InvokePackageManager {
        manager: &'static str,
        argv: Vec<String>,
        env: Vec<(String, String)>,
    },
}

impl StepAction {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            StepAction::Download { .. } => "download",
            StepAction::VerifyChecksum { .. } => "verify-checksum",
            StepAction::Extract { .. } => "extract",
            StepAction::RegisterSymlinks { .. } => "register-symlink",
            StepAction::RunCommand { .. } => "run-cmd",
            StepAction::InvokePackageManager { .. } => "invoke-package-manager",
        }
    }

    /// A one-line rendering for dry-run output and logs.
    pub(crate) fn describe(&self) -> String {
        match self {
            StepAction::Download { url, .. } => format!("download {url}"),
            StepAction::VerifyChecksum { checksum } => format!("verify sha256:{checksum}"),
            StepAction::Extract { strip } if *strip > 0 => {
                format!("extract (strip {strip} component{})", if *strip == 1 { "" } else { "s" })
            }
            StepAction::Extract { .. } => "extract".to_string(),
            StepAction::RegisterSymlinks { bins } => {
                format!("register symlinks: {}", bins.join(", "))
            }
            StepAction::RunCommand { command } => format!("run `{command}`"),
            StepAction::InvokePackageManager { argv, .. } => {
                format!("invoke `{}`", argv.join(" "))
            }
        }
    }
}

/// One package resolved to a concrete variant, with its ordered steps.
#[derive(Debug, Clone)]
pub(crate) struct PlannedInstall {
    pub(crate) package: String,
    pub(crate) description: String,
    pub(crate) variant: Variant,
    /// Set when the request named an alias that redirected here.
    pub(crate) redirected_from: Option<String>,
    /// Already installed with this variant; the executor records `skipped`.
    pub(crate) skip: bool,
    pub(crate) steps: Vec<StepAction>,
}

/// Deterministic, ordered output of resolution.
#[derive(Debug, Clone)]
pub(crate) struct InstallPlan {
    /// The requested package (post-redirect).
    pub(crate) root: String,
    /// Prerequisites first, the requested package last.
    pub(crate) installs: Vec<PlannedInstall>,
    pub(crate) warnings: Vec<String>,
}

impl InstallPlan {
    /// Stable content hash, recorded in the ledger alongside installs.
    pub(crate) fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for install in &self.installs {
            hasher.update(install.package.as_bytes());
            hasher.update(b"\0");
            hasher.update(install.variant.id.as_bytes());
            hasher.update(b"\0");
            for step in &install.steps {
                hasher.update(step.describe().as_bytes());
                hasher.update(b"\n");
            }
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Resolve a request against the registry for a platform.
///
/// Deterministic given `(platform, registry, request)`: variant selection is
/// first-match in declaration order, prerequisite order is a stable
/// topological sort.
pub(crate) fn resolve(
    platform: &Platform,
    registry: &Registry,
    index: &LedgerIndex,
    request: &InstallRequest,
) -> Result<InstallPlan, ResolveError> {
    if request.package.trim().is_empty() {
        return Err(ResolveError::EmptyPackageName);
    }

    let mut warnings = Vec::new();

    // Follow redirects from the requested package to the concrete one.
    let (root, root_variant, redirected_from) = follow_redirects(
        platform,
        registry,
        &request.package,
        request.variant_override.as_deref(),
        &mut warnings,
    )?;

    // Transitive closure of prerequisites, topologically sorted.
    let order = prerequisite_order(registry, &root.name)?;

    let mut installs = Vec::new();
    for name in order {
        let package = registry
            .get(&name)
            .ok_or_else(|| ResolveError::UnknownPackage(name.clone()))?;

        let (package, variant, via) = if name == root.name {
            (root, root_variant.clone(), redirected_from.clone())
        } else {
            // Prerequisites resolve on their own; a prerequisite that is an
            // alias is followed like any other redirect.
            let (target, variant, via) =
                follow_redirects(platform, registry, &package.name, None, &mut warnings)?;
            (target, variant, via)
        };

        let skip = !request.force && index.is_installed(&package.name, &variant.id);
        let steps = steps_for(&variant, &request.env_overrides);
        trace!(
            package = package.name,
            variant = variant.id,
            skip,
            steps = steps.len(),
            "Planned install"
        );

        installs.push(PlannedInstall {
            package: package.name.clone(),
            description: package.description.clone(),
            variant,
            redirected_from: via,
            skip,
            steps,
        });
    }

    Ok(InstallPlan {
        root: root.name.clone(),
        installs,
        warnings,
    })
}

/// Select a variant for `name`, following redirect variants up to
/// [`MAX_REDIRECT_DEPTH`]. Returns the concrete package, its variant, and
/// the original alias name when a redirect was taken.
fn follow_redirects<'a>(
    platform: &Platform,
    registry: &'a Registry,
    name: &str,
    variant_override: Option<&str>,
    warnings: &mut Vec<String>,
) -> Result<(&'a Package, Variant, Option<String>), ResolveError> {
    let mut chain = vec![name.to_string()];
    let mut current = name.to_string();
    let mut override_id = variant_override.map(ToString::to_string);

    loop {
        let package = registry
            .get(&current)
            .ok_or_else(|| ResolveError::UnknownPackage(current.clone()))?;

        let variant = select_variant(platform, package, override_id.as_deref(), warnings)?;

        match &variant.installer {
            Installer::Redirect {
                target,
                target_variant,
            } => {
                if chain.contains(target) {
                    chain.push(target.clone());
                    return Err(ResolveError::RedirectCycle { chain });
                }
                chain.push(target.clone());
                if chain.len() > MAX_REDIRECT_DEPTH {
                    return Err(ResolveError::RedirectTooDeep { chain });
                }
                override_id = target_variant.clone();
                current = target.clone();
            }
            _ => {
                let via = if chain.len() > 1 {
                    Some(name.to_string())
                } else {
                    None
                };
                return Ok((package, variant, via));
            }
        }
    }
}

/// First selector match wins, in declaration order. Overlapping selectors
/// resolve to the earliest declaration with a warning.
fn select_variant(
    platform: &Platform,
    package: &Package,
    variant_override: Option<&str>,
    warnings: &mut Vec<String>,
) -> Result<Variant, ResolveError> {
    if let Some(id) = variant_override {
        return package
            .variants
            .iter()
            .find(|variant| variant.id == id)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownVariant {
                package: package.name.clone(),
                variant: id.to_string(),
            });
    }

    let matching: Vec<&Variant> = package
        .variants
        .iter()
        .filter(|variant| {
            variant.platforms.is_empty()
                || variant.platforms.iter().any(|selector| selector.matches(platform))
        })
        .collect();

    match matching.as_slice() {
        [] => Err(ResolveError::NoMatchingVariant {
            package: package.name.clone(),
            platform: platform.summary(),
        }),
        [only] => Ok((*only).clone()),
        [first, rest @ ..] => {
            warnings.push(format!(
                "package `{}`: variants {} also match this platform; using `{}`",
                package.name,
                rest.iter()
                    .map(|variant| format!("`{}`", variant.id))
                    .collect::<Vec<_>>()
                    .join(", "),
                first.id,
            ));
            Ok((*first).clone())
        }
    }
}

/// Transitive prerequisites of `root` in install order (dependencies first,
/// `root` last). Kahn's algorithm over the declared edges; load-time
/// validation already dropped cyclic packages, so a cycle here means the
/// registry was mutated out from under us.
fn prerequisite_order(registry: &Registry, root: &str) -> Result<Vec<String>, ResolveError> {
    // Collect the closure.
    let mut closure = BTreeSet::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(name) = queue.pop_front() {
        if !closure.insert(name.clone()) {
            continue;
        }
        let package = registry
            .get(&name)
            .ok_or_else(|| ResolveError::UnknownPackage(name.clone()))?;
        for prereq in &package.prerequisites {
            queue.push_back(prereq.clone());
        }
    }

    // In-degree over edges prereq -> dependent, restricted to the closure.
    let mut in_degree: BTreeMap<&str, usize> =
        closure.iter().map(|name| (name.as_str(), 0)).collect();
    for name in &closure {
        let package = registry.get(name).expect("closure members exist");
        for prereq in &package.prerequisites {
            if closure.contains(prereq) {
                *in_degree.get_mut(name.as_str()).expect("closure member") += 1;
            }
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::new();
    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        for dependent in &closure {
            let package = registry.get(dependent).expect("closure members exist");
            if package.prerequisites.iter().any(|prereq| prereq == name) {
                let degree = in_degree.get_mut(dependent.as_str()).expect("closure member");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent.as_str());
                }
            }
        }
    }

    if order.len() != closure.len() {
        let cycle: Vec<String> = closure
            .iter()
            .filter(|name| !order.contains(name))
            .cloned()
            .collect();
        return Err(ResolveError::CyclicPrerequisites { cycle });
    }

    Ok(order)
}

/// Expand a concrete variant into ordered executor steps.
fn steps_for(variant: &Variant, env_overrides: &[(String, String)]) -> Vec<StepAction> {
    let mut steps = Vec::new();

    match &variant.installer {
        Installer::Archive {
            url,
            checksum,
            extract_strip,
        } => {
            steps.push(StepAction::Download {
                url: url.clone(),
                checksum: checksum.clone(),
            });
            if let Some(checksum) = checksum {
                steps.push(StepAction::VerifyChecksum {
                    checksum: checksum.clone(),
                });
            }
            steps.push(StepAction::Extract {
                strip: *extract_strip,
            });
            if !variant.bin.is_empty() {
                steps.push(StepAction::RegisterSymlinks {
                    bins: variant.bin.clone(),
                });
            }
        }
        Installer::Apt { packages } => {
            let mut argv = vec![
                "apt-get".to_string(),
                "install".to_string(),
                "-y".to_string(),
            ];
            argv.extend(packages.iter().cloned());
            steps.push(StepAction::InvokePackageManager {
                manager: "apt",
                argv,
                env: [("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]
                    .into_iter()
                    .chain(env_overrides.iter().cloned())
                    .collect(),
            });
        }
        Installer::Dnf { packages } => {
            let mut argv = vec!["dnf".to_string(), "install".to_string(), "-y".to_string()];
            argv.extend(packages.iter().cloned());
            steps.push(StepAction::InvokePackageManager {
                manager: "dnf",
                argv,
                env: env_overrides.to_vec(),
            });
        }
        Installer::Pacman { packages } => {
            let mut argv = vec![
                "pacman".to_string(),
                "-S".to_string(),
                "--noconfirm".to_string(),
            ];
            argv.extend(packages.iter().cloned());
            steps.push(StepAction::InvokePackageManager {
                manager: "pacman",
                argv,
                env: env_overrides.to_vec(),
            });
        }
        Installer::Snap { packages } => {
            let mut argv = vec!["snap".to_string(), "install".to_string()];
            argv.extend(packages.iter().cloned());
            steps.push(StepAction::InvokePackageManager {
                manager: "snap",
                argv,
                env: env_overrides.to_vec(),
            });
        }
        Installer::Script { command } => {
            steps.push(StepAction::RunCommand {
                command: command.clone(),
            });
        }
        // Redirects are inlined by `follow_redirects` and contribute no
        // steps of their own.
        Installer::Redirect { .. } => {}
    }

    for command in &variant.post_install {
        steps.push(StepAction::RunCommand {
            command: command.clone(),
        });
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerIndex;
    use crate::platform::{Arch, DistroFamily, Os};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn linux_amd64() -> Platform {
        Platform {
            os: Os::Linux,
            arch: Arch::Amd64,
            distro_family: DistroFamily::Apt,
            distro: "ubuntu".into(),
            version: "22.04".into(),
            inside_container: false,
        }
    }

    fn registry_from(content: &str) -> Registry {
        Registry::from_manifest("<test>", content).unwrap()
    }

    fn request(package: &str) -> InstallRequest {
        InstallRequest {
            package: package.into(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_name_is_a_config_error() {
        let registry = Registry::load(None).unwrap();
        let err = resolve(&linux_amd64(), &registry, &LedgerIndex::default(), &request(" "));
        assert!(matches!(err, Err(ResolveError::EmptyPackageName)));
    }

    #[test]
    fn archive_plan_has_expected_steps() {
        let registry = Registry::load(None).unwrap();
        let plan = resolve(
            &linux_amd64(),
            &registry,
            &LedgerIndex::default(),
            &InstallRequest {
                package: "hugo".into(),
                variant_override: Some("standard".into()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(plan.root, "hugo");
        assert_eq!(plan.installs.len(), 1);
        let install = &plan.installs[0];
        assert_eq!(install.variant.id, "standard");
        let names: Vec<_> = install.steps.iter().map(StepAction::name).collect();
        assert_eq!(names, ["download", "extract", "register-symlink"]);
    }

    #[test]
    fn plans_are_deterministic() {
        let registry = Registry::load(None).unwrap();
        let platform = linux_amd64();
        let index = LedgerIndex::default();
        let a = resolve(&platform, &registry, &index, &request("hugo")).unwrap();
        let b = resolve(&platform, &registry, &index, &request("hugo")).unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn redirect_is_inlined() {
        let registry = Registry::load(None).unwrap();
        let plan = resolve(
            &linux_amd64(),
            &registry,
            &LedgerIndex::default(),
            &request("hugo-extended"),
        )
        .unwrap();

        assert_eq!(plan.root, "hugo");
        let install = &plan.installs[0];
        assert_eq!(install.variant.id, "extended");
        assert_eq!(install.redirected_from.as_deref(), Some("hugo-extended"));
        // No step came from the alias itself.
        assert!(install.steps.iter().all(|step| step.name() != "redirect"));
    }

    #[test]
    fn unknown_variant_override_fails() {
        let registry = Registry::load(None).unwrap();
        let err = resolve(
            &linux_amd64(),
            &registry,
            &LedgerIndex::default(),
            &InstallRequest {
                package: "hugo".into(),
                variant_override: Some("nope".into()),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(ResolveError::UnknownVariant { .. })));
    }

    #[test]
    fn redirect_depth_nine_is_rejected() {
        // a0 -> a1 -> ... -> a9: nine hops, above the cap of eight.
        let mut manifest = String::from("packages:\n");
        for i in 0..9 {
            manifest.push_str(&format!(
                "  - name: a{i}\n    variants:\n      - id: default\n        type: redirect\n        target: a{}\n",
                i + 1
            ));
        }
        manifest.push_str(
            "  - name: a9\n    variants:\n      - id: default\n        type: script\n        command: echo done\n",
        );
        let registry = registry_from(&manifest);

        let err = resolve(
            &linux_amd64(),
            &registry,
            &LedgerIndex::default(),
            &request("a0"),
        );
        match err {
            Err(ResolveError::RedirectTooDeep { chain }) => {
                assert_eq!(chain[0], "a0");
                assert!(chain.len() > MAX_REDIRECT_DEPTH);
            }
            other => panic!("expected RedirectTooDeep, got {other:?}"),
        }
    }

    #[test]
    fn prerequisites_come_first() {
        let registry = registry_from(indoc! {r"
            packages:
              - name: app
                prerequisites: [lib, runtime]
                variants:
                  - id: default
                    type: script
                    command: echo app
              - name: lib
                prerequisites: [runtime]
                variants:
                  - id: default
                    type: script
                    command: echo lib
              - name: runtime
                variants:
                  - id: default
                    type: script
                    command: echo runtime
        "});

        let plan = resolve(
            &linux_amd64(),
            &registry,
            &LedgerIndex::default(),
            &request("app"),
        )
        .unwrap();

        let order: Vec<_> = plan
            .installs
            .iter()
            .map(|install| install.package.as_str())
            .collect();
        assert_eq!(order, ["runtime", "lib", "app"]);
    }

    #[test]
    fn installed_variant_is_skipped_unless_forced() {
        let registry = Registry::load(None).unwrap();
        // Simulate an installed entry via the index's serde shape.
        let index: LedgerIndex = serde_json::from_str(
            r#"{"packages":{"hugo":{"variant":"standard","installed_at":1,"plan_hash":"x"}}}"#,
        )
        .unwrap();

        let plan = resolve(
            &linux_amd64(),
            &registry,
            &index,
            &InstallRequest {
                package: "hugo".into(),
                variant_override: Some("standard".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(plan.installs[0].skip);

        // Different variant: not installed.
        let plan = resolve(
            &linux_amd64(),
            &registry,
            &index,
            &InstallRequest {
                package: "hugo".into(),
                variant_override: Some("extended".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!plan.installs[0].skip);

        // Forced: not skipped.
        let plan = resolve(
            &linux_amd64(),
            &registry,
            &index,
            &InstallRequest {
                package: "hugo".into(),
                variant_override: Some("standard".into()),
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!plan.installs[0].skip);
    }

    #[test]
    fn no_matching_variant_reports_platform() {
        let registry = Registry::load(None).unwrap();
        let windows = Platform {
            os: Os::Windows,
            arch: Arch::Amd64,
            distro_family: DistroFamily::None,
            distro: "unknown".into(),
            version: String::new(),
            inside_container: false,
        };
        let err = resolve(&windows, &registry, &LedgerIndex::default(), &request("hugo"));
        assert!(matches!(err, Err(ResolveError::NoMatchingVariant { .. })));
    }

    #[test]
    fn resolver_is_total_over_the_builtin_matrix() {
        // Every package x a matrix of platforms either yields a plan or a
        // typed error, never a panic.
        let registry = Registry::load(None).unwrap();
        let platforms = [
            linux_amd64(),
            Platform {
                os: Os::Linux,
                arch: Arch::Arm64,
                distro_family: DistroFamily::Dnf,
                distro: "fedora".into(),
                version: "40".into(),
                inside_container: false,
            },
            Platform {
                os: Os::Darwin,
                arch: Arch::Arm64,
                distro_family: DistroFamily::None,
                distro: "unknown".into(),
                version: String::new(),
                inside_container: false,
            },
            Platform {
                os: Os::Windows,
                arch: Arch::Amd64,
                distro_family: DistroFamily::None,
                distro: "unknown".into(),
                version: String::new(),
                inside_container: true,
            },
        ];

        for platform in &platforms {
            for package in registry.iter() {
                let _ = resolve(
                    platform,
                    &registry,
                    &LedgerIndex::default(),
                    &request(&package.name),
                );
            }
        }
    }
}
