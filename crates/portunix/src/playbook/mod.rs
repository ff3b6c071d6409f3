use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::platform::Platform;

pub(crate) mod engine;
pub(crate) mod template;

/// The only accepted `apiVersion`.
pub(crate) const API_VERSION: &str = "portunix.ai/v1";
/// The only accepted `kind`.
pub(crate) const KIND: &str = "Playbook";

#[derive(Debug, Error)]
pub(crate) enum ParseError {
    #[error("Failed to read playbook `{path}`")]
    Read {
        path: String,
        #[source]
        cause: std::io::Error,
    },
    #[error("Failed to parse playbook `{path}`: {cause}")]
    Yaml {
        path: String,
        #[source]
        cause: serde_yaml::Error,
    },
}

/// A declarative `.ptxbook` document. The schema is strict: unknown keys at
/// any level fail parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Playbook {
    #[serde(rename = "apiVersion")]
    pub(crate) api_version: String,
    pub(crate) kind: String,
    pub(crate) metadata: Metadata,
    pub(crate) spec: Spec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Metadata {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Spec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) environment: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) requirements: Option<Requirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) portunix: Option<PortunixSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ansible: Option<AnsibleSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) rollback: Option<Rollback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) cicd: Option<Cicd>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Requirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ansible: Option<AnsibleRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) rbac: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) secrets: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) audit: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AnsibleRequirement {
    pub(crate) min_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PortunixSection {
    #[serde(default)]
    pub(crate) packages: Vec<PackageStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PackageStep {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) vars: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AnsibleSection {
    #[serde(default)]
    pub(crate) playbooks: Vec<AnsiblePlay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AnsiblePlay {
    pub(crate) path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) vars: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) requires_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Rollback {
    pub(crate) enabled: bool,
    #[serde(default = "default_true")]
    pub(crate) preserve_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) timeout: Option<String>,
    #[serde(default)]
    pub(crate) on_failure: Vec<RollbackAction>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RollbackAction {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) when: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Cicd {
    pub(crate) pipeline: String,
    #[serde(default)]
    pub(crate) stages: Vec<CicdStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CicdStage {
    pub(crate) name: String,
    pub(crate) environment: String,
    pub(crate) playbook: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) depends: Option<Vec<String>>,
}

/// A validation finding with enough context to locate it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Diagnostic {
    pub(crate) location: String,
    pub(crate) message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

impl Playbook {
    pub(crate) fn parse(path: &Path) -> Result<Playbook, ParseError> {
        let content = fs_err::read_to_string(path).map_err(|cause| ParseError::Read {
            path: path.display().to_string(),
            cause,
        })?;
        Self::parse_str(&content, &path.display().to_string())
    }

    pub(crate) fn parse_str(content: &str, source: &str) -> Result<Playbook, ParseError> {
        serde_yaml::from_str(content).map_err(|cause| ParseError::Yaml {
            path: source.to_string(),
            cause,
        })
    }

    pub(crate) fn serialize(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Structural and semantic validation beyond what serde enforces.
    pub(crate) fn validate(&self, platform: &Platform) -> Vec<Diagnostic> {
        fn push(diagnostics: &mut Vec<Diagnostic>, location: &str, message: String) {
            diagnostics.push(Diagnostic {
                location: location.to_string(),
                message,
            });
        }

        /// A `when` expression must parse and reference only known variables.
        fn check_when(
            diagnostics: &mut Vec<Diagnostic>,
            scope: &template::Scope<'_>,
            location: &str,
            when: &str,
            extra: Option<&BTreeMap<String, Value>>,
        ) {
            match template::parse(when) {
                Err(err) => push(diagnostics, location, format!("`{when}` does not parse: {err}")),
                Ok(expr) => {
                    for root in expr.roots() {
                        let known = scope.defines(root)
                            || extra.is_some_and(|vars| vars.contains_key(root));
                        if !known {
                            push(
                                diagnostics,
                                location,
                                format!("references unknown variable `{root}`"),
                            );
                        }
                    }
                }
            }
        }

        let mut diagnostics = Vec::new();

        if self.api_version != API_VERSION {
            push(
                &mut diagnostics,
                "apiVersion",
                format!("expected `{API_VERSION}`, found `{}`", self.api_version),
            );
        }
        if self.kind != KIND {
            push(
                &mut diagnostics,
                "kind",
                format!("expected `{KIND}`, found `{}`", self.kind),
            );
        }
        if self.metadata.name.trim().is_empty() {
            push(&mut diagnostics, "metadata.name", "must not be empty".to_string());
        }

        if let Some(requirement) = self
            .spec
            .requirements
            .as_ref()
            .and_then(|requirements| requirements.ansible.as_ref())
        {
            if semver::Version::parse(&requirement.min_version).is_err() {
                push(
                    &mut diagnostics,
                    "spec.requirements.ansible.min_version",
                    format!("`{}` is not valid semver", requirement.min_version),
                );
            }
        }

        if let Some(rollback) = &self.spec.rollback {
            if let Some(timeout) = &rollback.timeout {
                if parse_duration(timeout).is_none() {
                    push(
                        &mut diagnostics,
                        "spec.rollback.timeout",
                        format!("`{timeout}` is not a duration (expected e.g. `300s`, `5m`)"),
                    );
                }
            }
            for (index, action) in rollback.on_failure.iter().enumerate() {
                if action.kind == "command" && action.command.is_none() {
                    push(
                        &mut diagnostics,
                        &format!("spec.rollback.on_failure[{index}]"),
                        "type `command` requires a `command` field".to_string(),
                    );
                }
            }
        }

        let scope = template::Scope::new(platform)
            .push(&self.spec.environment)
            .push(&self.spec.variables);

        for (index, step) in self
            .spec
            .portunix
            .iter()
            .flat_map(|section| &section.packages)
            .enumerate()
        {
            if step.name.trim().is_empty() {
                push(
                    &mut diagnostics,
                    &format!("spec.portunix.packages[{index}].name"),
                    "must not be empty".to_string(),
                );
            }
            if let Some(when) = &step.when {
                check_when(
                    &mut diagnostics,
                    &scope,
                    &format!("spec.portunix.packages[{index}].when"),
                    when,
                    step.vars.as_ref(),
                );
            }
        }
        for (index, play) in self
            .spec
            .ansible
            .iter()
            .flat_map(|section| &section.playbooks)
            .enumerate()
        {
            if let Some(when) = &play.when {
                check_when(
                    &mut diagnostics,
                    &scope,
                    &format!("spec.ansible.playbooks[{index}].when"),
                    when,
                    play.vars.as_ref(),
                );
            }
        }
        if let Some(rollback) = &self.spec.rollback {
            for (index, action) in rollback.on_failure.iter().enumerate() {
                if let Some(when) = &action.when {
                    check_when(
                        &mut diagnostics,
                        &scope,
                        &format!("spec.rollback.on_failure[{index}].when"),
                        when,
                        None,
                    );
                }
            }
        }

        diagnostics
    }
}

/// Parse durations like `300s`, `5m`, `1h`.
pub(crate) fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let (number, unit) = input.split_at(input.len().checked_sub(1)?);
    let number: u64 = number.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, DistroFamily, Os};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn platform() -> Platform {
        Platform {
            os: Os::Linux,
            arch: Arch::Amd64,
            distro_family: DistroFamily::Apt,
            distro: "ubuntu".into(),
            version: "22.04".into(),
            inside_container: false,
        }
    }

    const SAMPLE: &str = indoc! {r#"
        apiVersion: portunix.ai/v1
        kind: Playbook
        metadata:
          name: dev-environment
          description: Developer workstation setup
        spec:
          variables:
            install_java: true
            install_node: false
          environment:
            profile: workstation
          portunix:
            packages:
              - name: java
                when: install_java
              - name: nodejs
                when: install_node
          rollback:
            enabled: true
            preserve_logs: true
            timeout: 300s
            on_failure:
              - type: command
                command: echo rollback
                description: announce rollback
    "#};

    #[test]
    fn sample_parses_and_validates() {
        let playbook = Playbook::parse_str(SAMPLE, "<test>").unwrap();
        assert_eq!(playbook.metadata.name, "dev-environment");
        assert_eq!(playbook.spec.portunix.as_ref().unwrap().packages.len(), 2);
        assert!(playbook.validate(&platform()).is_empty());
    }

    #[test]
    fn unknown_keys_fail_parsing() {
        let content = SAMPLE.replace("description:", "descriptive:");
        let err = Playbook::parse_str(&content, "<test>");
        assert!(err.is_err());
    }

    #[test]
    fn round_trip_preserves_semantics() {
        let playbook = Playbook::parse_str(SAMPLE, "<test>").unwrap();
        let serialized = playbook.serialize().unwrap();
        let reparsed = Playbook::parse_str(&serialized, "<round-trip>").unwrap();
        // Parse ∘ Serialize ∘ Parse is the identity on the model.
        assert_eq!(
            serde_yaml::to_string(&playbook).unwrap(),
            serde_yaml::to_string(&reparsed).unwrap()
        );
    }

    #[test]
    fn wrong_api_version_is_diagnosed() {
        let content = SAMPLE.replace("portunix.ai/v1", "portunix.ai/v2");
        let playbook = Playbook::parse_str(&content, "<test>").unwrap();
        let diagnostics = playbook.validate(&platform());
        assert!(diagnostics.iter().any(|d| d.location == "apiVersion"));
    }

    #[test]
    fn empty_name_is_diagnosed() {
        let content = SAMPLE.replace("name: dev-environment", "name: ''");
        let playbook = Playbook::parse_str(&content, "<test>").unwrap();
        let diagnostics = playbook.validate(&platform());
        assert!(diagnostics.iter().any(|d| d.location == "metadata.name"));
    }

    #[test]
    fn unknown_when_variable_is_diagnosed() {
        let content = SAMPLE.replace("when: install_java", "when: install_scala");
        let playbook = Playbook::parse_str(&content, "<test>").unwrap();
        let diagnostics = playbook.validate(&platform());
        assert!(
            diagnostics
                .iter()
                .any(|d| d.message.contains("install_scala"))
        );
    }

    #[test]
    fn platform_attributes_are_known_in_when() {
        let content = SAMPLE.replace("when: install_java", "when: os == 'linux'");
        let playbook = Playbook::parse_str(&content, "<test>").unwrap();
        assert!(playbook.validate(&platform()).is_empty());
    }

    #[test]
    fn bad_semver_requirement_is_diagnosed() {
        let content = SAMPLE.replace(
            "spec:\n",
            "spec:\n  requirements:\n    ansible:\n      min_version: banana\n",
        );
        let playbook = Playbook::parse_str(&content, "<test>").unwrap();
        let diagnostics = playbook.validate(&platform());
        assert!(diagnostics.iter().any(|d| d.message.contains("banana")));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("300s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("banana"), None);
        assert_eq!(parse_duration(""), None);
    }
}
