use indoc::indoc;

use crate::common::{TestContext, cmd_snapshot};

mod common;

const CONDITIONAL: &str = indoc! {r"
    apiVersion: portunix.ai/v1
    kind: Playbook
    metadata:
      name: conditional
      description: Conditional installs
    spec:
      variables:
        install_java: true
        install_node: false
      portunix:
        packages:
          - name: java
            when: install_java
          - name: nodejs
            when: install_node
"};

#[test]
fn dry_run_honors_conditions() {
    let context = TestContext::new();
    let path = context.write_playbook("conditional.ptxbook", CONDITIONAL);

    cmd_snapshot!(context.filters(), context.command().args(["playbook", "run", "--dry-run"]).arg(&path), @r"
    success: true
    exit_code: 0
    ----- stdout -----
    package java: planned (java (apt))
    package nodejs: skipped (when: install_node)

    Previewed playbook `conditional` (run [RUN_ID])

    ----- stderr -----
    ");
}

#[test]
fn all_false_conditions_still_succeed() {
    let context = TestContext::new();
    let content = CONDITIONAL.replace("install_java: true", "install_java: false");
    let path = context.write_playbook("none.ptxbook", &content);

    cmd_snapshot!(context.filters(), context.command().args(["playbook", "run"]).arg(&path), @r"
    success: true
    exit_code: 0
    ----- stdout -----
    package java: skipped (when: install_java)
    package nodejs: skipped (when: install_node)

    Completed playbook `conditional` (run [RUN_ID])

    ----- stderr -----
    ");
}

#[test]
fn validate_accepts_a_well_formed_playbook() {
    let context = TestContext::new();
    let path = context.write_playbook("ok.ptxbook", CONDITIONAL);

    cmd_snapshot!(context.filters(), context.command().args(["playbook", "validate"]).arg(&path), @r"
    success: true
    exit_code: 0
    ----- stdout -----
    [TEMP_DIR]/ok.ptxbook: valid

    ----- stderr -----
    ");
}

#[test]
fn validate_rejects_unknown_keys() {
    let context = TestContext::new();
    let content = CONDITIONAL.replace("description:", "descriptive:");
    let path = context.write_playbook("bad.ptxbook", &content);

    let output = context
        .command()
        .args(["playbook", "validate"])
        .arg(&path)
        .output()
        .expect("run portunix");
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("invalid"), "{stdout}");
}

#[test]
fn validate_rejects_unknown_when_variables() {
    let context = TestContext::new();
    let content = CONDITIONAL.replace("when: install_java", "when: install_scala");
    let path = context.write_playbook("bad-when.ptxbook", &content);

    let output = context
        .command()
        .args(["playbook", "validate"])
        .arg(&path)
        .output()
        .expect("run portunix");
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("install_scala"), "{stdout}");
}

#[test]
fn check_resolves_packages_for_the_platform() {
    let context = TestContext::new();
    let path = context.write_playbook("check.ptxbook", CONDITIONAL);

    cmd_snapshot!(context.filters(), context.command().args(["playbook", "check"]).arg(&path), @r"
    success: true
    exit_code: 0
    ----- stdout -----
    package java: resolves to 1 install
    package nodejs: resolves to 1 install
    Playbook checks out

    ----- stderr -----
    ");
}

#[test]
fn init_writes_a_valid_sample() {
    let context = TestContext::new();
    let path = context.work_dir().join("sample.ptxbook");

    let status = context
        .command()
        .args(["playbook", "init"])
        .arg(&path)
        .status()
        .expect("run portunix");
    assert!(status.success());

    // The generated sample validates cleanly.
    let output = context
        .command()
        .args(["playbook", "validate"])
        .arg(&path)
        .output()
        .expect("run portunix");
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn list_shows_playbook_metadata() {
    let context = TestContext::new();
    context.write_playbook("a.ptxbook", CONDITIONAL);

    cmd_snapshot!(context.filters(), context.command().args(["playbook", "list"]), @r"
    success: true
    exit_code: 0
    ----- stdout -----
    a.ptxbook  conditional  Conditional installs

    ----- stderr -----
    ");
}

#[cfg(unix)]
#[test]
fn rollback_runs_on_failure() {
    let context = TestContext::new();
    let marker = context.work_dir().join("rolled-back");
    let content = format!(
        indoc! {r"
            apiVersion: portunix.ai/v1
            kind: Playbook
            metadata:
              name: doomed
            spec:
              portunix:
                packages:
                  - name: package-that-does-not-exist
              rollback:
                enabled: true
                preserve_logs: true
                timeout: 30s
                on_failure:
                  - type: command
                    command: touch {}
                    description: leave a marker
        "},
        marker.display()
    );
    let path = context.write_playbook("doomed.ptxbook", &content);

    let output = context
        .command()
        .args(["playbook", "run"])
        .arg(&path)
        .output()
        .expect("run portunix");
    assert_eq!(output.status.code(), Some(2));
    assert!(marker.exists(), "rollback command must have run");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("package-that-does-not-exist"), "{stderr}");
}
