use std::path::{Path, PathBuf};
use std::process::Command;

use assert_fs::TempDir;
use assert_fs::fixture::{ChildPath, PathChild};

/// Pinned platform for deterministic resolution across hosts.
pub const TEST_PLATFORM: &str = "linux/amd64/apt/ubuntu/22.04";

pub struct TestContext {
    temp_dir: TempDir,
    home_dir: ChildPath,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let home_dir = temp_dir.child("home");
        Self { temp_dir, home_dir }
    }

    /// A `portunix` command isolated to this context's store and platform.
    pub fn command(&self) -> Command {
        let mut command = Command::new(insta_cmd::get_cargo_bin("portunix"));
        command
            .current_dir(self.work_dir())
            .env("PORTUNIX_HOME", self.home_dir.path())
            .env("PORTUNIX_COLOR", "never")
            .env("PORTUNIX_INTERNAL__PLATFORM", TEST_PLATFORM)
            .env(
                "PORTUNIX_INTERNAL__TEST_DIR",
                self.temp_dir.child("local").path(),
            )
            .env_remove("RUST_LOG")
            .env_remove("PORTUNIX_LOG_LEVEL")
            .env_remove("PORTUNIX_LOG_OUTPUT")
            .env_remove("PORTUNIX_PERMISSION_LEVEL")
            .env_remove("PORTUNIX_ASSETS_DIR");
        command
    }

    pub fn work_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn home_dir(&self) -> &ChildPath {
        &self.home_dir
    }

    pub fn write_playbook(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs_err::write(&path, content).expect("write playbook");
        path
    }

    /// Snapshot filters: scrub temp paths and run ids.
    pub fn filters(&self) -> Vec<(String, String)> {
        let mut filters = Vec::new();
        filters.push((
            regex::escape(&self.temp_dir.path().display().to_string()),
            "[TEMP_DIR]".to_string(),
        ));
        if let Ok(canonical) = self.temp_dir.path().canonicalize() {
            filters.push((
                regex::escape(&canonical.display().to_string()),
                "[TEMP_DIR]".to_string(),
            ));
        }
        filters.push((r"run [0-9a-f]{16}".to_string(), "run [RUN_ID]".to_string()));
        filters
    }
}

macro_rules! cmd_snapshot {
    ($filters:expr, $cmd:expr, @$snapshot:literal) => {{
        let mut settings = insta::Settings::clone_current();
        for (regex, replacement) in $filters {
            settings.add_filter(&regex, replacement);
        }
        let _guard = settings.bind_to_scope();
        insta_cmd::assert_cmd_snapshot!($cmd, @$snapshot);
    }};
}

pub(crate) use cmd_snapshot;
