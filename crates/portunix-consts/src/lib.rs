pub mod env_vars;

use std::ffi::OsString;
use std::path::Path;

use env_vars::EnvVars;

/// Canonical package manifest file name inside an assets directory.
pub const MANIFEST_FILE: &str = "packages.yaml";
/// Directory of per-package overlay manifests inside an assets directory.
pub const MANIFEST_OVERLAY_DIR: &str = "packages.d";
/// File extension of playbook documents.
pub const PLAYBOOK_EXTENSION: &str = "ptxbook";

/// Append-only install log, one NDJSON record per step.
pub const LEDGER_FILE: &str = "ledger.ndjson";
/// Summary of installed package/variant pairs for O(1) lookup.
pub const LEDGER_INDEX_FILE: &str = "index.json";

/// Where the portunix binary is placed inside a container by the
/// run-in-container pipeline.
pub const CONTAINER_BINARY_PATH: &str = "/usr/local/bin/portunix";

/// Default TCP port of the MCP server.
pub const MCP_DEFAULT_PORT: u16 = 3001;

/// Prepend paths to the current $PATH, returning the joined result.
///
/// The resulting `OsString` can be used to set the `PATH` environment variable.
pub fn prepend_paths(paths: &[&Path]) -> Result<OsString, std::env::JoinPathsError> {
    std::env::join_paths(
        paths.iter().map(|p| p.to_path_buf()).chain(
            EnvVars::var_os(EnvVars::PATH)
                .as_ref()
                .iter()
                .flat_map(std::env::split_paths),
        ),
    )
}
