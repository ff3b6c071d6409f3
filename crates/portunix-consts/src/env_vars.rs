use std::ffi::OsString;

pub struct EnvVars;

impl EnvVars {
    pub const PATH: &'static str = "PATH";
    pub const HOME: &'static str = "HOME";
    pub const TERM: &'static str = "TERM";
    pub const CI: &'static str = "CI";

    // Portunix specific environment variables, public for users
    pub const PORTUNIX_HOME: &'static str = "PORTUNIX_HOME";
    pub const PORTUNIX_COLOR: &'static str = "PORTUNIX_COLOR";
    pub const PORTUNIX_LOG_LEVEL: &'static str = "PORTUNIX_LOG_LEVEL";
    pub const PORTUNIX_LOG_OUTPUT: &'static str = "PORTUNIX_LOG_OUTPUT";
    pub const PORTUNIX_LOG_FILE: &'static str = "PORTUNIX_LOG_FILE";
    pub const PORTUNIX_PERMISSION_LEVEL: &'static str = "PORTUNIX_PERMISSION_LEVEL";
    pub const PORTUNIX_CACHE_DIR: &'static str = "PORTUNIX_CACHE_DIR";
    pub const PORTUNIX_LEDGER_DIR: &'static str = "PORTUNIX_LEDGER_DIR";
    pub const PORTUNIX_ASSETS_DIR: &'static str = "PORTUNIX_ASSETS_DIR";
    pub const PORTUNIX_CONTAINER_RUNTIME: &'static str = "PORTUNIX_CONTAINER_RUNTIME";
    pub const PORTUNIX_NATIVE_TLS: &'static str = "PORTUNIX_NATIVE_TLS";
    pub const SSL_CERT_FILE: &'static str = "SSL_CERT_FILE";

    // Passed through to package-manager subprocesses
    pub const DEBIAN_FRONTEND: &'static str = "DEBIAN_FRONTEND";

    // Portunix internal environment variables
    pub const PORTUNIX_INTERNAL__PLATFORM: &'static str = "PORTUNIX_INTERNAL__PLATFORM";
    pub const PORTUNIX_INTERNAL__RUNTIME_BINARY: &'static str = "PORTUNIX_INTERNAL__RUNTIME_BINARY";
    pub const PORTUNIX_INTERNAL__TEST_DIR: &'static str = "PORTUNIX_INTERNAL__TEST_DIR";
}

impl EnvVars {
    /// Read an environment variable as an `OsString`.
    pub fn var_os(name: &str) -> Option<OsString> {
        #[allow(clippy::disallowed_methods)]
        std::env::var_os(name)
    }

    pub fn is_set(name: &str) -> bool {
        Self::var_os(name).is_some()
    }

    /// Read an environment variable as a `String`.
    pub fn var(name: &str) -> Result<String, std::env::VarError> {
        match Self::var_os(name) {
            Some(s) => s.into_string().map_err(std::env::VarError::NotUnicode),
            None => Err(std::env::VarError::NotPresent),
        }
    }

    /// Read an environment var and parse as bool.
    pub fn var_as_bool(name: &str) -> Option<bool> {
        if let Some(val) = EnvVars::var_os(name)
            && let Some(val) = val.to_str()
            && let Some(val) = EnvVars::parse_boolish(val)
        {
            Some(val)
        } else {
            None
        }
    }

    /// Parse a boolean from a string.
    ///
    /// Adapted from Clap's `BoolishValueParser` which is dual licensed under the MIT and Apache-2.0.
    /// See `clap_builder/src/util/str_to_bool.rs`
    fn parse_boolish(val: &str) -> Option<bool> {
        // True values are `y`, `yes`, `t`, `true`, `on`, and `1`.
        const TRUE_LITERALS: [&str; 6] = ["y", "yes", "t", "true", "on", "1"];

        // False values are `n`, `no`, `f`, `false`, `off`, and `0`.
        const FALSE_LITERALS: [&str; 6] = ["n", "no", "f", "false", "off", "0"];

        let val = val.to_lowercase();
        let pat = val.as_str();
        if TRUE_LITERALS.contains(&pat) {
            Some(true)
        } else if FALSE_LITERALS.contains(&pat) {
            Some(false)
        } else {
            None
        }
    }
}
