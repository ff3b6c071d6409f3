use std::io::Write;
use std::path::{Path, PathBuf};

use etcetera::BaseStrategy;
use thiserror::Error;

use portunix_consts::env_vars::EnvVars;

use crate::fs::{LockedFile, expand_tilde};

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Home directory not found")]
    HomeNotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// On-disk state of portunix: download cache, install ledger, run logs,
/// and scratch space. Rooted at `$PORTUNIX_HOME` or `~/.portunix`.
#[derive(Debug, Clone)]
pub(crate) struct Store {
    path: PathBuf,
    cache_dir: PathBuf,
    ledger_dir: PathBuf,
}

impl Store {
    pub(crate) fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache_dir = EnvVars::var_os(EnvVars::PORTUNIX_CACHE_DIR)
            .map(|p| expand_tilde(PathBuf::from(p)))
            .unwrap_or_else(|| path.join("cache"));
        let ledger_dir = EnvVars::var_os(EnvVars::PORTUNIX_LEDGER_DIR)
            .map(|p| expand_tilde(PathBuf::from(p)))
            .unwrap_or_else(|| path.join("ledger"));
        Self {
            path,
            cache_dir,
            ledger_dir,
        }
    }

    /// Create a store from environment variables or default paths.
    pub(crate) fn from_settings() -> Result<Self, Error> {
        let path = if let Some(path) = EnvVars::var_os(EnvVars::PORTUNIX_HOME) {
            Some(expand_tilde(PathBuf::from(path)))
        } else {
            std::env::home_dir().map(|home| home.join(".portunix"))
        };

        let Some(path) = path else {
            return Err(Error::HomeNotFound);
        };
        let store = Store::from_path(path).init()?;

        Ok(store)
    }

    pub(crate) fn path(&self) -> &Path {
        self.path.as_ref()
    }

    /// Initialize the store directories.
    pub(crate) fn init(self) -> Result<Self, Error> {
        fs_err::create_dir_all(&self.path)?;
        fs_err::create_dir_all(&self.cache_dir)?;
        fs_err::create_dir_all(&self.ledger_dir)?;
        fs_err::create_dir_all(self.runs_dir())?;
        fs_err::create_dir_all(self.scratch_path())?;

        match fs_err::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path.join("README"))
        {
            Ok(mut f) => {
                f.write_all(b"This directory is maintained by the portunix project.\n")?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => (),
            Err(err) => return Err(err.into()),
        }
        Ok(self)
    }

    /// Content-addressed download cache.
    pub(crate) fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Append-only install ledger.
    pub(crate) fn ledger_dir(&self) -> &Path {
        &self.ledger_dir
    }

    /// Per-run playbook logs, `runs/<run-id>`.
    pub(crate) fn runs_dir(&self) -> PathBuf {
        self.path.join("runs")
    }

    /// Scratch path for temporary files.
    pub(crate) fn scratch_path(&self) -> PathBuf {
        self.path.join("scratch")
    }

    /// Cached container-runtime probe results.
    pub(crate) fn runtime_cache_file(&self) -> PathBuf {
        self.path.join("runtimes.json")
    }

    pub(crate) fn log_file(&self) -> PathBuf {
        self.path.join("portunix.log")
    }

    /// Where archive variants are unpacked:
    /// `~/.local/share/portunix/packages/<package>/<variant>`.
    pub(crate) fn packages_dir(&self) -> PathBuf {
        if let Some(test_dir) = EnvVars::var_os(EnvVars::PORTUNIX_INTERNAL__TEST_DIR) {
            return PathBuf::from(test_dir).join("packages");
        }
        etcetera::choose_base_strategy()
            .map(|dirs| dirs.data_dir().join("portunix").join("packages"))
            .unwrap_or_else(|_| self.path.join("packages"))
    }

    /// Where binary symlinks are registered: `~/.local/bin`.
    pub(crate) fn bin_dir(&self) -> PathBuf {
        if let Some(test_dir) = EnvVars::var_os(EnvVars::PORTUNIX_INTERNAL__TEST_DIR) {
            return PathBuf::from(test_dir).join("bin");
        }
        std::env::home_dir()
            .map(|home| home.join(".local").join("bin"))
            .unwrap_or_else(|| self.path.join("bin"))
    }

    /// Acquire the store-wide mutation lock.
    pub(crate) async fn lock_async(&self) -> Result<LockedFile, std::io::Error> {
        LockedFile::acquire(self.path.join(".lock"), "store").await
    }

    /// Acquire the per-package mutation lock.
    pub(crate) async fn lock_package(&self, package: &str) -> Result<LockedFile, std::io::Error> {
        let locks = self.path.join("locks");
        fs_err::create_dir_all(&locks)?;
        LockedFile::acquire(locks.join(format!("{package}.lock")), package).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_creates_layout() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::from_path(tmp.path().join("home")).init()?;

        assert!(store.cache_dir().is_dir());
        assert!(store.ledger_dir().is_dir());
        assert!(store.runs_dir().is_dir());
        assert!(store.scratch_path().is_dir());
        assert!(store.path().join("README").is_file());

        // Locking twice in one process succeeds sequentially.
        drop(store.lock_async().await?);
        drop(store.lock_async().await?);
        Ok(())
    }
}
