use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use portunix_consts::{LEDGER_FILE, LEDGER_INDEX_FILE};

use crate::fs::{LockedFile, atomic_write};
use crate::store::Store;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StepStatus {
    Started,
    #[default]
    Ok,
    Skipped,
    Failed,
}

/// One ledger line. The ledger is append-only NDJSON; a record is written
/// when a step starts and again when it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StepRecord {
    pub(crate) ts: u64,
    pub(crate) run_id: String,
    pub(crate) seq: u64,
    pub(crate) package: String,
    pub(crate) variant: String,
    pub(crate) step: String,
    pub(crate) status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) artifacts: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

/// Summary of what is installed, for O(1) "already installed" lookups.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct LedgerIndex {
    #[serde(default)]
    packages: BTreeMap<String, InstalledEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InstalledEntry {
    pub(crate) variant: String,
    pub(crate) installed_at: u64,
    pub(crate) plan_hash: String,
}

impl LedgerIndex {
    /// The installed variant of `package`, if any.
    ///
    /// "Already installed" is decided by variant identity: a package
    /// installed with a different variant does not count.
    pub(crate) fn installed_variant(&self, package: &str) -> Option<&InstalledEntry> {
        self.packages.get(package)
    }

    pub(crate) fn is_installed(&self, package: &str, variant: &str) -> bool {
        self.packages
            .get(package)
            .is_some_and(|entry| entry.variant == variant)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &InstalledEntry)> {
        self.packages.iter()
    }
}

/// The append-only install ledger plus its index file.
#[derive(Debug)]
pub(crate) struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    pub(crate) fn new(store: &Store) -> Self {
        Self {
            dir: store.ledger_dir().to_path_buf(),
        }
    }

    pub(crate) fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn ledger_file(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    fn index_file(&self) -> PathBuf {
        self.dir.join(LEDGER_INDEX_FILE)
    }

    /// Append one record to the ledger.
    pub(crate) async fn append(&self, record: &StepRecord) -> Result<(), Error> {
        let _lock = LockedFile::acquire(self.dir.join(".lock"), "ledger").await?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_file())?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read every record in the ledger. Unparseable lines are skipped with a warning.
    pub(crate) fn records(&self) -> Result<Vec<StepRecord>, Error> {
        let content = match fs_err::read_to_string(self.ledger_file()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!("Skipping unparseable ledger line {}: {err}", lineno + 1),
            }
        }
        Ok(records)
    }

    /// Load the installed-package index. A missing or corrupt file yields an empty index.
    pub(crate) fn index(&self) -> LedgerIndex {
        match fs_err::read_to_string(self.index_file()) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
                warn!("Failed to parse ledger index, resetting: {err}");
                LedgerIndex::default()
            }),
            Err(_) => LedgerIndex::default(),
        }
    }

    /// Record a completed install in the index.
    pub(crate) async fn record_installed(
        &self,
        package: &str,
        variant: &str,
        plan_hash: &str,
    ) -> Result<(), Error> {
        let _lock = LockedFile::acquire(self.dir.join(".lock"), "ledger").await?;

        let mut index = self.index();
        index.packages.insert(
            package.to_string(),
            InstalledEntry {
                variant: variant.to_string(),
                installed_at: now_ts(),
                plan_hash: plan_hash.to_string(),
            },
        );
        self.write_index(&index)
    }

    /// Drop a package from the index (uninstall bookkeeping).
    pub(crate) async fn forget(&self, package: &str) -> Result<(), Error> {
        let _lock = LockedFile::acquire(self.dir.join(".lock"), "ledger").await?;

        let mut index = self.index();
        index.packages.remove(package);
        self.write_index(&index)
    }

    fn write_index(&self, index: &LedgerIndex) -> Result<(), Error> {
        let content = serde_json::to_string_pretty(index)?;
        atomic_write(&self.index_file(), content.as_bytes())?;
        Ok(())
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A short random identifier for one plan execution.
pub(crate) fn new_run_id() -> String {
    format!("{:08x}{:08x}", now_ts() as u32, rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(seq: u64, step: &str, status: StepStatus) -> StepRecord {
        StepRecord {
            ts: 1700000000,
            run_id: "run1".into(),
            seq,
            package: "hugo".into(),
            variant: "standard".into(),
            step: step.into(),
            status,
            artifacts: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn append_and_read_back() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let ledger = Ledger::from_dir(tmp.path());

        ledger.append(&record(0, "download", StepStatus::Started)).await?;
        ledger.append(&record(0, "download", StepStatus::Ok)).await?;
        ledger.append(&record(1, "extract", StepStatus::Failed)).await?;

        let records = ledger.records()?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].step, "download");
        assert_eq!(records[2].status, StepStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn index_tracks_variant_identity() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let ledger = Ledger::from_dir(tmp.path());

        assert!(!ledger.index().is_installed("hugo", "standard"));

        ledger.record_installed("hugo", "standard", "abc123").await?;
        let index = ledger.index();
        assert!(index.is_installed("hugo", "standard"));
        // A different variant is not "already installed".
        assert!(!index.is_installed("hugo", "extended"));

        ledger.forget("hugo").await?;
        assert!(!ledger.index().is_installed("hugo", "standard"));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let ledger = Ledger::from_dir(tmp.path());
        ledger.append(&record(0, "download", StepStatus::Ok)).await?;

        let mut file = fs_err::OpenOptions::new()
            .append(true)
            .open(tmp.path().join(LEDGER_FILE))?;
        file.write_all(b"{not json}\n")?;
        drop(file);

        ledger.append(&record(1, "extract", StepStatus::Ok)).await?;
        assert_eq!(ledger.records()?.len(), 2);
        Ok(())
    }
}
