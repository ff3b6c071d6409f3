use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::cli::{CacheGcArgs, ExitStatus};
use crate::download::DownloadCache;
use crate::printer::Printer;
use crate::store::Store;

pub(crate) fn cache_dir(store: &Store, printer: Printer) -> Result<ExitStatus> {
    writeln!(printer.stdout(), "{}", store.path().display().cyan())?;
    Ok(ExitStatus::Success)
}

/// Remove the whole store directory.
pub(crate) fn cache_clean(store: &Store, printer: Printer) -> Result<ExitStatus> {
    if store.path().exists() {
        fs_err::remove_dir_all(store.path())?;
    }
    writeln!(printer.stdout(), "Cleaned `{}`", store.path().display())?;
    Ok(ExitStatus::Success)
}

/// Drop cache entries older than the age limit.
pub(crate) fn cache_gc(store: &Store, args: CacheGcArgs, printer: Printer) -> Result<ExitStatus> {
    let cache = DownloadCache::new(store);
    let max_age = Duration::from_secs(args.max_age_days * 24 * 3600);
    let removed = cache.gc(max_age, args.dry_run)?;

    if removed.is_empty() {
        writeln!(printer.stdout(), "Nothing to remove")?;
    } else if args.dry_run {
        writeln!(printer.stdout(), "Would remove {} cache entries:", removed.len())?;
        for path in &removed {
            writeln!(printer.stdout(), "- {}", path.display())?;
        }
    } else {
        writeln!(printer.stdout(), "Removed {} cache entries", removed.len())?;
    }
    Ok(ExitStatus::Success)
}
