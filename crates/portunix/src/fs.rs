// MIT License
//
// Copyright (c) 2023 Astral Software Inc.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::warn_user;

pub(crate) static CWD: LazyLock<PathBuf> =
    LazyLock::new(|| std::env::current_dir().expect("The current directory must exist"));

/// Warn the user once a contended lock has kept us waiting this long.
const LOCK_WAIT_WARNING: Duration = Duration::from_secs(1);

/// A file lock that is automatically released when dropped.
#[derive(Debug)]
pub(crate) struct LockedFile(fs_err::File);

impl LockedFile {
    /// Take the lock if it is free; report contention without blocking.
    fn try_acquire(file: fs_err::File, resource: &str) -> Result<Option<Self>, std::io::Error> {
        trace!(resource, path = %file.path().display(), "Checking lock");
        match file.try_lock() {
            Ok(()) => {
                debug!(resource, "Acquired lock");
                Ok(Some(Self(file)))
            }
            Err(std::fs::TryLockError::WouldBlock) => Ok(None),
            Err(std::fs::TryLockError::Error(err)) => Err(err),
        }
    }

    /// Block the current thread until the lock is granted.
    fn acquire_blocking(path: &Path, resource: &str) -> Result<Self, std::io::Error> {
        let file = fs_err::File::create(path)?;
        file.lock().map_err(|err| {
            std::io::Error::other(format!(
                "Could not acquire lock for `{resource}` at `{}`: {err}",
                path.display()
            ))
        })?;
        trace!(resource, "Acquired lock after waiting");
        Ok(Self(file))
    }

    /// Acquire a cross-process lock for a resource using a file at the
    /// provided path.
    ///
    /// Uncontended locks are taken without blocking. A contended lock is
    /// waited for on the blocking pool, and the user is warned once the
    /// wait exceeds [`LOCK_WAIT_WARNING`].
    pub(crate) async fn acquire(
        path: impl AsRef<Path>,
        resource: impl Display,
    ) -> Result<Self, std::io::Error> {
        let path = path.as_ref().to_path_buf();
        let resource = resource.to_string();

        let file = fs_err::File::create(&path)?;
        if let Some(lock) = Self::try_acquire(file, &resource)? {
            return Ok(lock);
        }

        info!(resource, path = %path.display(), "Lock held by another process, waiting");
        let task = {
            let path = path.clone();
            let resource = resource.clone();
            tokio::task::spawn_blocking(move || Self::acquire_blocking(&path, &resource))
        };
        wait_with_warning(task, || {
            crate::cli::reporter::suspend(|| {
                warn_user!(
                    "Waiting to acquire lock for `{resource}` at `{}`. \
                     Another portunix process may still be running",
                    path.display()
                );
            });
        })
        .await
    }
}

/// Await the blocking lock task, invoking `warn` once if it outlasts the
/// warning threshold.
async fn wait_with_warning(
    mut task: tokio::task::JoinHandle<Result<LockedFile, std::io::Error>>,
    warn: impl FnOnce(),
) -> Result<LockedFile, std::io::Error> {
    tokio::select! {
        result = &mut task => result?,
        () = tokio::time::sleep(LOCK_WAIT_WARNING) => {
            warn();
            task.await?
        }
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(err) = self.0.file().unlock() {
            error!(
                "Failed to unlock `{}`: {err}; waiting processes may stay blocked",
                self.0.path().display(),
            );
        } else {
            trace!(path = %self.0.path().display(), "Released lock");
        }
    }
}

/// Write a file atomically: write to a temporary sibling, then rename over the target.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("Path has no parent directory"))?;
    fs_err::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

pub(crate) trait Simplified {
    /// Simplify a [`Path`].
    ///
    /// On Windows, this will strip the `\\?\` prefix from paths. On other platforms, it's a no-op.
    fn simplified(&self) -> &Path;

    /// Render a [`Path`] for display.
    fn simplified_display(&self) -> impl Display;

    /// Render a [`Path`] for user-facing display, relative to the current working directory.
    fn user_display(&self) -> impl Display;
}

impl<T: AsRef<Path>> Simplified for T {
    fn simplified(&self) -> &Path {
        dunce::simplified(self.as_ref())
    }

    fn simplified_display(&self) -> impl Display {
        dunce::simplified(self.as_ref()).display()
    }

    fn user_display(&self) -> impl Display {
        let path = dunce::simplified(self.as_ref());

        // If current working directory is root, display the path as-is.
        if CWD.ancestors().nth(1).is_none() {
            return path.display();
        }

        let path = path.strip_prefix(CWD.simplified()).unwrap_or(path);
        path.display()
    }
}

/// Expand a path starting with `~` to the user's home directory.
pub(crate) fn expand_tilde(path: PathBuf) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::home_dir() {
            return home.join(stripped);
        }
    }
    path
}

/// Create a symlink, or copy the file where symlinks are unavailable.
pub(crate) async fn create_symlink_or_copy(source: &Path, target: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    if target.exists() {
        fs_err::tokio::remove_file(target).await?;
    }

    #[cfg(not(windows))]
    {
        match fs_err::tokio::symlink(source, target).await {
            Ok(()) => {
                trace!(
                    "Created symlink from {} to {}",
                    source.display(),
                    target.display()
                );
                return Ok(());
            }
            Err(e) => {
                trace!(
                    "Failed to create symlink from {} to {}: {}",
                    source.display(),
                    target.display(),
                    e
                );
            }
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::symlink_file;
        match symlink_file(source, target) {
            Ok(()) => {
                trace!(
                    "Created Windows symlink from {} to {}",
                    source.display(),
                    target.display()
                );
                return Ok(());
            }
            Err(e) => {
                trace!(
                    "Failed to create Windows symlink from {} to {}: {}",
                    source.display(),
                    target.display(),
                    e
                );
            }
        }
    }

    trace!(
        "Falling back to copy from {} to {}",
        source.display(),
        target.display()
    );
    fs_err::tokio::copy(source, target).await.with_context(|| {
        format!(
            "Failed to copy file from {} to {}",
            source.display(),
            target.display(),
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn atomic_write_creates_parents() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let target = tmp.path().join("nested/dir/file.json");

        atomic_write(&target, b"{}")?;
        assert_eq!(fs_err::read_to_string(&target)?, "{}");

        // Overwrite in place.
        atomic_write(&target, b"{\"a\":1}")?;
        assert_eq!(fs_err::read_to_string(&target)?, "{\"a\":1}");
        Ok(())
    }

    #[tokio::test]
    async fn uncontended_lock_is_taken_without_blocking() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(".lock");

        let lock = LockedFile::acquire(&path, "test-lock").await?;
        drop(lock);

        // Free again after release.
        let file = fs_err::File::create(&path)?;
        assert!(LockedFile::try_acquire(file, "test-lock")?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn contended_lock_warns_then_acquires() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join(".lock");

        let holder = LockedFile::acquire(&path, "test-lock").await?;

        // While held, the fast path reports contention.
        let file = fs_err::File::create(&path)?;
        assert!(LockedFile::try_acquire(file, "test-lock")?.is_none());

        // A second acquisition waits on the blocking pool; the warning fires
        // once the threshold elapses, and the lock is granted after the
        // holder releases it.
        let task = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || LockedFile::acquire_blocking(&path, "test-lock"))
        };
        let warned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&warned);
        let waiter = wait_with_warning(task, move || flag.store(true, Ordering::SeqCst));

        let release = async {
            tokio::time::sleep(LOCK_WAIT_WARNING + Duration::from_millis(300)).await;
            drop(holder);
        };

        let (lock, ()) = tokio::join!(waiter, release);
        drop(lock?);
        assert!(
            warned.load(Ordering::SeqCst),
            "warning must fire after the wait threshold"
        );
        Ok(())
    }
}
