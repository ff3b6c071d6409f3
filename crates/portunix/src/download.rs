use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, trace, warn};

use crate::fs::{LockedFile, atomic_write};
use crate::ledger::now_ts;
use crate::store::Store;

/// Per-request deadline for downloads.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Total attempts per download, with exponential backoff in between.
const DOWNLOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Failed to download `{url}`")]
    Http {
        url: String,
        #[source]
        cause: reqwest::Error,
    },
    #[error("Failed to download `{url}`: HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("Checksum mismatch for `{url}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether another attempt could reasonably succeed.
    fn is_retryable(&self) -> bool {
        match self {
            Error::Http { .. } => true,
            Error::Status { status, .. } => *status >= 500 || *status == 429,
            Error::ChecksumMismatch { .. } | Error::Io(_) => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    downloaded_at: u64,
}

/// Cache key: `sha256(url|declared-checksum)`. Identical `(url, checksum)`
/// pairs share an entry; anything else cannot collide.
pub(crate) fn cache_key(url: &str, checksum: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    hasher.update(checksum.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Content-addressed download cache: `cache/<sha256>/blob` + `meta.json`.
#[derive(Debug)]
pub(crate) struct DownloadCache {
    dir: PathBuf,
    scratch: PathBuf,
}

impl DownloadCache {
    pub(crate) fn new(store: &Store) -> Self {
        Self {
            dir: store.cache_dir().to_path_buf(),
            scratch: store.scratch_path(),
        }
    }

    /// Fetch `url` into the cache, returning the path to the blob.
    ///
    /// The cached copy is reused when present. A declared checksum is
    /// verified after download; mismatches abort without caching.
    pub(crate) async fn fetch(
        &self,
        url: &str,
        checksum: Option<&str>,
        reporter: Option<&dyn DownloadReporter>,
    ) -> Result<PathBuf, Error> {
        let key = cache_key(url, checksum);
        let entry_dir = self.dir.join(&key);
        let blob = entry_dir.join("blob");

        if blob.is_file() {
            trace!(url, key, "Download cache hit");
            return Ok(blob);
        }

        fs_err::create_dir_all(&entry_dir)?;
        // Write-exclusive per key: concurrent fetches of the same URL wait.
        let _lock = LockedFile::acquire(entry_dir.join(".lock"), url).await?;
        if blob.is_file() {
            return Ok(blob);
        }

        let mut attempt = 0;
        let etag = loop {
            attempt += 1;
            match self.download_once(url, checksum, &blob, reporter).await {
                Ok(etag) => break etag,
                Err(err) if err.is_retryable() && attempt < DOWNLOAD_ATTEMPTS => {
                    let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    warn!(url, attempt, "Download failed, retrying in {backoff:?}: {err}");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        };

        let meta = CacheMeta {
            url: url.to_string(),
            etag,
            downloaded_at: now_ts(),
        };
        atomic_write(
            &entry_dir.join("meta.json"),
            serde_json::to_string_pretty(&meta)
                .expect("cache meta must serialize")
                .as_bytes(),
        )?;

        Ok(blob)
    }

    async fn download_once(
        &self,
        url: &str,
        checksum: Option<&str>,
        blob: &Path,
        reporter: Option<&dyn DownloadReporter>,
    ) -> Result<Option<String>, Error> {
        let response = client()
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|cause| Error::Http {
                url: url.to_string(),
                cause,
            })?;

        if !response.status().is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let total = response.content_length();
        let progress = reporter.map(|reporter| (reporter, reporter.on_download_start(url, total)));

        let temp = tempfile::NamedTempFile::new_in(&self.scratch)?;
        let mut file = fs_err::tokio::File::create(temp.path()).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        debug!(url, target = %blob.display(), "Downloading");
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|cause| Error::Http {
                url: url.to_string(),
                cause,
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            if let Some((reporter, id)) = &progress {
                reporter.on_download_progress(*id, chunk.len() as u64);
            }
        }
        file.flush().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = checksum {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(Error::ChecksumMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        temp.persist(blob).map_err(|err| err.error)?;
        if let Some((reporter, id)) = progress {
            reporter.on_download_complete(id);
        }
        Ok(etag)
    }

    /// Remove cache entries older than `max_age`. Returns the number removed.
    pub(crate) fn gc(&self, max_age: Duration, dry_run: bool) -> Result<Vec<PathBuf>, Error> {
        let cutoff = now_ts().saturating_sub(max_age.as_secs());
        let mut removed = Vec::new();

        for entry in fs_err::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join("meta.json");
            let downloaded_at = fs_err::read_to_string(&meta_path)
                .ok()
                .and_then(|content| serde_json::from_str::<CacheMeta>(&content).ok())
                .map_or(0, |meta| meta.downloaded_at);
            if downloaded_at < cutoff {
                if !dry_run {
                    fs_err::remove_dir_all(entry.path())?;
                }
                removed.push(entry.path());
            }
        }
        Ok(removed)
    }
}

/// Progress callbacks for streaming downloads.
pub(crate) trait DownloadReporter: Send + Sync {
    fn on_download_start(&self, url: &str, size: Option<u64>) -> usize;
    fn on_download_progress(&self, id: usize, bytes: u64);
    fn on_download_complete(&self, id: usize);
}

static REQWEST_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    let builder = reqwest::ClientBuilder::new()
        .user_agent(format!("portunix/{}", crate::version::version()));
    builder.build().unwrap_or_else(|e| {
        error!("Unable to create reqwest client, falling back to default: {e:?}");
        reqwest::Client::new()
    })
});

fn client() -> &'static reqwest::Client {
    &REQWEST_CLIENT
}
