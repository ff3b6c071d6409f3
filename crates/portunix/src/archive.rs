use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::trace;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Unsupported archive format: `{0}`")]
    UnsupportedFormat(String),
    #[error("Archive member has an unsafe path: `{0}`")]
    UnsafePath(String),
    #[error("Expected a single top-level directory, found {0} entries")]
    NonSingularArchive(usize),
    #[error(transparent)]
    Zip(#[from] async_zip::error::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Archive format, detected from the file name.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ArchiveExtension {
    TarGz,
    TarXz,
    TarBz2,
    Zip,
}

impl ArchiveExtension {
    pub(crate) fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let name = path.as_ref().to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Ok(Self::TarXz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Ok(Self::TarBz2)
        } else if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else {
            Err(Error::UnsupportedFormat(name))
        }
    }
}

/// Unpack an archive file into `dest`.
pub(crate) async fn unpack(
    archive: &Path,
    ext: ArchiveExtension,
    dest: &Path,
) -> Result<(), Error> {
    let file = fs_err::tokio::File::open(archive).await?;
    let reader = tokio::io::BufReader::new(file);

    trace!(archive = %archive.display(), ?ext, dest = %dest.display(), "Unpacking");
    match ext {
        ArchiveExtension::TarGz => {
            let decoder = async_compression::tokio::bufread::GzipDecoder::new(reader);
            untar(decoder, dest).await
        }
        ArchiveExtension::TarXz => {
            let decoder = async_compression::tokio::bufread::XzDecoder::new(reader);
            untar(decoder, dest).await
        }
        ArchiveExtension::TarBz2 => {
            let decoder = async_compression::tokio::bufread::BzDecoder::new(reader);
            untar(decoder, dest).await
        }
        ArchiveExtension::Zip => unzip(reader, dest).await,
    }
}

async fn untar(
    reader: impl tokio::io::AsyncRead + Unpin + Send,
    dest: &Path,
) -> Result<(), Error> {
    let mut archive = tokio_tar::Archive::new(reader);
    archive.unpack(dest).await?;
    Ok(())
}

async fn unzip(
    reader: impl tokio::io::AsyncBufRead + Unpin,
    dest: &Path,
) -> Result<(), Error> {
    let mut zip = async_zip::base::read::stream::ZipFileReader::new(reader.compat());

    while let Some(mut entry) = zip.next_with_entry().await? {
        let relpath = {
            let meta = entry.reader().entry();
            meta.filename().as_str()?.to_string()
        };

        // Reject absolute paths and traversal out of the destination.
        let relative = Path::new(&relpath);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::UnsafePath(relpath));
        }
        let target = dest.join(relative);

        if relpath.ends_with('/') {
            fs_err::tokio::create_dir_all(&target).await?;
        } else {
            if let Some(parent) = target.parent() {
                fs_err::tokio::create_dir_all(parent).await?;
            }
            let mut file = fs_err::tokio::File::create(&target).await?;
            let mut reader = entry.reader_mut().compat();
            tokio::io::copy(&mut reader, &mut file).await?;

            #[cfg(unix)]
            if let Some(mode) = entry.reader().entry().unix_permissions() {
                use std::os::unix::fs::PermissionsExt;
                fs_err::set_permissions(
                    &target,
                    std::fs::Permissions::from_mode(u32::from(mode)),
                )?;
            }
        }

        (_, zip) = entry.skip().await?;
    }

    Ok(())
}

/// Descend `strip` levels of single top-level directories, returning the
/// directory the stripped content lives in.
///
/// Mirrors `tar --strip-components` for the common case of archives that
/// wrap their content in versioned directories. A level with more than one
/// entry stops the descent.
pub(crate) fn strip_components(dir: &Path, strip: u32) -> Result<PathBuf, Error> {
    let mut current = dir.to_path_buf();
    for _ in 0..strip {
        let entries: Vec<_> = fs_err::read_dir(&current)?.collect::<Result<_, _>>()?;
        if entries.len() == 1 && entries[0].file_type()?.is_dir() {
            current = entries[0].path();
        } else {
            return Err(Error::NonSingularArchive(entries.len()));
        }
    }
    Ok(current)
}
