/// Snapshot bundles (`<id>.tar.gz`, entries rooted at `<id>/`)

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::VaultError;

/// One entry of an archive's table of contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub path: PathBuf,
    pub size: u64,
    pub is_file: bool,
}

/// Bundle `dir` into a gzip tarball rooted at the directory's own name
pub fn compress_dir(dir: &Path, archive: &Path) -> Result<()> {
    let root = dir
        .file_name()
        .with_context(|| format!("{} has no directory name", dir.display()))?;

    let file = File::create(archive)
        .with_context(|| format!("Failed to create {}", archive.display()))?;
    let mut tar = Builder::new(GzEncoder::new(file, Compression::default()));
    tar.follow_symlinks(false);
    tar.append_dir_all(root, dir)
        .with_context(|| format!("Failed to add {} to archive", dir.display()))?;

    tar.into_inner()
        .context("Failed to finish tar stream")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(())
}

/// Read the table of contents without extracting anything
pub fn read_toc(archive: &Path) -> Result<Vec<TocEntry>> {
    let unreadable = |reason: String| VaultError::UnreadableArchive {
        path: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive).map_err(|e| unreadable(e.to_string()))?;
    let mut tar = Archive::new(GzDecoder::new(file));

    let mut toc = Vec::new();
    for entry in tar.entries().map_err(|e| unreadable(e.to_string()))? {
        let entry = entry.map_err(|e| unreadable(e.to_string()))?;
        let path = entry.path().map_err(|e| unreadable(e.to_string()))?.into_owned();
        toc.push(TocEntry {
            path,
            size: entry.header().size().unwrap_or(0),
            is_file: entry.header().entry_type() == EntryType::Regular,
        });
    }

    if toc.is_empty() {
        return Err(unreadable("archive is empty".to_string()).into());
    }

    Ok(toc)
}

/// Top-level directory every entry lives under
pub fn toc_root(toc: &[TocEntry]) -> Option<String> {
    toc.iter().find_map(|e| match e.path.components().next() {
        Some(Component::Normal(name)) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Read a single small file out of an archive by its path inside the bundle
pub fn read_member(archive: &Path, member: &Path) -> Result<Option<Vec<u8>>> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = Archive::new(GzDecoder::new(file));

    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == member {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }

    Ok(None)
}

/// Check a fresh archive against the directory it was built from
pub fn verify(archive: &Path, dir: &Path) -> Result<()> {
    let expected = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();

    let found = read_toc(archive)?.iter().filter(|e| e.is_file).count();
    if found != expected {
        return Err(VaultError::UnreadableArchive {
            path: archive.to_path_buf(),
            reason: format!("{} files archived, {} expected", found, expected),
        }
        .into());
    }

    debug!(archive = %archive.display(), files = found, "archive verified");
    Ok(())
}

/// Unpack into `dest`, returning the snapshot directory it produced
///
/// Entries that would escape `dest` are skipped.
pub fn extract(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let root = toc_root(&read_toc(archive)?).ok_or_else(|| VaultError::InvalidSnapshot {
        path: archive.to_path_buf(),
        reason: "no top-level directory".to_string(),
    })?;

    fs::create_dir_all(dest)?;
    let file = File::open(archive)?;
    let mut tar = Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.set_preserve_mtime(true);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !entry.unpack_in(dest)? {
            warn!(path = %path.display(), "skipped archive entry outside the snapshot");
        }
    }

    Ok(dest.join(root))
}

pub fn is_archive(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(crate::utils::layout::ARCHIVE_SUFFIX))
            .unwrap_or(false)
}
