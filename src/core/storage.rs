/// Disk usage and tree operations
///
/// Free space comes from `df` the same way the storage screen always read it;
/// sizes and copies walk the tree with `walkdir` without following symlinks.

use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use serde::Serialize;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use crate::utils::Interrupt;

/// Filesystem usage for the mount holding a path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub filesystem: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: f64,
    pub mount_point: String,
}

/// Files and bytes moved by a tree copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub bytes: u64,
}

/// Get disk usage for the filesystem that holds `path`
///
/// A path that does not exist yet is measured at its nearest existing
/// ancestor, which is where it would be created.
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let probe = nearest_existing(path);

    let output = Command::new("df")
        .arg("-B1") // Byte output
        .arg("-P") // One line per filesystem
        .arg(&probe)
        .output()
        .context("Failed to run df command")?;

    if !output.status.success() {
        bail!(
            "df failed for {}: {}",
            probe.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_df_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `df -B1 -P` output
pub fn parse_df_output(stdout: &str) -> Result<DiskUsage> {
    let lines: Vec<&str> = stdout.lines().collect();

    if lines.len() < 2 {
        bail!("Unexpected df output");
    }

    let parts: Vec<&str> = lines[1].split_whitespace().collect();
    if parts.len() < 6 {
        bail!("Failed to parse df output");
    }

    let total = parts[1].parse::<u64>()?;
    let used = parts[2].parse::<u64>()?;
    let available = parts[3].parse::<u64>()?;
    let use_percent = parts[4].trim_end_matches('%').parse::<f64>()?;

    Ok(DiskUsage {
        filesystem: parts[0].to_string(),
        total_bytes: total,
        used_bytes: used,
        available_bytes: available,
        use_percent,
        mount_point: parts[5..].join(" "),
    })
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut candidate = Some(path);
    while let Some(p) = candidate {
        if p.exists() {
            return p.to_path_buf();
        }
        candidate = p.parent();
    }
    PathBuf::from("/")
}

/// Total size of regular files under `path` (a file counts as itself)
pub fn path_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }

    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Recursively copy `src` into `dst`, preserving permissions and symlinks
pub fn copy_tree(src: &Path, dst: &Path, progress: Option<&ProgressBar>) -> Result<CopyStats> {
    copy_tree_until(src, dst, progress, &Interrupt::default())
}

/// `copy_tree` that stops between entries once `interrupt` is raised
pub fn copy_tree_until(
    src: &Path,
    dst: &Path,
    progress: Option<&ProgressBar>,
    interrupt: &Interrupt,
) -> Result<CopyStats> {
    if !src.is_dir() {
        bail!("{} is not a directory", src.display());
    }

    let mut stats = CopyStats::default();
    let mut dirs = Vec::new();

    let during = format!("copy of {}", src.display());
    for entry in WalkDir::new(src).follow_links(false) {
        interrupt.check(&during)?;
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            dirs.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(&link, &target)
                .with_context(|| format!("Failed to recreate symlink {}", target.display()))?;
        } else if file_type.is_file() {
            let bytes = fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            stats.files += 1;
            stats.bytes += bytes;
            if let Some(pb) = progress {
                pb.set_message(format!("{} files", stats.files));
                pb.tick();
            }
        } else {
            debug!(path = %entry.path().display(), "skipping special file");
        }
    }

    // Directory modes last so read-only dirs don't block their own contents
    for (dir, perms) in dirs.into_iter().rev() {
        fs::set_permissions(&dir, perms)?;
    }

    Ok(stats)
}

/// Copy a single file, creating parent directories
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))
}

/// Remove a file or directory tree
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.with_context(|| format!("Failed to remove {}", path.display()))
}
