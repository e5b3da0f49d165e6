/// Helper utilities for stack-vault

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use std::path::{Path, PathBuf};

use crate::utils::constants::layout;

/// Get the project root directory (where docker-compose.yml is located)
///
/// Resolution order: explicit path, `STACK_VAULT_PROJECT_ROOT`, saved
/// configuration, nearest ancestor of the current directory holding a
/// compose file, then the current directory itself.
pub fn get_project_root(explicit: Option<&Path>, saved: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(project_root) = std::env::var("STACK_VAULT_PROJECT_ROOT") {
        let path = PathBuf::from(project_root);
        if path.is_dir() {
            return Ok(path);
        }
    }

    if let Some(path) = saved {
        if path.join(layout::STACK_DEFINITION).exists() {
            return Ok(path.to_path_buf());
        }
    }

    let current_dir = std::env::current_dir()
        .context("Failed to get current directory")?;

    let mut dir = current_dir.as_path();
    loop {
        if dir.join(layout::STACK_DEFINITION).exists() {
            return Ok(dir.to_path_buf());
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    Ok(current_dir)
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Timestamp fragment used in snapshot ids and set-aside names
pub fn timestamp_id(now: DateTime<Local>) -> String {
    now.format(layout::ID_FORMAT).to_string()
}

/// Recover the creation time encoded in a snapshot file or directory name
pub fn parse_snapshot_timestamp(name: &str) -> Option<DateTime<Local>> {
    let stem = name.strip_suffix(layout::ARCHIVE_SUFFIX).unwrap_or(name);
    let stamp = stem.strip_prefix(layout::SNAPSHOT_PREFIX)?;
    let stamp = stamp.get(..15)?;

    let naive = NaiveDateTime::parse_from_str(stamp, layout::ID_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Find an executable on PATH
pub fn find_in_path(tool: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Validate domain name (basic check)
pub fn is_valid_domain(domain: &str) -> bool {
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() < 2 {
        return false;
    }

    parts.iter().all(|part| {
        !part.is_empty()
        && part.chars().all(|c| c.is_alphanumeric() || c == '-')
        && !part.starts_with('-')
        && !part.ends_with('-')
    })
}

/// Check if a directory exists and this process can create files in it
///
/// Mode bits alone say nothing about ownership, so this tries an anonymous
/// temp file instead.
pub fn is_dir_writable<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    path.is_dir() && tempfile::tempfile_in(path).is_ok()
}

/// Spinner for long copies; hidden when stderr is not a terminal
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} ({elapsed})") {
        pb.set_style(style);
    }
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3661), "1h 1m");
        assert_eq!(format_duration(86400), "1d 0h");
    }

    #[test]
    fn test_snapshot_timestamp_roundtrip() {
        let parsed = parse_snapshot_timestamp("backup_20240131_235959.tar.gz").unwrap();
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.month(), 1);
        assert_eq!(parsed.day(), 31);

        assert!(parse_snapshot_timestamp("backup_20240131_235959_2").is_some());
        assert!(parse_snapshot_timestamp("notes.txt").is_none());
        assert!(parse_snapshot_timestamp("backup_garbage").is_none());
    }


    #[test]
    fn test_is_valid_domain() {
        assert!(is_valid_domain("media.example.com"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("-bad.example.com"));
    }

    #[test]
    fn test_explicit_project_root_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = get_project_root(Some(dir.path()), None).unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn test_is_dir_writable_tries_a_real_file() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let dir = tempfile::tempdir().unwrap();
        assert!(is_dir_writable(dir.path()));
        assert!(!is_dir_writable(dir.path().join("missing")));

        let file = dir.path().join("owner.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(!is_dir_writable(&file));

        // Permission bits do not bind root
        let running_as_root = std::fs::metadata(&file).unwrap().uid() == 0;
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        assert_eq!(is_dir_writable(&locked), running_as_root);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
