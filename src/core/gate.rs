/// Integrity & Capacity Gate
///
/// Runs before anything at the destination is touched. A snapshot whose
/// table of contents cannot be read, or a target without room for it, stops
/// the restore here.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::archive;
use crate::core::snapshot::{BackupInfo, SnapshotForm, SpaceRequirements};
use crate::core::storage;
use crate::error::{Issue, VaultError};
use crate::utils::{format_bytes, layout};

/// What the gate learned about a snapshot without extracting it
#[derive(Debug, Clone)]
pub struct SnapshotInspection {
    pub path: PathBuf,
    pub id: String,
    pub form: SnapshotForm,
    /// Size on disk of the archive or directory
    pub stored_bytes: u64,
    /// `configuration` + `bulk_data` as found in the snapshot
    pub payload_bytes: u64,
    pub has_bulk_data: bool,
    pub bulk_data_bytes: u64,
    /// Top-level entries of the snapshot, sorted
    pub sections: Vec<String>,
    pub space_requirements: Option<SpaceRequirements>,
    pub backup_info: Option<BackupInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Sufficient,
    Insufficient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityBasis {
    /// Payload size recorded by the source in `space_requirements.json`
    RecordedRequirement,
    ArchiveSize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityReport {
    pub basis: CapacityBasis,
    pub base_bytes: u64,
    pub multiplier: f64,
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub verdict: Verdict,
}

pub fn evaluate(required: u64, available: u64) -> Verdict {
    if available >= required {
        Verdict::Sufficient
    } else {
        Verdict::Insufficient
    }
}

impl CapacityReport {
    pub fn new(basis: CapacityBasis, base_bytes: u64, multiplier: f64, available_bytes: u64) -> Self {
        let required_bytes = (base_bytes as f64 * multiplier).ceil() as u64;
        Self {
            basis,
            base_bytes,
            multiplier,
            required_bytes,
            available_bytes,
            verdict: evaluate(required_bytes, available_bytes),
        }
    }

    /// Refuse an insufficient verdict unless the operator overrode it
    pub fn ensure(&self, force: bool) -> Result<Option<Issue>> {
        match (self.verdict, force) {
            (Verdict::Sufficient, _) => Ok(None),
            (Verdict::Insufficient, false) => Err(VaultError::InsufficientCapacity {
                required: self.required_bytes,
                available: self.available_bytes,
            }
            .into()),
            (Verdict::Insufficient, true) => {
                warn!(
                    required = self.required_bytes,
                    available = self.available_bytes,
                    "capacity check overridden"
                );
                Ok(Some(Issue::warning(
                    "capacity",
                    format!(
                        "proceeding with {} available for {} required (override)",
                        format_bytes(self.available_bytes),
                        format_bytes(self.required_bytes)
                    ),
                )))
            }
        }
    }
}

/// Validate a snapshot's structure without extracting it
pub fn inspect_snapshot(path: &Path) -> Result<SnapshotInspection> {
    if !path.exists() {
        return Err(VaultError::BackupNotFound(path.to_path_buf()).into());
    }

    if path.is_dir() {
        inspect_directory(path)
    } else if archive::is_archive(path) {
        inspect_archive(path)
    } else {
        Err(VaultError::InvalidSnapshot {
            path: path.to_path_buf(),
            reason: format!("expected a directory or a {} archive", layout::ARCHIVE_SUFFIX),
        }
        .into())
    }
}

fn inspect_directory(path: &Path) -> Result<SnapshotInspection> {
    let config = path.join(layout::CONFIGURATION);
    if !config.is_dir() {
        return Err(VaultError::InvalidSnapshot {
            path: path.to_path_buf(),
            reason: format!("no {}/ section", layout::CONFIGURATION),
        }
        .into());
    }

    let bulk = path.join(layout::BULK_DATA);
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(SnapshotInspection {
        path: path.to_path_buf(),
        id,
        form: SnapshotForm::Directory,
        stored_bytes: storage::path_size(path),
        payload_bytes: storage::path_size(&config) + storage::path_size(&bulk),
        has_bulk_data: bulk.is_dir(),
        bulk_data_bytes: storage::path_size(&bulk),
        sections: directory_sections(path)?,
        space_requirements: read_json_file(&path.join(layout::SPACE_REQUIREMENTS)),
        backup_info: read_json_file(&path.join(layout::BACKUP_INFO)),
    })
}

fn inspect_archive(path: &Path) -> Result<SnapshotInspection> {
    let toc = archive::read_toc(path)?;
    let id = archive::toc_root(&toc).ok_or_else(|| VaultError::InvalidSnapshot {
        path: path.to_path_buf(),
        reason: "archive has no top-level directory".to_string(),
    })?;

    let root = PathBuf::from(&id);
    let config = root.join(layout::CONFIGURATION);
    let bulk = root.join(layout::BULK_DATA);

    if !toc.iter().any(|e| e.path.starts_with(&config)) {
        return Err(VaultError::InvalidSnapshot {
            path: path.to_path_buf(),
            reason: format!("no {}/ section", layout::CONFIGURATION),
        }
        .into());
    }

    let payload_bytes = toc
        .iter()
        .filter(|e| e.is_file && (e.path.starts_with(&config) || e.path.starts_with(&bulk)))
        .map(|e| e.size)
        .sum();
    let has_bulk_data = toc.iter().any(|e| e.path.starts_with(&bulk));
    let bulk_data_bytes = toc
        .iter()
        .filter(|e| e.is_file && e.path.starts_with(&bulk))
        .map(|e| e.size)
        .sum();
    let mut sections: Vec<String> = toc
        .iter()
        .filter_map(|e| e.path.strip_prefix(&root).ok())
        .filter_map(|rest| rest.components().next())
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    sections.sort();
    sections.dedup();

    let stored_bytes = fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();

    Ok(SnapshotInspection {
        path: path.to_path_buf(),
        id,
        form: SnapshotForm::Archive,
        stored_bytes,
        payload_bytes,
        has_bulk_data,
        bulk_data_bytes,
        sections,
        space_requirements: read_json_member(path, &root.join(layout::SPACE_REQUIREMENTS)),
        backup_info: read_json_member(path, &root.join(layout::BACKUP_INFO)),
    })
}

fn directory_sections(path: &Path) -> Result<Vec<String>> {
    let mut sections = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("Failed to read {}", path.display()))? {
        sections.push(entry?.file_name().to_string_lossy().into_owned());
    }
    sections.sort();
    Ok(sections)
}

fn read_json_member<T: serde::de::DeserializeOwned>(archive: &Path, member: &Path) -> Option<T> {
    let raw = archive::read_member(archive, member).ok()??;
    serde_json::from_slice(&raw).ok()
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Compare what the snapshot needs with free space at `destination`
pub fn check_capacity(
    inspection: &SnapshotInspection,
    destination: &Path,
    multiplier: f64,
) -> Result<CapacityReport> {
    let (basis, base) = match &inspection.space_requirements {
        Some(space) => (CapacityBasis::RecordedRequirement, space.payload_bytes),
        None => (CapacityBasis::ArchiveSize, inspection.stored_bytes),
    };

    let usage = storage::disk_usage(destination)?;
    let report = CapacityReport::new(basis, base, multiplier, usage.available_bytes);

    info!(
        required = %format_bytes(report.required_bytes),
        available = %format_bytes(report.available_bytes),
        verdict = ?report.verdict,
        "capacity check"
    );
    Ok(report)
}
