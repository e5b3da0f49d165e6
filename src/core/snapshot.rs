/// Snapshot Builder
///
/// Produces exactly one snapshot per call: a `backup_<timestamp>` directory
/// under the backup root, bundled into `<id>.tar.gz` when compression is on.
/// Only a missing configuration tree is fatal. Every other gap is recorded
/// as an issue and the snapshot is marked partial.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Networks, System};
use tracing::{debug, info, warn};

use crate::core::archive;
use crate::core::secrets;
use crate::core::storage::{self, DiskUsage};
use crate::core::supervisor::{ServiceStatus, StackSupervisor, ToolCheck};
use crate::error::{Issue, VaultError};
use crate::utils::{
    format_bytes, layout, parse_snapshot_timestamp, spinner, timestamp_id, Interrupt, VaultConfig,
    RECORDED_ENV_VARS,
};

const STAGE: &str = "snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOptions {
    pub include_bulk_data: bool,
    pub compress: bool,
    /// `<= 0` disables the retention sweep
    pub retention_days: i64,
    pub migration_metadata: bool,
    pub export_secrets: bool,
    pub anonymize_secrets: bool,
}

impl SnapshotOptions {
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            include_bulk_data: false,
            compress: config.compress,
            retention_days: config.retention_days,
            migration_metadata: false,
            export_secrets: false,
            anonymize_secrets: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotForm {
    Archive,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionClass {
    Retained,
    Expired,
}

/// Contents of `backup_info.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub created_at: DateTime<Local>,
    pub hostname: String,
    pub tool_version: String,
    pub source_root: PathBuf,
    pub options: SnapshotOptions,
    pub sections_present: Vec<String>,
    pub sections_missing: Vec<String>,
    pub partial: bool,
    pub issues: Vec<String>,
    pub payload_bytes: u64,
    pub secrets_found: usize,
    pub anonymized_files: usize,
}

/// Contents of `space_requirements.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceRequirements {
    pub config_bytes: u64,
    pub bulk_data_bytes: u64,
    pub payload_bytes: u64,
    pub multiplier: f64,
    pub required_bytes: u64,
    pub bulk_data_included: bool,
}

impl SpaceRequirements {
    pub fn new(config_bytes: u64, bulk_data_bytes: u64, multiplier: f64, bulk: bool) -> Self {
        let payload_bytes = config_bytes + bulk_data_bytes;
        Self {
            config_bytes,
            bulk_data_bytes,
            payload_bytes,
            multiplier,
            required_bytes: (payload_bytes as f64 * multiplier).ceil() as u64,
            bulk_data_included: bulk,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub received_bytes: u64,
    pub transmitted_bytes: u64,
}

/// Contents of `migration_info.json`
#[derive(Debug, Clone, Serialize)]
pub struct MigrationInfo {
    pub captured_at: DateTime<Local>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub hostname: Option<String>,
    pub total_memory_bytes: u64,
    pub tools: Vec<ToolCheck>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub disk_usage: Option<DiskUsage>,
    pub environment: BTreeMap<String, String>,
    pub services: Vec<ServiceStatus>,
    pub minimum_target_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub id: String,
    pub location: PathBuf,
    pub form: SnapshotForm,
    pub size_bytes: u64,
    pub payload_bytes: u64,
    pub partial: bool,
    pub issues: Vec<Issue>,
    /// Export path inside the snapshot, when one was written
    pub secrets_export: Option<PathBuf>,
    pub secrets_found: usize,
    pub anonymized_files: usize,
    pub expired_removed: Vec<PathBuf>,
}

/// A snapshot found in a backup root
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub path: PathBuf,
    pub form: SnapshotForm,
    pub size_bytes: u64,
    pub created: DateTime<Local>,
    pub retention: RetentionClass,
}

pub struct SnapshotBuilder<'a> {
    config: &'a VaultConfig,
    supervisor: Option<&'a dyn StackSupervisor>,
    interrupt: Interrupt,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(config: &'a VaultConfig) -> Self {
        Self {
            config,
            supervisor: None,
            interrupt: Interrupt::default(),
        }
    }

    /// Abandon the tree copies once this is raised
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Supervisor used for the service snapshot in migration metadata
    pub fn with_supervisor(mut self, supervisor: &'a dyn StackSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub async fn build(&self, options: &SnapshotOptions) -> Result<SnapshotOutcome> {
        let source = self.config.project_root()?;
        let config_src = source.join(&self.config.config_dir);
        if !config_src.is_dir() {
            return Err(VaultError::MissingConfiguration(config_src).into());
        }

        let backup_root = self.config.backup_root()?;
        fs::create_dir_all(&backup_root)
            .with_context(|| format!("Failed to create {}", backup_root.display()))?;

        let created_at = Local::now();
        let id = unique_id(&backup_root, created_at);
        let snap = backup_root.join(&id);
        fs::create_dir(&snap).with_context(|| format!("Failed to create {}", snap.display()))?;
        info!(id = %id, source = %source.display(), "building snapshot");

        let mut issues = Vec::new();
        let mut present = Vec::new();
        let mut missing = Vec::new();

        let config_stats =
            match storage::copy_tree_until(&config_src, &snap.join(layout::CONFIGURATION), None, &self.interrupt) {
                Ok(stats) => stats,
                Err(e) => return Err(discard(&snap, e)),
            };
        present.push(layout::CONFIGURATION.to_string());
        debug!(files = config_stats.files, bytes = config_stats.bytes, "configuration copied");

        let mut bulk_bytes = 0;
        if options.include_bulk_data {
            let bulk_src = source.join(&self.config.bulk_data_dir);
            if bulk_src.is_dir() {
                bulk_bytes = copy_bulk(&bulk_src, &snap.join(layout::BULK_DATA), &backup_root, &self.interrupt)
                    .map_err(|e| discard(&snap, e))?;
                present.push(layout::BULK_DATA.to_string());
            } else {
                issues.push(Issue::warning(
                    STAGE,
                    format!("bulk data requested but {} does not exist", bulk_src.display()),
                ));
                missing.push(layout::BULK_DATA.to_string());
            }
        }

        for (name, src, is_dir) in [
            (layout::STACK_DEFINITION, source.join(&self.config.compose_file), false),
            (layout::ENVIRONMENT_VALUES, source.join(&self.config.env_file), false),
            (layout::MANAGEMENT_SCRIPTS, source.join(&self.config.scripts_dir), true),
        ] {
            let copied = match (is_dir, src.exists()) {
                (_, false) => None,
                (true, true) => Some(storage::copy_tree(&src, &snap.join(name), None).map(|_| ())),
                (false, true) => Some(storage::copy_file(&src, &snap.join(name)).map(|_| ())),
            };

            match copied {
                Some(Ok(())) => present.push(name.to_string()),
                Some(Err(e)) => {
                    issues.push(Issue::warning(STAGE, format!("could not copy {}: {:#}", name, e)));
                    missing.push(name.to_string());
                }
                None => {
                    issues.push(Issue::warning(
                        STAGE,
                        format!("{} not found, snapshot will be partial", src.display()),
                    ));
                    missing.push(name.to_string());
                }
            }
        }

        let mut secrets_export = None;
        let mut secrets_found = 0;
        if options.export_secrets {
            let records = secrets::scan_tree(&snap.join(layout::CONFIGURATION), &snap)?;
            let path = snap.join(layout::SECRETS_EXPORT);
            secrets::write_export(&records, &path, &id)?;
            secrets_found = records.len();
            issues.push(Issue::deferred(
                STAGE,
                format!(
                    "{} secret value(s) exported to {}; delete it once the restore is done",
                    secrets_found,
                    layout::SECRETS_EXPORT
                ),
            ));
            secrets_export = Some(path);
        }

        let mut anonymized_files = 0;
        if options.anonymize_secrets {
            let report = secrets::anonymize_tree(&snap.join(layout::CONFIGURATION))?;
            anonymized_files = report.modified.len();
            info!(files = anonymized_files, values = report.replacements, "secrets anonymized");
        }

        let space = SpaceRequirements::new(
            config_stats.bytes,
            bulk_bytes,
            self.config.safety_multiplier,
            options.include_bulk_data,
        );
        write_json(&snap.join(layout::SPACE_REQUIREMENTS), &space)?;

        if options.migration_metadata {
            let info = self.migration_info(&space).await;
            write_json(&snap.join(layout::MIGRATION_INFO), &info)?;
        }

        let partial = !missing.is_empty();
        let info = BackupInfo {
            id: id.clone(),
            created_at,
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            source_root: source.to_path_buf(),
            options: *options,
            sections_present: present,
            sections_missing: missing,
            partial,
            issues: issues.iter().map(|i| i.to_string()).collect(),
            payload_bytes: space.payload_bytes,
            secrets_found,
            anonymized_files,
        };
        write_json(&snap.join(layout::BACKUP_INFO), &info)?;
        fs::write(snap.join(layout::RESTORE_INSTRUCTIONS), restore_instructions(&info))?;

        let (location, form) = if options.compress {
            let archive_path = backup_root.join(format!("{}{}", id, layout::ARCHIVE_SUFFIX));
            compress_or_keep(&snap, &archive_path, &mut issues)
        } else {
            (snap.clone(), SnapshotForm::Directory)
        };

        // The export now lives inside the archive
        if form == SnapshotForm::Archive {
            secrets_export = secrets_export.map(|p| {
                PathBuf::from(&id).join(p.file_name().unwrap_or_default())
            });
        }

        let expired_removed = if options.retention_days > 0 {
            sweep_expired(&backup_root, options.retention_days, Local::now(), &id, &mut issues)?
        } else {
            Vec::new()
        };

        let size_bytes = storage::path_size(&location);
        info!(id = %id, size = %format_bytes(size_bytes), partial, "snapshot complete");

        Ok(SnapshotOutcome {
            id,
            location,
            form,
            size_bytes,
            payload_bytes: space.payload_bytes,
            partial,
            issues,
            secrets_export,
            secrets_found,
            anonymized_files,
            expired_removed,
        })
    }

    async fn migration_info(&self, space: &SpaceRequirements) -> MigrationInfo {
        let mut system = System::new();
        system.refresh_memory();

        let networks = Networks::new_with_refreshed_list();
        let mut network_interfaces = Vec::new();
        for (name, data) in &networks {
            network_interfaces.push(NetworkInterface {
                name: name.clone(),
                received_bytes: data.total_received(),
                transmitted_bytes: data.total_transmitted(),
            });
        }
        network_interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        let (tools, services) = match self.supervisor {
            Some(supervisor) => {
                let tools = supervisor.probe_tools().await;
                let services = supervisor.list_services().await.unwrap_or_else(|e| {
                    warn!(error = %e, "could not list services for migration metadata");
                    Vec::new()
                });
                (tools, services)
            }
            None => (Vec::new(), Vec::new()),
        };

        let disk_usage = self
            .config
            .project_root()
            .ok()
            .and_then(|root| storage::disk_usage(root).ok());

        MigrationInfo {
            captured_at: Local::now(),
            os_name: System::name(),
            os_version: System::os_version(),
            kernel_version: System::kernel_version(),
            hostname: System::host_name(),
            total_memory_bytes: system.total_memory(),
            tools,
            network_interfaces,
            disk_usage,
            environment: filtered_environment(std::env::vars()),
            services,
            minimum_target_bytes: space.required_bytes,
        }
    }
}

/// Drop a half-built snapshot directory and hand back the error
fn discard(snap: &Path, error: anyhow::Error) -> anyhow::Error {
    if let Err(e) = storage::remove_path(snap) {
        warn!(path = %snap.display(), error = %e, "could not remove incomplete snapshot");
    }
    error
}

fn copy_bulk(src: &Path, dst: &Path, backup_root: &Path, interrupt: &Interrupt) -> Result<u64> {
    if backup_root.starts_with(src) {
        anyhow::bail!(
            "backup root {} lies inside the bulk data tree {}",
            backup_root.display(),
            src.display()
        );
    }

    let estimate = storage::path_size(src);
    println!(
        "{} {}",
        "⚠ Including bulk data:".yellow().bold(),
        format!("{} from {} will be copied", format_bytes(estimate), src.display()).yellow()
    );
    warn!(path = %src.display(), bytes = estimate, "copying bulk data");

    let pb = spinner("Copying bulk data");
    let stats = storage::copy_tree_until(src, dst, Some(&pb), interrupt);
    pb.finish_and_clear();
    Ok(stats?.bytes)
}

fn bundle(dir: &Path, archive_path: &Path) -> Result<PathBuf> {
    let pb = spinner("Compressing snapshot");
    let result = archive::compress_dir(dir, archive_path).and_then(|_| archive::verify(archive_path, dir));
    pb.finish_and_clear();

    if let Err(e) = result {
        let _ = fs::remove_file(archive_path);
        return Err(e);
    }

    storage::remove_path(dir)?;
    Ok(archive_path.to_path_buf())
}

/// Bundle `snap`, falling back to the directory as the deliverable
fn compress_or_keep(snap: &Path, archive_path: &Path, issues: &mut Vec<Issue>) -> (PathBuf, SnapshotForm) {
    match bundle(snap, archive_path) {
        Ok(archive) => (archive, SnapshotForm::Archive),
        Err(e) => {
            warn!(error = %e, "compression failed, keeping directory");
            issues.push(Issue::warning(
                STAGE,
                format!("compression failed ({:#}); the directory {} is the deliverable", e, snap.display()),
            ));
            (snap.to_path_buf(), SnapshotForm::Directory)
        }
    }
}

/// Snapshot id for `now`, suffixed `_N` if the name is taken
pub fn unique_id(backup_root: &Path, now: DateTime<Local>) -> String {
    let base = format!("{}{}", layout::SNAPSHOT_PREFIX, timestamp_id(now));
    let taken = |id: &str| {
        backup_root.join(id).exists()
            || backup_root.join(format!("{}{}", id, layout::ARCHIVE_SUFFIX)).exists()
    };

    if !taken(&base) {
        return base;
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|id| !taken(id))
        .unwrap_or(base)
}

/// Keep only the environment variables worth recording
pub fn filtered_environment<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(k, _)| RECORDED_ENV_VARS.contains(&k.as_str()))
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn restore_instructions(info: &BackupInfo) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Restoring {}\n\n", info.id));
    out.push_str(&format!(
        "Created {} on {} from `{}`.\n\n",
        info.created_at.format("%Y-%m-%d %H:%M:%S"),
        info.hostname,
        info.source_root.display()
    ));
    if info.partial {
        out.push_str(&format!(
            "**Partial snapshot.** Missing sections: {}\n\n",
            info.sections_missing.join(", ")
        ));
    }
    out.push_str("## Steps\n\n");
    out.push_str("1. Copy this snapshot and the `stack-vault` binary to the target host.\n");
    out.push_str("2. Change into the directory that should hold the stack.\n");
    out.push_str(&format!(
        "3. Run `stack-vault restore --backup {}{}`.\n",
        info.id,
        if info.options.compress { layout::ARCHIVE_SUFFIX } else { "" }
    ));
    out.push_str("4. Review `.env` values (PUID, PGID, TZ, DOMAIN) for the new host.\n");
    out.push_str("5. Run `stack-vault validate` once the services are up.\n");
    if info.options.export_secrets {
        out.push_str(&format!(
            "\n`{}` holds live credentials. Delete it after use.\n",
            layout::SECRETS_EXPORT
        ));
    }
    if info.options.anonymize_secrets {
        out.push_str(
            "\nSecrets in `config/` were replaced with PLACEHOLDER_* values. \
             The `.original` files next to them hold the real values.\n",
        );
    }
    out
}

/// Snapshots under `backup_root`, newest first
pub fn list_snapshots(
    backup_root: &Path,
    retention_days: i64,
    now: DateTime<Local>,
) -> Result<Vec<SnapshotEntry>> {
    if !backup_root.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(backup_root)
        .with_context(|| format!("Failed to read {}", backup_root.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(layout::SNAPSHOT_PREFIX) {
            continue;
        }

        let form = if path.is_dir() {
            SnapshotForm::Directory
        } else if name.ends_with(layout::ARCHIVE_SUFFIX) {
            SnapshotForm::Archive
        } else {
            continue;
        };

        let created = match parse_snapshot_timestamp(&name) {
            Some(ts) => ts,
            None => match entry.metadata().and_then(|m| m.modified()) {
                Ok(mtime) => DateTime::<Local>::from(mtime),
                Err(_) => continue,
            },
        };

        let expired = retention_days > 0 && now.signed_duration_since(created).num_days() >= retention_days;

        entries.push(SnapshotEntry {
            id: name.trim_end_matches(layout::ARCHIVE_SUFFIX).to_string(),
            size_bytes: storage::path_size(&path),
            path,
            form,
            created,
            retention: if expired { RetentionClass::Expired } else { RetentionClass::Retained },
        });
    }

    entries.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(entries)
}

fn sweep_expired(
    backup_root: &Path,
    retention_days: i64,
    now: DateTime<Local>,
    keep_id: &str,
    issues: &mut Vec<Issue>,
) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in list_snapshots(backup_root, retention_days, now)? {
        if entry.retention != RetentionClass::Expired || entry.id == keep_id {
            continue;
        }
        match storage::remove_path(&entry.path) {
            Ok(()) => {
                info!(path = %entry.path.display(), "removed expired snapshot");
                removed.push(entry.path);
            }
            Err(e) => issues.push(Issue::warning(
                "retention",
                format!("could not remove {}: {:#}", entry.path.display(), e),
            )),
        }
    }
    Ok(removed)
}
