/// Restore Engine
///
/// Stages run strictly in order:
///
/// `Prerequisites → BackupExisting → StopExisting → ExtractPayload →
/// ReconcileEnvironment → RestoreSecretsReview → ApplyOwnership →
/// StartServices → Report`
///
/// Nothing at the destination changes before `Prerequisites` (integrity,
/// capacity, go/no-go) has passed, and no file is overwritten while the
/// target stack is still running. There is no rollback. Set-aside copies and
/// the recorded issues are what an operator recovers from.

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::archive;
use crate::core::config::EnvFile;
use crate::core::gate::{self, CapacityReport, SnapshotInspection};
use crate::core::snapshot::SnapshotForm;
use crate::core::storage;
use crate::core::supervisor::{any_running, StackSupervisor};
use crate::error::{Issue, VaultError};
use crate::utils::{
    format_bytes, layout, timestamp_id, Identity, Interrupt, Prompter, VaultConfig, SENSITIVE_FILE_EXTENSIONS,
    SENSITIVE_FILE_NAMES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    Prerequisites,
    BackupExisting,
    StopExisting,
    ExtractPayload,
    ReconcileEnvironment,
    RestoreSecretsReview,
    ApplyOwnership,
    StartServices,
    Report,
}

impl RestoreStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStage::Prerequisites => "prerequisites",
            RestoreStage::BackupExisting => "backup-existing",
            RestoreStage::StopExisting => "stop-existing",
            RestoreStage::ExtractPayload => "extract-payload",
            RestoreStage::ReconcileEnvironment => "reconcile-environment",
            RestoreStage::RestoreSecretsReview => "secrets-review",
            RestoreStage::ApplyOwnership => "apply-ownership",
            RestoreStage::StartServices => "start-services",
            RestoreStage::Report => "report",
        }
    }

    pub fn next(self) -> Option<Self> {
        use RestoreStage::*;
        match self {
            Prerequisites => Some(BackupExisting),
            BackupExisting => Some(StopExisting),
            StopExisting => Some(ExtractPayload),
            ExtractPayload => Some(ReconcileEnvironment),
            ReconcileEnvironment => Some(RestoreSecretsReview),
            RestoreSecretsReview => Some(ApplyOwnership),
            ApplyOwnership => Some(StartServices),
            StartServices => Some(Report),
            Report => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub backup: PathBuf,
    pub destination: PathBuf,
    /// Proceed past an insufficient capacity verdict
    pub force: bool,
    /// The caller already asked the go/no-go question
    pub preconfirmed: bool,
    pub start_services: bool,
}

/// An environment value the operator chose to change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvOverride {
    pub key: String,
    pub from: Option<String>,
    pub to: String,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    pub snapshot_id: String,
    pub destination: PathBuf,
    pub completed: Vec<RestoreStage>,
    pub capacity: Option<CapacityReport>,
    pub set_aside: Vec<PathBuf>,
    pub restored_sections: Vec<String>,
    pub env_changes: Vec<EnvOverride>,
    pub secrets_review: Option<PathBuf>,
    pub services_started: bool,
    pub issues: Vec<Issue>,
}

/// Changes implied by the operator's answers, in answer order
pub fn plan_env_overrides(
    current: &HashMap<String, String>,
    answers: &[(String, String)],
) -> Vec<EnvOverride> {
    answers
        .iter()
        .filter(|(_, answer)| !answer.trim().is_empty())
        .filter_map(|(key, answer)| {
            let answer = answer.trim();
            let from = current.get(key).cloned();
            if from.as_deref() == Some(answer) {
                None
            } else {
                Some(EnvOverride {
                    key: key.clone(),
                    from,
                    to: answer.to_string(),
                })
            }
        })
        .collect()
}

/// Where each snapshot section lands in the destination
struct SectionTarget {
    name: &'static str,
    target: PathBuf,
    bulk: bool,
}

struct RestoreState {
    options: RestoreOptions,
    inspection: Option<SnapshotInspection>,
    staging: Option<TempDir>,
    snapshot_root: Option<PathBuf>,
    /// Operator's answer to the bulk data question
    restore_bulk: bool,
    restored_paths: Vec<PathBuf>,
    outcome: RestoreOutcome,
}

pub struct RestoreEngine<'a> {
    config: &'a VaultConfig,
    prompter: &'a dyn Prompter,
    supervisor: Option<&'a dyn StackSupervisor>,
    interrupt: Interrupt,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(config: &'a VaultConfig, prompter: &'a dyn Prompter) -> Self {
        Self {
            config,
            prompter,
            supervisor: None,
            interrupt: Interrupt::default(),
        }
    }

    /// Stop at the next stage boundary or copied entry once this is raised
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Supervisor of the stack at the destination
    pub fn with_supervisor(mut self, supervisor: &'a dyn StackSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub async fn run(&self, options: RestoreOptions) -> Result<RestoreOutcome> {
        let mut state = RestoreState {
            outcome: RestoreOutcome {
                destination: options.destination.clone(),
                ..Default::default()
            },
            options,
            inspection: None,
            staging: None,
            snapshot_root: None,
            restore_bulk: false,
            restored_paths: Vec::new(),
        };

        let mut stage = Some(RestoreStage::Prerequisites);
        while let Some(current) = stage {
            self.interrupt.check(current.as_str())?;
            info!(stage = current.as_str(), "restore stage");
            let result = self.run_stage(current, &mut state).await;
            if self.interrupt.is_raised() {
                warn!(stage = current.as_str(), "restore interrupted");
                return Err(VaultError::Interrupted(current.as_str().to_string()).into());
            }
            result?;
            state.outcome.completed.push(current);
            stage = current.next();
        }

        Ok(state.outcome)
    }

    async fn run_stage(&self, stage: RestoreStage, state: &mut RestoreState) -> Result<()> {
        match stage {
            RestoreStage::Prerequisites => self.prerequisites(state),
            RestoreStage::BackupExisting => self.backup_existing(state),
            RestoreStage::StopExisting => self.stop_existing(state).await,
            RestoreStage::ExtractPayload => self.extract_payload(state),
            RestoreStage::ReconcileEnvironment => self.reconcile_environment(state),
            RestoreStage::RestoreSecretsReview => self.secrets_review(state),
            RestoreStage::ApplyOwnership => {
                self.apply_ownership(state);
                Ok(())
            }
            RestoreStage::StartServices => self.start_services(state).await,
            RestoreStage::Report => {
                // Dropping the staging dir removes it
                state.staging.take();
                info!(
                    snapshot = %state.outcome.snapshot_id,
                    sections = state.outcome.restored_sections.len(),
                    issues = state.outcome.issues.len(),
                    "restore complete"
                );
                Ok(())
            }
        }
    }

    fn sections(&self, dest: &Path) -> Vec<SectionTarget> {
        vec![
            SectionTarget {
                name: layout::CONFIGURATION,
                target: dest.join(&self.config.config_dir),
                bulk: false,
            },
            SectionTarget {
                name: layout::BULK_DATA,
                target: dest.join(&self.config.bulk_data_dir),
                bulk: true,
            },
            SectionTarget {
                name: layout::STACK_DEFINITION,
                target: dest.join(&self.config.compose_file),
                bulk: false,
            },
            SectionTarget {
                name: layout::ENVIRONMENT_VALUES,
                target: dest.join(&self.config.env_file),
                bulk: false,
            },
            SectionTarget {
                name: layout::MANAGEMENT_SCRIPTS,
                target: dest.join(&self.config.scripts_dir),
                bulk: false,
            },
        ]
    }

    fn prerequisites(&self, state: &mut RestoreState) -> Result<()> {
        let options = &state.options;
        let inspection = gate::inspect_snapshot(&options.backup)?;
        state.outcome.snapshot_id = inspection.id.clone();

        if let Some(info) = &inspection.backup_info {
            if info.partial {
                state.outcome.issues.push(Issue::warning(
                    RestoreStage::Prerequisites.as_str(),
                    format!("snapshot is partial, missing: {}", info.sections_missing.join(", ")),
                ));
            }
        }

        let capacity = gate::check_capacity(&inspection, &options.destination, self.config.safety_multiplier)?;
        if let Some(issue) = capacity.ensure(options.force)? {
            state.outcome.issues.push(issue);
        }
        state.outcome.capacity = Some(capacity);

        if !options.preconfirmed {
            let question = format!(
                "Restore {} ({}) into {}?",
                inspection.id,
                format_bytes(inspection.payload_bytes),
                options.destination.display()
            );
            if !self.prompter.confirm(&question, true)? {
                return Err(VaultError::Declined.into());
            }
        }

        state.inspection = Some(inspection);
        Ok(())
    }

    /// Sections of the snapshot that will replace what is at the destination
    fn incoming_sections(&self, state: &RestoreState) -> Vec<SectionTarget> {
        let present = state
            .inspection
            .as_ref()
            .map(|i| i.sections.clone())
            .unwrap_or_default();
        self.sections(&state.options.destination)
            .into_iter()
            .filter(|s| present.iter().any(|p| p == s.name))
            .filter(|s| !s.bulk || state.restore_bulk)
            .collect()
    }

    fn backup_existing(&self, state: &mut RestoreState) -> Result<()> {
        let (has_bulk, bulk_bytes) = state
            .inspection
            .as_ref()
            .map(|i| (i.has_bulk_data, i.bulk_data_bytes))
            .context("snapshot was not inspected")?;

        if has_bulk {
            let question = format!(
                "Snapshot contains {} of bulk data. Restore it too?",
                format_bytes(bulk_bytes)
            );
            state.restore_bulk = self.prompter.confirm(&question, true)?;
            if !state.restore_bulk {
                state.outcome.issues.push(Issue::warning(
                    RestoreStage::ExtractPayload.as_str(),
                    "bulk data not restored",
                ));
            }
        }

        let existing: Vec<PathBuf> = self
            .incoming_sections(state)
            .into_iter()
            .map(|s| s.target)
            .filter(|t| t.symlink_metadata().is_ok())
            .collect();

        if existing.is_empty() {
            debug!("nothing to set aside");
            return Ok(());
        }

        let suffix = format!(".pre-restore-{}", timestamp_id(Local::now()));
        let question = format!(
            "{} existing item(s) found. Set them aside as *{} before restoring?",
            existing.len(),
            suffix
        );
        if !self.prompter.confirm(&question, true)? {
            state.outcome.issues.push(Issue::warning(
                RestoreStage::BackupExisting.as_str(),
                "existing files were not set aside and will be overwritten",
            ));
            return Ok(());
        }

        for path in existing {
            let mut aside = path.clone().into_os_string();
            aside.push(&suffix);
            let aside = PathBuf::from(aside);
            fs::rename(&path, &aside).with_context(|| {
                format!("Failed to set aside {} as {}", path.display(), aside.display())
            })?;
            info!(from = %path.display(), to = %aside.display(), "set aside");
            state.outcome.set_aside.push(aside);
        }
        Ok(())
    }

    async fn stop_existing(&self, state: &mut RestoreState) -> Result<()> {
        let supervisor = match self.supervisor {
            Some(s) => s,
            None => return Ok(()),
        };

        let running = match any_running(supervisor).await {
            Ok(running) => running,
            Err(e) => {
                state.outcome.issues.push(Issue::warning(
                    RestoreStage::StopExisting.as_str(),
                    format!("could not query the target stack: {:#}", e),
                ));
                false
            }
        };
        if !running {
            return Ok(());
        }

        if !self.prompter.confirm("The target stack is running. Stop it before overwriting?", true)? {
            return Err(VaultError::Declined.into());
        }

        supervisor.stop(true).await.map_err(|e| VaultError::StageFailed {
            stage: RestoreStage::StopExisting.as_str().to_string(),
            reason: format!("{:#}", e),
        })?;
        Ok(())
    }

    fn extract_payload(&self, state: &mut RestoreState) -> Result<()> {
        let inspection = state
            .inspection
            .as_ref()
            .context("snapshot was not inspected")?;
        let dest = state.options.destination.clone();
        fs::create_dir_all(&dest).with_context(|| format!("Failed to create {}", dest.display()))?;

        let root = match inspection.form {
            SnapshotForm::Directory => inspection.path.clone(),
            SnapshotForm::Archive => {
                let work = dest.join(layout::WORK_DIR);
                fs::create_dir_all(&work)?;
                let staging = tempfile::Builder::new()
                    .prefix("staging-")
                    .tempdir_in(&work)
                    .context("Failed to create staging directory")?;
                let root = archive::extract(&inspection.path, staging.path())?;
                state.staging = Some(staging);
                root
            }
        };

        if !root.join(layout::CONFIGURATION).is_dir() {
            return Err(VaultError::InvalidSnapshot {
                path: inspection.path.clone(),
                reason: format!("no {}/ section after extraction", layout::CONFIGURATION),
            }
            .into());
        }

        let stage = RestoreStage::ExtractPayload.as_str();
        for section in self.sections(&dest) {
            let src = root.join(section.name);
            if !src.exists() {
                if !section.bulk {
                    state.outcome.issues.push(Issue::warning(
                        stage,
                        format!("{} not in snapshot, skipped", section.name),
                    ));
                }
                continue;
            }

            if section.bulk && !state.restore_bulk {
                continue;
            }

            storage::remove_path(&section.target)?;
            if src.is_dir() {
                storage::copy_tree_until(&src, &section.target, None, &self.interrupt)?;
            } else {
                storage::copy_file(&src, &section.target)?;
            }
            debug!(section = section.name, target = %section.target.display(), "restored");
            state.outcome.restored_sections.push(section.name.to_string());
            state.restored_paths.push(section.target);
        }

        state.snapshot_root = Some(root);
        Ok(())
    }

    fn reconcile_environment(&self, state: &mut RestoreState) -> Result<()> {
        let stage = RestoreStage::ReconcileEnvironment.as_str();
        let env_path = state.options.destination.join(&self.config.env_file);
        if !env_path.exists() {
            return Ok(());
        }

        if !self.prompter.is_interactive() {
            state.outcome.issues.push(Issue::deferred(
                stage,
                format!(
                    "review {} in {} for this host",
                    self.config.reconcile_keys.join(", "),
                    env_path.display()
                ),
            ));
            return Ok(());
        }

        let mut env = EnvFile::load(&env_path)?;
        let mut answers = Vec::new();
        for key in &self.config.reconcile_keys {
            let current = env.get(key).unwrap_or("").to_string();
            answers.push((key.clone(), self.prompter.ask(key, &current)?));
        }

        let changes = plan_env_overrides(&env.to_map(), &answers);
        if changes.is_empty() {
            return Ok(());
        }
        for change in &changes {
            env.set(change.key.clone(), change.to.clone());
        }
        env.save()?;
        for problem in env.validate() {
            state.outcome.issues.push(Issue::warning(stage, problem));
        }

        info!(changed = changes.len(), "environment reconciled");
        state.outcome.env_changes = changes;
        Ok(())
    }

    fn secrets_review(&self, state: &mut RestoreState) -> Result<()> {
        let export = match &state.snapshot_root {
            Some(root) => root.join(layout::SECRETS_EXPORT),
            None => return Ok(()),
        };
        if !export.is_file() {
            return Ok(());
        }

        let review = state
            .options
            .destination
            .join(layout::WORK_DIR)
            .join(layout::SECRETS_EXPORT);
        storage::copy_file(&export, &review)?;
        fs::set_permissions(&review, fs::Permissions::from_mode(0o600))?;

        state.outcome.issues.push(Issue::deferred(
            RestoreStage::RestoreSecretsReview.as_str(),
            format!(
                "secret values from the source are in {}; re-enter what you need, then delete it",
                review.display()
            ),
        ));
        state.outcome.secrets_review = Some(review);
        Ok(())
    }

    fn apply_ownership(&self, state: &mut RestoreState) {
        let stage = RestoreStage::ApplyOwnership.as_str();
        let (failed, first_error) = apply_owner(&state.restored_paths, self.config.owner);
        if failed > 0 {
            state.outcome.issues.push(Issue::warning(
                stage,
                format!(
                    "could not change ownership of {} path(s) to {}:{} ({})",
                    failed,
                    self.config.owner.uid,
                    self.config.owner.gid,
                    first_error.unwrap_or_default()
                ),
            ));
        }

        let config_dir = state.options.destination.join(&self.config.config_dir);
        for path in sensitive_files(&config_dir) {
            if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o600)) {
                state.outcome.issues.push(Issue::warning(
                    stage,
                    format!("could not restrict {}: {}", path.display(), e),
                ));
            }
        }
    }

    async fn start_services(&self, state: &mut RestoreState) -> Result<()> {
        let supervisor = match self.supervisor {
            Some(s) if state.options.start_services => s,
            _ => return Ok(()),
        };

        if !self.prompter.confirm("Start the stack now?", true)? {
            return Ok(());
        }

        match supervisor.start().await {
            Ok(()) => state.outcome.services_started = true,
            Err(e) => state.outcome.issues.push(Issue::warning(
                RestoreStage::StartServices.as_str(),
                format!("stack did not start: {:#}", e),
            )),
        }
        Ok(())
    }
}

/// Recursively chown `paths`; returns the failure count and first error
pub fn apply_owner(paths: &[PathBuf], owner: Identity) -> (usize, Option<String>) {
    let mut failed = 0;
    let mut first_error = None;

    for root in paths {
        for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            let meta = match entry.path().symlink_metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.uid() == owner.uid && meta.gid() == owner.gid {
                continue;
            }
            if let Err(e) = lchown(entry.path(), Some(owner.uid), Some(owner.gid)) {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    (failed, first_error)
}

/// TLS material and similar files that must stay owner-only
pub fn sensitive_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let ext = p.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
            SENSITIVE_FILE_NAMES.contains(&name.as_str())
                || SENSITIVE_FILE_EXTENSIONS.contains(&ext.as_str())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::{SnapshotBuilder, SnapshotOptions};
    use crate::core::supervisor::{MockStackSupervisor, ServiceStatus};
    use crate::utils::prompt::ScriptedPrompter;
    use crate::utils::AssumeDefaults;
    use mockall::predicate::eq;

    fn stack(root: &Path) {
        fs::create_dir_all(root.join("config/sonarr")).unwrap();
        fs::create_dir_all(root.join("config/bazarr/config")).unwrap();
        fs::create_dir_all(root.join("config/traefik")).unwrap();
        fs::write(root.join("config/sonarr/config.xml"), "<Config><Port>8989</Port></Config>").unwrap();
        fs::write(root.join("config/bazarr/config/config.yaml"), "auth:\n  password: hunter2\n").unwrap();
        fs::write(root.join("config/traefik/acme.json"), "{}").unwrap();
        fs::set_permissions(root.join("config/traefik/acme.json"), fs::Permissions::from_mode(0o644)).unwrap();
        fs::write(root.join("docker-compose.yml"), "services: {}\n").unwrap();
        fs::write(root.join(".env"), "PUID=1000\nPGID=1000\nTZ=UTC\n").unwrap();
    }

    async fn snapshot(root: &Path, opts: SnapshotOptions) -> PathBuf {
        let config = VaultConfig::default().for_project(root);
        SnapshotBuilder::new(&config).build(&opts).await.unwrap().location
    }

    fn snap_options() -> SnapshotOptions {
        SnapshotOptions {
            include_bulk_data: false,
            compress: true,
            retention_days: 0,
            migration_metadata: false,
            export_secrets: false,
            anonymize_secrets: false,
        }
    }

    fn restore_options(backup: PathBuf, destination: PathBuf) -> RestoreOptions {
        RestoreOptions {
            backup,
            destination,
            force: false,
            preconfirmed: false,
            start_services: true,
        }
    }

    fn tree_bytes(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut files: Vec<_> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_stage_order() {
        let mut stage = Some(RestoreStage::Prerequisites);
        let mut order = Vec::new();
        while let Some(s) = stage {
            order.push(s);
            stage = s.next();
        }
        assert_eq!(order.len(), 9);
        assert_eq!(order.first(), Some(&RestoreStage::Prerequisites));
        assert_eq!(order.last(), Some(&RestoreStage::Report));
        let extract = order.iter().position(|s| *s == RestoreStage::ExtractPayload).unwrap();
        let stop = order.iter().position(|s| *s == RestoreStage::StopExisting).unwrap();
        let owner = order.iter().position(|s| *s == RestoreStage::ApplyOwnership).unwrap();
        let start = order.iter().position(|s| *s == RestoreStage::StartServices).unwrap();
        assert!(stop < extract && extract < owner && owner < start);
    }

    #[test]
    fn test_plan_env_overrides() {
        let current = HashMap::from([
            ("PUID".to_string(), "1000".to_string()),
            ("TZ".to_string(), "UTC".to_string()),
        ]);
        let answers = vec![
            ("PUID".to_string(), "1000".to_string()),
            ("TZ".to_string(), "Europe/Paris".to_string()),
            ("DOMAIN".to_string(), "".to_string()),
            ("LOCAL_NETWORK".to_string(), "192.168.1.0/24".to_string()),
        ];
        let plan = plan_env_overrides(&current, &answers);
        assert_eq!(
            plan,
            vec![
                EnvOverride {
                    key: "TZ".into(),
                    from: Some("UTC".into()),
                    to: "Europe/Paris".into()
                },
                EnvOverride {
                    key: "LOCAL_NETWORK".into(),
                    from: None,
                    to: "192.168.1.0/24".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_reproduces_configuration() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let config = VaultConfig::default();
        let target = dst.path().join("stack");
        let outcome = RestoreEngine::new(&config, &AssumeDefaults)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.completed.len(), 9);
        assert_eq!(tree_bytes(&src.path().join("config")), tree_bytes(&target.join("config")));
        assert_eq!(
            fs::read(src.path().join(".env")).unwrap(),
            fs::read(target.join(".env")).unwrap()
        );
        assert!(outcome.restored_sections.contains(&"config".to_string()));
        assert!(outcome.issues.iter().any(|i| i.message.contains("scripts")));

        let mode = fs::metadata(target.join("config/traefik/acme.json")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // Staging is cleaned up
        let work = target.join(layout::WORK_DIR);
        assert!(!work.exists() || fs::read_dir(&work).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_missing_backup_leaves_destination_untouched() {
        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("stack");
        let config = VaultConfig::default();

        let err = RestoreEngine::new(&config, &AssumeDefaults)
            .run(restore_options(dst.path().join("backup_nope.tar.gz"), target.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<VaultError>(), Some(VaultError::BackupNotFound(_))));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_insufficient_capacity_requires_force() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let mut config = VaultConfig::default();
        config.safety_multiplier = 1.0e15;
        let target = dst.path().join("stack");

        let err = RestoreEngine::new(&config, &AssumeDefaults)
            .run(restore_options(backup.clone(), target.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VaultError>(),
            Some(VaultError::InsufficientCapacity { .. })
        ));
        assert!(!target.exists());

        let mut forced = restore_options(backup, target.clone());
        forced.force = true;
        let outcome = RestoreEngine::new(&config, &AssumeDefaults).run(forced).await.unwrap();
        assert!(outcome.issues.iter().any(|i| i.stage == "capacity"));
        assert!(target.join("config/sonarr/config.xml").exists());
    }

    #[tokio::test]
    async fn test_declined_go_no_go_changes_nothing() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let config = VaultConfig::default();
        let prompter = ScriptedPrompter::new(&["n"]);
        let target = dst.path().join("stack");
        let err = RestoreEngine::new(&config, &prompter)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap_err();

        assert!(VaultError::is_declined(&err));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_anonymized_snapshot_restores_placeholders_and_siblings() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let mut opts = snap_options();
        opts.anonymize_secrets = true;
        opts.export_secrets = true;
        let backup = snapshot(src.path(), opts).await;

        let config = VaultConfig::default();
        let target = dst.path().join("stack");
        let outcome = RestoreEngine::new(&config, &AssumeDefaults)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap();

        let yaml = target.join("config/bazarr/config/config.yaml");
        assert_eq!(fs::read_to_string(&yaml).unwrap(), "auth:\n  password: PLACEHOLDER_PASSWORD\n");
        assert_eq!(
            fs::read_to_string(target.join("config/bazarr/config/config.yaml.original")).unwrap(),
            "auth:\n  password: hunter2\n"
        );

        let review = outcome.secrets_review.unwrap();
        assert_eq!(review, target.join(".stack-vault/secrets_export.txt"));
        assert_eq!(fs::metadata(&review).unwrap().permissions().mode() & 0o777, 0o600);
        assert!(outcome
            .issues
            .iter()
            .any(|i| i.severity == crate::error::Severity::Deferred));
    }

    #[tokio::test]
    async fn test_existing_tree_is_set_aside_and_stack_cycled() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let target = dst.path().to_path_buf();
        fs::create_dir_all(target.join("config")).unwrap();
        fs::write(target.join("config/stale.txt"), "old").unwrap();

        let mut mock = MockStackSupervisor::new();
        mock.expect_list_services()
            .returning(|| Ok(vec![ServiceStatus::new("sonarr", true, None)]));
        mock.expect_stop().with(eq(true)).times(1).returning(|_| Ok(()));
        mock.expect_start().times(1).returning(|| Ok(()));

        let config = VaultConfig::default();
        let outcome = RestoreEngine::new(&config, &AssumeDefaults)
            .with_supervisor(&mock)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.set_aside.len(), 1);
        assert!(outcome.set_aside[0].join("stale.txt").exists());
        assert!(!target.join("config/stale.txt").exists());
        assert!(outcome.services_started);
    }

    #[tokio::test]
    async fn test_failed_stop_aborts_before_overwrite() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let target = dst.path().to_path_buf();
        let mut mock = MockStackSupervisor::new();
        mock.expect_list_services()
            .returning(|| Ok(vec![ServiceStatus::new("sonarr", true, None)]));
        mock.expect_stop()
            .returning(|_| Err(anyhow::anyhow!("daemon went away")));
        mock.expect_start().never();

        let config = VaultConfig::default();
        let err = RestoreEngine::new(&config, &AssumeDefaults)
            .with_supervisor(&mock)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<VaultError>(), Some(VaultError::StageFailed { .. })));
        assert!(!target.join("config").exists());
    }

    #[tokio::test]
    async fn test_interactive_environment_reconciliation() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let config = VaultConfig::default();
        // PUID, PGID, TZ, DOMAIN, LOCAL_NETWORK
        let prompter = ScriptedPrompter::new(&["", "", "Europe/Berlin", "", ""]);
        let mut options = restore_options(backup, dst.path().join("stack"));
        options.preconfirmed = true;

        let outcome = RestoreEngine::new(&config, &prompter).run(options).await.unwrap();
        assert_eq!(outcome.env_changes.len(), 1);
        assert_eq!(
            fs::read_to_string(dst.path().join("stack/.env")).unwrap(),
            "PUID=1000\nPGID=1000\nTZ=Europe/Berlin\n"
        );
    }

    #[tokio::test]
    async fn test_sections_missing_from_snapshot_stay_in_place() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let target = dst.path().to_path_buf();
        fs::create_dir_all(target.join("data/media/movies")).unwrap();
        fs::write(target.join("data/media/movies/film.mkv"), "frames").unwrap();
        fs::create_dir_all(target.join("scripts")).unwrap();
        fs::write(target.join("scripts/update.sh"), "#!/bin/sh\n").unwrap();
        fs::create_dir_all(target.join("config")).unwrap();

        let config = VaultConfig::default();
        let outcome = RestoreEngine::new(&config, &AssumeDefaults)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(target.join("data/media/movies/film.mkv")).unwrap(), "frames");
        assert!(target.join("scripts/update.sh").exists());
        assert_eq!(outcome.set_aside.len(), 1);
        assert!(outcome.set_aside[0].to_string_lossy().contains("config.pre-restore-"));
        assert!(!outcome.restored_sections.contains(&"data".to_string()));
    }

    #[tokio::test]
    async fn test_declined_bulk_data_keeps_existing_library() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        fs::create_dir_all(src.path().join("data/media/tv")).unwrap();
        fs::write(src.path().join("data/media/tv/episode.mkv"), "source frames").unwrap();
        let mut opts = snap_options();
        opts.include_bulk_data = true;
        let backup = snapshot(src.path(), opts).await;

        let target = dst.path().to_path_buf();
        fs::create_dir_all(target.join("data/media/movies")).unwrap();
        fs::write(target.join("data/media/movies/film.mkv"), "frames").unwrap();

        let config = VaultConfig::default();
        // go/no-go, bulk data
        let prompter = ScriptedPrompter::new(&["y", "n"]);
        let outcome = RestoreEngine::new(&config, &prompter)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap();

        let asked = prompter.asked.lock().unwrap().clone();
        assert!(asked[1].contains("bulk data"));
        assert!(target.join("data/media/movies/film.mkv").exists());
        assert!(!target.join("data/media/tv/episode.mkv").exists());
        assert!(outcome.set_aside.iter().all(|p| !p.to_string_lossy().contains("data.pre-restore-")));
        assert!(!outcome.restored_sections.contains(&"data".to_string()));
        assert!(outcome.issues.iter().any(|i| i.message == "bulk data not restored"));
        assert!(target.join("config/sonarr/config.xml").exists());
    }

    #[tokio::test]
    async fn test_accepted_bulk_data_sets_library_aside() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        fs::create_dir_all(src.path().join("data/media/tv")).unwrap();
        fs::write(src.path().join("data/media/tv/episode.mkv"), "source frames").unwrap();
        let mut opts = snap_options();
        opts.include_bulk_data = true;
        let backup = snapshot(src.path(), opts).await;

        let target = dst.path().to_path_buf();
        fs::create_dir_all(target.join("data/media/movies")).unwrap();
        fs::write(target.join("data/media/movies/film.mkv"), "frames").unwrap();

        let config = VaultConfig::default();
        let outcome = RestoreEngine::new(&config, &AssumeDefaults)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(target.join("data/media/tv/episode.mkv")).unwrap(),
            "source frames"
        );
        let aside = outcome
            .set_aside
            .iter()
            .find(|p| p.to_string_lossy().contains("data.pre-restore-"))
            .unwrap();
        assert!(aside.join("media/movies/film.mkv").exists());
        assert!(outcome.restored_sections.contains(&"data".to_string()));
    }

    /// Raises the interrupt at the first question, then takes the default
    struct InterruptingPrompter(Interrupt);

    impl Prompter for InterruptingPrompter {
        fn confirm(&self, _question: &str, default: bool) -> Result<bool> {
            self.0.raise();
            Ok(default)
        }

        fn ask(&self, _question: &str, default: &str) -> Result<String> {
            self.0.raise();
            Ok(default.to_string())
        }

        fn is_interactive(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_interrupt_at_go_no_go_stops_before_extraction() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let backup = snapshot(src.path(), snap_options()).await;

        let interrupt = Interrupt::default();
        let prompter = InterruptingPrompter(interrupt.clone());
        let config = VaultConfig::default();
        let target = dst.path().join("stack");
        let err = RestoreEngine::new(&config, &prompter)
            .with_interrupt(interrupt)
            .run(restore_options(backup, target.clone()))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<VaultError>(),
            Some(VaultError::Interrupted(stage)) if stage == "prerequisites"
        ));
        assert!(!target.join("config").exists());
    }

    #[test]
    fn test_sensitive_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("certs")).unwrap();
        fs::write(tmp.path().join("certs/server.key"), "k").unwrap();
        fs::write(tmp.path().join("certs/chain.PEM"), "p").unwrap();
        fs::write(tmp.path().join("acme.json"), "{}").unwrap();
        fs::write(tmp.path().join("config.xml"), "<x/>").unwrap();
        assert_eq!(sensitive_files(tmp.path()).len(), 3);
    }
}
