/// Migration Orchestrator
///
/// Sequences snapshot, transfer, restore and validation for local, remote
/// and manual moves. It never builds or restores anything itself; it decides
/// what runs next, asks the operator at the checkpoints and writes the
/// report.

use anyhow::Result;
use chrono::{DateTime, Local};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::report;
use crate::core::restore::{RestoreEngine, RestoreOptions, RestoreOutcome};
use crate::core::snapshot::{SnapshotBuilder, SnapshotOptions, SnapshotOutcome};
use crate::core::storage;
use crate::core::supervisor::StackSupervisor;
use crate::core::transport::{shell_quote, Destination, TransferReport, Transport, COMPANION_BINARY};
use crate::core::validator::{Band, Outcome, ValidationMode, Validator};
use crate::error::{Issue, VaultError};
use crate::utils::{find_in_path, format_bytes, is_dir_writable, Interrupt, Prompter, VaultConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    Local,
    Remote,
    Manual,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::Local => "local",
            MigrationType::Remote => "remote",
            MigrationType::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" => Some(MigrationType::Local),
            "remote" => Some(MigrationType::Remote),
            "manual" => Some(MigrationType::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    ValidatePrerequisites,
    GatherPlan,
    ConfirmPlan,
    BuildSnapshot,
    Transfer,
    Restore,
    Validate,
    Report,
    Cleanup,
}

impl MigrationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStage::ValidatePrerequisites => "validate-prerequisites",
            MigrationStage::GatherPlan => "gather-plan",
            MigrationStage::ConfirmPlan => "confirm-plan",
            MigrationStage::BuildSnapshot => "build-snapshot",
            MigrationStage::Transfer => "transfer",
            MigrationStage::Restore => "restore",
            MigrationStage::Validate => "validate",
            MigrationStage::Report => "report",
            MigrationStage::Cleanup => "cleanup",
        }
    }
}

/// Stage after `stage`; manual migrations stop after the transfer step
pub fn next_stage(kind: MigrationType, stage: MigrationStage, validate: bool) -> Option<MigrationStage> {
    use MigrationStage::*;
    let manual = kind == MigrationType::Manual;
    match stage {
        ValidatePrerequisites => Some(GatherPlan),
        GatherPlan => Some(ConfirmPlan),
        ConfirmPlan => Some(BuildSnapshot),
        BuildSnapshot => Some(Transfer),
        Transfer if manual => Some(Report),
        Transfer => Some(Restore),
        Restore if validate => Some(Validate),
        Restore => Some(Report),
        Validate => Some(Report),
        Report if manual => None,
        Report => Some(Cleanup),
        Cleanup => None,
    }
}

/// What the operator asked for on the command line; gaps are prompted
#[derive(Debug, Clone, Default)]
pub struct MigrationRequest {
    pub kind: Option<MigrationType>,
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub remote_host: Option<String>,
    pub include_bulk_data: Option<bool>,
    pub skip_validation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub kind: MigrationType,
    pub source: PathBuf,
    /// Local target directory, or the directory on the remote host
    pub destination: Option<PathBuf>,
    pub remote_host: Option<String>,
    pub include_bulk_data: bool,
    pub run_validation: bool,
    pub cleanup_local: bool,
}

impl MigrationPlan {
    pub fn destination_label(&self) -> String {
        match (self.kind, &self.remote_host, &self.destination) {
            (MigrationType::Manual, _, _) => "manual transfer".to_string(),
            (MigrationType::Remote, Some(host), Some(path)) => format!("`{}:{}`", host, path.display()),
            (_, _, Some(path)) => format!("`{}`", path.display()),
            _ => "(unset)".to_string(),
        }
    }

    fn transport_destination(&self) -> Result<Destination> {
        let missing = || VaultError::StageFailed {
            stage: MigrationStage::Transfer.as_str().to_string(),
            reason: "destination is not set".to_string(),
        };
        Ok(match self.kind {
            MigrationType::Manual => Destination::Manual,
            MigrationType::Local => Destination::Local(self.destination.clone().ok_or_else(missing)?),
            MigrationType::Remote => Destination::Remote {
                host: self.remote_host.clone().ok_or_else(missing)?,
                path: self.destination.clone().ok_or_else(missing)?,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
    pub total: usize,
    pub band: Option<Band>,
    pub report_file: Option<PathBuf>,
}

impl ValidationSummary {
    pub fn summary(&self) -> String {
        match self.band {
            Some(band) => format!(
                "{}/{} passed, {} warnings, {} failed ({})",
                self.passed,
                self.total,
                self.warned,
                self.failed,
                band.label()
            ),
            None if self.failed > 0 => "remote validation reported failures".to_string(),
            None => "remote validation passed".to_string(),
        }
    }
}

/// Everything one migration did, for the report
#[derive(Debug, Clone)]
pub struct MigrationRun {
    pub started_at: DateTime<Local>,
    pub plan: Option<MigrationPlan>,
    pub completed: Vec<MigrationStage>,
    pub failed: Option<(MigrationStage, String)>,
    pub interrupted: Option<MigrationStage>,
    pub snapshot: Option<SnapshotOutcome>,
    pub transfer: Option<TransferReport>,
    pub restore: Option<RestoreOutcome>,
    pub remote_restore: Option<String>,
    pub validation: Option<ValidationSummary>,
    pub issues: Vec<Issue>,
    pub cleaned_up: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

impl MigrationRun {
    pub fn new() -> Self {
        Self {
            started_at: Local::now(),
            plan: None,
            completed: Vec::new(),
            failed: None,
            interrupted: None,
            snapshot: None,
            transfer: None,
            restore: None,
            remote_restore: None,
            validation: None,
            issues: Vec::new(),
            cleaned_up: None,
            report_path: None,
        }
    }

    /// Files holding plaintext secrets that the operator must delete
    pub fn sensitive_artifacts(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let exported = self.snapshot.as_ref().and_then(|s| s.secrets_export.as_ref().map(|e| (s, e)));
        if let Some((snapshot, export)) = exported {
            if self.cleaned_up.is_none() {
                // Relative paths name a member of the archive
                paths.push(match export.is_absolute() {
                    true => export.clone(),
                    false => snapshot.location.join(export),
                });
            }
            if let Some(copy) = self.transfer.as_ref().and_then(|t| t.delivered_snapshot()) {
                if matches!(self.transfer.as_ref().map(|t| &t.destination), Some(Destination::Local(_))) {
                    paths.push(PathBuf::from(copy));
                }
            }
        }
        if let Some(review) = self.restore.as_ref().and_then(|r| r.secrets_review.clone()) {
            paths.push(review);
        }
        paths
    }

    pub fn succeeded(&self) -> bool {
        self.failed.is_none()
            && self.interrupted.is_none()
            && self.validation.as_ref().map(|v| v.failed == 0).unwrap_or(true)
    }
}

impl Default for MigrationRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates the supervisor for a stack directory (the destination of a local move)
pub type SupervisorFactory<'a> =
    Box<dyn Fn(&VaultConfig) -> Result<Box<dyn StackSupervisor>> + Send + Sync + 'a>;

pub struct Orchestrator<'a> {
    config: &'a VaultConfig,
    prompter: &'a dyn Prompter,
    source_supervisor: Option<&'a dyn StackSupervisor>,
    target_supervisor: Option<SupervisorFactory<'a>>,
    transport: Transport,
    interrupt: Interrupt,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a VaultConfig, prompter: &'a dyn Prompter) -> Self {
        Self {
            config,
            prompter,
            source_supervisor: None,
            target_supervisor: None,
            transport: Transport::new(config.probe_timeout()),
            interrupt: Interrupt::default(),
        }
    }

    /// Shared with the snapshot and restore engines this run drives
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_source_supervisor(mut self, supervisor: &'a dyn StackSupervisor) -> Self {
        self.source_supervisor = Some(supervisor);
        self
    }

    pub fn with_target_supervisor(mut self, factory: SupervisorFactory<'a>) -> Self {
        self.target_supervisor = Some(factory);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Run the workflow; the returned run is also written as a report
    ///
    /// Declining the plan returns `VaultError::Declined` and writes nothing.
    /// Any other failure writes a partial report naming the failed stage.
    pub async fn run(&self, request: MigrationRequest) -> Result<MigrationRun> {
        let mut run = MigrationRun::new();
        let mut kind = request.kind.unwrap_or(MigrationType::Local);
        let mut validate = !request.skip_validation;
        let mut stage = Some(MigrationStage::ValidatePrerequisites);

        while let Some(current) = stage {
            info!(stage = current.as_str(), "migration stage");
            let result = if self.interrupt.is_raised() {
                None
            } else {
                Some(self.run_stage(current, &request, &mut run).await)
            };
            let result = result.filter(|_| !self.interrupt.is_raised());

            let Some(result) = result else {
                warn!(stage = current.as_str(), "migration interrupted");
                run.interrupted = Some(current);
                self.write_report(&mut run);
                return Err(VaultError::Interrupted(current.as_str().to_string()).into());
            };

            if let Err(e) = result {
                if VaultError::is_declined(&e) && current == MigrationStage::ConfirmPlan {
                    return Err(e);
                }
                run.failed = Some((current, format!("{:#}", e)));
                self.write_report(&mut run);
                return Err(e);
            }

            run.completed.push(current);
            let cleaned = current == MigrationStage::Cleanup && run.cleaned_up.is_some();
            if current == MigrationStage::Report || cleaned {
                self.write_report(&mut run);
            }
            if let Some(plan) = &run.plan {
                kind = plan.kind;
                validate = plan.run_validation;
            }
            stage = next_stage(kind, current, validate);
        }

        Ok(run)
    }

    fn write_report(&self, run: &mut MigrationRun) {
        let dir = run
            .plan
            .as_ref()
            .map(|p| p.source.clone())
            .or_else(|| self.config.project_root().ok().map(Path::to_path_buf));
        if let Some(dir) = dir {
            match report::write(run, &dir) {
                Ok(path) => run.report_path = Some(path),
                Err(e) => warn!(error = %e, "could not write migration report"),
            }
        }
    }

    async fn run_stage(
        &self,
        stage: MigrationStage,
        request: &MigrationRequest,
        run: &mut MigrationRun,
    ) -> Result<()> {
        match stage {
            MigrationStage::ValidatePrerequisites => self.validate_prerequisites(request, run),
            MigrationStage::GatherPlan => {
                run.plan = Some(self.gather_plan(request)?);
                Ok(())
            }
            MigrationStage::ConfirmPlan => self.confirm_plan(run),
            MigrationStage::BuildSnapshot => self.build_snapshot(run).await,
            MigrationStage::Transfer => self.transfer(run).await,
            MigrationStage::Restore => self.restore(run).await,
            MigrationStage::Validate => self.validate(run).await,
            // Written by the loop once the stage is marked complete, and
            // rewritten if cleanup removes anything it lists
            MigrationStage::Report => Ok(()),
            MigrationStage::Cleanup => self.cleanup(run),
        }
    }

    fn source_root(&self, request: &MigrationRequest) -> Result<PathBuf> {
        match &request.source {
            Some(path) => Ok(path.clone()),
            None => Ok(self.config.project_root()?.to_path_buf()),
        }
    }

    fn validate_prerequisites(&self, request: &MigrationRequest, run: &mut MigrationRun) -> Result<()> {
        let stage = MigrationStage::ValidatePrerequisites.as_str();
        let source = self.source_root(request)?;

        let config_tree = source.join(&self.config.config_dir);
        if !config_tree.is_dir() {
            return Err(VaultError::MissingConfiguration(config_tree).into());
        }
        if !source.join(&self.config.compose_file).is_file() {
            run.issues.push(Issue::warning(stage, "source has no stack definition"));
        }

        let backups = self.config.for_project(&source).backup_root()?;
        let writable_parent = backups
            .ancestors()
            .find(|p| p.exists())
            .map(is_dir_writable)
            .unwrap_or(false);
        if !writable_parent {
            return Err(VaultError::StageFailed {
                stage: stage.to_string(),
                reason: format!("cannot write snapshots under {}", backups.display()),
            }
            .into());
        }

        if request.kind == Some(MigrationType::Remote) {
            for tool in ["ssh", "scp"] {
                if find_in_path(tool).is_none() {
                    return Err(VaultError::MissingTool(tool.to_string()).into());
                }
            }
        }
        Ok(())
    }

    fn gather_plan(&self, request: &MigrationRequest) -> Result<MigrationPlan> {
        let failed = |reason: &str| VaultError::StageFailed {
            stage: MigrationStage::GatherPlan.as_str().to_string(),
            reason: reason.to_string(),
        };

        let kind = match request.kind {
            Some(kind) => kind,
            None => {
                let answer = self.prompter.ask("Migration type (local/remote/manual)", "local")?;
                MigrationType::parse(&answer).ok_or_else(|| failed("unknown migration type"))?
            }
        };
        let source = self.source_root(request)?;

        let (destination, remote_host) = match kind {
            MigrationType::Manual => (request.destination.clone(), None),
            MigrationType::Local => {
                let dest = match &request.destination {
                    Some(d) => d.clone(),
                    None => PathBuf::from(self.prompter.ask("Destination directory", "")?),
                };
                if dest.as_os_str().is_empty() {
                    return Err(failed("a destination directory is required").into());
                }
                if dest == source {
                    return Err(failed("destination is the source directory").into());
                }
                (Some(dest), None)
            }
            MigrationType::Remote => {
                let host = match &request.remote_host {
                    Some(h) => h.clone(),
                    None => self.prompter.ask("Remote host (user@host)", "")?,
                };
                if host.trim().is_empty() {
                    return Err(failed("a remote host is required").into());
                }
                let dest = match &request.destination {
                    Some(d) => d.clone(),
                    None => PathBuf::from(
                        self.prompter
                            .ask("Directory on the remote host", &source.to_string_lossy())?,
                    ),
                };
                (Some(dest), Some(host))
            }
        };

        let include_bulk_data = match request.include_bulk_data {
            Some(value) => value,
            None => self.prompter.confirm("Include bulk data (media)?", false)?,
        };

        let cleanup_local = kind != MigrationType::Manual
            && self
                .prompter
                .confirm("Offer to delete the local snapshot after a successful restore?", false)?;

        Ok(MigrationPlan {
            kind,
            source,
            destination,
            remote_host,
            include_bulk_data,
            run_validation: !request.skip_validation && kind != MigrationType::Manual,
            cleanup_local,
        })
    }

    fn confirm_plan(&self, run: &MigrationRun) -> Result<()> {
        let plan = run.plan.as_ref().ok_or_else(|| anyhow::anyhow!("no migration plan"))?;

        println!("{}", "Migration plan".bold());
        println!("  {:<22} {}", "Type:", plan.kind.as_str());
        println!("  {:<22} {}", "Source:", plan.source.display());
        println!("  {:<22} {}", "Destination:", plan.destination_label());
        println!("  {:<22} {}", "Include bulk data:", plan.include_bulk_data);
        println!("  {:<22} {}", "Validate afterwards:", plan.run_validation);
        if plan.include_bulk_data {
            let bulk = storage::path_size(&plan.source.join(&self.config.bulk_data_dir));
            println!(
                "  {} bulk data adds about {}",
                "⚠".yellow().bold(),
                format_bytes(bulk)
            );
        }

        if !self.prompter.confirm("Proceed with the migration?", true)? {
            return Err(VaultError::Declined.into());
        }
        Ok(())
    }

    fn plan<'r>(&self, run: &'r MigrationRun) -> Result<&'r MigrationPlan> {
        run.plan.as_ref().ok_or_else(|| anyhow::anyhow!("no migration plan"))
    }

    async fn build_snapshot(&self, run: &mut MigrationRun) -> Result<()> {
        let plan = self.plan(run)?;
        let config = self.config.for_project(&plan.source);
        let options = SnapshotOptions {
            include_bulk_data: plan.include_bulk_data,
            compress: true,
            retention_days: 0,
            migration_metadata: true,
            export_secrets: true,
            anonymize_secrets: false,
        };

        let mut builder = SnapshotBuilder::new(&config).with_interrupt(self.interrupt.clone());
        if let Some(supervisor) = self.source_supervisor {
            builder = builder.with_supervisor(supervisor);
        }
        let outcome = builder.build(&options).await?;

        run.issues.extend(outcome.issues.iter().cloned());
        run.snapshot = Some(outcome);
        Ok(())
    }

    async fn transfer(&self, run: &mut MigrationRun) -> Result<()> {
        let destination = self.plan(run)?.transport_destination()?;
        let snapshot = run
            .snapshot
            .as_ref()
            .map(|s| s.location.clone())
            .ok_or_else(|| anyhow::anyhow!("no snapshot to transfer"))?;

        let report = self.transport.deliver(&snapshot, &destination).await?;
        if let Some(manual) = &report.manual {
            println!("\n{}", "Manual transfer".bold());
            for artifact in &manual.artifacts {
                println!("  copy {}", artifact.display());
            }
            println!("  then, in the target directory, run:");
            println!("    {}", manual.resume_command.green());
        }
        run.transfer = Some(report);
        Ok(())
    }

    async fn restore(&self, run: &mut MigrationRun) -> Result<()> {
        let plan = self.plan(run)?.clone();
        let delivered = run
            .transfer
            .as_ref()
            .and_then(|t| t.delivered_snapshot())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("snapshot was not delivered"))?;
        let destination = plan
            .destination
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no destination"))?;

        if let (MigrationType::Remote, Some(host)) = (plan.kind, &plan.remote_host) {
            let command = remote_command(&destination, &format!("restore --backup {} --yes", shell_quote(&delivered)));
            let output = self.transport.remote_exec(host, &command).await.map_err(|e| {
                VaultError::StageFailed {
                    stage: MigrationStage::Restore.as_str().to_string(),
                    reason: format!("{:#}", e),
                }
            })?;
            run.remote_restore = Some(output);
            return Ok(());
        }

        let target_config = self.config.for_project(&destination);
        let supervisor = self.target_supervisor(&target_config, run);
        let mut engine = RestoreEngine::new(&target_config, self.prompter).with_interrupt(self.interrupt.clone());
        if let Some(supervisor) = supervisor.as_deref() {
            engine = engine.with_supervisor(supervisor);
        }

        let outcome = engine
            .run(RestoreOptions {
                backup: PathBuf::from(delivered),
                destination,
                force: false,
                preconfirmed: true,
                start_services: true,
            })
            .await?;

        run.issues.extend(outcome.issues.iter().cloned());
        run.restore = Some(outcome);
        Ok(())
    }

    fn target_supervisor(&self, target: &VaultConfig, run: &mut MigrationRun) -> Option<Box<dyn StackSupervisor>> {
        let factory = self.target_supervisor.as_ref()?;
        match factory(target) {
            Ok(supervisor) => Some(supervisor),
            Err(e) => {
                run.issues.push(Issue::warning(
                    MigrationStage::Restore.as_str(),
                    format!("no supervisor for the destination stack: {:#}", e),
                ));
                None
            }
        }
    }

    async fn validate(&self, run: &mut MigrationRun) -> Result<()> {
        let plan = self.plan(run)?.clone();
        let destination = plan
            .destination
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no destination"))?;

        if let (MigrationType::Remote, Some(host)) = (plan.kind, &plan.remote_host) {
            let command = remote_command(&destination, "validate --report");
            let summary = match self.transport.remote_exec(host, &command).await {
                Ok(_) => ValidationSummary {
                    passed: 0,
                    warned: 0,
                    failed: 0,
                    total: 0,
                    band: None,
                    report_file: None,
                },
                Err(e) => {
                    run.issues.push(Issue::warning(
                        MigrationStage::Validate.as_str(),
                        format!("remote validation: {:#}", e),
                    ));
                    ValidationSummary {
                        passed: 0,
                        warned: 0,
                        failed: 1,
                        total: 1,
                        band: None,
                        report_file: None,
                    }
                }
            };
            run.validation = Some(summary);
            return Ok(());
        }

        let target_config = self.config.for_project(&destination);
        let supervisor = match self.target_supervisor(&target_config, run) {
            Some(s) => s,
            None => {
                run.issues.push(Issue::warning(
                    MigrationStage::Validate.as_str(),
                    "validation skipped: destination stack cannot be inspected",
                ));
                return Ok(());
            }
        };

        if run.restore.as_ref().map(|r| r.services_started).unwrap_or(false) {
            let wait = self.config.stabilization_wait();
            info!(seconds = wait.as_secs(), "waiting for services to settle");
            tokio::time::sleep(wait).await;
        }

        let report = Validator::new(&target_config, &*supervisor)
            .run(ValidationMode::Full)
            .await?;
        let report_file = report.write_markdown(&destination).ok();
        for result in report.results.iter().filter(|r| r.outcome != Outcome::Pass) {
            run.issues.push(Issue::warning(
                MigrationStage::Validate.as_str(),
                format!("{} {}: {}", result.category.as_str(), result.name, result.detail),
            ));
        }

        run.validation = Some(ValidationSummary {
            passed: report.passed(),
            warned: report.warned(),
            failed: report.failed(),
            total: report.total(),
            band: Some(report.band()),
            report_file,
        });
        Ok(())
    }

    fn cleanup(&self, run: &mut MigrationRun) -> Result<()> {
        let plan = self.plan(run)?;
        let restored = run.restore.is_some() || run.remote_restore.is_some();
        if !plan.cleanup_local || !restored {
            return Ok(());
        }

        let snapshot = match &run.snapshot {
            Some(s) => s.location.clone(),
            None => return Ok(()),
        };
        let question = format!("Delete the local snapshot {}?", snapshot.display());
        if !self.prompter.confirm(&question, false)? {
            return Ok(());
        }

        storage::remove_path(&snapshot)?;
        info!(path = %snapshot.display(), "local snapshot removed");
        run.cleaned_up = Some(snapshot);
        Ok(())
    }
}

/// Command line for the companion binary in a remote stack directory
pub fn remote_command(stack_dir: &Path, subcommand: &str) -> String {
    let dir = shell_quote(&stack_dir.to_string_lossy());
    format!(
        "cd {} && ./{} --project-root {} {}",
        dir, COMPANION_BINARY, dir, subcommand
    )
}

/// Where a manual migration's report tells the operator the artifacts are
pub fn snapshot_location(run: &MigrationRun) -> Option<&Path> {
    run.snapshot.as_ref().map(|s| s.location.as_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::supervisor::{MockStackSupervisor, ServiceStatus, ToolCheck};
    use crate::utils::prompt::ScriptedPrompter;
    use crate::utils::AssumeDefaults;
    use std::fs;

    fn stack(root: &Path) {
        fs::create_dir_all(root.join("config/sonarr")).unwrap();
        fs::create_dir_all(root.join("data/media/movies")).unwrap();
        fs::write(root.join("config/sonarr/config.xml"), "<Config><ApiKey>k3y</ApiKey></Config>").unwrap();
        fs::write(root.join("data/media/movies/film.mkv"), vec![1u8; 512]).unwrap();
        fs::write(root.join("docker-compose.yml"), "services:\n  sonarr: {}\n").unwrap();
        fs::write(root.join(".env"), "PUID=1000\nPGID=1000\nTZ=UTC\n").unwrap();
    }

    fn config(root: &Path) -> VaultConfig {
        let mut config = VaultConfig::default().for_project(root);
        config.stabilization_wait_secs = 0;
        config.http_timeout_secs = 1;
        config
    }

    fn running_target<'a>() -> SupervisorFactory<'a> {
        Box::new(|_: &VaultConfig| {
            let mut mock = MockStackSupervisor::new();
            mock.expect_list_services()
                .returning(|| Ok(vec![ServiceStatus::new("sonarr", true, None)]));
            mock.expect_probe_tools()
                .returning(|| vec![ToolCheck::ok("docker", "Docker version 25.0.0")]);
            mock.expect_stop().returning(|_| Ok(()));
            mock.expect_start().returning(|| Ok(()));
            Ok(Box::new(mock) as Box<dyn StackSupervisor>)
        })
    }

    /// Defaults everywhere, except it agrees to delete the local snapshot
    struct DeletesSnapshot;

    impl Prompter for DeletesSnapshot {
        fn confirm(&self, question: &str, default: bool) -> Result<bool> {
            Ok(default || question.to_lowercase().contains("delete the local snapshot"))
        }

        fn ask(&self, _question: &str, default: &str) -> Result<String> {
            Ok(default.to_string())
        }

        fn is_interactive(&self) -> bool {
            false
        }
    }

    /// Raises the interrupt when `trigger` is asked, otherwise takes defaults
    struct InterruptsAt {
        trigger: &'static str,
        interrupt: Interrupt,
    }

    impl Prompter for InterruptsAt {
        fn confirm(&self, question: &str, default: bool) -> Result<bool> {
            if question.contains(self.trigger) {
                self.interrupt.raise();
            }
            Ok(default)
        }

        fn ask(&self, _question: &str, default: &str) -> Result<String> {
            Ok(default.to_string())
        }

        fn is_interactive(&self) -> bool {
            false
        }
    }

    fn reports_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("migration_report_"))
            .collect()
    }

    fn quiet_transport() -> Transport {
        Transport::new(std::time::Duration::from_secs(1)).with_companions(vec![])
    }

    #[test]
    fn test_next_stage_paths() {
        use MigrationStage::*;
        let walk = |kind, validate| {
            let mut stages = vec![ValidatePrerequisites];
            while let Some(next) = next_stage(kind, *stages.last().unwrap(), validate) {
                stages.push(next);
            }
            stages
        };

        assert_eq!(
            walk(MigrationType::Local, true),
            vec![ValidatePrerequisites, GatherPlan, ConfirmPlan, BuildSnapshot, Transfer, Restore, Validate, Report, Cleanup]
        );
        assert_eq!(
            walk(MigrationType::Remote, false),
            vec![ValidatePrerequisites, GatherPlan, ConfirmPlan, BuildSnapshot, Transfer, Restore, Report, Cleanup]
        );
        assert_eq!(
            walk(MigrationType::Manual, true),
            vec![ValidatePrerequisites, GatherPlan, ConfirmPlan, BuildSnapshot, Transfer, Report]
        );
    }

    #[test]
    fn test_remote_command_quotes_paths() {
        assert_eq!(
            remote_command(Path::new("/srv/media stack"), "validate"),
            "cd '/srv/media stack' && ./stack-vault --project-root '/srv/media stack' validate"
        );
    }

    #[tokio::test]
    async fn test_manual_with_bulk_data_reports_resume_command() {
        let tmp = tempfile::tempdir().unwrap();
        stack(tmp.path());
        let config = config(tmp.path());

        let orchestrator = Orchestrator::new(&config, &AssumeDefaults).with_transport(quiet_transport());
        let run = orchestrator
            .run(MigrationRequest {
                kind: Some(MigrationType::Manual),
                include_bulk_data: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(run.restore.is_none());
        assert!(run.validation.is_none());
        assert!(!run.completed.contains(&MigrationStage::Restore));
        assert!(!run.completed.contains(&MigrationStage::Cleanup));

        let manual = run.transfer.as_ref().unwrap().manual.as_ref().unwrap();
        let report = fs::read_to_string(run.report_path.as_ref().unwrap()).unwrap();
        assert!(report.contains(&manual.resume_command));
        assert!(report.contains("COMPLETED"));

        // The snapshot is still on disk and includes bulk data
        let snapshot = snapshot_location(&run).unwrap();
        assert!(snapshot.exists());
        assert!(run.snapshot.as_ref().unwrap().payload_bytes >= 512);
    }

    #[tokio::test]
    async fn test_declined_plan_has_no_side_effects() {
        let tmp = tempfile::tempdir().unwrap();
        stack(tmp.path());
        let config = config(tmp.path());
        // bulk?, cleanup?, proceed?
        let prompter = ScriptedPrompter::new(&["n", "n", "n"]);

        let err = Orchestrator::new(&config, &prompter)
            .with_transport(quiet_transport())
            .run(MigrationRequest {
                kind: Some(MigrationType::Local),
                destination: Some(tmp.path().join("elsewhere")),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(VaultError::is_declined(&err));
        assert!(!tmp.path().join("backups").exists());
        assert!(!tmp.path().join("elsewhere").exists());
        let reports = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("migration_report_"))
            .count();
        assert_eq!(reports, 0);
    }

    #[tokio::test]
    async fn test_local_migration_end_to_end() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let config = config(src.path());
        let target = dst.path().join("stack");

        let run = Orchestrator::new(&config, &AssumeDefaults)
            .with_transport(quiet_transport())
            .with_target_supervisor(running_target())
            .run(MigrationRequest {
                kind: Some(MigrationType::Local),
                destination: Some(target.clone()),
                include_bulk_data: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(target.join("config/sonarr/config.xml")).unwrap(),
            "<Config><ApiKey>k3y</ApiKey></Config>"
        );
        assert!(!target.join("data").exists());
        assert!(run.restore.as_ref().unwrap().services_started);
        assert!(run.validation.is_some());
        assert!(run.completed.contains(&MigrationStage::Cleanup));

        // Cleanup is never automatic
        assert!(run.cleaned_up.is_none());
        assert!(snapshot_location(&run).unwrap().exists());

        let report = fs::read_to_string(run.report_path.as_ref().unwrap()).unwrap();
        assert!(report.contains("Rotate API keys"));
        assert!(report.contains("secrets_export.txt"));
    }

    #[tokio::test]
    async fn test_cleanup_is_recorded_in_report() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        stack(src.path());
        let config = config(src.path());

        let run = Orchestrator::new(&config, &DeletesSnapshot)
            .with_transport(quiet_transport())
            .with_target_supervisor(running_target())
            .run(MigrationRequest {
                kind: Some(MigrationType::Local),
                destination: Some(dst.path().join("stack")),
                include_bulk_data: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        let removed = run.cleaned_up.clone().unwrap();
        assert!(!removed.exists());
        assert_eq!(reports_in(src.path()).len(), 1);

        let report = fs::read_to_string(run.report_path.as_ref().unwrap()).unwrap();
        assert!(report.contains("## Cleanup"));
        assert!(report.contains(&format!("Local snapshot removed: `{}`", removed.display())));
        // The export inside the deleted archive is no longer listed
        let snapshot_id = &run.snapshot.as_ref().unwrap().id;
        assert!(!report.contains(&removed.join(snapshot_id).display().to_string()));
    }

    #[tokio::test]
    async fn test_interrupt_during_plan_confirmation_writes_interrupted_report() {
        let tmp = tempfile::tempdir().unwrap();
        stack(tmp.path());
        let config = config(tmp.path());
        let interrupt = Interrupt::default();
        let prompter = InterruptsAt {
            trigger: "Proceed with the migration?",
            interrupt: interrupt.clone(),
        };

        let err = Orchestrator::new(&config, &prompter)
            .with_transport(quiet_transport())
            .with_interrupt(interrupt)
            .run(MigrationRequest {
                kind: Some(MigrationType::Local),
                destination: Some(tmp.path().join("elsewhere")),
                include_bulk_data: Some(false),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<VaultError>(),
            Some(VaultError::Interrupted(stage)) if stage == "confirm-plan"
        ));
        assert!(!tmp.path().join("backups").exists());
        let reports = reports_in(tmp.path());
        assert_eq!(reports.len(), 1);
        let text = fs::read_to_string(&reports[0]).unwrap();
        assert!(text.contains("INTERRUPTED during confirm-plan"));
    }

    #[tokio::test]
    async fn test_missing_destination_fails_with_partial_report() {
        let tmp = tempfile::tempdir().unwrap();
        stack(tmp.path());
        let config = config(tmp.path());

        let err = Orchestrator::new(&config, &AssumeDefaults)
            .with_transport(quiet_transport())
            .run(MigrationRequest {
                kind: Some(MigrationType::Local),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<VaultError>(), Some(VaultError::StageFailed { .. })));
        let report = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with("migration_report_"))
            .unwrap();
        let text = fs::read_to_string(report.path()).unwrap();
        assert!(text.contains("FAILED at gather-plan"));
    }
}
