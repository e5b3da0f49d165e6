mod cli;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use colored::Colorize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, warn};

use cli::{Cli, Commands};
use stack_vault::core::migration::{MigrationRequest, Orchestrator, SupervisorFactory};
use stack_vault::core::restore::{RestoreEngine, RestoreOptions};
use stack_vault::core::snapshot::{self, RetentionClass, SnapshotBuilder, SnapshotOptions};
use stack_vault::core::validator::{Outcome, ValidationMode, Validator};
use stack_vault::core::{DockerManager, StackSupervisor};
use stack_vault::error::{Issue, Severity, VaultError};
use stack_vault::utils::{
    format_bytes, format_duration, get_project_root, logging, AssumeDefaults, Interrupt, Prompter,
    TerminalPrompter, VaultConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) if VaultError::is_declined(&e) => {
            println!("Cancelled, nothing was changed.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref(), cli.project_root.as_deref())?;

    match cli.command {
        Commands::BuildSnapshot {
            include_bulk_data,
            no_compress,
            retention_days,
            migration,
            export_secrets,
            anonymize_secrets,
        } => {
            let mut options = SnapshotOptions::from_config(&config);
            options.include_bulk_data = include_bulk_data;
            options.compress = options.compress && !no_compress;
            options.migration_metadata = migration;
            options.export_secrets = export_secrets;
            options.anonymize_secrets = anonymize_secrets;
            if let Some(days) = retention_days {
                options.retention_days = days;
            }
            handle_build_snapshot(&config, &options).await
        }
        Commands::Restore { backup, yes, force } => handle_restore(&config, backup, yes, force).await,
        Commands::Migrate {
            kind,
            source,
            dest,
            remote,
            include_bulk_data,
            skip_validation,
            yes,
        } => {
            let request = MigrationRequest {
                kind,
                source,
                destination: dest,
                remote_host: remote,
                include_bulk_data: include_bulk_data.then_some(true),
                skip_validation,
            };
            handle_migrate(&config, request, yes).await
        }
        Commands::Validate { report, quick } => handle_validate(&config, report, quick).await,
        Commands::ListSnapshots => handle_list_snapshots(&config),
        Commands::Status => handle_status(&config).await,
    }
}

/// Config file, then the project root, then `.env` overrides
fn load_config(path: Option<&Path>, project_root: Option<&Path>) -> Result<VaultConfig> {
    let mut config = VaultConfig::load(path)?;
    let root = get_project_root(project_root, config.project_root.as_deref())?;
    debug!(root = %root.display(), "project root");

    let env_path = root.join(&config.env_file);
    if env_path.is_file() {
        let mut env = HashMap::new();
        for item in dotenv::from_path_iter(&env_path)? {
            let (key, value) = item?;
            env.insert(key, value);
        }
        config.apply_env_overrides(&env)?;
    }

    config.project_root = Some(root);
    config.validate()?;
    Ok(config)
}

fn docker_for(config: &VaultConfig) -> Result<DockerManager> {
    DockerManager::new(config.project_root()?, &config.compose_file, &config.env_file)
}

/// Docker is optional for capture; without it the services are not recorded
fn optional_docker(config: &VaultConfig) -> Option<DockerManager> {
    match docker_for(config) {
        Ok(docker) => Some(docker),
        Err(e) => {
            warn!(error = %e, "docker unavailable, continuing without a supervisor");
            None
        }
    }
}

fn print_issues(issues: &[Issue]) {
    for issue in issues {
        match issue.severity {
            Severity::Warning => println!("  {} {}: {}", "⚠".yellow(), issue.stage, issue.message),
            Severity::Deferred => println!("  {} {}: {}", "!".red().bold(), issue.stage, issue.message),
        }
    }
}

async fn handle_build_snapshot(config: &VaultConfig, options: &SnapshotOptions) -> Result<ExitCode> {
    let docker = optional_docker(config);
    let mut builder = SnapshotBuilder::new(config);
    if let Some(docker) = &docker {
        builder = builder.with_supervisor(docker);
    }

    let outcome = builder.build(options).await?;

    println!("{} Snapshot {} created", "✓".green().bold(), outcome.id.bold());
    println!("  {:<18} {}", "Location:", outcome.location.display());
    println!("  {:<18} {}", "Size:", format_bytes(outcome.size_bytes));
    println!("  {:<18} {}", "Payload:", format_bytes(outcome.payload_bytes));
    if outcome.partial {
        println!("  {:<18} {}", "Partial:", "yes".yellow());
    }
    if let Some(export) = &outcome.secrets_export {
        println!(
            "  {:<18} {} ({} values)",
            "Secrets export:",
            export.display(),
            outcome.secrets_found
        );
    }
    if outcome.anonymized_files > 0 {
        println!("  {:<18} {} files", "Anonymized:", outcome.anonymized_files);
    }
    for removed in &outcome.expired_removed {
        println!("  {} removed expired {}", "-".dimmed(), removed.display());
    }
    print_issues(&outcome.issues);

    Ok(ExitCode::SUCCESS)
}

/// Accept a path as given, else a name inside the backup root
fn resolve_backup(config: &VaultConfig, backup: PathBuf) -> Result<PathBuf> {
    if backup.exists() || backup.is_absolute() {
        return Ok(backup);
    }
    let in_root = config.backup_root()?.join(&backup);
    if in_root.exists() {
        return Ok(in_root);
    }
    Ok(backup)
}

async fn handle_restore(config: &VaultConfig, backup: PathBuf, yes: bool, force: bool) -> Result<ExitCode> {
    let prompter: Box<dyn Prompter> = if yes || force {
        Box::new(AssumeDefaults)
    } else {
        Box::new(TerminalPrompter)
    };
    let backup = resolve_backup(config, backup)?;
    let docker = optional_docker(config);

    let mut engine = RestoreEngine::new(config, prompter.as_ref()).with_interrupt(Interrupt::on_ctrl_c());
    if let Some(docker) = &docker {
        engine = engine.with_supervisor(docker);
    }

    let outcome = engine
        .run(RestoreOptions {
            backup,
            destination: config.project_root()?.to_path_buf(),
            force,
            preconfirmed: force,
            start_services: true,
        })
        .await?;

    println!("{} Restored {} into {}", "✓".green().bold(), outcome.snapshot_id.bold(), outcome.destination.display());
    println!("  {:<18} {}", "Sections:", outcome.restored_sections.join(", "));
    for aside in &outcome.set_aside {
        println!("  {:<18} {}", "Previous copy:", aside.display());
    }
    for change in &outcome.env_changes {
        println!(
            "  {:<18} {}: {} → {}",
            "Environment:",
            change.key,
            change.from.as_deref().unwrap_or("(unset)"),
            change.to
        );
    }
    println!(
        "  {:<18} {}",
        "Services:",
        if outcome.services_started { "started".green() } else { "not started".yellow() }
    );
    print_issues(&outcome.issues);

    Ok(ExitCode::SUCCESS)
}

async fn handle_migrate(config: &VaultConfig, request: MigrationRequest, yes: bool) -> Result<ExitCode> {
    let prompter: Box<dyn Prompter> = if yes {
        Box::new(AssumeDefaults)
    } else {
        Box::new(TerminalPrompter)
    };
    let source_root = request
        .source
        .clone()
        .unwrap_or_else(|| config.project_root().map(Path::to_path_buf).unwrap_or_default());
    let source_config = config.for_project(&source_root);
    let docker = optional_docker(&source_config);

    let factory: SupervisorFactory = Box::new(|target: &VaultConfig| {
        Ok(Box::new(docker_for(target)?) as Box<dyn StackSupervisor>)
    });
    let mut orchestrator = Orchestrator::new(config, prompter.as_ref())
        .with_target_supervisor(factory)
        .with_interrupt(Interrupt::on_ctrl_c());
    if let Some(docker) = &docker {
        orchestrator = orchestrator.with_source_supervisor(docker);
    }

    let run = orchestrator.run(request).await?;

    println!("\n{} Migration finished", "✓".green().bold());
    if let Some(validation) = &run.validation {
        let summary = validation.summary();
        if validation.failed > 0 {
            println!("  {:<18} {}", "Validation:", summary.red());
        } else {
            println!("  {:<18} {}", "Validation:", summary.green());
        }
    }
    if let Some(report) = &run.report_path {
        println!("  {:<18} {}", "Report:", report.display());
    }
    let sensitive = run.sensitive_artifacts();
    if !sensitive.is_empty() {
        println!("\n{}", "Delete these once you no longer need them:".yellow().bold());
        for path in sensitive {
            println!("  {}", path.display());
        }
    }

    Ok(if run.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn handle_validate(config: &VaultConfig, write_report: bool, quick: bool) -> Result<ExitCode> {
    let docker = docker_for(config)?;
    let mode = if quick { ValidationMode::Quick } else { ValidationMode::Full };
    let report = Validator::new(config, &docker).run(mode).await?;

    println!("Stack validation ({})\n", if quick { "quick" } else { "full" });
    println!("{:<16} {:<28} {:<6} {}", "Category", "Check", "Result", "Detail");
    println!("{}", "-".repeat(80));
    for result in &report.results {
        let outcome = match result.outcome {
            Outcome::Pass => "pass".green(),
            Outcome::Warn => "warn".yellow(),
            Outcome::Fail => "fail".red().bold(),
        };
        println!(
            "{:<16} {:<28} {:<6} {}",
            result.category.as_str(),
            result.name,
            outcome,
            result.detail
        );
    }

    println!(
        "\n{} passed, {} warnings, {} failed: {:.0}% ({})",
        report.passed(),
        report.warned(),
        report.failed(),
        report.success_rate() * 100.0,
        report.band().label()
    );

    if write_report {
        let path = report.write_markdown(config.project_root()?)?;
        println!("Report written to {}", path.display());
    }

    Ok(if report.exit_code() == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn handle_list_snapshots(config: &VaultConfig) -> Result<ExitCode> {
    let backup_root = config.backup_root()?;
    let now = Local::now();
    let entries = snapshot::list_snapshots(&backup_root, config.retention_days, now)?;

    if entries.is_empty() {
        println!("No snapshots in {}", backup_root.display());
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<28} {:<10} {:<12} {:<12} {:<10}", "Snapshot", "Form", "Size", "Age", "Retention");
    println!("{}", "-".repeat(76));
    for entry in entries {
        let age = (now - entry.created).num_seconds().max(0) as u64;
        let form = match entry.form {
            snapshot::SnapshotForm::Archive => "archive",
            snapshot::SnapshotForm::Directory => "directory",
        };
        let retention = match entry.retention {
            RetentionClass::Retained => "retained".green(),
            RetentionClass::Expired => "expired".yellow(),
        };
        println!(
            "{:<28} {:<10} {:<12} {:<12} {:<10}",
            entry.id,
            form,
            format_bytes(entry.size_bytes),
            format_duration(age),
            retention
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn handle_status(config: &VaultConfig) -> Result<ExitCode> {
    let docker = docker_for(config)?;
    let services = docker.list_services().await?;

    println!("Stack status ({})\n", docker.project_name());
    println!("{:<25} {:<15} {:<15}", "Service", "Status", "Health");
    println!("{}", "-".repeat(60));

    for service in services {
        let status = if service.running { "running".green() } else { "stopped".red() };
        let health = service.health.map(|h| h.as_str()).unwrap_or("N/A");
        println!("{:<25} {:<15} {:<15}", service.name, status, health);
    }

    Ok(ExitCode::SUCCESS)
}
