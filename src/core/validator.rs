/// Post-Operation Validator
///
/// Runs a battery of checks against a stack directory and its supervisor.
/// Every check appends exactly one row to the report; nothing is counted
/// outside it.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use reqwest::Client;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::config::EnvFile;
use crate::core::docker::parse_compose_services;
use crate::core::storage;
use crate::core::supervisor::{HealthState, ServiceStatus, StackSupervisor};
use crate::utils::{
    is_dir_writable, timestamp_id, ServiceSpec, VaultConfig, REQUIRED_ENV_KEYS,
    SQLITE_SIGNATURE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Warn,
    Fail,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Warn => "warn",
            Outcome::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Prerequisite,
    Environment,
    Directory,
    ServiceRunning,
    ServiceHealth,
    Connectivity,
    ConfigFile,
    Database,
    MediaLibrary,
    PortConflict,
    DiskSpace,
    LeftoverSecrets,
}

impl CheckCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckCategory::Prerequisite => "prerequisite",
            CheckCategory::Environment => "environment",
            CheckCategory::Directory => "directory",
            CheckCategory::ServiceRunning => "service running",
            CheckCategory::ServiceHealth => "service health",
            CheckCategory::Connectivity => "http",
            CheckCategory::ConfigFile => "config file",
            CheckCategory::Database => "database",
            CheckCategory::MediaLibrary => "media library",
            CheckCategory::PortConflict => "port",
            CheckCategory::DiskSpace => "disk space",
            CheckCategory::LeftoverSecrets => "secrets",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub category: CheckCategory,
    pub name: String,
    pub outcome: Outcome,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Quick,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Excellent,
    Good,
    NeedsAttention,
    SignificantIssues,
}

impl Band {
    pub fn label(&self) -> &'static str {
        match self {
            Band::Excellent => "excellent",
            Band::Good => "good",
            Band::NeedsAttention => "needs attention",
            Band::SignificantIssues => "significant issues",
        }
    }
}

/// Display band for a success rate in `0.0..=1.0`
pub fn band(rate: f64) -> Band {
    if rate >= 0.90 {
        Band::Excellent
    } else if rate >= 0.75 {
        Band::Good
    } else if rate >= 0.50 {
        Band::NeedsAttention
    } else {
        Band::SignificantIssues
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub mode: ValidationMode,
    pub project_root: PathBuf,
    pub started_at: DateTime<Local>,
    pub results: Vec<CheckResult>,
    /// A prerequisite failed and the remaining checks were skipped
    pub halted: bool,
}

impl ValidationReport {
    pub fn new(mode: ValidationMode, project_root: &Path) -> Self {
        Self {
            mode,
            project_root: project_root.to_path_buf(),
            started_at: Local::now(),
            results: Vec::new(),
            halted: false,
        }
    }

    pub fn record(
        &mut self,
        category: CheckCategory,
        name: impl Into<String>,
        outcome: Outcome,
        detail: impl Into<String>,
    ) {
        let result = CheckResult {
            category,
            name: name.into(),
            outcome,
            detail: detail.into(),
        };
        debug!(category = category.as_str(), name = %result.name, outcome = outcome.as_str(), "check");
        self.results.push(result);
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Outcome::Pass)
    }

    pub fn warned(&self) -> usize {
        self.count(Outcome::Warn)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Fail)
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.passed() as f64 / self.total() as f64
        }
    }

    pub fn band(&self) -> Band {
        band(self.success_rate())
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 {
            1
        } else {
            0
        }
    }

    pub fn in_category(&self, category: CheckCategory) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(move |r| r.category == category)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Stack Validation Report\n\n");
        out.push_str(&format!("- Project: `{}`\n", self.project_root.display()));
        out.push_str(&format!("- Run at: {}\n", self.started_at.format("%Y-%m-%d %H:%M:%S")));
        out.push_str(&format!("- Mode: {:?}\n", self.mode));
        out.push_str(&format!(
            "- Result: {} passed, {} warnings, {} failed of {} ({:.0}%, {})\n",
            self.passed(),
            self.warned(),
            self.failed(),
            self.total(),
            self.success_rate() * 100.0,
            self.band().label()
        ));
        if self.halted {
            out.push_str("- Prerequisites failed; remaining checks were skipped\n");
        }
        out.push_str("\n| Category | Check | Result | Detail |\n|---|---|---|---|\n");
        for r in &self.results {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                r.category.as_str(),
                r.name,
                r.outcome.as_str().to_uppercase(),
                r.detail.replace('|', "\\|")
            ));
        }
        out
    }

    /// Write `validation_report_<ts>.md` into `dir`
    pub fn write_markdown(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("validation_report_{}.md", timestamp_id(self.started_at)));
        fs::write(&path, self.to_markdown())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Outcome of the health check for one service
pub fn health_outcome(status: Option<&ServiceStatus>) -> (Outcome, String) {
    match status {
        None => (Outcome::Fail, "no container found".to_string()),
        Some(s) => match (s.health, s.running) {
            (Some(HealthState::Healthy), _) => (Outcome::Pass, "healthy".to_string()),
            (Some(HealthState::Starting), _) => (Outcome::Warn, "health check starting".to_string()),
            (Some(HealthState::Unhealthy), true) => (Outcome::Warn, "running but unhealthy".to_string()),
            (Some(HealthState::Unhealthy), false) => (Outcome::Fail, "unhealthy and stopped".to_string()),
            (None, true) => (Outcome::Pass, "running (no health check defined)".to_string()),
            (None, false) => (Outcome::Fail, "not running".to_string()),
        },
    }
}

/// Signature check only: missing is a warning, anything else must be SQLite
pub fn database_outcome(path: &Path) -> (Outcome, String) {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return (Outcome::Warn, "not present yet (first run?)".to_string()),
    };

    let mut header = [0u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) if &header == SQLITE_SIGNATURE => (Outcome::Pass, "valid SQLite header".to_string()),
        _ => (Outcome::Fail, "not a SQLite database".to_string()),
    }
}

pub fn disk_outcome(use_percent: f64) -> Outcome {
    if use_percent >= 90.0 {
        Outcome::Fail
    } else if use_percent >= 80.0 {
        Outcome::Warn
    } else {
        Outcome::Pass
    }
}

/// A service the stack is expected to run
struct Expected<'a> {
    name: String,
    spec: Option<&'a ServiceSpec>,
}

pub struct Validator<'a> {
    config: &'a VaultConfig,
    supervisor: &'a dyn StackSupervisor,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a VaultConfig, supervisor: &'a dyn StackSupervisor) -> Self {
        Self { config, supervisor }
    }

    pub async fn run(&self, mode: ValidationMode) -> Result<ValidationReport> {
        let root = self.config.project_root()?;
        let mut report = ValidationReport::new(mode, root);
        info!(mode = ?mode, root = %root.display(), "validating stack");

        self.check_prerequisites(root, &mut report).await;
        if report.in_category(CheckCategory::Prerequisite).any(|r| r.outcome == Outcome::Fail) {
            report.halted = true;
            return Ok(report);
        }

        let expected = self.expected_services(root);
        let statuses = match self.supervisor.list_services().await {
            Ok(s) => s,
            Err(e) => {
                for service in &expected {
                    report.record(
                        CheckCategory::ServiceRunning,
                        &service.name,
                        Outcome::Fail,
                        format!("could not list services: {:#}", e),
                    );
                }
                return Ok(report);
            }
        };

        for service in &expected {
            let running = statuses.iter().any(|s| s.name == service.name && s.running);
            report.record(
                CheckCategory::ServiceRunning,
                &service.name,
                if running { Outcome::Pass } else { Outcome::Fail },
                if running { "running" } else { "not running" },
            );
        }

        if mode == ValidationMode::Quick {
            return Ok(report);
        }

        self.check_environment(root, &mut report);
        self.check_directories(root, &mut report);

        for service in &expected {
            let status = statuses.iter().find(|s| s.name == service.name);
            if let Some(status) = status.filter(|s| s.running) {
                let (outcome, detail) = health_outcome(Some(status));
                report.record(CheckCategory::ServiceHealth, &service.name, outcome, detail);
                if let Some(spec) = service.spec {
                    self.check_http(spec, &mut report).await?;
                }
            } else if let Some(spec) = service.spec {
                check_port(spec, &mut report).await;
            }

            if let Some(spec) = service.spec {
                self.check_service_files(spec, &mut report);
            }
        }

        self.check_media(root, &mut report);
        check_disk(root, &mut report);
        self.check_leftover_secrets(root, &mut report);

        Ok(report)
    }

    async fn check_prerequisites(&self, root: &Path, report: &mut ValidationReport) {
        for tool in self.supervisor.probe_tools().await {
            let outcome = if tool.ok { Outcome::Pass } else { Outcome::Fail };
            report.record(CheckCategory::Prerequisite, &tool.name, outcome, &tool.detail);
        }

        let compose = root.join(&self.config.compose_file);
        if compose.is_file() {
            report.record(CheckCategory::Prerequisite, "stack definition", Outcome::Pass, compose.display().to_string());
        } else {
            report.record(
                CheckCategory::Prerequisite,
                "stack definition",
                Outcome::Fail,
                format!("{} not found", compose.display()),
            );
        }
    }

    /// Services from the compose file, matched against the catalog
    fn expected_services(&self, root: &Path) -> Vec<Expected<'a>> {
        let declared = fs::read_to_string(root.join(&self.config.compose_file))
            .ok()
            .and_then(|c| parse_compose_services(&c).ok())
            .filter(|s| !s.is_empty());

        match declared {
            Some(names) => names
                .into_iter()
                .map(|name| {
                    let spec = self.config.services.iter().find(|s| s.name == name);
                    Expected { name, spec }
                })
                .collect(),
            None => self
                .config
                .services
                .iter()
                .map(|spec| Expected {
                    name: spec.name.clone(),
                    spec: Some(spec),
                })
                .collect(),
        }
    }

    fn check_environment(&self, root: &Path, report: &mut ValidationReport) {
        let path = root.join(&self.config.env_file);
        let env = match EnvFile::load(&path) {
            Ok(env) => env,
            Err(_) => {
                report.record(
                    CheckCategory::Environment,
                    self.config.env_file.as_str(),
                    Outcome::Fail,
                    format!("{} not found", path.display()),
                );
                return;
            }
        };

        let missing = env.missing_keys(REQUIRED_ENV_KEYS);
        for key in REQUIRED_ENV_KEYS {
            if missing.contains(key) {
                report.record(CheckCategory::Environment, *key, Outcome::Fail, "not set");
            } else {
                report.record(CheckCategory::Environment, *key, Outcome::Pass, env.get(key).unwrap_or(""));
            }
        }

        for problem in env.validate() {
            report.record(CheckCategory::Environment, "values", Outcome::Warn, problem);
        }
    }

    fn check_directories(&self, root: &Path, report: &mut ValidationReport) {
        let config_dir = root.join(&self.config.config_dir);
        let (outcome, detail) = if !config_dir.is_dir() {
            (Outcome::Fail, "missing".to_string())
        } else if !is_dir_writable(&config_dir) {
            (Outcome::Warn, "not writable".to_string())
        } else {
            (Outcome::Pass, config_dir.display().to_string())
        };
        report.record(CheckCategory::Directory, self.config.config_dir.as_str(), outcome, detail);

        let data_dir = root.join(&self.config.bulk_data_dir);
        let (outcome, detail) = if data_dir.is_dir() {
            (Outcome::Pass, data_dir.display().to_string())
        } else {
            (Outcome::Warn, "missing".to_string())
        };
        report.record(CheckCategory::Directory, self.config.bulk_data_dir.as_str(), outcome, detail);
    }

    async fn check_http(&self, spec: &ServiceSpec, report: &mut ValidationReport) -> Result<()> {
        let client = Client::builder()
            .timeout(self.config.http_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        let url = spec.url(&self.config.service_host);
        let start = Instant::now();
        match client.get(&url).send().await {
            Ok(response) => report.record(
                CheckCategory::Connectivity,
                &spec.name,
                Outcome::Pass,
                format!("{} answered {} in {}ms", url, response.status(), start.elapsed().as_millis()),
            ),
            Err(e) => report.record(
                CheckCategory::Connectivity,
                &spec.name,
                Outcome::Warn,
                format!("{} did not respond, may still be initializing ({})", url, e),
            ),
        }
        Ok(())
    }

    fn check_service_files(&self, spec: &ServiceSpec, report: &mut ValidationReport) {
        let config_dir = self.config.project_root().map(|r| r.join(&self.config.config_dir));
        let config_dir = match config_dir {
            Ok(dir) => dir,
            Err(_) => return,
        };

        if let Some(file) = &spec.config_file {
            let path = config_dir.join(file);
            if path.is_file() {
                report.record(CheckCategory::ConfigFile, &spec.name, Outcome::Pass, file.as_str());
            } else {
                report.record(
                    CheckCategory::ConfigFile,
                    &spec.name,
                    Outcome::Warn,
                    format!("{} not present yet", file),
                );
            }
        }

        if let Some(db) = &spec.database {
            let (outcome, detail) = database_outcome(&config_dir.join(db));
            report.record(CheckCategory::Database, &spec.name, outcome, format!("{}: {}", db, detail));
        }
    }

    fn check_media(&self, root: &Path, report: &mut ValidationReport) {
        let data_dir = root.join(&self.config.bulk_data_dir);
        for media in &self.config.media_dirs {
            let path = data_dir.join(media);
            let entries = fs::read_dir(&path).map(|rd| rd.filter_map(|e| e.ok()).count());
            match entries {
                Ok(0) => report.record(CheckCategory::MediaLibrary, media.as_str(), Outcome::Warn, "empty"),
                Ok(n) => report.record(
                    CheckCategory::MediaLibrary,
                    media.as_str(),
                    Outcome::Pass,
                    format!("{} entries", n),
                ),
                Err(_) => report.record(CheckCategory::MediaLibrary, media.as_str(), Outcome::Warn, "missing"),
            }
        }
    }

    fn check_leftover_secrets(&self, root: &Path, report: &mut ValidationReport) {
        let bulk = root.join(&self.config.bulk_data_dir);
        let mut found: Vec<PathBuf> = WalkDir::new(root)
            .max_depth(3)
            .into_iter()
            .filter_entry(|e| e.path() != bulk)
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_secrets_export(e.path()))
            .map(|e| e.into_path())
            .collect();

        if let Ok(backups) = self.config.backup_root() {
            if !backups.starts_with(root) {
                found.extend(
                    WalkDir::new(&backups)
                        .max_depth(2)
                        .into_iter()
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_type().is_file() && is_secrets_export(e.path()))
                        .map(|e| e.into_path()),
                );
            }
        }

        if found.is_empty() {
            report.record(CheckCategory::LeftoverSecrets, "exports", Outcome::Pass, "none found");
        } else {
            for path in found {
                report.record(
                    CheckCategory::LeftoverSecrets,
                    "exports",
                    Outcome::Warn,
                    format!("{} still holds plaintext secrets", path.display()),
                );
            }
        }
    }
}

fn is_secrets_export(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.starts_with("secrets_export") && name.ends_with(".txt")
}

async fn check_port(spec: &ServiceSpec, report: &mut ValidationReport) {
    match tokio::net::TcpListener::bind(("0.0.0.0", spec.port)).await {
        Ok(_) => report.record(
            CheckCategory::PortConflict,
            &spec.name,
            Outcome::Pass,
            format!("port {} free", spec.port),
        ),
        Err(e) => report.record(
            CheckCategory::PortConflict,
            &spec.name,
            Outcome::Warn,
            format!("port {} is taken while {} is down ({})", spec.port, spec.name, e),
        ),
    }
}

fn check_disk(root: &Path, report: &mut ValidationReport) {
    match storage::disk_usage(root) {
        Ok(usage) => report.record(
            CheckCategory::DiskSpace,
            usage.mount_point.as_str(),
            disk_outcome(usage.use_percent),
            format!("{:.0}% used", usage.use_percent),
        ),
        Err(e) => report.record(CheckCategory::DiskSpace, "project", Outcome::Warn, format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::supervisor::{MockStackSupervisor, ToolCheck};

    fn tools_ok() -> Vec<ToolCheck> {
        vec![
            ToolCheck::ok("docker", "Docker version 25.0.0"),
            ToolCheck::ok("docker compose", "v2.24.0"),
            ToolCheck::ok("docker daemon", "reachable"),
        ]
    }

    fn project(root: &Path) {
        fs::write(
            root.join("docker-compose.yml"),
            "services:\n  sonarr: {}\n  radarr: {}\n  custom-tool: {}\n",
        )
        .unwrap();
        fs::write(root.join(".env"), "PUID=1000\nPGID=1000\nTZ=UTC\n").unwrap();
        fs::create_dir_all(root.join("config/sonarr")).unwrap();
        fs::write(root.join("config/sonarr/config.xml"), "<Config/>").unwrap();
        fs::write(root.join("config/sonarr/sonarr.db"), b"SQLite format 3\0rest").unwrap();
        fs::create_dir_all(root.join("config/radarr")).unwrap();
        fs::write(root.join("config/radarr/radarr.db"), b"not a database at all").unwrap();
    }

    #[test]
    fn test_bands() {
        assert_eq!(band(1.0), Band::Excellent);
        assert_eq!(band(0.90), Band::Excellent);
        assert_eq!(band(0.80), Band::Good);
        assert_eq!(band(0.50), Band::NeedsAttention);
        assert_eq!(band(0.49), Band::SignificantIssues);
    }

    #[test]
    fn test_health_precedence() {
        let healthy_stopped = ServiceStatus::new("a", false, Some(HealthState::Healthy));
        assert_eq!(health_outcome(Some(&healthy_stopped)).0, Outcome::Pass);

        let unhealthy = ServiceStatus::new("a", true, Some(HealthState::Unhealthy));
        assert_eq!(health_outcome(Some(&unhealthy)).0, Outcome::Warn);

        let plain = ServiceStatus::new("a", true, None);
        assert_eq!(health_outcome(Some(&plain)).0, Outcome::Pass);

        let down = ServiceStatus::new("a", false, None);
        assert_eq!(health_outcome(Some(&down)).0, Outcome::Fail);
        assert_eq!(health_outcome(None).0, Outcome::Fail);
    }

    #[test]
    fn test_database_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good.db");
        let bad = tmp.path().join("bad.db");
        fs::write(&good, b"SQLite format 3\0xxxxxxxx").unwrap();
        fs::write(&bad, b"short").unwrap();

        assert_eq!(database_outcome(&good).0, Outcome::Pass);
        assert_eq!(database_outcome(&bad).0, Outcome::Fail);
        assert_eq!(database_outcome(&tmp.path().join("missing.db")).0, Outcome::Warn);
    }

    #[test]
    fn test_disk_thresholds() {
        assert_eq!(disk_outcome(95.0), Outcome::Fail);
        assert_eq!(disk_outcome(85.0), Outcome::Warn);
        assert_eq!(disk_outcome(40.0), Outcome::Pass);
    }

    #[test]
    fn test_counts_and_exit_code() {
        let mut report = ValidationReport::new(ValidationMode::Full, Path::new("/srv"));
        report.record(CheckCategory::Environment, "PUID", Outcome::Pass, "");
        report.record(CheckCategory::Environment, "TZ", Outcome::Warn, "");
        report.record(CheckCategory::Database, "x", Outcome::Fail, "");
        report.record(CheckCategory::Directory, "config", Outcome::Pass, "");

        assert_eq!(report.passed() + report.warned() + report.failed(), report.total());
        assert_eq!(report.success_rate(), 0.5);
        assert_eq!(report.band(), Band::NeedsAttention);
        assert_eq!(report.exit_code(), 1);
        assert!(report.to_markdown().contains("| database | x | FAIL |"));
    }

    #[tokio::test]
    async fn test_prerequisite_failure_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        project(tmp.path());
        let config = VaultConfig::default().for_project(tmp.path());

        let mut mock = MockStackSupervisor::new();
        mock.expect_probe_tools()
            .returning(|| vec![ToolCheck::missing("docker daemon", "not reachable")]);
        mock.expect_list_services().never();

        let report = Validator::new(&config, &mock).run(ValidationMode::Full).await.unwrap();
        assert!(report.halted);
        assert_eq!(report.exit_code(), 1);
        assert!(report.results.iter().all(|r| r.category == CheckCategory::Prerequisite));
    }

    #[tokio::test]
    async fn test_quick_with_nothing_running() {
        let tmp = tempfile::tempdir().unwrap();
        project(tmp.path());
        let config = VaultConfig::default().for_project(tmp.path());

        let mut mock = MockStackSupervisor::new();
        mock.expect_probe_tools().returning(tools_ok);
        mock.expect_list_services().returning(|| Ok(vec![]));

        let report = Validator::new(&config, &mock).run(ValidationMode::Quick).await.unwrap();
        let running: Vec<_> = report.in_category(CheckCategory::ServiceRunning).collect();
        assert_eq!(running.len(), 3);
        assert!(running.iter().all(|r| r.outcome == Outcome::Fail));
        assert_eq!(report.in_category(CheckCategory::Prerequisite).count(), 4);
        assert!(report
            .in_category(CheckCategory::Prerequisite)
            .all(|r| r.outcome == Outcome::Pass));
        assert_eq!(report.total(), 7);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_full_mode_checks_files_and_databases() {
        let tmp = tempfile::tempdir().unwrap();
        project(tmp.path());
        fs::write(tmp.path().join("secrets_export_old.txt"), "leftover").unwrap();
        let mut config = VaultConfig::default().for_project(tmp.path());
        config.http_timeout_secs = 1;
        config.services.retain(|s| s.name == "sonarr" || s.name == "radarr");

        let mut mock = MockStackSupervisor::new();
        mock.expect_probe_tools().returning(tools_ok);
        mock.expect_list_services().returning(|| {
            Ok(vec![
                ServiceStatus::new("sonarr", false, None),
                ServiceStatus::new("radarr", false, None),
                ServiceStatus::new("custom-tool", true, None),
            ])
        });

        let report = Validator::new(&config, &mock).run(ValidationMode::Full).await.unwrap();
        assert_eq!(report.passed() + report.warned() + report.failed(), report.total());

        let dbs: Vec<_> = report.in_category(CheckCategory::Database).collect();
        assert_eq!(dbs.len(), 2);
        assert!(dbs.iter().any(|r| r.name == "sonarr" && r.outcome == Outcome::Pass));
        assert!(dbs.iter().any(|r| r.name == "radarr" && r.outcome == Outcome::Fail));

        let configs: Vec<_> = report.in_category(CheckCategory::ConfigFile).collect();
        assert!(configs.iter().any(|r| r.name == "sonarr" && r.outcome == Outcome::Pass));
        assert!(configs.iter().any(|r| r.name == "radarr" && r.outcome == Outcome::Warn));

        let health: Vec<_> = report.in_category(CheckCategory::ServiceHealth).collect();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].name, "custom-tool");

        assert!(report
            .in_category(CheckCategory::LeftoverSecrets)
            .any(|r| r.outcome == Outcome::Warn));
        assert_eq!(report.in_category(CheckCategory::Environment).count(), 3);

        let written = report.write_markdown(tmp.path()).unwrap();
        assert!(written.file_name().unwrap().to_string_lossy().starts_with("validation_report_"));
    }
}
