/// Docker and Docker Compose integration
///
/// Implements the stack supervisor on top of `docker compose` (stop/start)
/// and the Docker Engine API (container listing, daemon ping).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::config::EnvFile;
use crate::core::supervisor::{HealthState, ServiceStatus, StackSupervisor, ToolCheck};

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Seconds compose waits for a graceful stop before killing
const GRACEFUL_STOP_TIMEOUT: &str = "30";

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
    project_root: PathBuf,
    compose_file: PathBuf,
    project_name: String,
}

impl DockerManager {
    /// Create a manager for the stack rooted at `project_root`
    pub fn new(project_root: &Path, compose_file: &str, env_file: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        let compose_file = project_root.join(compose_file);
        let env = EnvFile::load(project_root.join(env_file)).ok();
        let project_name = env
            .as_ref()
            .and_then(|e| e.get("COMPOSE_PROJECT_NAME"))
            .map(str::to_string)
            .unwrap_or_else(|| default_project_name(project_root));

        Ok(Self {
            docker,
            project_root: project_root.to_path_buf(),
            compose_file,
            project_name,
        })
    }

    /// Get project root directory
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Execute docker-compose command
    pub async fn compose_command(&self, args: &[&str]) -> Result<String> {
        if !self.compose_file.exists() {
            return Err(anyhow!(
                "{} not found",
                self.compose_file.display()
            ));
        }

        debug!(args = ?args, root = %self.project_root.display(), "docker compose");

        let output = Command::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .args(args)
            .current_dir(&self.project_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute docker compose command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Docker compose command failed: {}", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Service names declared in the compose file
    pub fn compose_services(&self) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(&self.compose_file)
            .with_context(|| format!("Failed to read {}", self.compose_file.display()))?;
        parse_compose_services(&content)
    }

    /// Convert ContainerSummary to ServiceStatus
    fn container_summary_to_status(summary: ContainerSummary) -> ServiceStatus {
        let name = summary
            .labels
            .as_ref()
            .and_then(|labels| labels.get(COMPOSE_SERVICE_LABEL).cloned())
            .or_else(|| {
                summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let running = summary.state.as_deref() == Some("running");
        let health = summary.status.as_deref().and_then(parse_health);

        ServiceStatus::new(name, running, health)
    }
}

#[async_trait]
impl StackSupervisor for DockerManager {
    async fn stop(&self, graceful: bool) -> Result<()> {
        let timeout = if graceful { GRACEFUL_STOP_TIMEOUT } else { "0" };
        info!(project = %self.project_name, graceful, "stopping stack");
        self.compose_command(&["down", "--timeout", timeout]).await?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        info!(project = %self.project_name, "starting stack");
        self.compose_command(&["up", "-d"]).await?;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<ServiceStatus>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, self.project_name)],
        );

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self
            .docker
            .list_containers(options)
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .map(Self::container_summary_to_status)
            .collect())
    }

    async fn probe_tools(&self) -> Vec<ToolCheck> {
        let mut checks = Vec::new();

        checks.push(match run_version(&["--version"]).await {
            Some(version) => ToolCheck::ok("docker", version),
            None => ToolCheck::missing("docker", "docker CLI not found on PATH"),
        });

        checks.push(match run_version(&["compose", "version"]).await {
            Some(version) => ToolCheck::ok("docker compose", version),
            None => ToolCheck::missing("docker compose", "compose plugin not installed"),
        });

        checks.push(match self.docker.ping().await {
            Ok(_) => ToolCheck::ok("docker daemon", "reachable"),
            Err(e) => ToolCheck::missing("docker daemon", format!("not reachable: {}", e)),
        });

        checks
    }
}

async fn run_version(args: &[&str]) -> Option<String> {
    let output = Command::new("docker").args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Health from a `docker ps` status string such as "Up 2 hours (healthy)"
pub fn parse_health(status: &str) -> Option<HealthState> {
    // unhealthy before healthy: one contains the other
    if status.contains("unhealthy") {
        Some(HealthState::Unhealthy)
    } else if status.contains("health: starting") || status.contains("(starting)") {
        Some(HealthState::Starting)
    } else if status.contains("healthy") {
        Some(HealthState::Healthy)
    } else {
        None
    }
}

/// Compose's default project name: directory name, lowercased, restricted charset
pub fn default_project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Extract the `services:` keys from a compose document
pub fn parse_compose_services(content: &str) -> Result<Vec<String>> {
    use serde_yaml::Value;

    let yaml: Value = serde_yaml::from_str(content)
        .context("Failed to parse compose file")?;

    let services = yaml
        .get("services")
        .and_then(|s| s.as_mapping())
        .map(|map| {
            map.keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(services)
}
