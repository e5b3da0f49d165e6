/// Stack supervisor contract
///
/// The backup core never manages containers itself. It stops the stack before
/// a restore, starts it afterwards and looks at what is running; everything
/// else belongs to the supervisor.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Container health as reported by a Docker healthcheck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Starting,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Starting => "starting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    /// `None` when the service defines no healthcheck
    pub health: Option<HealthState>,
}

impl ServiceStatus {
    pub fn new(name: impl Into<String>, running: bool, health: Option<HealthState>) -> Self {
        Self {
            name: name.into(),
            running,
            health,
        }
    }
}

/// Result of probing one external dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl ToolCheck {
    pub fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { name: name.into(), ok: true, detail: detail.into() }
    }

    pub fn missing(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { name: name.into(), ok: false, detail: detail.into() }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StackSupervisor: Send + Sync {
    /// Stop every service of the stack
    async fn stop(&self, graceful: bool) -> Result<()>;

    /// Bring the stack up in the background
    async fn start(&self) -> Result<()>;

    /// Current state of every container belonging to the stack
    async fn list_services(&self) -> Result<Vec<ServiceStatus>>;

    /// Probe the tools the supervisor needs (CLI, compose plugin, daemon)
    async fn probe_tools(&self) -> Vec<ToolCheck>;
}

/// True when any service of the stack is up
pub async fn any_running(supervisor: &dyn StackSupervisor) -> Result<bool> {
    Ok(supervisor.list_services().await?.iter().any(|s| s.running))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_running() {
        let mut mock = MockStackSupervisor::new();
        mock.expect_list_services().returning(|| {
            Ok(vec![
                ServiceStatus::new("sonarr", false, None),
                ServiceStatus::new("radarr", true, Some(HealthState::Healthy)),
            ])
        });
        assert!(any_running(&mock).await.unwrap());
    }

    #[tokio::test]
    async fn test_nothing_running() {
        let mut mock = MockStackSupervisor::new();
        mock.expect_list_services().returning(|| Ok(vec![]));
        assert!(!any_running(&mock).await.unwrap());
    }
}
