/// Archive Transport
///
/// Delivers a snapshot plus its companion tooling to a destination. Sources
/// are never deleted. A remote destination is probed first; if the probe
/// fails nothing is copied.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::core::storage;
use crate::error::VaultError;
use crate::utils::find_in_path;

pub const COMPANION_BINARY: &str = "stack-vault";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local(PathBuf),
    Remote { host: String, path: PathBuf },
    Manual,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local(path) => write!(f, "{}", path.display()),
            Destination::Remote { host, path } => write!(f, "{}:{}", host, path.display()),
            Destination::Manual => write!(f, "manual transfer"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactTransfer {
    pub artifact: PathBuf,
    pub delivered_to: Option<String>,
    pub ok: bool,
}

/// What the operator must move by hand, and how to continue afterwards
#[derive(Debug, Clone, Serialize)]
pub struct ManualHandoff {
    pub snapshot: PathBuf,
    pub artifacts: Vec<PathBuf>,
    pub resume_command: String,
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub destination: Destination,
    pub artifacts: Vec<ArtifactTransfer>,
    pub manual: Option<ManualHandoff>,
}

impl TransferReport {
    /// Where the snapshot ended up, as a path on the destination host
    pub fn delivered_snapshot(&self) -> Option<&str> {
        self.artifacts.first().and_then(|a| a.delivered_to.as_deref())
    }
}

pub struct Transport {
    probe_timeout: Duration,
    companions: Vec<PathBuf>,
}

impl Transport {
    /// Transport that ships the running binary alongside each snapshot
    pub fn new(probe_timeout: Duration) -> Self {
        let companions = std::env::current_exe().ok().into_iter().collect();
        Self {
            probe_timeout,
            companions,
        }
    }

    pub fn with_companions(mut self, companions: Vec<PathBuf>) -> Self {
        self.companions = companions;
        self
    }

    pub async fn deliver(&self, snapshot: &Path, destination: &Destination) -> Result<TransferReport> {
        let mut artifacts = vec![snapshot.to_path_buf()];
        artifacts.extend(self.companions.iter().cloned());

        match destination {
            Destination::Local(dir) => {
                let transfers = deliver_local(&artifacts, dir)?;
                Ok(TransferReport {
                    destination: destination.clone(),
                    artifacts: transfers,
                    manual: None,
                })
            }
            Destination::Remote { host, path } => {
                self.probe(host).await?;
                let transfers = self.deliver_remote(&artifacts, host, path).await?;
                Ok(TransferReport {
                    destination: destination.clone(),
                    artifacts: transfers,
                    manual: None,
                })
            }
            Destination::Manual => {
                let handoff = manual_handoff(snapshot, &artifacts);
                Ok(TransferReport {
                    destination: destination.clone(),
                    artifacts: artifacts
                        .into_iter()
                        .map(|artifact| ArtifactTransfer {
                            artifact,
                            delivered_to: None,
                            ok: false,
                        })
                        .collect(),
                    manual: Some(handoff),
                })
            }
        }
    }

    /// Non-interactive, bounded connectivity check
    pub async fn probe(&self, host: &str) -> Result<()> {
        require_tool("ssh")?;

        let probe_failed = |reason: String| VaultError::ConnectivityProbeFailed {
            host: host.to_string(),
            reason,
        };

        info!(host, "probing remote host");
        let output = timeout(
            self.probe_timeout + Duration::from_secs(2),
            Command::new("ssh")
                .args(probe_args(host, self.probe_timeout))
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| probe_failed(format!("no answer within {}s", self.probe_timeout.as_secs())))?
        .map_err(|e| probe_failed(e.to_string()))?;

        if !output.status.success() {
            return Err(probe_failed(String::from_utf8_lossy(&output.stderr).trim().to_string()).into());
        }
        Ok(())
    }

    async fn deliver_remote(
        &self,
        artifacts: &[PathBuf],
        host: &str,
        path: &Path,
    ) -> Result<Vec<ArtifactTransfer>> {
        require_tool("scp")?;

        let remote_dir = path.to_string_lossy().into_owned();
        self.remote_exec(host, &format!("mkdir -p {}", shell_quote(&remote_dir)))
            .await
            .map_err(|e| VaultError::TransferFailed {
                artifact: remote_dir.clone(),
                reason: format!("could not create remote directory: {:#}", e),
            })?;

        let mut transfers = Vec::new();
        for artifact in artifacts {
            let name = artifact_name(artifact);
            let target = format!("{}:{}/", host, remote_dir.trim_end_matches('/'));
            info!(artifact = %artifact.display(), target = %target, "copying");

            let output = Command::new("scp")
                .args(["-r", "-p", "-o", "BatchMode=yes"])
                .arg(artifact)
                .arg(&target)
                .stdin(Stdio::null())
                .output()
                .await
                .with_context(|| format!("Failed to run scp for {}", artifact.display()))?;

            if !output.status.success() {
                return Err(VaultError::TransferFailed {
                    artifact: artifact.display().to_string(),
                    reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                }
                .into());
            }

            transfers.push(ArtifactTransfer {
                artifact: artifact.clone(),
                delivered_to: Some(format!("{}/{}", remote_dir.trim_end_matches('/'), name)),
                ok: true,
            });
        }

        Ok(transfers)
    }

    /// Run a shell command on the remote host, returning its stdout
    pub async fn remote_exec(&self, host: &str, command: &str) -> Result<String> {
        debug!(host, command, "remote exec");
        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes", host, command])
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run ssh")?;

        if !output.status.success() {
            anyhow::bail!(
                "remote command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn require_tool(tool: &str) -> Result<()> {
    if find_in_path(tool).is_none() {
        return Err(VaultError::MissingTool(tool.to_string()).into());
    }
    Ok(())
}

pub fn probe_args(host: &str, probe_timeout: Duration) -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", probe_timeout.as_secs().max(1)),
        host.to_string(),
        "true".to_string(),
    ]
}

fn artifact_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn deliver_local(artifacts: &[PathBuf], dir: &Path) -> Result<Vec<ArtifactTransfer>> {
    std::fs::create_dir_all(dir)
        .map_err(|e| VaultError::TransferFailed {
            artifact: dir.display().to_string(),
            reason: format!("could not create destination: {}", e),
        })?;

    let mut transfers = Vec::new();
    for artifact in artifacts {
        let target = dir.join(artifact_name(artifact));
        let copied = if artifact.is_dir() {
            storage::copy_tree(artifact, &target, None).map(|_| ())
        } else {
            storage::copy_file(artifact, &target).map(|_| ())
        };

        copied.map_err(|e| VaultError::TransferFailed {
            artifact: artifact.display().to_string(),
            reason: format!("{:#}", e),
        })?;

        info!(artifact = %artifact.display(), target = %target.display(), "delivered");
        transfers.push(ArtifactTransfer {
            artifact: artifact.clone(),
            delivered_to: Some(target.display().to_string()),
            ok: true,
        });
    }
    Ok(transfers)
}

/// Exact command that continues a manual migration on the target host
pub fn resume_command(snapshot: &Path) -> String {
    format!(
        "./{} restore --backup {} && ./{} validate",
        COMPANION_BINARY,
        shell_quote(&artifact_name(snapshot)),
        COMPANION_BINARY
    )
}

fn manual_handoff(snapshot: &Path, artifacts: &[PathBuf]) -> ManualHandoff {
    ManualHandoff {
        snapshot: snapshot.to_path_buf(),
        artifacts: artifacts.to_vec(),
        resume_command: resume_command(snapshot),
    }
}

/// Quote for a POSIX shell unless the value is plainly safe
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
