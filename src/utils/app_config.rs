/// Application configuration management
///
/// Every option the tool understands lives in [`VaultConfig`] with an explicit
/// default. The file is read once at startup (`~/.config/stack-vault/config.toml`
/// unless `--config` is given), overridden by the project `.env`, then
/// validated before any command runs.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::utils::constants::{
    default_services, layout, ServiceSpec, DEFAULT_MEDIA_DIRS, DEFAULT_SAFETY_MULTIPLIER,
    RECONCILE_KEYS,
};

/// Owner applied to restored trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Identity {
    fn default() -> Self {
        Self { uid: 1000, gid: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Stack directory; resolved at startup when empty
    pub project_root: Option<PathBuf>,
    /// Where snapshots are written (relative paths hang off the project root)
    pub backup_root: PathBuf,
    pub config_dir: String,
    pub bulk_data_dir: String,
    pub compose_file: String,
    pub env_file: String,
    pub scripts_dir: String,
    pub retention_days: i64,
    pub compress: bool,
    pub owner: Identity,
    pub timezone: String,
    pub safety_multiplier: f64,
    pub probe_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub stabilization_wait_secs: u64,
    /// Host used for HTTP reachability checks
    pub service_host: String,
    pub media_dirs: Vec<String>,
    pub reconcile_keys: Vec<String>,
    pub services: Vec<ServiceSpec>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            backup_root: PathBuf::from("backups"),
            config_dir: layout::CONFIGURATION.to_string(),
            bulk_data_dir: layout::BULK_DATA.to_string(),
            compose_file: layout::STACK_DEFINITION.to_string(),
            env_file: layout::ENVIRONMENT_VALUES.to_string(),
            scripts_dir: layout::MANAGEMENT_SCRIPTS.to_string(),
            retention_days: 30,
            compress: true,
            owner: Identity::default(),
            timezone: "UTC".to_string(),
            safety_multiplier: DEFAULT_SAFETY_MULTIPLIER,
            probe_timeout_secs: 10,
            http_timeout_secs: 5,
            stabilization_wait_secs: 30,
            service_host: "localhost".to_string(),
            media_dirs: DEFAULT_MEDIA_DIRS.iter().map(|s| s.to_string()).collect(),
            reconcile_keys: RECONCILE_KEYS.iter().map(|s| s.to_string()).collect(),
            services: default_services(),
        }
    }
}

impl VaultConfig {
    /// Default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("stack-vault");
        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from an explicit file or the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(anyhow!("config file not found at {}", p.display()));
                }
                p.to_path_buf()
            }
            None => match Self::config_path() {
                Ok(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply values from the stack's environment (loaded from `.env`)
    pub fn apply_env_overrides(&mut self, env: &HashMap<String, String>) -> Result<()> {
        if let Some(uid) = env.get("PUID") {
            self.owner.uid = uid.trim().parse()
                .with_context(|| format!("PUID '{}' is not a number", uid))?;
        }
        if let Some(gid) = env.get("PGID") {
            self.owner.gid = gid.trim().parse()
                .with_context(|| format!("PGID '{}' is not a number", gid))?;
        }
        if let Some(tz) = env.get("TZ") {
            self.timezone = tz.trim().to_string();
        }
        if let Some(days) = env.get("BACKUP_RETENTION_DAYS") {
            self.retention_days = days.trim().parse()
                .with_context(|| format!("BACKUP_RETENTION_DAYS '{}' is not a number", days))?;
        }
        if let Some(root) = env.get("STACK_VAULT_BACKUP_ROOT") {
            self.backup_root = PathBuf::from(root.trim());
        }
        Ok(())
    }

    /// Check the configuration once, at the entry point
    pub fn validate(&self) -> Result<()> {
        if self.safety_multiplier < 1.0 {
            bail!("safety_multiplier must be at least 1.0 (got {})", self.safety_multiplier);
        }
        if self.probe_timeout_secs == 0 || self.http_timeout_secs == 0 {
            bail!("timeouts must be greater than zero");
        }

        for (field, value) in [
            ("config_dir", &self.config_dir),
            ("bulk_data_dir", &self.bulk_data_dir),
            ("compose_file", &self.compose_file),
            ("env_file", &self.env_file),
            ("scripts_dir", &self.scripts_dir),
        ] {
            if value.is_empty() || Path::new(value).is_absolute() || value.contains("..") {
                bail!("{} must be a relative name inside the project (got '{}')", field, value);
            }
        }

        // Snapshots copy the configuration tree, so they cannot live inside it
        let (config_tree, backups) = match &self.project_root {
            Some(root) => (root.join(&self.config_dir), self.backup_root()?),
            None => (PathBuf::from(&self.config_dir), self.backup_root.clone()),
        };
        if without_cur_dir(&backups).starts_with(without_cur_dir(&config_tree)) {
            bail!(
                "backup_root {} lies inside config_dir '{}'",
                self.backup_root.display(),
                self.config_dir
            );
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                bail!("service '{}' is defined twice", service.name);
            }
            if !service.health_path.starts_with('/') {
                bail!("health_path for '{}' must start with '/'", service.name);
            }
        }

        Ok(())
    }

    pub fn project_root(&self) -> Result<&Path> {
        self.project_root
            .as_deref()
            .ok_or_else(|| anyhow!("project root has not been resolved"))
    }

    /// Backup root, anchored at the project root when relative
    pub fn backup_root(&self) -> Result<PathBuf> {
        if self.backup_root.is_absolute() {
            Ok(self.backup_root.clone())
        } else {
            Ok(self.project_root()?.join(&self.backup_root))
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn stabilization_wait(&self) -> Duration {
        Duration::from_secs(self.stabilization_wait_secs)
    }

    /// Same settings pointed at another stack directory
    pub fn for_project(&self, root: &Path) -> Self {
        let mut config = self.clone();
        config.project_root = Some(root.to_path_buf());
        config
    }
}

fn without_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.safety_multiplier, 1.5);
        assert_eq!(config.retention_days, 30);
        assert!(config.compress);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = VaultConfig::from_toml(
            r#"
            retention_days = 7
            bulk_data_dir = "media-root"

            [owner]
            uid = 911
            gid = 911
            "#,
        )
        .unwrap();

        assert_eq!(config.retention_days, 7);
        assert_eq!(config.bulk_data_dir, "media-root");
        assert_eq!(config.owner, Identity { uid: 911, gid: 911 });
        assert_eq!(config.config_dir, "config");
        assert_eq!(config.services.len(), 7);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = VaultConfig::default();
        let env: HashMap<String, String> = [
            ("PUID", "1001"),
            ("PGID", "1002"),
            ("TZ", "Europe/Paris"),
            ("BACKUP_RETENTION_DAYS", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_env_overrides(&env).unwrap();
        assert_eq!(config.owner, Identity { uid: 1001, gid: 1002 });
        assert_eq!(config.timezone, "Europe/Paris");
        assert_eq!(config.retention_days, 0);
    }

    #[test]
    fn test_bad_puid_rejected() {
        let mut config = VaultConfig::default();
        let env = HashMap::from([("PUID".to_string(), "abc".to_string())]);
        assert!(config.apply_env_overrides(&env).is_err());
    }

    #[test]
    fn test_validation_rejects_escaping_dirs() {
        let config = VaultConfig {
            config_dir: "../etc".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = VaultConfig {
            safety_multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backup_root_inside_configuration_rejected() {
        let env = HashMap::from([("STACK_VAULT_BACKUP_ROOT".to_string(), "config/backups".to_string())]);
        let mut config = VaultConfig::default();
        config.apply_env_overrides(&env).unwrap();
        assert!(config.validate().is_err());

        let mut config = VaultConfig::default().for_project(Path::new("/srv/stack"));
        config.backup_root = PathBuf::from("/srv/stack/config/snapshots");
        assert!(config.validate().is_err());

        config.backup_root = PathBuf::from("./config");
        assert!(config.validate().is_err());

        // A sibling whose name merely starts with the config dir is fine
        config.backup_root = PathBuf::from("configs-backups");
        assert!(config.validate().is_ok());
        config.backup_root = PathBuf::from("/mnt/backups");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relative_backup_root_anchored() {
        let config = VaultConfig::default().for_project(Path::new("/srv/stack"));
        assert_eq!(config.backup_root().unwrap(), PathBuf::from("/srv/stack/backups"));
    }
}
