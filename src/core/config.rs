/// Environment file handling
///
/// Reads and writes the stack's `.env`, keeping comments and line order so a
/// reconciled file diffs cleanly against the one captured in the snapshot.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::is_valid_domain;

#[derive(Debug, Clone)]
pub struct EnvValue {
    pub key: String,
    pub value: String,
    pub comment: Option<String>,
}

pub struct EnvFile {
    path: PathBuf,
    original: String,
    values: HashMap<String, EnvValue>,
    /// Keys set after load that were not in the file
    appended: Vec<String>,
}

impl EnvFile {
    /// Load configuration from .env file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(anyhow!("environment file not found at {}", path.display()));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Ok(Self::parse(path, content))
    }

    fn parse(path: PathBuf, content: String) -> Self {
        let mut values = HashMap::new();
        let mut current_comment = None;

        for line in content.lines() {
            let line = line.trim();

            if line.starts_with('#') {
                current_comment = Some(line.trim_start_matches('#').trim().to_string());
                continue;
            }

            if line.is_empty() {
                current_comment = None;
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                let value = unquote(value.trim()).to_string();

                values.insert(
                    key.clone(),
                    EnvValue {
                        key,
                        value,
                        comment: current_comment.take(),
                    },
                );
            }
        }

        Self {
            path,
            original: content,
            values,
            appended: Vec::new(),
        }
    }

    /// Save configuration back to its file
    pub fn save(&self) -> Result<()> {
        fs::write(&self.path, self.render())
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// File content with current values, original layout preserved
    pub fn render(&self) -> String {
        let mut lines = Vec::new();

        for line in self.original.lines() {
            let trimmed = line.trim();

            if trimmed.starts_with('#') || trimmed.is_empty() {
                lines.push(line.to_string());
                continue;
            }

            let bare = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            match bare.split_once('=') {
                Some((key, raw)) => {
                    let key = key.trim();
                    match self.values.get(key) {
                        Some(v) if v.value != unquote(raw.trim()) => {
                            let prefix = if trimmed.starts_with("export ") { "export " } else { "" };
                            lines.push(format!("{}{}={}", prefix, key, v.value));
                        }
                        _ => lines.push(line.to_string()),
                    }
                }
                None => lines.push(line.to_string()),
            }
        }

        for key in &self.appended {
            if let Some(v) = self.values.get(key) {
                lines.push(format!("{}={}", key, v.value));
            }
        }

        let mut out = lines.join("\n");
        if self.original.ends_with('\n') || !self.appended.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.value.as_str())
    }

    /// Set a configuration value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        if let Some(existing) = self.values.get_mut(&key) {
            existing.value = value;
        } else {
            self.appended.push(key.clone());
            self.values.insert(
                key.clone(),
                EnvValue {
                    key,
                    value,
                    comment: None,
                },
            );
        }
    }

    /// Keys from `required` that are missing or empty
    pub fn missing_keys<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|k| self.get(k).map(|v| v.is_empty()).unwrap_or(true))
            .collect()
    }

    /// Problems with identity/locale values
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for key in ["PUID", "PGID"] {
            if let Some(v) = self.get(key) {
                if v.parse::<u32>().is_err() {
                    errors.push(format!("{} must be a numeric id (got '{}')", key, v));
                }
            }
        }

        if let Some(domain) = self.get("DOMAIN") {
            if !domain.is_empty() && !is_valid_domain(domain) {
                errors.push(format!("Invalid domain: {}", domain));
            }
        }

        errors
    }

    /// Export configuration to HashMap
    pub fn to_map(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
