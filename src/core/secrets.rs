/// Secret detection, export and anonymization
///
/// Detection is a case-insensitive key match on `api_key`, `apikey`,
/// `secret`, `password` and `token`, line by line, in XML, JSON, YAML and
/// INI-like files. It over-matches (any key containing "token") and misses
/// secrets stored under other names. Treat the output as a review aid, not a
/// guarantee that a tree is clean.

use anyhow::{Context, Result};
use chrono::Local;
use regex::{Captures, Match, Regex};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::utils::constants::{layout, SECRET_SCAN_EXTENSIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretClass {
    ApiKey,
    Password,
    Token,
    Secret,
}

impl SecretClass {
    /// Classify a matched key name
    pub fn classify(key: &str) -> Option<Self> {
        let key = key.to_lowercase();
        if key.contains("apikey") || key.contains("api_key") {
            Some(SecretClass::ApiKey)
        } else if key.contains("password") {
            Some(SecretClass::Password)
        } else if key.contains("token") {
            Some(SecretClass::Token)
        } else if key.contains("secret") {
            Some(SecretClass::Secret)
        } else {
            None
        }
    }

    pub fn placeholder(&self) -> &'static str {
        match self {
            SecretClass::ApiKey => "PLACEHOLDER_API_KEY",
            SecretClass::Password => "PLACEHOLDER_PASSWORD",
            SecretClass::Token => "PLACEHOLDER_TOKEN",
            SecretClass::Secret => "PLACEHOLDER_SECRET",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SecretClass::ApiKey => "api_key",
            SecretClass::Password => "password",
            SecretClass::Token => "token",
            SecretClass::Secret => "secret",
        }
    }

    fn is_placeholder(value: &str) -> bool {
        [
            SecretClass::ApiKey,
            SecretClass::Password,
            SecretClass::Token,
            SecretClass::Secret,
        ]
        .iter()
        .any(|c| c.placeholder() == value)
    }
}

/// One secret-looking value found in a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretRecord {
    /// Path relative to the scanned snapshot
    pub file: PathBuf,
    pub line: usize,
    pub class: SecretClass,
    pub key: String,
    pub value: String,
}

/// Files changed by an anonymization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymizeReport {
    pub modified: Vec<PathBuf>,
    pub replacements: usize,
}

// key = value / key: value (YAML, JSON, INI, conf). Quoted values run to the
// closing quote; bare values run to the end of the line or a ` #` comment.
const KEY_VALUE_PATTERN: &str = r#"(?i)(?P<key>["']?(?P<name>[A-Za-z0-9_.\-]*(?:api_?key|secret|password|token)[A-Za-z0-9_.\-]*)["']?\s*[:=]\s*)(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)'|(?P<bare>[^\s"'<>#,][^\r\n]*?)(?P<rest>\s*,?\s*(?:\s#.*)?)$)"#;
// <ApiKey>value</ApiKey>
const XML_PATTERN: &str = r"(?i)(?P<key><(?P<name>[A-Za-z0-9_.\-]*(?:api_?key|secret|password|token)[A-Za-z0-9_.\-]*)>)(?P<value>[^<]+)";

fn patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(KEY_VALUE_PATTERN).expect("key/value secret pattern is valid"),
            Regex::new(XML_PATTERN).expect("xml secret pattern is valid"),
        ]
    })
}

/// The secret value of a match, whichever quoting it used
fn value_match<'h>(caps: &Captures<'h>) -> Option<Match<'h>> {
    ["dq", "sq", "bare", "value"].iter().find_map(|group| caps.name(group))
}

/// Whether a file is in a format the scanner understands
pub fn is_candidate(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SECRET_SCAN_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Secrets on a single line as (class, key name, value)
pub fn scan_line(line: &str) -> Vec<(SecretClass, String, String)> {
    let mut found = Vec::new();
    for pattern in patterns() {
        for caps in pattern.captures_iter(line) {
            let name = &caps["name"];
            let Some(value) = value_match(&caps) else {
                continue;
            };
            let value = value.as_str().trim();
            if value.is_empty() || SecretClass::is_placeholder(value) {
                continue;
            }
            if let Some(class) = SecretClass::classify(name) {
                found.push((class, name.to_string(), value.to_string()));
            }
        }
    }
    found
}

/// Replace every secret value on a line with its placeholder
pub fn redact_line(line: &str) -> (String, usize) {
    let mut count = 0;
    let mut current = line.to_string();

    for pattern in patterns() {
        current = pattern
            .replace_all(&current, |caps: &Captures| {
                let whole = &caps[0];
                let offset = caps.get(0).map(|m| m.start()).unwrap_or(0);
                let value = value_match(caps);
                let text = value.map(|v| v.as_str().trim()).unwrap_or("");
                match (value, SecretClass::classify(&caps["name"])) {
                    (Some(v), Some(class)) if !text.is_empty() && !SecretClass::is_placeholder(text) => {
                        count += 1;
                        format!(
                            "{}{}{}",
                            &whole[..v.start() - offset],
                            class.placeholder(),
                            &whole[v.end() - offset..]
                        )
                    }
                    _ => whole.to_string(),
                }
            })
            .into_owned();
    }

    (current, count)
}

fn candidate_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_candidate(p))
}

/// Scan every candidate file under `root`; paths are reported relative to `base`
pub fn scan_tree(root: &Path, base: &Path) -> Result<Vec<SecretRecord>> {
    let mut records = Vec::new();

    for path in candidate_files(root) {
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };

        let rel = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
        for (idx, line) in content.lines().enumerate() {
            for (class, key, value) in scan_line(line) {
                records.push(SecretRecord {
                    file: rel.clone(),
                    line: idx + 1,
                    class,
                    key,
                    value,
                });
            }
        }
    }

    Ok(records)
}

/// Write records to an owner-only export file
pub fn write_export(records: &[SecretRecord], path: &Path, snapshot_id: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    // mode() only applies on creation
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    writeln!(file, "# stack-vault secrets export")?;
    writeln!(file, "# snapshot: {}", snapshot_id)?;
    writeln!(file, "# generated: {}", Local::now().to_rfc3339())?;
    writeln!(file, "# Contains live credentials. Review, then delete this file.")?;
    writeln!(file)?;

    for r in records {
        writeln!(
            file,
            "{}:{} [{}] {} = {}",
            r.file.display(),
            r.line,
            r.class.label(),
            r.key,
            r.value
        )?;
    }

    info!(path = %path.display(), count = records.len(), "secrets exported");
    Ok(())
}

/// Path of the unmodified copy kept next to an anonymized file
pub fn original_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(layout::ORIGINAL_SUFFIX);
    PathBuf::from(name)
}

/// Redact secrets in place under `root`, keeping `<file>.original` copies
///
/// Only call this on a snapshot copy, never on a live tree. A second pass
/// changes nothing: placeholders are not secrets and existing siblings are
/// left as they are.
pub fn anonymize_tree(root: &Path) -> Result<AnonymizeReport> {
    let mut report = AnonymizeReport::default();

    for path in candidate_files(root) {
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let mut redacted = String::with_capacity(content.len());
        let mut count = 0;
        for chunk in content.split_inclusive('\n') {
            let (body, ending) = split_line_ending(chunk);
            let (line, n) = redact_line(body);
            redacted.push_str(&line);
            redacted.push_str(ending);
            count += n;
        }

        if count == 0 {
            continue;
        }

        let sibling = original_sibling(&path);
        if !sibling.exists() {
            fs::copy(&path, &sibling)
                .with_context(|| format!("Failed to preserve {}", path.display()))?;
        }
        fs::write(&path, redacted)
            .with_context(|| format!("Failed to anonymize {}", path.display()))?;

        debug!(path = %path.display(), count, "anonymized");
        report.replacements += count;
        report.modified.push(path);
    }

    Ok(report)
}

fn split_line_ending(chunk: &str) -> (&str, &str) {
    if let Some(body) = chunk.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = chunk.strip_suffix('\n') {
        (body, "\n")
    } else {
        (chunk, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(SecretClass::classify("ApiKey"), Some(SecretClass::ApiKey));
        assert_eq!(SecretClass::classify("api_key"), Some(SecretClass::ApiKey));
        assert_eq!(SecretClass::classify("WebUI_Password"), Some(SecretClass::Password));
        assert_eq!(SecretClass::classify("plex_token"), Some(SecretClass::Token));
        assert_eq!(SecretClass::classify("client_secret"), Some(SecretClass::Secret));
        assert_eq!(SecretClass::classify("username"), None);
    }

    #[test]
    fn test_scan_line_formats() {
        let xml = scan_line("  <ApiKey>0123abcd</ApiKey>");
        assert_eq!(xml, vec![(SecretClass::ApiKey, "ApiKey".into(), "0123abcd".into())]);

        let yaml = scan_line("password: hunter2");
        assert_eq!(yaml, vec![(SecretClass::Password, "password".into(), "hunter2".into())]);

        let json = scan_line(r#"  "apiKey": "f00dfeed","#);
        assert_eq!(json, vec![(SecretClass::ApiKey, "apiKey".into(), "f00dfeed".into())]);

        let ini = scan_line("auth_token = abc.def");
        assert_eq!(ini, vec![(SecretClass::Token, "auth_token".into(), "abc.def".into())]);

        assert!(scan_line("username: admin").is_empty());
        assert!(scan_line("password: PLACEHOLDER_PASSWORD").is_empty());
    }

    #[test]
    fn test_redact_line_keeps_key_and_quotes() {
        assert_eq!(redact_line("password: hunter2").0, "password: PLACEHOLDER_PASSWORD");
        assert_eq!(
            redact_line("<ApiKey>abc</ApiKey>").0,
            "<ApiKey>PLACEHOLDER_API_KEY</ApiKey>"
        );
        assert_eq!(
            redact_line(r#""token": "xyz","#).0,
            r#""token": "PLACEHOLDER_TOKEN","#
        );
        assert_eq!(redact_line("port: 8080"), ("port: 8080".to_string(), 0));
    }

    #[test]
    fn test_whole_passphrase_is_captured_and_redacted() {
        let line = r#"password: "correct horse battery""#;
        assert_eq!(
            scan_line(line),
            vec![(SecretClass::Password, "password".into(), "correct horse battery".into())]
        );
        assert_eq!(redact_line(line), (r#"password: "PLACEHOLDER_PASSWORD""#.to_string(), 1));

        assert_eq!(
            redact_line("client_secret = 'a, b # c'").0,
            "client_secret = 'PLACEHOLDER_SECRET'"
        );
        assert_eq!(redact_line("password: abc#def").0, "password: PLACEHOLDER_PASSWORD");
        assert_eq!(
            redact_line("password = two words # rotated in May").0,
            "password = PLACEHOLDER_PASSWORD # rotated in May"
        );
        assert_eq!(
            scan_line("password = two words # rotated in May")[0].2,
            "two words"
        );
        assert!(scan_line(r#"password: """#).is_empty());
    }

    #[test]
    fn test_anonymize_is_idempotent_and_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bazarr/config.yaml");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "general:\n  password: hunter2\n  port: 6767\n").unwrap();

        let first = anonymize_tree(dir.path()).unwrap();
        assert_eq!(first.modified, vec![file.clone()]);
        assert_eq!(first.replacements, 1);
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "general:\n  password: PLACEHOLDER_PASSWORD\n  port: 6767\n"
        );
        let sibling = original_sibling(&file);
        assert_eq!(
            fs::read_to_string(&sibling).unwrap(),
            "general:\n  password: hunter2\n  port: 6767\n"
        );

        let second = anonymize_tree(dir.path()).unwrap();
        assert!(second.modified.is_empty());
        assert_eq!(
            fs::read_to_string(&sibling).unwrap(),
            "general:\n  password: hunter2\n  port: 6767\n"
        );
    }

    #[test]
    fn test_scan_tree_and_export_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("config/sonarr");
        fs::create_dir_all(&cfg).unwrap();
        fs::write(cfg.join("config.xml"), "<Config>\n  <ApiKey>abc</ApiKey>\n</Config>\n").unwrap();
        fs::write(cfg.join("notes.txt"), "password: ignored-not-config\n").unwrap();

        let records = scan_tree(&dir.path().join("config"), dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, PathBuf::from("config/sonarr/config.xml"));
        assert_eq!(records[0].line, 2);

        let export = dir.path().join("secrets_export.txt");
        write_export(&records, &export, "backup_test").unwrap();
        let mode = fs::metadata(&export).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let text = fs::read_to_string(&export).unwrap();
        assert!(text.contains("config/sonarr/config.xml:2 [api_key] ApiKey = abc"));
    }
}
