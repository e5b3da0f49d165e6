/// Stack service definitions and snapshot layout constants
///
/// The default catalog mirrors the media stack's docker-compose.yml. It can be
/// replaced wholesale through `[[services]]` entries in the config file.

use serde::{Deserialize, Serialize};

/// Service definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    /// Host port the web UI listens on
    pub port: u16,
    /// Path probed for HTTP reachability
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Main config file, relative to the configuration tree
    pub config_file: Option<String>,
    /// SQLite database, relative to the configuration tree
    pub database: Option<String>,
}

fn default_health_path() -> String {
    "/".to_string()
}

impl ServiceSpec {
    pub fn url(&self, host: &str) -> String {
        format!("http://{}:{}{}", host, self.port, self.health_path)
    }
}

// (name, display name, port, health path, config file, database)
const DEFAULT_SERVICES: &[(&str, &str, u16, &str, Option<&str>, Option<&str>)] = &[
    (
        "jellyfin",
        "Jellyfin (Media Server)",
        8096,
        "/health",
        Some("jellyfin/config/system.xml"),
        Some("jellyfin/data/library.db"),
    ),
    (
        "sonarr",
        "Sonarr (TV)",
        8989,
        "/ping",
        Some("sonarr/config.xml"),
        Some("sonarr/sonarr.db"),
    ),
    (
        "radarr",
        "Radarr (Movies)",
        7878,
        "/ping",
        Some("radarr/config.xml"),
        Some("radarr/radarr.db"),
    ),
    (
        "prowlarr",
        "Prowlarr (Indexer Manager)",
        9696,
        "/ping",
        Some("prowlarr/config.xml"),
        Some("prowlarr/prowlarr.db"),
    ),
    (
        "bazarr",
        "Bazarr (Subtitles)",
        6767,
        "/",
        Some("bazarr/config/config.yaml"),
        Some("bazarr/db/bazarr.db"),
    ),
    (
        "qbittorrent",
        "qBittorrent (Download Client)",
        8080,
        "/",
        Some("qbittorrent/qBittorrent/qBittorrent.conf"),
        None,
    ),
    (
        "jellyseerr",
        "Jellyseerr (Requests)",
        5055,
        "/api/v1/status",
        Some("jellyseerr/settings.json"),
        Some("jellyseerr/db/db.sqlite3"),
    ),
];

/// All stack services in start order
pub fn default_services() -> Vec<ServiceSpec> {
    DEFAULT_SERVICES
        .iter()
        .map(|(name, display, port, health, config, db)| ServiceSpec {
            name: name.to_string(),
            display_name: display.to_string(),
            port: *port,
            health_path: health.to_string(),
            config_file: config.map(str::to_string),
            database: db.map(str::to_string),
        })
        .collect()
}

/// Snapshot member names
pub mod layout {
    pub const CONFIGURATION: &str = "config";
    pub const BULK_DATA: &str = "data";
    pub const STACK_DEFINITION: &str = "docker-compose.yml";
    pub const ENVIRONMENT_VALUES: &str = ".env";
    pub const MANAGEMENT_SCRIPTS: &str = "scripts";
    pub const BACKUP_INFO: &str = "backup_info.json";
    pub const MIGRATION_INFO: &str = "migration_info.json";
    pub const SPACE_REQUIREMENTS: &str = "space_requirements.json";
    pub const SECRETS_EXPORT: &str = "secrets_export.txt";
    pub const RESTORE_INSTRUCTIONS: &str = "RESTORE_INSTRUCTIONS.md";

    pub const SNAPSHOT_PREFIX: &str = "backup_";
    pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
    pub const ORIGINAL_SUFFIX: &str = ".original";
    pub const ID_FORMAT: &str = "%Y%m%d_%H%M%S";

    /// Per-destination scratch directory (secrets review copy, staging)
    pub const WORK_DIR: &str = ".stack-vault";
}

/// Config file extensions scanned for secrets (XML, JSON, YAML, INI-like)
pub const SECRET_SCAN_EXTENSIONS: &[&str] = &["xml", "json", "yaml", "yml", "ini", "conf", "cfg"];

/// Environment keys that usually differ between hosts
pub const RECONCILE_KEYS: &[&str] = &["PUID", "PGID", "TZ", "DOMAIN", "LOCAL_NETWORK"];

/// Environment keys the stack cannot start without
pub const REQUIRED_ENV_KEYS: &[&str] = &["PUID", "PGID", "TZ"];

/// Process environment variables safe to record in migration metadata
pub const RECORDED_ENV_VARS: &[&str] = &[
    "HOSTNAME",
    "USER",
    "SHELL",
    "LANG",
    "TZ",
    "PUID",
    "PGID",
    "DOMAIN",
    "COMPOSE_PROJECT_NAME",
];

/// Single files holding private key material
pub const SENSITIVE_FILE_NAMES: &[&str] = &["acme.json"];
pub const SENSITIVE_FILE_EXTENSIONS: &[&str] = &["key", "pem"];

/// Media library directories under the bulk data tree
pub const DEFAULT_MEDIA_DIRS: &[&str] = &["media/movies", "media/tv"];

/// First 16 bytes of every SQLite 3 database
pub const SQLITE_SIGNATURE: &[u8; 16] = b"SQLite format 3\0";

/// Multiplier applied to payload size for the capacity gate
pub const DEFAULT_SAFETY_MULTIPLIER: f64 = 1.5;
