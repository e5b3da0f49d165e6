/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use stack_vault::core::migration::MigrationType;

// Build timestamp injected at compile time by build.rs
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "stack-vault")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.config/stack-vault/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Stack directory holding docker-compose.yml
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture the stack into a snapshot
    BuildSnapshot {
        /// Include the bulk data tree (media); can be very large
        #[arg(long)]
        include_bulk_data: bool,

        /// Keep the snapshot as a directory instead of a .tar.gz
        #[arg(long)]
        no_compress: bool,

        /// Delete snapshots older than N days (0 keeps everything)
        #[arg(long)]
        retention_days: Option<i64>,

        /// Record host metadata for a migration
        #[arg(long)]
        migration: bool,

        /// Write discovered credentials to secrets_export.txt (mode 0600)
        #[arg(long)]
        export_secrets: bool,

        /// Replace credentials inside the snapshot with placeholders
        #[arg(long)]
        anonymize_secrets: bool,
    },

    /// Restore a snapshot into the project directory
    Restore {
        /// Snapshot archive or directory
        #[arg(short, long)]
        backup: PathBuf,

        /// Answer every question with its default
        #[arg(short, long)]
        yes: bool,

        /// Skip confirmations and override the capacity check
        #[arg(long)]
        force: bool,
    },

    /// Move the stack to another directory or host
    Migrate {
        /// Migration type
        #[arg(short = 't', long = "type", value_enum)]
        kind: Option<MigrationType>,

        /// Source stack directory (default: project root)
        #[arg(long)]
        source: Option<PathBuf>,

        /// Destination directory (local, or on the remote host)
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Remote host as user@host
        #[arg(long)]
        remote: Option<String>,

        /// Include the bulk data tree (media)
        #[arg(long)]
        include_bulk_data: bool,

        /// Do not validate the restored stack
        #[arg(long)]
        skip_validation: bool,

        /// Answer every question with its default
        #[arg(short, long)]
        yes: bool,
    },

    /// Check the health of the deployed stack
    Validate {
        /// Write validation_report_<ts>.md in the project root
        #[arg(long)]
        report: bool,

        /// Only prerequisites and running services
        #[arg(long)]
        quick: bool,
    },

    /// List snapshots in the backup root
    ListSnapshots,

    /// Show service status
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_flags() {
        let cli = Cli::try_parse_from([
            "stack-vault",
            "migrate",
            "--type",
            "remote",
            "--remote",
            "media@nas",
            "--dest",
            "/srv/stack",
            "--skip-validation",
        ])
        .unwrap();

        match cli.command {
            Commands::Migrate { kind, remote, dest, skip_validation, include_bulk_data, .. } => {
                assert_eq!(kind, Some(MigrationType::Remote));
                assert_eq!(remote.as_deref(), Some("media@nas"));
                assert_eq!(dest, Some(PathBuf::from("/srv/stack")));
                assert!(skip_validation);
                assert!(!include_bulk_data);
            }
            _ => panic!("expected migrate"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["stack-vault", "validate", "--quick", "--project-root", "/srv/stack", "-v"]).unwrap();
        assert_eq!(cli.project_root, Some(PathBuf::from("/srv/stack")));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Validate { quick: true, report: false }));
    }

    #[test]
    fn test_restore_requires_backup() {
        assert!(Cli::try_parse_from(["stack-vault", "restore"]).is_err());
    }
}
