/// Migration report
///
/// A markdown file written next to the source stack, separate from the
/// snapshot, so it survives cleanup of the archive.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::migration::{MigrationRun, MigrationStage};
use crate::error::Severity;
use crate::utils::{format_bytes, timestamp_id};

/// Follow-up items no tool can do for the operator
pub const MANUAL_CHECKLIST: &[&str] = &[
    "Rotate API keys and passwords that were exported or transferred",
    "Re-test integrations between services (indexers, download client, media server)",
    "Update network configuration: DNS records, reverse proxy, port forwards, firewall rules",
    "Confirm library paths and permissions inside each service",
    "Delete sensitive exports listed below once they are no longer needed",
];

pub fn report_path(dir: &Path, at: DateTime<Local>) -> PathBuf {
    dir.join(format!("migration_report_{}.md", timestamp_id(at)))
}

pub fn render(run: &MigrationRun) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Stack Migration Report\n");
    let _ = writeln!(out, "- Started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "- Status: {}", status_line(run));

    if let Some(plan) = &run.plan {
        let _ = writeln!(out, "\n## Plan\n");
        let _ = writeln!(out, "| Parameter | Value |\n|---|---|");
        let _ = writeln!(out, "| Type | {} |", plan.kind.as_str());
        let _ = writeln!(out, "| Source | `{}` |", plan.source.display());
        let _ = writeln!(out, "| Destination | {} |", plan.destination_label());
        let _ = writeln!(out, "| Include bulk data | {} |", yes_no(plan.include_bulk_data));
        let _ = writeln!(out, "| Run validation | {} |", yes_no(plan.run_validation));
        let _ = writeln!(out, "| Clean up local artifacts | {} |", yes_no(plan.cleanup_local));
    }

    if let Some(snapshot) = &run.snapshot {
        let _ = writeln!(out, "\n## Snapshot\n");
        let _ = writeln!(out, "- Id: `{}`", snapshot.id);
        let _ = writeln!(out, "- Location: `{}`", snapshot.location.display());
        let _ = writeln!(out, "- Size: {}", format_bytes(snapshot.size_bytes));
        let _ = writeln!(out, "- Payload: {}", format_bytes(snapshot.payload_bytes));
        if snapshot.partial {
            let _ = writeln!(out, "- Partial: yes");
        }
    }

    if let Some(transfer) = &run.transfer {
        let _ = writeln!(out, "\n## Transfer\n");
        for artifact in &transfer.artifacts {
            let _ = writeln!(
                out,
                "- `{}` → {}",
                artifact.artifact.display(),
                artifact.delivered_to.as_deref().unwrap_or("not transferred")
            );
        }
        if let Some(manual) = &transfer.manual {
            let _ = writeln!(out, "\nMove these artifacts to the target host yourself, then run:\n");
            let _ = writeln!(out, "```\n{}\n```", manual.resume_command);
        }
    }

    if let Some(restore) = &run.restore {
        let _ = writeln!(out, "\n## Restore\n");
        let _ = writeln!(out, "- Sections: {}", restore.restored_sections.join(", "));
        for aside in &restore.set_aside {
            let _ = writeln!(out, "- Previous files kept at `{}`", aside.display());
        }
        for change in &restore.env_changes {
            let _ = writeln!(
                out,
                "- {}: {} → {}",
                change.key,
                change.from.as_deref().unwrap_or("(unset)"),
                change.to
            );
        }
        let _ = writeln!(out, "- Services started: {}", yes_no(restore.services_started));
    }
    if let Some(remote) = &run.remote_restore {
        let _ = writeln!(out, "\n## Remote restore\n\n```\n{}\n```", remote.trim());
    }

    if let Some(validation) = &run.validation {
        let _ = writeln!(out, "\n## Validation\n");
        let _ = writeln!(out, "- {}", validation.summary());
        if let Some(file) = &validation.report_file {
            let _ = writeln!(out, "- Details: `{}`", file.display());
        }
    }

    if let Some(removed) = &run.cleaned_up {
        let _ = writeln!(out, "\n## Cleanup\n");
        let _ = writeln!(out, "- Local snapshot removed: `{}`", removed.display());
    }

    let _ = writeln!(out, "\n## Issues\n");
    if run.issues.is_empty() {
        let _ = writeln!(out, "None recorded.");
    }
    for issue in &run.issues {
        let tag = match issue.severity {
            Severity::Warning => "warning",
            Severity::Deferred => "action required",
        };
        let _ = writeln!(out, "- **{}** ({}): {}", tag, issue.stage, issue.message);
    }

    let _ = writeln!(out, "\n## Manual follow-up\n");
    for item in MANUAL_CHECKLIST {
        let _ = writeln!(out, "- [ ] {}", item);
    }

    let sensitive = run.sensitive_artifacts();
    let _ = writeln!(out, "\n## Sensitive files awaiting deletion\n");
    if sensitive.is_empty() {
        let _ = writeln!(out, "None.");
    }
    for path in sensitive {
        let _ = writeln!(out, "- `{}`", path.display());
    }

    out
}

fn status_line(run: &MigrationRun) -> String {
    if let Some(stage) = run.interrupted {
        return format!("INTERRUPTED during {}", stage.as_str());
    }
    if let Some((stage, reason)) = &run.failed {
        return format!("FAILED at {}: {}", stage.as_str(), reason);
    }
    if run.completed.contains(&MigrationStage::Report) {
        if run.validation.as_ref().map(|v| v.failed > 0).unwrap_or(false) {
            "COMPLETED with validation failures".to_string()
        } else {
            "COMPLETED".to_string()
        }
    } else {
        "IN PROGRESS".to_string()
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn write(run: &MigrationRun, dir: &Path) -> Result<PathBuf> {
    let path = report_path(dir, run.started_at);
    fs::write(&path, render(run)).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
