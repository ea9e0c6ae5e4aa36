//! Remove content that no metadata row refers to

use crate::common::Result;
use crate::content::ContentStore;
use crate::coordinator::metadata::MetadataStore;
use crate::ops::verify::verify_store;
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
pub struct RepairReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub skipped: usize,
    pub dry_run: bool,
}

/// Delete orphaned files and project directories found by [`verify_store`].
///
/// Rows with missing or mismatched content are left alone: metadata is
/// authoritative and only an operator can decide whether to drop them.
///
/// Nothing may write to the stores meanwhile. A running server repairs
/// through [`Coordinator::repair_orphans`](crate::Coordinator::repair_orphans).
pub async fn repair_orphans(
    metadata: &dyn MetadataStore,
    content: &ContentStore,
    dry_run: bool,
) -> Result<RepairReport> {
    tracing::info!(dry_run, "Starting orphan repair");
    let verify = verify_store(metadata, content, false).await?;
    let mut report = RepairReport {
        dry_run,
        ..Default::default()
    };

    for file in &verify.orphaned_files {
        if dry_run {
            tracing::info!(project = %file.project, name = %file.name, "Would remove orphaned file");
            report.files_removed += 1;
            continue;
        }
        match content.remove_project_file(&file.project, &file.name).await {
            Ok(()) => report.files_removed += 1,
            Err(e) => {
                tracing::warn!(project = %file.project, name = %file.name, "Could not remove orphaned file: {}", e);
                report.skipped += 1;
            }
        }
    }

    for dir in &verify.orphaned_dirs {
        if dry_run {
            tracing::info!(dir = %dir, "Would remove orphaned project directory");
            report.dirs_removed += 1;
            continue;
        }
        match content.delete_project(dir).await {
            Ok(()) => report.dirs_removed += 1,
            Err(e) => {
                tracing::warn!(dir = %dir, "Could not remove orphaned directory: {}", e);
                report.skipped += 1;
            }
        }
    }

    tracing::info!(
        files_removed = report.files_removed,
        dirs_removed = report.dirs_removed,
        skipped = report.skipped,
        "Repair complete"
    );
    Ok(report)
}
