//! Verify that metadata and content agree

use crate::common::Result;
use crate::content::ContentStore;
use crate::coordinator::metadata::MetadataStore;
use serde::Serialize;
use std::collections::HashSet;

/// One file inside a project directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRef {
    pub project: String,
    pub name: String,
}

#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub total_projects: usize,
    pub total_artifacts: usize,
    pub healthy: usize,
    /// Metadata rows whose file is absent
    pub missing: Vec<FileRef>,
    /// Files whose length differs from the recorded size
    pub size_mismatch: Vec<FileRef>,
    /// Files whose digest differs from the recorded hash (deep only)
    pub corrupted: Vec<FileRef>,
    /// Files with no metadata row, including abandoned staging files
    pub orphaned_files: Vec<FileRef>,
    /// Project directories with no metadata row
    pub orphaned_dirs: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
            && self.size_mismatch.is_empty()
            && self.corrupted.is_empty()
            && self.orphaned_files.is_empty()
            && self.orphaned_dirs.is_empty()
    }
}

/// Walk every project and artifact, comparing both stores.
/// `deep` re-hashes each file.
pub async fn verify_store(
    metadata: &dyn MetadataStore,
    content: &ContentStore,
    deep: bool,
) -> Result<VerifyReport> {
    tracing::info!(deep, "Starting store verification");
    let mut report = VerifyReport::default();

    let projects = metadata.list_projects()?;
    report.total_projects = projects.len();
    let known_keys: HashSet<&str> = projects.iter().map(|p| p.key.as_str()).collect();

    for project in &projects {
        let artifacts = metadata.list_artifacts(project.id)?;
        report.total_artifacts += artifacts.len();

        let on_disk: Vec<String> = if content.project_exists(&project.key).await? {
            content.list_project_files(&project.key).await?
        } else {
            Vec::new()
        };
        let recorded: HashSet<String> = artifacts.iter().map(|a| a.version.to_string()).collect();

        for artifact in &artifacts {
            let file = FileRef {
                project: project.key.clone(),
                name: artifact.version.to_string(),
            };
            match content.artifact_len(&project.key, &artifact.version).await? {
                None => report.missing.push(file),
                Some(len) if len != artifact.file_size_bytes => report.size_mismatch.push(file),
                Some(_) if deep => {
                    let stored = content.hash_artifact(&project.key, &artifact.version).await?;
                    if stored.sha256 != artifact.sha256 {
                        report.corrupted.push(file);
                    } else {
                        report.healthy += 1;
                    }
                }
                Some(_) => report.healthy += 1,
            }
        }

        for name in on_disk {
            if !recorded.contains(&name) {
                if ContentStore::is_staging_name(&name) {
                    tracing::debug!(project = %project.key, name = %name, "Abandoned upload");
                }
                report.orphaned_files.push(FileRef {
                    project: project.key.clone(),
                    name,
                });
            }
        }
    }

    for dir in content.list_project_dirs().await? {
        if !known_keys.contains(dir.as_str()) {
            report.orphaned_dirs.push(dir);
        }
    }

    tracing::info!(
        healthy = report.healthy,
        missing = report.missing.len(),
        size_mismatch = report.size_mismatch.len(),
        corrupted = report.corrupted.len(),
        orphaned_files = report.orphaned_files.len(),
        orphaned_dirs = report.orphaned_dirs.len(),
        "Verification complete"
    );
    Ok(report)
}
