//! Consistency coordinator
//!
//! Keeps the metadata store and the content store in agreement. Each write
//! runs in a fixed order across the two stores, and a failure in the later
//! step triggers a compensating action on the earlier one:
//!
//! | operation            | first                | then                 | on failure of "then"      |
//! |----------------------|----------------------|----------------------|---------------------------|
//! | create project       | content: mkdir       | metadata: insert     | remove directory          |
//! | rename project       | content: rename dir  | metadata: update     | rename directory back     |
//! | create artifact      | content: save        | metadata: insert     | delete file               |
//! | reversion artifact   | content: rename file | metadata: update     | rename file back          |
//! | replace binary       | content: write new   | metadata: update     | delete new, keep old      |
//! | delete project/artif.| metadata: delete     | content: delete      | log only                  |
//!
//! Metadata is authoritative: deletes never fail because content is missing.
//!
//! Between the two steps the stores briefly disagree (a file or directory
//! exists with no row yet). Every write therefore holds the shared side of a
//! maintenance gate, and orphan repair takes the exclusive side, so repair
//! never mistakes an in-flight write for an orphan.

use crate::common::{validate_file_name, validate_project_key, Error, Result, Version};
use crate::content::ContentStore;
use crate::coordinator::latest::{resolve_latest, ReleasedVersion};
use crate::coordinator::metadata::{Artifact, MetadataStore, NewArtifact, Project};
use crate::ops::{self, RepairReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;

/// Project with derived, per-read statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub artifact_count: usize,
    pub latest_version: Option<ReleasedVersion>,
    pub latest_stable_version: Option<ReleasedVersion>,
}

/// Changes to a project; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub key: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Changes to an artifact.
///
/// `version`, `retained` and `locked` are mutable. The remaining fields are
/// immutable: when supplied they must match the stored values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactUpdate {
    pub version: Option<String>,
    pub retained: Option<bool>,
    pub locked: Option<bool>,
    pub file_name: Option<String>,
    pub file_size_bytes: Option<u64>,
    pub sha256: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An artifact record with its content opened for reading
#[derive(Debug)]
pub struct ArtifactDownload {
    pub artifact: Artifact,
    pub file: File,
}

pub struct Coordinator {
    metadata: Arc<dyn MetadataStore>,
    content: Arc<ContentStore>,
    /// Shared by writes, exclusive for orphan repair
    maintenance: RwLock<()>,
}

impl Coordinator {
    pub fn new(metadata: Arc<dyn MetadataStore>, content: Arc<ContentStore>) -> Self {
        Self {
            metadata,
            content,
            maintenance: RwLock::new(()),
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    // === Projects ===

    /// Create a project directory, then its metadata row
    pub async fn new_project(
        &self,
        key: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Project> {
        let _writing = self.maintenance.read().await;
        validate_project_key(key)?;
        if self.metadata.get_project(key)?.is_some() {
            return Err(Error::Conflict(format!("project already exists: {}", key)));
        }

        self.content.create_project(key).await?;

        match self.metadata.insert_project(key, name, description) {
            Ok(project) => {
                tracing::info!(key, id = project.id, "Project created");
                Ok(project)
            }
            Err(e) => {
                tracing::warn!(key, "Project insert failed, removing directory: {}", e);
                if let Err(cleanup) = self.content.delete_project(key).await {
                    tracing::error!(key, "Failed to remove orphaned project directory: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    pub async fn get_project(&self, key: &str) -> Result<ProjectView> {
        let project = self.find_project(key)?;
        self.project_view(project)
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectView>> {
        self.metadata
            .list_projects()?
            .into_iter()
            .map(|p| self.project_view(p))
            .collect()
    }

    /// Update display fields and optionally move the project to a new key
    pub async fn update_project(&self, key: &str, update: ProjectUpdate) -> Result<()> {
        let _writing = self.maintenance.read().await;
        let mut project = self.find_project(key)?;

        let mut renamed_from = None;
        if let Some(new_key) = update.key.filter(|k| *k != project.key) {
            validate_project_key(&new_key)?;
            if self.metadata.get_project(&new_key)?.is_some() {
                return Err(Error::Conflict(format!("project already exists: {}", new_key)));
            }
            self.content.rename_project(&project.key, &new_key).await?;
            renamed_from = Some(std::mem::replace(&mut project.key, new_key));
        }
        if let Some(name) = update.name {
            project.name = Some(name);
        }
        if let Some(description) = update.description {
            project.description = Some(description);
        }

        if let Err(e) = self.metadata.update_project(&project) {
            if let Some(old_key) = &renamed_from {
                tracing::warn!(old_key, new_key = %project.key, "Project update failed, moving directory back: {}", e);
                if let Err(undo) = self.content.rename_project(&project.key, old_key).await {
                    tracing::error!(old_key, "Failed to restore project directory: {}", undo);
                }
            }
            return Err(e);
        }

        match renamed_from {
            Some(old_key) => tracing::info!(old_key, new_key = %project.key, "Project renamed"),
            None => tracing::info!(key = %project.key, "Project updated"),
        }
        Ok(())
    }

    /// Delete metadata (cascading to artifacts), then the directory tree
    pub async fn delete_project(&self, key: &str) -> Result<()> {
        let _writing = self.maintenance.read().await;
        let project = self.find_project(key)?;
        if !self.metadata.delete_project(project.id)? {
            return Err(Error::NotFound(format!("project {}", key)));
        }
        if let Err(e) = self.content.delete_project(&project.key).await {
            tracing::warn!(key, "Project directory not removed: {}", e);
        }
        tracing::info!(key, "Project deleted");
        Ok(())
    }

    // === Artifacts ===

    /// Store a new artifact version: content first, then metadata
    pub async fn new_artifact<R>(
        &self,
        project_key: &str,
        version: &str,
        file_name: &str,
        body: &mut R,
    ) -> Result<Artifact>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let _writing = self.maintenance.read().await;
        let project = self.find_project(project_key)?;
        let version = Version::parse(version)?;
        validate_file_name(file_name)?;
        if self.metadata.artifact_exists(project.id, &version)? {
            return Err(Error::Conflict(format!(
                "artifact already exists: {}/{}",
                project.key, version
            )));
        }

        let stored = self
            .content
            .save_artifact(&project.key, &version, body)
            .await?;

        let new = NewArtifact {
            project_id: project.id,
            version: version.clone(),
            file_name: file_name.to_string(),
            file_size_bytes: stored.size_bytes,
            sha256: stored.sha256,
            timestamp: Utc::now(),
            retained: false,
            locked: false,
        };
        match self.metadata.insert_artifact(new) {
            Ok(artifact) => {
                tracing::info!(
                    project = %project.key,
                    %version,
                    size = artifact.file_size_bytes,
                    "Artifact created"
                );
                Ok(artifact)
            }
            Err(e) => {
                tracing::warn!(project = %project.key, %version, "Artifact insert failed, removing file: {}", e);
                if let Err(cleanup) = self.content.delete_artifact(&project.key, &version).await {
                    tracing::error!(project = %project.key, %version, "Failed to remove orphaned artifact file: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    pub async fn get_artifact(&self, project_key: &str, version: &str) -> Result<Artifact> {
        let project = self.find_project(project_key)?;
        self.find_artifact(&project, version)
    }

    /// All artifacts of a project, highest version first
    pub async fn list_artifacts(&self, project_key: &str) -> Result<Vec<Artifact>> {
        let project = self.find_project(project_key)?;
        let mut artifacts = self.metadata.list_artifacts(project.id)?;
        artifacts.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(artifacts)
    }

    /// Look up the record, then open the file
    pub async fn download_artifact(
        &self,
        project_key: &str,
        version: &str,
    ) -> Result<ArtifactDownload> {
        let project = self.find_project(project_key)?;
        let artifact = self.find_artifact(&project, version)?;
        let file = self
            .content
            .open_artifact(&project.key, &artifact.version)
            .await?;
        Ok(ArtifactDownload { artifact, file })
    }

    /// Metadata-only update; a version change renames the file before the row changes
    pub async fn update_artifact(
        &self,
        project_key: &str,
        version: &str,
        update: ArtifactUpdate,
    ) -> Result<()> {
        let _writing = self.maintenance.read().await;
        let project = self.find_project(project_key)?;
        let current = self.find_artifact(&project, version)?;
        check_immutable_fields(&current, &update, false)?;
        let new_version = self.target_version(&project, &current, update.version.as_deref())?;

        if let Some(to) = &new_version {
            self.content
                .reversion_artifact(&project.key, &current.version, to)
                .await?;
        }

        let mut updated = current.clone();
        if let Some(to) = &new_version {
            updated.version = to.clone();
        }
        apply_flags(&mut updated, &update);

        if let Err(e) = self.metadata.update_artifact(&updated) {
            if let Some(to) = &new_version {
                tracing::warn!(project = %project.key, from = %current.version, %to, "Artifact update failed, restoring file name: {}", e);
                if let Err(undo) = self
                    .content
                    .reversion_artifact(&project.key, to, &current.version)
                    .await
                {
                    tracing::error!(project = %project.key, version = %current.version, "Failed to restore artifact file: {}", undo);
                }
            }
            return Err(e);
        }

        tracing::info!(project = %project.key, version = %updated.version, "Artifact updated");
        Ok(())
    }

    /// Update with new binary content.
    ///
    /// The new bytes are written next to the old file, metadata commits, and
    /// only then is the old content replaced or removed. A failed commit
    /// deletes the new bytes and leaves the old artifact intact.
    pub async fn update_artifact_with_content<R>(
        &self,
        project_key: &str,
        version: &str,
        update: ArtifactUpdate,
        body: &mut R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let _writing = self.maintenance.read().await;
        let project = self.find_project(project_key)?;
        let current = self.find_artifact(&project, version)?;
        check_immutable_fields(&current, &update, true)?;
        let new_version = self.target_version(&project, &current, update.version.as_deref())?;

        match new_version {
            Some(to) => {
                let stored = self.content.save_artifact(&project.key, &to, body).await?;

                let mut updated = current.clone();
                updated.version = to.clone();
                updated.sha256 = stored.sha256;
                updated.file_size_bytes = stored.size_bytes;
                updated.timestamp = Utc::now();
                apply_flags(&mut updated, &update);

                if let Err(e) = self.metadata.update_artifact(&updated) {
                    tracing::warn!(project = %project.key, version = %to, "Artifact update failed, removing new content: {}", e);
                    if let Err(cleanup) = self.content.delete_artifact(&project.key, &to).await {
                        tracing::error!(project = %project.key, version = %to, "Failed to remove new artifact file: {}", cleanup);
                    }
                    return Err(e);
                }

                if let Err(e) = self
                    .content
                    .delete_artifact(&project.key, &current.version)
                    .await
                {
                    tracing::warn!(project = %project.key, version = %current.version, "Superseded artifact file not removed: {}", e);
                }
                tracing::info!(project = %project.key, from = %current.version, %to, "Artifact content replaced");
            }
            None => {
                let staged = self.content.stage_artifact(&project.key, body).await?;

                let mut updated = current.clone();
                updated.sha256 = staged.content.sha256.clone();
                updated.file_size_bytes = staged.content.size_bytes;
                updated.timestamp = Utc::now();
                apply_flags(&mut updated, &update);

                if let Err(e) = self.metadata.update_artifact(&updated) {
                    tracing::warn!(project = %project.key, version = %current.version, "Artifact update failed, discarding upload: {}", e);
                    if let Err(cleanup) = self.content.discard_staged(staged).await {
                        tracing::error!(project = %project.key, "Failed to discard staged upload: {}", cleanup);
                    }
                    return Err(e);
                }

                if let Err(e) = self
                    .content
                    .promote_staged(&project.key, &current.version, &staged)
                    .await
                {
                    tracing::warn!(project = %project.key, version = %current.version, "Promoting upload failed, restoring metadata: {}", e);
                    if let Err(undo) = self.metadata.update_artifact(&current) {
                        tracing::error!(project = %project.key, version = %current.version, "Failed to restore artifact metadata: {}", undo);
                    }
                    if let Err(cleanup) = self.content.discard_staged(staged).await {
                        tracing::error!(project = %project.key, "Failed to discard staged upload: {}", cleanup);
                    }
                    return Err(e);
                }
                tracing::info!(project = %project.key, version = %current.version, "Artifact content replaced");
            }
        }
        Ok(())
    }

    /// Delete metadata, then best-effort delete the file
    pub async fn delete_artifact(&self, project_key: &str, version: &str) -> Result<()> {
        let _writing = self.maintenance.read().await;
        let project = self.find_project(project_key)?;
        let artifact = self.find_artifact(&project, version)?;
        if !self.metadata.delete_artifact(artifact.id)? {
            return Err(Error::NotFound(format!(
                "artifact {}/{}",
                project.key, artifact.version
            )));
        }
        if let Err(e) = self
            .content
            .delete_artifact(&project.key, &artifact.version)
            .await
        {
            tracing::warn!(project = %project.key, version = %artifact.version, "Artifact file not removed: {}", e);
        }
        tracing::info!(project = %project.key, version = %artifact.version, "Artifact deleted");
        Ok(())
    }

    // === Maintenance ===

    /// Remove orphaned content once no write is in flight.
    ///
    /// New writes wait until repair finishes.
    pub async fn repair_orphans(&self, dry_run: bool) -> Result<RepairReport> {
        let _exclusive = self.maintenance.write().await;
        ops::repair_orphans(self.metadata.as_ref(), &self.content, dry_run).await
    }

    // === Helpers ===

    fn find_project(&self, key: &str) -> Result<Project> {
        self.metadata
            .get_project(key)?
            .ok_or_else(|| Error::NotFound(format!("project {}", key)))
    }

    fn find_artifact(&self, project: &Project, version: &str) -> Result<Artifact> {
        let not_found = || Error::NotFound(format!("artifact {}/{}", project.key, version));
        let version = Version::try_parse(version).ok_or_else(not_found)?;
        self.metadata
            .get_artifact(project.id, &version)?
            .ok_or_else(not_found)
    }

    fn project_view(&self, project: Project) -> Result<ProjectView> {
        let stamps = self.metadata.version_stamps(project.id)?;
        let latest = resolve_latest(&stamps);
        Ok(ProjectView {
            project,
            artifact_count: stamps.len(),
            latest_version: latest.latest,
            latest_stable_version: latest.latest_stable,
        })
    }

    /// Parse a requested version; `None` when it is absent or unchanged
    fn target_version(
        &self,
        project: &Project,
        current: &Artifact,
        requested: Option<&str>,
    ) -> Result<Option<Version>> {
        let Some(requested) = requested else {
            return Ok(None);
        };
        let to = Version::parse(requested)?;
        if to == current.version {
            return Ok(None);
        }
        if self.metadata.artifact_exists(project.id, &to)? {
            return Err(Error::Conflict(format!(
                "artifact already exists: {}/{}",
                project.key, to
            )));
        }
        Ok(Some(to))
    }
}

/// Reject attempts to change fields that only a write of new content may set
fn check_immutable_fields(
    current: &Artifact,
    update: &ArtifactUpdate,
    new_content: bool,
) -> Result<()> {
    let immutable = |field: &str| -> Result<()> {
        Err(Error::BadRequest(format!("{} is immutable", field)))
    };

    if update.timestamp.is_some_and(|t| t != current.timestamp) {
        return immutable("timestamp");
    }
    if update
        .file_name
        .as_ref()
        .is_some_and(|n| *n != current.file_name)
    {
        return immutable("file_name");
    }
    if update
        .file_size_bytes
        .is_some_and(|s| s != current.file_size_bytes)
    {
        return immutable("file_size_bytes");
    }
    if !new_content
        && update
            .sha256
            .as_ref()
            .is_some_and(|h| !h.eq_ignore_ascii_case(&current.sha256))
    {
        return immutable("sha256");
    }
    Ok(())
}

fn apply_flags(artifact: &mut Artifact, update: &ArtifactUpdate) {
    if let Some(retained) = update.retained {
        artifact.retained = retained;
    }
    if let Some(locked) = update.locked {
        artifact.locked = locked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> Artifact {
        Artifact {
            id: 1,
            project_id: 1,
            version: Version::parse("1.0").unwrap(),
            file_name: "a.zip".into(),
            file_size_bytes: 10,
            sha256: "ab".into(),
            timestamp: Utc::now(),
            retained: false,
            locked: false,
        }
    }

    #[test]
    fn test_matching_immutable_fields_pass() {
        let current = artifact();
        let update = ArtifactUpdate {
            file_name: Some("a.zip".into()),
            file_size_bytes: Some(10),
            sha256: Some("AB".into()),
            timestamp: Some(current.timestamp),
            ..Default::default()
        };
        assert!(check_immutable_fields(&current, &update, false).is_ok());
    }

    #[test]
    fn test_changed_immutable_fields_rejected() {
        let current = artifact();
        for update in [
            ArtifactUpdate {
                file_name: Some("b.zip".into()),
                ..Default::default()
            },
            ArtifactUpdate {
                file_size_bytes: Some(11),
                ..Default::default()
            },
            ArtifactUpdate {
                sha256: Some("cd".into()),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                check_immutable_fields(&current, &update, false),
                Err(Error::BadRequest(_))
            ));
        }
    }

    #[test]
    fn test_hash_may_change_with_new_content() {
        let current = artifact();
        let update = ArtifactUpdate {
            sha256: Some("cd".into()),
            ..Default::default()
        };
        assert!(check_immutable_fields(&current, &update, true).is_ok());
    }
}
