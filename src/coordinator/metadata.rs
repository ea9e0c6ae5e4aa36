//! Metadata store using RocksDB
//!
//! Stores:
//! - Projects (id → record) with a unique key index (key → id)
//! - Artifacts (id → record) with a unique `(project_id, version)` index
//! - Id sequences (ids are never reused)
//!
//! Every mutation is one `WriteBatch`, so rows and their index entries change
//! together. Check-then-write sequences hold `write_lock`.

use crate::common::{Error, Result, Version};
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const CF_PROJECTS: &str = "projects";
const CF_PROJECT_KEYS: &str = "project_keys";
const CF_ARTIFACTS: &str = "artifacts";
const CF_ARTIFACT_VERSIONS: &str = "artifact_versions";
const CF_SEQUENCES: &str = "sequences";

const SEQ_PROJECT: &[u8] = b"project";
const SEQ_ARTIFACT: &[u8] = b"artifact";

/// Project record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub key: String,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Artifact record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: u64,
    pub project_id: u64,
    pub version: Version,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub sha256: String,
    pub timestamp: DateTime<Utc>,
    pub retained: bool,
    pub locked: bool,
}

/// Artifact fields supplied on insert (the id is assigned by the store)
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub project_id: u64,
    pub version: Version,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub sha256: String,
    pub timestamp: DateTime<Utc>,
    pub retained: bool,
    pub locked: bool,
}

/// Raw version string and upload time of one artifact row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStamp {
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// On-disk artifact row; the version stays a string so a bad row can be skipped
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactRow {
    id: u64,
    project_id: u64,
    version: String,
    file_name: String,
    file_size_bytes: u64,
    sha256: String,
    timestamp: DateTime<Utc>,
    retained: bool,
    locked: bool,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = Error;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        let version = Version::try_parse(&row.version).ok_or_else(|| {
            Error::MetadataCorrupted(format!(
                "artifact {} has unparseable version {:?}",
                row.id, row.version
            ))
        })?;
        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            version,
            file_name: row.file_name,
            file_size_bytes: row.file_size_bytes,
            sha256: row.sha256,
            timestamp: row.timestamp,
            retained: row.retained,
            locked: row.locked,
        })
    }
}

impl From<&Artifact> for ArtifactRow {
    fn from(a: &Artifact) -> Self {
        Self {
            id: a.id,
            project_id: a.project_id,
            version: a.version.to_string(),
            file_name: a.file_name.clone(),
            file_size_bytes: a.file_size_bytes,
            sha256: a.sha256.clone(),
            timestamp: a.timestamp,
            retained: a.retained,
            locked: a.locked,
        }
    }
}

/// Authoritative record store for projects and artifacts
pub trait MetadataStore: Send + Sync {
    /// Insert a project; `Conflict` if the key is taken
    fn insert_project(
        &self,
        key: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Project>;
    fn get_project(&self, key: &str) -> Result<Option<Project>>;
    fn get_project_by_id(&self, id: u64) -> Result<Option<Project>>;
    fn list_projects(&self) -> Result<Vec<Project>>;
    /// Overwrite a project row; `NotFound` if absent, `Conflict` if the new key is taken
    fn update_project(&self, project: &Project) -> Result<()>;
    /// Delete a project and all its artifacts; `false` if it did not exist
    fn delete_project(&self, id: u64) -> Result<bool>;

    /// Insert an artifact; `NotFound` without its project, `Conflict` on a duplicate version
    fn insert_artifact(&self, new: NewArtifact) -> Result<Artifact>;
    fn get_artifact(&self, project_id: u64, version: &Version) -> Result<Option<Artifact>>;
    fn artifact_exists(&self, project_id: u64, version: &Version) -> Result<bool>;
    fn list_artifacts(&self, project_id: u64) -> Result<Vec<Artifact>>;
    fn version_stamps(&self, project_id: u64) -> Result<Vec<VersionStamp>>;
    /// Overwrite an artifact row; `NotFound` if absent, `Conflict` if the new version is taken
    fn update_artifact(&self, artifact: &Artifact) -> Result<()>;
    fn delete_artifact(&self, id: u64) -> Result<bool>;
}

/// RocksDB-backed metadata store
pub struct RocksMetadataStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksMetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![
                CF_PROJECTS,
                CF_PROJECT_KEYS,
                CF_ARTIFACTS,
                CF_ARTIFACT_VERSIONS,
                CF_SEQUENCES,
            ],
        )?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Internal("metadata write lock poisoned".into()))
    }

    /// Reserve the next id of a sequence inside `batch`
    fn next_id(&self, batch: &mut WriteBatch, seq: &[u8]) -> Result<u64> {
        let cf = self.cf(CF_SEQUENCES)?;
        let current = match self.db.get_cf(cf, seq)? {
            Some(bytes) => decode_id(&bytes)?,
            None => 0,
        };
        let next = current + 1;
        batch.put_cf(cf, seq, next.to_be_bytes());
        Ok(next)
    }

    fn get_row<T: for<'de> Deserialize<'de>>(&self, cf_name: &str, id: u64) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn artifact_ids(&self, project_id: u64) -> Result<Vec<(Vec<u8>, u64)>> {
        let cf = self.cf(CF_ARTIFACT_VERSIONS)?;
        let prefix = project_id.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut ids = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push((key.to_vec(), decode_id(&value)?));
        }
        Ok(ids)
    }

    fn artifact_rows(&self, project_id: u64) -> Result<Vec<ArtifactRow>> {
        let mut rows = Vec::new();
        for (_, id) in self.artifact_ids(project_id)? {
            match self.get_row::<ArtifactRow>(CF_ARTIFACTS, id)? {
                Some(row) => rows.push(row),
                None => {
                    return Err(Error::MetadataCorrupted(format!(
                        "version index points at missing artifact {}",
                        id
                    )))
                }
            }
        }
        Ok(rows)
    }
}

fn version_index_key(project_id: u64, version: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + version.len());
    key.extend_from_slice(&project_id.to_be_bytes());
    key.extend_from_slice(version.as_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::MetadataCorrupted(format!("invalid id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
}

impl MetadataStore for RocksMetadataStore {
    // === Project operations ===

    fn insert_project(
        &self,
        key: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Project> {
        let _guard = self.lock()?;
        let keys = self.cf(CF_PROJECT_KEYS)?;
        if self.db.get_cf(keys, key.as_bytes())?.is_some() {
            return Err(Error::Conflict(format!("project key already exists: {}", key)));
        }

        let mut batch = WriteBatch::default();
        let id = self.next_id(&mut batch, SEQ_PROJECT)?;
        let project = Project {
            id,
            key: key.to_string(),
            name,
            description,
        };
        batch.put_cf(self.cf(CF_PROJECTS)?, id.to_be_bytes(), encode(&project)?);
        batch.put_cf(keys, key.as_bytes(), id.to_be_bytes());
        self.db.write(batch)?;

        Ok(project)
    }

    fn get_project(&self, key: &str) -> Result<Option<Project>> {
        let keys = self.cf(CF_PROJECT_KEYS)?;
        match self.db.get_cf(keys, key.as_bytes())? {
            Some(bytes) => self.get_project_by_id(decode_id(&bytes)?),
            None => Ok(None),
        }
    }

    fn get_project_by_id(&self, id: u64) -> Result<Option<Project>> {
        self.get_row(CF_PROJECTS, id)
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let cf = self.cf(CF_PROJECTS)?;
        let mut projects = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            projects.push(bincode::deserialize(&value)?);
        }
        Ok(projects)
    }

    fn update_project(&self, project: &Project) -> Result<()> {
        let _guard = self.lock()?;
        let existing = self
            .get_project_by_id(project.id)?
            .ok_or_else(|| Error::NotFound(format!("project {}", project.id)))?;

        let keys = self.cf(CF_PROJECT_KEYS)?;
        let mut batch = WriteBatch::default();
        if existing.key != project.key {
            if self.db.get_cf(keys, project.key.as_bytes())?.is_some() {
                return Err(Error::Conflict(format!(
                    "project key already exists: {}",
                    project.key
                )));
            }
            batch.delete_cf(keys, existing.key.as_bytes());
            batch.put_cf(keys, project.key.as_bytes(), project.id.to_be_bytes());
        }
        batch.put_cf(
            self.cf(CF_PROJECTS)?,
            project.id.to_be_bytes(),
            encode(project)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    fn delete_project(&self, id: u64) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(project) = self.get_project_by_id(id)? else {
            return Ok(false);
        };

        let mut batch = WriteBatch::default();
        let versions = self.cf(CF_ARTIFACT_VERSIONS)?;
        let artifacts = self.cf(CF_ARTIFACTS)?;
        let cascaded = self.artifact_ids(id)?;
        for (index_key, artifact_id) in &cascaded {
            batch.delete_cf(versions, index_key);
            batch.delete_cf(artifacts, artifact_id.to_be_bytes());
        }
        batch.delete_cf(self.cf(CF_PROJECT_KEYS)?, project.key.as_bytes());
        batch.delete_cf(self.cf(CF_PROJECTS)?, id.to_be_bytes());
        self.db.write(batch)?;

        tracing::debug!(
            key = %project.key,
            artifacts = cascaded.len(),
            "Deleted project metadata"
        );
        Ok(true)
    }

    // === Artifact operations ===

    fn insert_artifact(&self, new: NewArtifact) -> Result<Artifact> {
        let _guard = self.lock()?;
        if self.get_project_by_id(new.project_id)?.is_none() {
            return Err(Error::NotFound(format!("project {}", new.project_id)));
        }

        let versions = self.cf(CF_ARTIFACT_VERSIONS)?;
        let index_key = version_index_key(new.project_id, &new.version.to_string());
        if self.db.get_cf(versions, &index_key)?.is_some() {
            return Err(Error::Conflict(format!(
                "artifact version already exists: {}",
                new.version
            )));
        }

        let mut batch = WriteBatch::default();
        let id = self.next_id(&mut batch, SEQ_ARTIFACT)?;
        let artifact = Artifact {
            id,
            project_id: new.project_id,
            version: new.version,
            file_name: new.file_name,
            file_size_bytes: new.file_size_bytes,
            sha256: new.sha256,
            timestamp: new.timestamp,
            retained: new.retained,
            locked: new.locked,
        };
        batch.put_cf(
            self.cf(CF_ARTIFACTS)?,
            id.to_be_bytes(),
            encode(&ArtifactRow::from(&artifact))?,
        );
        batch.put_cf(versions, &index_key, id.to_be_bytes());
        self.db.write(batch)?;

        Ok(artifact)
    }

    fn get_artifact(&self, project_id: u64, version: &Version) -> Result<Option<Artifact>> {
        let versions = self.cf(CF_ARTIFACT_VERSIONS)?;
        let index_key = version_index_key(project_id, &version.to_string());
        let Some(bytes) = self.db.get_cf(versions, &index_key)? else {
            return Ok(None);
        };
        let id = decode_id(&bytes)?;
        match self.get_row::<ArtifactRow>(CF_ARTIFACTS, id)? {
            Some(row) => Ok(Some(row.try_into()?)),
            None => Err(Error::MetadataCorrupted(format!(
                "version index points at missing artifact {}",
                id
            ))),
        }
    }

    fn artifact_exists(&self, project_id: u64, version: &Version) -> Result<bool> {
        let versions = self.cf(CF_ARTIFACT_VERSIONS)?;
        let index_key = version_index_key(project_id, &version.to_string());
        Ok(self.db.get_cf(versions, &index_key)?.is_some())
    }

    fn list_artifacts(&self, project_id: u64) -> Result<Vec<Artifact>> {
        self.artifact_rows(project_id)?
            .into_iter()
            .map(Artifact::try_from)
            .collect()
    }

    fn version_stamps(&self, project_id: u64) -> Result<Vec<VersionStamp>> {
        Ok(self
            .artifact_rows(project_id)?
            .into_iter()
            .map(|row| VersionStamp {
                version: row.version,
                timestamp: row.timestamp,
            })
            .collect())
    }

    fn update_artifact(&self, artifact: &Artifact) -> Result<()> {
        let _guard = self.lock()?;
        let existing: ArtifactRow = self
            .get_row(CF_ARTIFACTS, artifact.id)?
            .ok_or_else(|| Error::NotFound(format!("artifact {}", artifact.id)))?;

        let versions = self.cf(CF_ARTIFACT_VERSIONS)?;
        let row = ArtifactRow::from(artifact);
        let mut batch = WriteBatch::default();
        if existing.version != row.version || existing.project_id != row.project_id {
            let new_key = version_index_key(row.project_id, &row.version);
            if self.db.get_cf(versions, &new_key)?.is_some() {
                return Err(Error::Conflict(format!(
                    "artifact version already exists: {}",
                    row.version
                )));
            }
            batch.delete_cf(
                versions,
                version_index_key(existing.project_id, &existing.version),
            );
            batch.put_cf(versions, &new_key, row.id.to_be_bytes());
        }
        batch.put_cf(self.cf(CF_ARTIFACTS)?, row.id.to_be_bytes(), encode(&row)?);
        self.db.write(batch)?;
        Ok(())
    }

    fn delete_artifact(&self, id: u64) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(existing) = self.get_row::<ArtifactRow>(CF_ARTIFACTS, id)? else {
            return Ok(false);
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(
            self.cf(CF_ARTIFACT_VERSIONS)?,
            version_index_key(existing.project_id, &existing.version),
        );
        batch.delete_cf(self.cf(CF_ARTIFACTS)?, id.to_be_bytes());
        self.db.write(batch)?;
        Ok(true)
    }
}
