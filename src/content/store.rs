//! Filesystem content store
//!
//! Architecture:
//! - One directory per project: `{root}/{key}/`
//! - One file per artifact, named by its canonical version: `{root}/{key}/{version}`
//! - Uploads stream through a `HashingWriter`, so the SHA-256 digest is
//!   computed in the same pass that lands the bytes on disk
//! - Replacement uploads go to a hidden staging file first and are promoted
//!   with an atomic rename

use crate::common::{validate_project_key, HashingWriter, Result, Sha256Hasher, Version};
use crate::content::paths::{PathResolver, STAGING_PREFIX};
use crate::Error;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Digest and length of bytes written by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Bytes written to a staging file, not yet visible under a version name
#[derive(Debug)]
pub struct StagedContent {
    path: PathBuf,
    pub content: StoredContent,
}

impl StagedContent {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Removes a partially written file unless disarmed. Covers write errors and
/// callers dropping the save future mid-stream.
struct PartialFileGuard {
    path: Option<PathBuf>,
}

impl PartialFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial upload {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Content store rooted at one directory
#[derive(Debug, Clone)]
pub struct ContentStore {
    paths: PathResolver,
}

impl ContentStore {
    /// Open or create content store
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let paths = PathResolver::new(root)?;
        tracing::info!("ContentStore opened at {}", paths.root().display());
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    // === Project directories ===

    /// Create a project directory; `Conflict` if it already exists
    pub async fn create_project(&self, key: &str) -> Result<()> {
        let dir = self.project_dir(key)?;
        match fs::create_dir(&dir).await {
            Ok(()) => {
                tracing::debug!(key, "Created project directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::Conflict(format!(
                "project directory already exists: {}",
                key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively delete a project directory
    pub async fn delete_project(&self, key: &str) -> Result<()> {
        let dir = self.project_dir(key)?;
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| not_found_or(e, format!("project directory {}", key)))?;
        tracing::debug!(key, "Deleted project directory");
        Ok(())
    }

    /// Move a project directory to a new key
    pub async fn rename_project(&self, old_key: &str, new_key: &str) -> Result<()> {
        let from = self.project_dir(old_key)?;
        let to = self.project_dir(new_key)?;
        if old_key == new_key {
            return Err(Error::BadRequest("source and destination keys are equal".into()));
        }
        if !is_dir(&from).await? {
            return Err(Error::NotFound(format!("project directory {}", old_key)));
        }
        if fs::try_exists(&to).await? {
            return Err(Error::Conflict(format!(
                "project directory already exists: {}",
                new_key
            )));
        }
        fs::rename(&from, &to).await?;
        tracing::debug!(old_key, new_key, "Renamed project directory");
        Ok(())
    }

    pub async fn project_exists(&self, key: &str) -> Result<bool> {
        is_dir(&self.project_dir(key)?).await
    }

    /// Keys of every project directory on disk
    pub async fn list_project_dirs(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(self.paths.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Names of every file in a project directory (versions and staging files)
    pub async fn list_project_files(&self, key: &str) -> Result<Vec<String>> {
        let dir = self.project_dir(key)?;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| not_found_or(e, format!("project directory {}", key)))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    // === Artifact files ===

    /// Stream `reader` into a new artifact file; `Conflict` if the file exists
    pub async fn save_artifact<R>(
        &self,
        key: &str,
        version: &Version,
        reader: &mut R,
    ) -> Result<StoredContent>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.artifact_path(key, version)?;
        let content = self.write_new(&path, reader).await.map_err(|e| match e {
            Error::Io(io) if io.kind() == ErrorKind::AlreadyExists => {
                Error::Conflict(format!("artifact file already exists: {}/{}", key, version))
            }
            other => other,
        })?;
        tracing::debug!(key, %version, size = content.size_bytes, "Saved artifact");
        Ok(content)
    }

    /// Stream `reader` into a fresh staging file of the project
    pub async fn stage_artifact<R>(&self, key: &str, reader: &mut R) -> Result<StagedContent>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let path = self.paths.staging_path(key, &token)?;
        let content = self.write_new(&path, reader).await?;
        tracing::debug!(key, size = content.size_bytes, "Staged upload");
        Ok(StagedContent { path, content })
    }

    /// Atomically replace (or create) the artifact file with staged bytes
    pub async fn promote_staged(
        &self,
        key: &str,
        version: &Version,
        staged: &StagedContent,
    ) -> Result<()> {
        let path = self.artifact_path(key, version)?;
        fs::rename(&staged.path, &path).await?;
        tracing::debug!(key, %version, "Promoted staged upload");
        Ok(())
    }

    /// Drop a staging file that will not be promoted
    pub async fn discard_staged(&self, staged: StagedContent) -> Result<()> {
        match fs::remove_file(&staged.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Open an artifact for reading
    pub async fn open_artifact(&self, key: &str, version: &Version) -> Result<File> {
        let path = self.existing_artifact_path(key, version).await?;
        File::open(&path)
            .await
            .map_err(|e| not_found_or(e, format!("artifact file {}/{}", key, version)))
    }

    /// Remove an artifact file
    pub async fn delete_artifact(&self, key: &str, version: &Version) -> Result<()> {
        let path = self.existing_artifact_path(key, version).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(e, format!("artifact file {}/{}", key, version)))?;
        tracing::debug!(key, %version, "Deleted artifact file");
        Ok(())
    }

    /// Rename an artifact file to another version of the same project
    pub async fn reversion_artifact(&self, key: &str, from: &Version, to: &Version) -> Result<()> {
        if from == to {
            return Err(Error::BadRequest(format!(
                "cannot reversion {} to itself",
                from
            )));
        }
        let source = self.existing_artifact_path(key, from).await?;
        let dest = self.artifact_path(key, to)?;
        if !fs::try_exists(&source).await? {
            return Err(Error::NotFound(format!("artifact file {}/{}", key, from)));
        }
        if fs::try_exists(&dest).await? {
            return Err(Error::Conflict(format!(
                "artifact file already exists: {}/{}",
                key, to
            )));
        }
        fs::rename(&source, &dest).await?;
        tracing::debug!(key, %from, %to, "Reversioned artifact file");
        Ok(())
    }

    /// Re-read an artifact file and compute its digest
    pub async fn hash_artifact(&self, key: &str, version: &Version) -> Result<StoredContent> {
        let mut file = self.open_artifact(key, version).await?;
        let mut hasher = Sha256Hasher::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        let mut size_bytes = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size_bytes += n as u64;
        }
        Ok(StoredContent {
            sha256: hasher.finalize(),
            size_bytes,
        })
    }

    /// Size on disk, `None` if the file is absent
    pub async fn artifact_len(&self, key: &str, version: &Version) -> Result<Option<u64>> {
        let path = self.artifact_path(key, version)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a stray file in a project directory by name (repair only)
    pub(crate) async fn remove_project_file(&self, key: &str, name: &str) -> Result<()> {
        let project = self.project_dir(key)?;
        let path = project.join(name);
        if path.parent() != Some(project.as_path()) || name.starts_with("..") {
            return Err(Error::AccessDenied(format!("invalid file name {:?}", name)));
        }
        fs::remove_file(&path).await?;
        Ok(())
    }

    pub fn is_staging_name(name: &str) -> bool {
        name.starts_with(STAGING_PREFIX)
    }

    // === Helpers ===

    fn project_dir(&self, key: &str) -> Result<PathBuf> {
        validate_project_key(key)?;
        self.paths.project_dir(key)
    }

    fn artifact_path(&self, key: &str, version: &Version) -> Result<PathBuf> {
        validate_project_key(key)?;
        self.paths.artifact_path(key, &version.to_string())
    }

    /// Artifact path whose project directory must exist
    async fn existing_artifact_path(&self, key: &str, version: &Version) -> Result<PathBuf> {
        let dir = self.project_dir(key)?;
        if !is_dir(&dir).await? {
            return Err(Error::NotFound(format!("project directory {}", key)));
        }
        self.artifact_path(key, version)
    }

    async fn write_new<R>(&self, path: &Path, reader: &mut R) -> Result<StoredContent>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let guard = PartialFileGuard::new(path.to_path_buf());

        let mut writer = HashingWriter::new(file);
        tokio::io::copy(reader, &mut writer).await?;
        writer.flush().await?;
        let (file, sha256, size_bytes) = writer.finish();
        file.sync_all().await?;

        guard.disarm();
        Ok(StoredContent { sha256, size_bytes })
    }
}

async fn is_dir(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn not_found_or(e: std::io::Error, what: String) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::NotFound(what)
    } else {
        Error::Io(e)
    }
}
