//! Path resolution for the content store
//!
//! Layout: `{root}/{project_key}/{version}`. Every resolved path is
//! normalised lexically (`.` and `..` folded) and must stay strictly below
//! the canonical root; artifact paths must also stay below their project
//! directory. Anything else is `AccessDenied`.

use crate::common::{Error, Result};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create the root if needed and pin its canonical form
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all artifacts of a project
    pub fn project_dir(&self, key: &str) -> Result<PathBuf> {
        let resolved = normalize(&self.root.join(key));
        if resolved == self.root || !resolved.starts_with(&self.root) {
            tracing::warn!(key, "Rejected project path outside storage root");
            return Err(Error::AccessDenied(format!(
                "project path escapes storage root: {:?}",
                key
            )));
        }
        Ok(resolved)
    }

    /// File holding one artifact version
    pub fn artifact_path(&self, key: &str, version: &str) -> Result<PathBuf> {
        let project = self.project_dir(key)?;
        self.file_in(&project, version)
    }

    /// Temporary upload file inside a project directory
    pub fn staging_path(&self, key: &str, token: &str) -> Result<PathBuf> {
        let project = self.project_dir(key)?;
        self.file_in(&project, &format!("{}{}", STAGING_PREFIX, token))
    }

    fn file_in(&self, project: &Path, name: &str) -> Result<PathBuf> {
        let resolved = normalize(&project.join(name));
        if resolved == project || !resolved.starts_with(project) {
            tracing::warn!(name, "Rejected artifact path outside project directory");
            return Err(Error::AccessDenied(format!(
                "artifact path escapes project directory: {:?}",
                name
            )));
        }
        Ok(resolved)
    }
}

/// File-name prefix of in-flight uploads; never a valid version string
pub const STAGING_PREFIX: &str = ".upload-";

/// Fold `.` and `..` without touching the filesystem (targets may not exist yet).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
