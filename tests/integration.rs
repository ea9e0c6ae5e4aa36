//! Integration tests for minirepo

use futures_util::FutureExt;
use minirepo::common::sha256_hex;
use minirepo::coordinator::{
    Artifact, ArtifactUpdate, MetadataStore, NewArtifact, Project, ProjectUpdate, VersionStamp,
};
use minirepo::ops::{repair_orphans, verify_store};
use minirepo::{ContentStore, Coordinator, Error, Result, RocksMetadataStore, Version};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Delegates to RocksDB but fails selected writes on demand
struct FlakyMetadata {
    inner: RocksMetadataStore,
    fail_insert_project: AtomicBool,
    fail_update_project: AtomicBool,
    fail_insert_artifact: AtomicBool,
    fail_update_artifact: AtomicBool,
}

fn injected(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(Error::Internal("injected failure".into()));
    }
    Ok(())
}

impl MetadataStore for FlakyMetadata {
    fn insert_project(
        &self,
        key: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Project> {
        injected(&self.fail_insert_project)?;
        self.inner.insert_project(key, name, description)
    }
    fn get_project(&self, key: &str) -> Result<Option<Project>> {
        self.inner.get_project(key)
    }
    fn get_project_by_id(&self, id: u64) -> Result<Option<Project>> {
        self.inner.get_project_by_id(id)
    }
    fn list_projects(&self) -> Result<Vec<Project>> {
        self.inner.list_projects()
    }
    fn update_project(&self, project: &Project) -> Result<()> {
        injected(&self.fail_update_project)?;
        self.inner.update_project(project)
    }
    fn delete_project(&self, id: u64) -> Result<bool> {
        self.inner.delete_project(id)
    }
    fn insert_artifact(&self, new: NewArtifact) -> Result<Artifact> {
        injected(&self.fail_insert_artifact)?;
        self.inner.insert_artifact(new)
    }
    fn get_artifact(&self, project_id: u64, version: &Version) -> Result<Option<Artifact>> {
        self.inner.get_artifact(project_id, version)
    }
    fn artifact_exists(&self, project_id: u64, version: &Version) -> Result<bool> {
        self.inner.artifact_exists(project_id, version)
    }
    fn list_artifacts(&self, project_id: u64) -> Result<Vec<Artifact>> {
        self.inner.list_artifacts(project_id)
    }
    fn version_stamps(&self, project_id: u64) -> Result<Vec<VersionStamp>> {
        self.inner.version_stamps(project_id)
    }
    fn update_artifact(&self, artifact: &Artifact) -> Result<()> {
        injected(&self.fail_update_artifact)?;
        self.inner.update_artifact(artifact)
    }
    fn delete_artifact(&self, id: u64) -> Result<bool> {
        self.inner.delete_artifact(id)
    }
}

struct Harness {
    coordinator: Coordinator,
    metadata: Arc<FlakyMetadata>,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let inner = RocksMetadataStore::open(dir.path().join("metadata")).unwrap();
        let metadata = Arc::new(FlakyMetadata {
            inner,
            fail_insert_project: AtomicBool::new(false),
            fail_update_project: AtomicBool::new(false),
            fail_insert_artifact: AtomicBool::new(false),
            fail_update_artifact: AtomicBool::new(false),
        });
        let content = Arc::new(ContentStore::open(dir.path().join("artifacts")).unwrap());
        let coordinator = Coordinator::new(metadata.clone(), content);
        Self {
            coordinator,
            metadata,
            _dir: dir,
        }
    }

    fn project_dir(&self, key: &str) -> PathBuf {
        self.coordinator.content().paths().root().join(key)
    }

    fn artifact_file(&self, key: &str, version: &str) -> PathBuf {
        self.project_dir(key).join(version)
    }

    async fn upload(&self, key: &str, version: &str, bytes: &[u8]) -> Artifact {
        let mut reader = bytes;
        self.coordinator
            .new_artifact(key, version, "app.zip", &mut reader)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_create_project_and_artifact() {
    let h = Harness::new();
    let project = h.coordinator.new_project("app", Some("App".into()), None).await.unwrap();
    assert_eq!(project.key, "app");
    assert!(h.project_dir("app").is_dir());

    let artifact = h.upload("app", "1.0.0", b"hello world").await;
    assert_eq!(artifact.sha256, sha256_hex(b"hello world"));
    assert_eq!(artifact.file_size_bytes, 11);
    assert_eq!(artifact.file_name, "app.zip");
    assert!(!artifact.retained);
    assert_eq!(
        std::fs::read(h.artifact_file("app", "1.0.0")).unwrap(),
        b"hello world"
    );

    let mut again: &[u8] = b"other";
    let err = h
        .coordinator
        .new_artifact("app", "1.0.0", "app.zip", &mut again)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(
        std::fs::read(h.artifact_file("app", "1.0.0")).unwrap(),
        b"hello world"
    );
}

#[tokio::test]
async fn test_rejected_inputs() {
    let h = Harness::new();
    assert!(matches!(
        h.coordinator.new_project("Bad_Key", None, None).await,
        Err(Error::BadRequest(_))
    ));
    assert!(matches!(
        h.coordinator.new_project("-lead", None, None).await,
        Err(Error::BadRequest(_))
    ));

    h.coordinator.new_project("app", None, None).await.unwrap();
    assert!(matches!(
        h.coordinator.new_project("app", None, None).await,
        Err(Error::Conflict(_))
    ));

    let mut body: &[u8] = b"x";
    assert!(matches!(
        h.coordinator.new_artifact("app", "../1.0", "a", &mut body).await,
        Err(Error::BadRequest(_))
    ));
    let mut body: &[u8] = b"x";
    assert!(matches!(
        h.coordinator.new_artifact("missing", "1.0", "a", &mut body).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.coordinator.get_artifact("app", "not-a-version").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_artifact_with_missing_file() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"data").await;

    std::fs::remove_file(h.artifact_file("app", "1.0")).unwrap();
    h.coordinator.delete_artifact("app", "1.0").await.unwrap();

    assert!(matches!(
        h.coordinator.get_artifact("app", "1.0").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        h.coordinator.delete_artifact("app", "1.0").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_project_cascades() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"a").await;
    h.upload("app", "2.0", b"b").await;

    h.coordinator.delete_project("app").await.unwrap();
    assert!(!h.project_dir("app").exists());
    assert!(matches!(
        h.coordinator.get_project("app").await,
        Err(Error::NotFound(_))
    ));

    // The key is free again and starts empty
    h.coordinator.new_project("app", None, None).await.unwrap();
    assert!(h.coordinator.list_artifacts("app").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rename_project() {
    let h = Harness::new();
    h.coordinator
        .new_project("old-name", Some("Old".into()), None)
        .await
        .unwrap();
    h.upload("old-name", "1.0", b"payload").await;

    let update = ProjectUpdate {
        key: Some("new-name".into()),
        description: Some("moved".into()),
        ..Default::default()
    };
    h.coordinator.update_project("old-name", update).await.unwrap();

    assert!(matches!(
        h.coordinator.get_project("old-name").await,
        Err(Error::NotFound(_))
    ));
    let view = h.coordinator.get_project("new-name").await.unwrap();
    assert_eq!(view.project.name.as_deref(), Some("Old"));
    assert_eq!(view.project.description.as_deref(), Some("moved"));
    assert_eq!(view.artifact_count, 1);

    assert!(!h.project_dir("old-name").exists());
    assert_eq!(
        std::fs::read(h.artifact_file("new-name", "1.0")).unwrap(),
        b"payload"
    );
    assert!(h.coordinator.download_artifact("new-name", "1.0").await.is_ok());
}

#[tokio::test]
async fn test_rename_project_onto_existing_key() {
    let h = Harness::new();
    h.coordinator.new_project("one", None, None).await.unwrap();
    h.coordinator.new_project("two", None, None).await.unwrap();

    let update = ProjectUpdate {
        key: Some("two".into()),
        ..Default::default()
    };
    assert!(matches!(
        h.coordinator.update_project("one", update).await,
        Err(Error::Conflict(_))
    ));
    assert!(h.project_dir("one").is_dir());
    assert!(h.project_dir("two").is_dir());
}

#[tokio::test]
async fn test_latest_versions() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();

    let empty = h.coordinator.get_project("app").await.unwrap();
    assert_eq!(empty.artifact_count, 0);
    assert!(empty.latest_version.is_none());
    assert!(empty.latest_stable_version.is_none());

    h.upload("app", "1.0.0", b"a").await;
    h.upload("app", "1.1.0-beta", b"b").await;
    h.upload("app", "0.9.0", b"c").await;

    let view = h.coordinator.get_project("app").await.unwrap();
    assert_eq!(view.artifact_count, 3);
    assert_eq!(
        view.latest_version.unwrap().version.to_string(),
        "1.1.0-beta"
    );
    assert_eq!(
        view.latest_stable_version.unwrap().version.to_string(),
        "1.0.0"
    );

    let listed: Vec<String> = h
        .coordinator
        .list_artifacts("app")
        .await
        .unwrap()
        .iter()
        .map(|a| a.version.to_string())
        .collect();
    assert_eq!(listed, vec!["1.1.0-beta", "1.0.0", "0.9.0"]);
}

#[tokio::test]
async fn test_reversion_metadata_only() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    let original = h.upload("app", "1.0-rc1", b"release bits").await;

    let update = ArtifactUpdate {
        version: Some("1.0".into()),
        retained: Some(true),
        ..Default::default()
    };
    h.coordinator
        .update_artifact("app", "1.0-rc1", update)
        .await
        .unwrap();

    assert!(matches!(
        h.coordinator.get_artifact("app", "1.0-rc1").await,
        Err(Error::NotFound(_))
    ));
    let moved = h.coordinator.get_artifact("app", "1.0").await.unwrap();
    assert_eq!(moved.id, original.id);
    assert_eq!(moved.sha256, original.sha256);
    assert_eq!(moved.timestamp, original.timestamp);
    assert!(moved.retained);

    assert!(!h.artifact_file("app", "1.0-rc1").exists());
    assert_eq!(
        std::fs::read(h.artifact_file("app", "1.0")).unwrap(),
        b"release bits"
    );
}

#[tokio::test]
async fn test_update_rejects_immutable_changes() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"data").await;
    h.upload("app", "2.0", b"data").await;

    let update = ArtifactUpdate {
        file_name: Some("renamed.zip".into()),
        ..Default::default()
    };
    assert!(matches!(
        h.coordinator.update_artifact("app", "1.0", update).await,
        Err(Error::BadRequest(_))
    ));

    let update = ArtifactUpdate {
        version: Some("2.0".into()),
        ..Default::default()
    };
    assert!(matches!(
        h.coordinator.update_artifact("app", "1.0", update).await,
        Err(Error::Conflict(_))
    ));
    assert!(h.artifact_file("app", "1.0").exists());
}

#[tokio::test]
async fn test_replace_content_same_version() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    let original = h.upload("app", "1.0", b"old bytes").await;

    let mut body: &[u8] = b"new bytes, longer";
    h.coordinator
        .update_artifact_with_content("app", "1.0", ArtifactUpdate::default(), &mut body)
        .await
        .unwrap();

    let updated = h.coordinator.get_artifact("app", "1.0").await.unwrap();
    assert_eq!(updated.id, original.id);
    assert_eq!(updated.sha256, sha256_hex(b"new bytes, longer"));
    assert_eq!(updated.file_size_bytes, 17);
    assert_eq!(
        std::fs::read(h.artifact_file("app", "1.0")).unwrap(),
        b"new bytes, longer"
    );

    let files = h.coordinator.content().list_project_files("app").await.unwrap();
    assert_eq!(files, vec!["1.0"]);
}

#[tokio::test]
async fn test_replace_content_with_new_version() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"first").await;

    let update = ArtifactUpdate {
        version: Some("1.1".into()),
        ..Default::default()
    };
    let mut body: &[u8] = b"second";
    h.coordinator
        .update_artifact_with_content("app", "1.0", update, &mut body)
        .await
        .unwrap();

    let updated = h.coordinator.get_artifact("app", "1.1").await.unwrap();
    assert_eq!(updated.sha256, sha256_hex(b"second"));
    assert!(!h.artifact_file("app", "1.0").exists());
    assert_eq!(std::fs::read(h.artifact_file("app", "1.1")).unwrap(), b"second");
}

#[tokio::test]
async fn test_failed_project_insert_removes_directory() {
    let h = Harness::new();
    h.metadata.fail_insert_project.store(true, Ordering::SeqCst);

    assert!(h.coordinator.new_project("app", None, None).await.is_err());
    assert!(!h.project_dir("app").exists());

    h.metadata.fail_insert_project.store(false, Ordering::SeqCst);
    h.coordinator.new_project("app", None, None).await.unwrap();
}

#[tokio::test]
async fn test_failed_project_rename_restores_directory() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"data").await;
    h.metadata.fail_update_project.store(true, Ordering::SeqCst);

    let update = ProjectUpdate {
        key: Some("renamed".into()),
        ..Default::default()
    };
    assert!(h.coordinator.update_project("app", update).await.is_err());
    assert!(h.artifact_file("app", "1.0").exists());
    assert!(!h.project_dir("renamed").exists());
}

#[tokio::test]
async fn test_failed_artifact_insert_removes_file() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.metadata.fail_insert_artifact.store(true, Ordering::SeqCst);

    let mut body: &[u8] = b"bits";
    assert!(h
        .coordinator
        .new_artifact("app", "1.0", "a.zip", &mut body)
        .await
        .is_err());
    assert!(!h.artifact_file("app", "1.0").exists());

    h.metadata.fail_insert_artifact.store(false, Ordering::SeqCst);
    h.upload("app", "1.0", b"bits").await;
}

#[tokio::test]
async fn test_failed_reversion_restores_file() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"data").await;
    h.metadata.fail_update_artifact.store(true, Ordering::SeqCst);

    let update = ArtifactUpdate {
        version: Some("2.0".into()),
        ..Default::default()
    };
    assert!(h.coordinator.update_artifact("app", "1.0", update).await.is_err());
    assert_eq!(std::fs::read(h.artifact_file("app", "1.0")).unwrap(), b"data");
    assert!(!h.artifact_file("app", "2.0").exists());
}

#[tokio::test]
async fn test_failed_replace_keeps_old_content() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    let original = h.upload("app", "1.0", b"keep me").await;
    h.metadata.fail_update_artifact.store(true, Ordering::SeqCst);

    let mut body: &[u8] = b"replacement";
    assert!(h
        .coordinator
        .update_artifact_with_content("app", "1.0", ArtifactUpdate::default(), &mut body)
        .await
        .is_err());

    let update = ArtifactUpdate {
        version: Some("1.1".into()),
        ..Default::default()
    };
    let mut body: &[u8] = b"replacement";
    assert!(h
        .coordinator
        .update_artifact_with_content("app", "1.0", update, &mut body)
        .await
        .is_err());

    assert_eq!(std::fs::read(h.artifact_file("app", "1.0")).unwrap(), b"keep me");
    let files = h.coordinator.content().list_project_files("app").await.unwrap();
    assert_eq!(files, vec!["1.0"]);

    let current = h.coordinator.get_artifact("app", "1.0").await.unwrap();
    assert_eq!(current.sha256, original.sha256);
}

#[tokio::test]
async fn test_verify_and_repair_orphans() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"good").await;
    h.upload("app", "2.0", b"gone").await;

    std::fs::remove_file(h.artifact_file("app", "2.0")).unwrap();
    std::fs::write(h.artifact_file("app", "3.0"), b"stray").unwrap();
    std::fs::create_dir(h.project_dir("abandoned")).unwrap();

    let metadata: &dyn MetadataStore = h.metadata.as_ref();
    let content = h.coordinator.content();
    let report = verify_store(metadata, content, true).await.unwrap();
    assert_eq!(report.total_projects, 1);
    assert_eq!(report.total_artifacts, 2);
    assert_eq!(report.healthy, 1);
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.missing[0].name, "2.0");
    assert_eq!(report.orphaned_files.len(), 1);
    assert_eq!(report.orphaned_files[0].name, "3.0");
    assert_eq!(report.orphaned_dirs, vec!["abandoned"]);
    assert!(!report.is_consistent());

    let dry = repair_orphans(metadata, content, true).await.unwrap();
    assert_eq!(dry.files_removed, 1);
    assert_eq!(dry.dirs_removed, 1);
    assert!(h.artifact_file("app", "3.0").exists());

    let repaired = repair_orphans(metadata, content, false).await.unwrap();
    assert_eq!(repaired.files_removed, 1);
    assert_eq!(repaired.dirs_removed, 1);
    assert!(!h.artifact_file("app", "3.0").exists());
    assert!(!h.project_dir("abandoned").exists());

    // Missing content is reported, never repaired
    let after = verify_store(metadata, content, false).await.unwrap();
    assert_eq!(after.missing.len(), 1);
    assert!(after.orphaned_files.is_empty());
    assert!(after.orphaned_dirs.is_empty());
}

#[tokio::test]
async fn test_repair_waits_for_inflight_upload() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();

    let (mut tx, mut rx) = tokio::io::duplex(64);
    let upload = h.coordinator.new_artifact("app", "1.0", "app.zip", &mut rx);

    let coordinator = &h.coordinator;
    let path = h.artifact_file("app", "1.0");
    let writer = async move {
        tx.write_all(b"first").await.unwrap();
        while std::fs::metadata(&path).map_or(0, |m| m.len()) < 5 {
            tokio::task::yield_now().await;
        }
        // The file has no row yet; repair must not treat it as an orphan
        assert!(coordinator.repair_orphans(false).now_or_never().is_none());
        tx.write_all(b"second").await.unwrap();
    };

    let (uploaded, ()) = tokio::join!(upload, writer);
    let artifact = uploaded.unwrap();
    assert_eq!(artifact.sha256, sha256_hex(b"firstsecond"));

    let report = h.coordinator.repair_orphans(false).await.unwrap();
    assert_eq!(report.files_removed, 0);

    let mut download = h.coordinator.download_artifact("app", "1.0").await.unwrap();
    let mut bytes = Vec::new();
    download.file.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"firstsecond");
}

#[tokio::test]
async fn test_repair_waits_for_inflight_replacement() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"old").await;

    let (mut tx, mut rx) = tokio::io::duplex(64);
    let replace =
        h.coordinator
            .update_artifact_with_content("app", "1.0", ArtifactUpdate::default(), &mut rx);

    let coordinator = &h.coordinator;
    let content = h.coordinator.content().clone();
    let writer = async move {
        tx.write_all(b"new").await.unwrap();
        loop {
            let files = content.list_project_files("app").await.unwrap();
            if files.iter().any(|f| ContentStore::is_staging_name(f)) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(coordinator.repair_orphans(false).now_or_never().is_none());
    };

    let (replaced, ()) = tokio::join!(replace, writer);
    replaced.unwrap();

    assert_eq!(std::fs::read(h.artifact_file("app", "1.0")).unwrap(), b"new");
    let files = h.coordinator.content().list_project_files("app").await.unwrap();
    assert_eq!(files, vec!["1.0"]);
}

#[tokio::test]
async fn test_deep_verify_detects_corruption() {
    let h = Harness::new();
    h.coordinator.new_project("app", None, None).await.unwrap();
    h.upload("app", "1.0", b"abcd").await;
    std::fs::write(h.artifact_file("app", "1.0"), b"abce").unwrap();

    let metadata: &dyn MetadataStore = h.metadata.as_ref();
    let shallow = verify_store(metadata, h.coordinator.content(), false).await.unwrap();
    assert!(shallow.is_consistent());

    let deep = verify_store(metadata, h.coordinator.content(), true).await.unwrap();
    assert_eq!(deep.corrupted.len(), 1);
}

#[test]
fn test_metadata_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("metadata");

    {
        let store = RocksMetadataStore::open(&path).unwrap();
        store.insert_project("app", None, None).unwrap();
        store.flush().unwrap();
    }

    let store = RocksMetadataStore::open(&path).unwrap();
    let project = store.get_project("app").unwrap().unwrap();
    assert_eq!(store.get_project_by_id(project.id).unwrap(), Some(project));
}
