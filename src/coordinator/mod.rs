//! Coordinator: metadata, consistency engine and HTTP API
//!
//! The coordinator is responsible for:
//! - Authoritative project and artifact records (RocksDB)
//! - Ordering writes across metadata and content, with compensation
//! - Latest / latest-stable version views
//! - Serving the HTTP API

pub mod engine;
pub mod http;
pub mod latest;
pub mod metadata;
pub mod server;

pub use engine::{ArtifactDownload, ArtifactUpdate, Coordinator, ProjectUpdate, ProjectView};
pub use latest::{resolve_latest, LatestVersions, ReleasedVersion};
pub use metadata::{Artifact, MetadataStore, NewArtifact, Project, RocksMetadataStore, VersionStamp};
pub use server::Server;
