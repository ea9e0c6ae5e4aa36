//! Content store: project directories and artifact files on local disk

pub mod paths;
pub mod store;

pub use paths::PathResolver;
pub use store::{ContentStore, StagedContent, StoredContent};
