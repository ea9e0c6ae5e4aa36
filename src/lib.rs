//! # minirepo
//!
//! A versioned artifact repository. Projects group single-file artifacts,
//! each stored under a semantic-style version:
//! - RocksDB holds the authoritative project and artifact records
//! - The filesystem holds the bytes, one directory per project
//! - A consistency coordinator keeps the two in agreement, ordering every
//!   write and compensating when the second step fails
//! - Latest and latest-stable versions are derived on read
//!
//! ## Architecture
//!
//! ```text
//!            HTTP API (axum)
//!                  │
//!        ┌─────────▼──────────┐
//!        │    Coordinator     │  write ordering + compensation
//!        └───┬────────────┬───┘
//!            │            │
//!  ┌─────────▼───┐   ┌────▼──────────────────────┐
//!  │ Metadata    │   │ Content store             │
//!  │ (RocksDB)   │   │ {root}/{project}/{version}│
//!  └─────────────┘   └───────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the server
//! ```bash
//! minirepo-server serve \
//!   --bind 0.0.0.0:5080 \
//!   --storage-root ./data/artifacts \
//!   --db ./data/metadata
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minirepo create-project my-app --name "My App"
//! minirepo push my-app 1.2.0 --file ./build/app.tar.gz
//! minirepo pull my-app 1.2.0 --output ./app.tar.gz
//! minirepo artifacts my-app
//! minirepo verify --deep
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod content;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{Config, Error, Result, Version};
pub use content::ContentStore;
pub use coordinator::{Coordinator, RocksMetadataStore, Server};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
