//! Common utilities and types shared across minirepo

pub mod config;
pub mod error;
pub mod hash;
pub mod key;
pub mod utils;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use hash::{sha256_hex, HashingWriter, Sha256Hasher};
pub use key::{is_valid_project_key, validate_project_key};
pub use utils::{content_disposition, format_bytes, validate_file_name};
pub use version::Version;
