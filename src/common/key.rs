//! Project key validation
//!
//! A key is lowercase alphanumeric groups joined by single dashes
//! (`^[a-z0-9]+(-?[a-z0-9]+)*$`). It doubles as the project's directory name,
//! so the check also keeps `/`, `.` and `..` out of content paths.

use crate::common::{Error, Result};

/// Longest key accepted (a single path component on common filesystems)
pub const MAX_KEY_LEN: usize = 255;

/// Does `key` match the project key pattern?
pub fn is_valid_project_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return false;
    }
    if key.starts_with('-') || key.ends_with('-') || key.contains("--") {
        return false;
    }
    key.bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Validate a project key, failing with `BadRequest`
pub fn validate_project_key(key: &str) -> Result<()> {
    if is_valid_project_key(key) {
        Ok(())
    } else {
        Err(Error::BadRequest(format!("invalid project key: {:?}", key)))
    }
}
