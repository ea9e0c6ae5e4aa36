//! Configuration for minirepo
//!
//! Layered in order: built-in defaults, optional TOML file, `MINIREPO_*`
//! environment variables. Command-line overrides are applied by the binaries.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "minirepo.toml";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Root directory of the content store (one subdirectory per project)
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// RocksDB path for metadata
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Upper bound on a single upload body
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5080))
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/artifacts")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/metadata")
}
fn default_max_upload_bytes() -> u64 {
    1024 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            storage_root: default_storage_root(),
            db_path: default_db_path(),
            max_upload_bytes: default_max_upload_bytes(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `MINIREPO_*` env vars.
    ///
    /// When `path` is `None`, `minirepo.toml` is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(p) => builder.add_source(config::File::from(p.to_path_buf()).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let settings = builder
            .add_source(config::Environment::with_prefix("MINIREPO"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("storage_root cannot be empty".into()));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("db_path cannot be empty".into()));
        }
        if self.max_upload_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_upload_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
