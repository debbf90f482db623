//! Runtime configuration
//!
//! Settings come from three places:
//! - Command line flags (see `cli`)
//! - An optional env file (`botex.env` by default) loaded into the process
//! - Environment variables for models, API keys and oTree credentials

pub mod models;

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

pub use models::{ModelRegistry, ModelSpec, Provider};

/// Environment variable holding the oTree REST key
pub const OTREE_REST_KEY_ENV: &str = "OTREE_REST_KEY";
/// Environment variable holding the oTree admin password
pub const OTREE_ADMIN_PASSWORD_ENV: &str = "OTREE_ADMIN_PASSWORD";
/// Admin account used for the data export
pub const OTREE_ADMIN_NAME: &str = "admin";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load env file {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Load `KEY=value` pairs from `path` into the process environment
///
/// A missing file is not an error. Variables already set in the
/// environment win over the file.
pub fn load_env_file(path: &Path) -> Result<bool, ConfigError> {
    if !path.exists() {
        debug!("No env file at {}", path.display());
        return Ok(false);
    }

    dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
        path: path.display().to_string(),
        source,
    })?;

    info!("Loaded environment from {}", path.display());
    Ok(true)
}

/// oTree credentials resolved from flags and environment
#[derive(Debug, Clone, Default)]
pub struct HostSettings {
    pub rest_key: Option<String>,
    pub admin_name: String,
    pub admin_password: Option<String>,
}

impl HostSettings {
    /// Resolve settings, preferring an explicit REST key over the environment
    pub fn resolve<F>(rest_key_flag: Option<&str>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |v: String| if v.trim().is_empty() { None } else { Some(v) };

        Self {
            rest_key: rest_key_flag
                .map(str::to_string)
                .or_else(|| lookup(OTREE_REST_KEY_ENV))
                .and_then(non_empty),
            admin_name: OTREE_ADMIN_NAME.to_string(),
            admin_password: lookup(OTREE_ADMIN_PASSWORD_ENV).and_then(non_empty),
        }
    }

    /// Resolve settings from the process environment
    pub fn from_env(rest_key_flag: Option<&str>) -> Self {
        Self::resolve(rest_key_flag, |k| std::env::var(k).ok())
    }
}
