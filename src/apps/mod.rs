//! Experiment apps
//!
//! An app is a directory under the apps root holding:
//! - `player_models.csv` with the participant roster (required)
//! - `prompts.json` with the bot prompt sets
//! - `__init__.py`, the oTree app module served by the experiment host

pub mod prompts;
pub mod roster;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

pub use prompts::{PromptBook, PromptError, PromptSet};
pub use roster::{Assignment, Roster, RosterError};

pub const MODELS_FILE: &str = "player_models.csv";
pub const PROMPTS_FILE: &str = "prompts.json";
pub const APP_MODULE_FILE: &str = "__init__.py";

/// App lookup errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid apps directory pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("App '{name}' not found")]
    NotFound { name: String, available: Vec<String> },

    #[error("Must specify an app")]
    NotSelected { available: Vec<String> },
}

/// An app directory on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDir {
    pub name: String,
    pub path: PathBuf,
}

impl AppDir {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: root.join(name),
        }
    }

    pub fn models_path(&self) -> PathBuf {
        self.path.join(MODELS_FILE)
    }

    pub fn prompts_path(&self) -> PathBuf {
        self.path.join(PROMPTS_FILE)
    }

    /// Required files that are absent
    pub fn missing_files(&self) -> Vec<&'static str> {
        [APP_MODULE_FILE, MODELS_FILE, PROMPTS_FILE]
            .into_iter()
            .filter(|f| !self.path.join(f).exists())
            .collect()
    }

    pub fn load_roster(&self) -> Result<Roster, RosterError> {
        Roster::load(&self.models_path())
    }

    /// Load the app prompts; a missing file yields an empty book
    pub fn load_prompts(&self) -> Result<PromptBook, PromptError> {
        let path = self.prompts_path();
        if !path.exists() {
            warn!("App-specific prompts file not found: {}", path.display());
            return Ok(PromptBook::default());
        }
        PromptBook::load(&path)
    }

    /// Short description for the app listing
    pub fn listing(&self) -> AppListing {
        match self.load_roster() {
            Ok(roster) => AppListing::Ready {
                participants: roster.len(),
                has_roles: roster.has_roles(),
            },
            Err(e) => {
                debug!("Listing {}: {}", self.name, e);
                AppListing::ConfigError
            }
        }
    }
}

/// Status line of an app in `--list-apps`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppListing {
    Ready { participants: usize, has_roles: bool },
    ConfigError,
}

/// Find every app under `root`, sorted by name
///
/// Hidden (`.`) and private (`_`) directories are skipped.
pub fn discover_apps(root: &Path) -> Result<Vec<AppDir>, AppError> {
    let escaped = glob::Pattern::escape(&root.to_string_lossy());
    let pattern = format!("{}/*/{}", escaped, MODELS_FILE);

    let mut apps: Vec<AppDir> = glob::glob(&pattern)?
        .filter_map(Result::ok)
        .filter_map(|models| {
            let dir = models.parent()?;
            let name = dir.file_name()?.to_str()?.to_string();
            if name.starts_with('.') || name.starts_with('_') {
                return None;
            }
            Some(AppDir {
                name,
                path: dir.to_path_buf(),
            })
        })
        .collect();

    apps.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(apps)
}

/// Resolve the app selected on the command line
pub fn select_app(root: &Path, name: Option<&str>) -> Result<AppDir, AppError> {
    let apps = discover_apps(root)?;
    let available: Vec<String> = apps.iter().map(|a| a.name.clone()).collect();

    let Some(name) = name else {
        return Err(AppError::NotSelected { available });
    };

    apps.into_iter()
        .find(|a| a.name == name)
        .ok_or_else(|| AppError::NotFound {
            name: name.to_string(),
            available,
        })
}
