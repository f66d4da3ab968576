//! Runtime configuration for kit history storage.
//!
//! # Responsibility
//! - Resolve database location and logging settings from the environment.
//! - Open a ready-to-use `Session` for the resolved database.
//!
//! # Invariants
//! - Blank environment values behave as if unset.
//! - With no database path configured, storage is an in-memory database.

use crate::db::{open_db, open_db_in_memory, DbResult, Session};
use crate::logging::default_log_level;
use std::path::PathBuf;

pub const DB_PATH_ENV: &str = "KIT_HISTORY_DB_PATH";
pub const LOG_LEVEL_ENV: &str = "KIT_HISTORY_LOG_LEVEL";
pub const LOG_DIR_ENV: &str = "KIT_HISTORY_LOG_DIR";

/// Storage and logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// SQLite file path. `None` selects an in-memory database.
    pub db_path: Option<PathBuf>,
    /// One of `trace|debug|info|warn|error`.
    pub log_level: String,
    /// Absolute directory for rolling log files. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            log_level: default_log_level().to_string(),
            log_dir: None,
        }
    }
}

impl StoreConfig {
    /// Reads `KIT_HISTORY_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = Self::default();
        Self {
            db_path: read(DB_PATH_ENV).map(PathBuf::from),
            log_level: read(LOG_LEVEL_ENV).unwrap_or(defaults.log_level),
            log_dir: read(LOG_DIR_ENV).map(PathBuf::from),
        }
    }

    /// Opens the configured database with migrations applied.
    pub fn open_session(&self) -> DbResult<Session> {
        let conn = match &self.db_path {
            Some(path) => open_db(path)?,
            None => open_db_in_memory()?,
        };
        Ok(Session::new(conn))
    }
}
