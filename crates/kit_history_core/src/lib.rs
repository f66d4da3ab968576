//! Embedded data access for kits and their status history.
//! This crate is the single source of truth for the kit/history relationship.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::StoreConfig;
pub use db::{Session, SessionError, TxState};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use model::kit::{
    Kit, KitId, KitSnapshot, KitStatus, KitValidationError, StatusEntry, StatusEntryId,
};
pub use repo::kit_repo::{
    HistoryLoader, KitRepository, RepoError, RepoResult, SqliteKitRepository,
};
pub use service::kit_service::KitService;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
