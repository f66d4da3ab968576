//! Kit use-case service.
//!
//! # Responsibility
//! - Provide kit registration, status recording and history clearing.
//! - Run each use case in exactly one transaction.
//!
//! # Invariants
//! - A failed use case is rolled back as a whole.
//! - Kits returned from the service have their history fetched and stay usable
//!   after the transaction ends.

use crate::db::Session;
use crate::model::kit::{Kit, KitId, KitStatus, StatusEntry};
use crate::repo::kit_repo::{KitRepository, RepoError, RepoResult, SqliteKitRepository};
use log::info;

/// Use-case service owning one storage session.
pub struct KitService {
    session: Session,
}

impl KitService {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Registers a kit in status `New` with a matching first history entry.
    ///
    /// # Errors
    /// - `Validation` for malformed code or barcode.
    /// - `Integrity` when the code is already taken.
    pub fn register_kit(&mut self, code: &str, barcode: &str) -> RepoResult<Kit> {
        let kit = self.session.transaction(|tx| -> RepoResult<Kit> {
            let repo = SqliteKitRepository::new(tx);
            let mut kit = Kit::new(code, barcode, KitStatus::New);
            kit.add_status(StatusEntry::new(KitStatus::New))?;
            repo.persist(&mut kit)?;
            Ok(kit)
        })?;
        info!(
            "event=kit_register module=service status=ok kit={}",
            kit.id()
        );
        Ok(kit)
    }

    /// Moves a kit to `status` and appends the change to its history.
    pub fn record_status(&mut self, kit_id: KitId, status: KitStatus) -> RepoResult<Kit> {
        self.session.transaction(|tx| -> RepoResult<Kit> {
            let repo = SqliteKitRepository::new(tx);
            let mut kit = repo
                .find_by_id(kit_id)?
                .ok_or(RepoError::NotFound(kit_id))?;
            kit.transition_to(status)?;
            kit.status_history(&repo)?;
            repo.flush(&mut kit)?;
            Ok(kit)
        })
    }

    /// Deletes every history entry of a kit, keeping the kit.
    pub fn clear_history(&mut self, kit_id: KitId) -> RepoResult<()> {
        self.session.transaction(|tx| -> RepoResult<()> {
            let repo = SqliteKitRepository::new(tx);
            let mut kit = repo
                .find_by_id(kit_id)?
                .ok_or(RepoError::NotFound(kit_id))?;
            kit.delete_history();
            repo.flush(&mut kit)
        })
    }

    /// Returns one kit's history in insertion order.
    pub fn history(&mut self, kit_id: KitId) -> RepoResult<Vec<StatusEntry>> {
        self.session.transaction(|tx| -> RepoResult<Vec<StatusEntry>> {
            let repo = SqliteKitRepository::new(tx);
            let mut kit = repo
                .find_by_id(kit_id)?
                .ok_or(RepoError::NotFound(kit_id))?;
            Ok(kit.status_history(&repo)?.to_vec())
        })
    }

    /// Lists every kit with history fetched.
    pub fn list_with_history(&mut self) -> RepoResult<Vec<Kit>> {
        self.session
            .transaction(|tx| SqliteKitRepository::new(tx).find_all_with_history())
    }

    /// Deletes all kits and history, returning the affected row count.
    pub fn reset(&mut self) -> RepoResult<usize> {
        self.session
            .transaction(|tx| SqliteKitRepository::new(tx).delete_all())
    }
}
