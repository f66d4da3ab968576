//! Kit aggregate and its status history.
//!
//! # Responsibility
//! - Define the `Kit` parent record and the `StatusEntry` children it owns.
//! - Keep both sides of the kit/entry link consistent through aggregate
//!   methods only.
//! - Track pending history removals until the next repository flush.
//!
//! # Invariants
//! - Every entry held by a kit carries that kit's id as its back-reference.
//! - The back-reference is private; only `Kit::add_status` sets it and
//!   `Kit::remove_status` clears it.
//! - An entry linked to one kit is never silently moved to another.
//! - History order is insertion order.

use crate::db::TxGeneration;
use crate::repo::kit_repo::{HistoryLoader, RepoResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Surrogate key of a kit.
pub type KitId = Uuid;

/// Surrogate key of a status history entry.
pub type StatusEntryId = Uuid;

/// Non-blank, no surrounding whitespace, no control characters.
static KIT_LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s\p{Cc}](?:[^\p{Cc}]*[^\s\p{Cc}])?$").expect("valid kit label regex")
});
const KIT_CODE_MAX_CHARS: usize = 64;
const KIT_BARCODE_MAX_CHARS: usize = 128;

/// Lifecycle status shared by kits and their history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitStatus {
    /// Registered, not yet in use.
    New,
    /// Handed out and in use.
    Active,
    /// Retired.
    Closed,
}

/// Validation errors for kit fields and kit/entry linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KitValidationError {
    InvalidCode(String),
    InvalidBarcode(String),
    /// Entry is already linked to a different kit.
    EntryOwnedByOtherKit {
        entry: StatusEntryId,
        owner: KitId,
    },
    /// Entry is already linked to this kit.
    DuplicateEntry(StatusEntryId),
    /// Entry in the collection does not point back to the kit holding it.
    BrokenBackReference {
        entry: StatusEntryId,
        kit: KitId,
    },
}

impl Display for KitValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCode(code) => write!(f, "invalid kit code `{code}`"),
            Self::InvalidBarcode(barcode) => write!(f, "invalid kit barcode `{barcode}`"),
            Self::EntryOwnedByOtherKit { entry, owner } => {
                write!(f, "status entry {entry} already belongs to kit {owner}")
            }
            Self::DuplicateEntry(entry) => {
                write!(f, "status entry {entry} is already in this kit's history")
            }
            Self::BrokenBackReference { entry, kit } => {
                write!(f, "status entry {entry} does not point back to kit {kit}")
            }
        }
    }
}

impl Error for KitValidationError {}

/// One status change in a kit's history.
///
/// Equality compares every field, including the back-reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub uuid: StatusEntryId,
    pub status: KitStatus,
    /// Unix epoch milliseconds.
    pub operation_date: i64,
    #[serde(rename = "kit_uuid")]
    kit_id: Option<KitId>,
    #[serde(skip)]
    persisted: bool,
}

impl StatusEntry {
    /// Creates an unlinked entry stamped with the current time.
    pub fn new(status: KitStatus) -> Self {
        Self::with_operation_date(status, now_epoch_ms())
    }

    pub fn with_operation_date(status: KitStatus, operation_date: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            status,
            operation_date,
            kit_id: None,
            persisted: false,
        }
    }

    /// Owning kit, or `None` while the entry is not linked.
    pub fn kit_id(&self) -> Option<KitId> {
        self.kit_id
    }

    pub(crate) fn from_storage(
        uuid: StatusEntryId,
        status: KitStatus,
        operation_date: i64,
        kit_id: KitId,
    ) -> Self {
        Self {
            uuid,
            status,
            operation_date,
            kit_id: Some(kit_id),
            persisted: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryFetch {
    /// `history` mirrors storage plus unsaved additions.
    Fetched,
    /// Stored rows not read yet; `history` holds only unsaved additions.
    Deferred(TxGeneration),
}

/// History rows to delete on the next flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PendingRemovals {
    pub(crate) all: bool,
    pub(crate) entries: Vec<StatusEntryId>,
}

/// A kit together with the status history it owns.
#[derive(Debug, Clone)]
pub struct Kit {
    uuid: KitId,
    pub code: String,
    pub barcode: String,
    pub status: KitStatus,
    history: Vec<StatusEntry>,
    fetch: HistoryFetch,
    removals: PendingRemovals,
}

/// Serializable view of a kit and whatever history it has fetched.
#[derive(Debug, Serialize)]
pub struct KitSnapshot<'a> {
    pub uuid: KitId,
    pub code: &'a str,
    pub barcode: &'a str,
    pub status: KitStatus,
    /// `None` when history was never fetched.
    pub status_history: Option<&'a [StatusEntry]>,
}

impl Kit {
    /// Creates a new kit with a generated id and an empty history.
    pub fn new(code: impl Into<String>, barcode: impl Into<String>, status: KitStatus) -> Self {
        Self::with_id(Uuid::new_v4(), code, barcode, status)
    }

    /// Creates a kit with a caller-provided id.
    pub fn with_id(
        uuid: KitId,
        code: impl Into<String>,
        barcode: impl Into<String>,
        status: KitStatus,
    ) -> Self {
        Self {
            uuid,
            code: code.into(),
            barcode: barcode.into(),
            status,
            history: Vec::new(),
            fetch: HistoryFetch::Fetched,
            removals: PendingRemovals::default(),
        }
    }

    pub(crate) fn from_storage_deferred(
        uuid: KitId,
        code: String,
        barcode: String,
        status: KitStatus,
        generation: TxGeneration,
    ) -> Self {
        Self {
            fetch: HistoryFetch::Deferred(generation),
            ..Self::with_id(uuid, code, barcode, status)
        }
    }

    pub(crate) fn from_storage_fetched(
        uuid: KitId,
        code: String,
        barcode: String,
        status: KitStatus,
        history: Vec<StatusEntry>,
    ) -> Self {
        Self {
            history,
            ..Self::with_id(uuid, code, barcode, status)
        }
    }

    pub fn id(&self) -> KitId {
        self.uuid
    }

    /// Validates kit fields and the back-reference of every held entry.
    pub fn validate(&self) -> Result<(), KitValidationError> {
        if !is_valid_label(&self.code, KIT_CODE_MAX_CHARS) {
            return Err(KitValidationError::InvalidCode(self.code.clone()));
        }
        if !is_valid_label(&self.barcode, KIT_BARCODE_MAX_CHARS) {
            return Err(KitValidationError::InvalidBarcode(self.barcode.clone()));
        }
        if let Some(entry) = self
            .history
            .iter()
            .find(|entry| entry.kit_id != Some(self.uuid))
        {
            return Err(KitValidationError::BrokenBackReference {
                entry: entry.uuid,
                kit: self.uuid,
            });
        }
        Ok(())
    }

    /// Appends `entry` to the history and links it back to this kit.
    ///
    /// Nothing changes when an error is returned. An entry that was stored
    /// before and has since been removed gets a fresh id, so it never clashes
    /// with its old row, whichever kit is flushed first.
    ///
    /// # Errors
    /// - `EntryOwnedByOtherKit` when the entry is linked to another kit.
    /// - `DuplicateEntry` when the entry is already linked to this kit.
    pub fn add_status(&mut self, mut entry: StatusEntry) -> Result<(), KitValidationError> {
        match entry.kit_id {
            Some(owner) if owner == self.uuid => {
                return Err(KitValidationError::DuplicateEntry(entry.uuid));
            }
            Some(owner) => {
                return Err(KitValidationError::EntryOwnedByOtherKit {
                    entry: entry.uuid,
                    owner,
                });
            }
            None => {}
        }
        if self.history.iter().any(|held| held.uuid == entry.uuid) {
            return Err(KitValidationError::DuplicateEntry(entry.uuid));
        }

        if entry.persisted {
            entry.uuid = Uuid::new_v4();
            entry.persisted = false;
        }
        entry.kit_id = Some(self.uuid);
        self.history.push(entry);
        Ok(())
    }

    /// Sets the kit status and records the change in history.
    pub fn transition_to(&mut self, status: KitStatus) -> Result<(), KitValidationError> {
        self.add_status(StatusEntry::new(status))?;
        self.status = status;
        Ok(())
    }

    /// Unlinks one entry. Its stored row is deleted on the next flush.
    ///
    /// Returns `None` when the entry is not part of this kit's history.
    pub fn remove_status(
        &mut self,
        entry_id: StatusEntryId,
        loader: &dyn HistoryLoader,
    ) -> RepoResult<Option<StatusEntry>> {
        self.ensure_history(loader)?;
        let Some(index) = self.history.iter().position(|entry| entry.uuid == entry_id) else {
            return Ok(None);
        };

        let mut entry = self.history.remove(index);
        if entry.persisted {
            self.removals.entries.push(entry.uuid);
        }
        entry.kit_id = None;
        Ok(Some(entry))
    }

    /// Removes every entry. Stored rows are deleted on the next flush.
    ///
    /// Does not need fetched history and is idempotent.
    pub fn delete_history(&mut self) {
        self.history.clear();
        self.fetch = HistoryFetch::Fetched;
        self.removals.all = true;
        self.removals.entries.clear();
    }

    /// Returns the history in insertion order, fetching it if still deferred.
    ///
    /// # Errors
    /// - `SessionClosed` when a fetch is needed but the transaction this kit
    ///   was read in has ended.
    pub fn status_history(&mut self, loader: &dyn HistoryLoader) -> RepoResult<&[StatusEntry]> {
        self.ensure_history(loader)?;
        Ok(&self.history)
    }

    /// Returns whether the history is empty, fetching it if still deferred.
    pub fn is_history_empty(&mut self, loader: &dyn HistoryLoader) -> RepoResult<bool> {
        Ok(self.status_history(loader)?.is_empty())
    }

    /// Returns the history only if it has already been fetched.
    pub fn fetched_history(&self) -> Option<&[StatusEntry]> {
        match self.fetch {
            HistoryFetch::Fetched => Some(&self.history),
            HistoryFetch::Deferred(_) => None,
        }
    }

    pub fn is_history_fetched(&self) -> bool {
        self.fetch == HistoryFetch::Fetched
    }

    pub fn snapshot(&self) -> KitSnapshot<'_> {
        KitSnapshot {
            uuid: self.uuid,
            code: &self.code,
            barcode: &self.barcode,
            status: self.status,
            status_history: self.fetched_history(),
        }
    }

    pub(crate) fn pending_removals(&self) -> &PendingRemovals {
        &self.removals
    }

    pub(crate) fn unsaved_entries(&self) -> impl Iterator<Item = &StatusEntry> {
        self.history.iter().filter(|entry| !entry.persisted)
    }

    /// Records that every pending change reached storage.
    pub(crate) fn mark_flushed(&mut self) {
        self.removals = PendingRemovals::default();
        for entry in &mut self.history {
            entry.persisted = true;
        }
    }

    fn ensure_history(&mut self, loader: &dyn HistoryLoader) -> RepoResult<()> {
        if let HistoryFetch::Deferred(generation) = self.fetch {
            let mut stored = loader.load_history(self.uuid, generation)?;
            // Additions flushed while deferred are already among the stored rows.
            for entry in std::mem::take(&mut self.history) {
                if !stored.iter().any(|held| held.uuid == entry.uuid) {
                    stored.push(entry);
                }
            }
            self.history = stored;
            self.fetch = HistoryFetch::Fetched;
        }
        Ok(())
    }
}

fn is_valid_label(value: &str, max_chars: usize) -> bool {
    value.chars().count() <= max_chars && KIT_LABEL_RE.is_match(value)
}

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{Kit, KitStatus, KitValidationError, PendingRemovals, StatusEntry};
    use crate::db::TxGeneration;
    use crate::model::kit::KitId;
    use crate::repo::kit_repo::{HistoryLoader, RepoError, RepoResult};
    use std::cell::Cell;

    struct StubLoader {
        rows: Vec<(KitStatus, i64)>,
        generation: Option<TxGeneration>,
        calls: Cell<u32>,
    }

    impl HistoryLoader for StubLoader {
        fn load_history(
            &self,
            kit_id: KitId,
            fetched_in: TxGeneration,
        ) -> RepoResult<Vec<StatusEntry>> {
            self.calls.set(self.calls.get() + 1);
            if self.generation != Some(fetched_in) {
                return Err(RepoError::SessionClosed(kit_id));
            }
            Ok(self
                .rows
                .iter()
                .map(|(status, at)| {
                    StatusEntry::from_storage(uuid::Uuid::new_v4(), *status, *at, kit_id)
                })
                .collect())
        }
    }

    struct StoredLoader {
        rows: Vec<StatusEntry>,
    }

    impl HistoryLoader for StoredLoader {
        fn load_history(&self, _: KitId, _: TxGeneration) -> RepoResult<Vec<StatusEntry>> {
            Ok(self.rows.clone())
        }
    }

    fn stub(generation: Option<TxGeneration>) -> StubLoader {
        StubLoader {
            rows: vec![(KitStatus::New, 10), (KitStatus::Active, 20)],
            generation,
            calls: Cell::new(0),
        }
    }

    #[test]
    fn add_status_links_both_sides() {
        let mut kit = Kit::new("SK_CODE", "SK_BARCODE", KitStatus::New);
        let entry = StatusEntry::new(KitStatus::New);
        let entry_id = entry.uuid;
        assert_eq!(entry.kit_id(), None);

        kit.add_status(entry).unwrap();

        let history = kit.fetched_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].uuid, entry_id);
        assert_eq!(history[0].kit_id(), Some(kit.id()));
        kit.validate().unwrap();
    }

    #[test]
    fn add_status_rejects_entry_owned_by_other_kit_without_side_effects() {
        let mut first = Kit::new("FIRST", "B1", KitStatus::New);
        let mut second = Kit::new("SECOND", "B2", KitStatus::New);
        first.add_status(StatusEntry::new(KitStatus::New)).unwrap();
        let borrowed = first.fetched_history().unwrap()[0].clone();

        let err = second.add_status(borrowed.clone()).unwrap_err();
        assert_eq!(
            err,
            KitValidationError::EntryOwnedByOtherKit {
                entry: borrowed.uuid,
                owner: first.id(),
            }
        );
        assert!(second.fetched_history().unwrap().is_empty());
        assert_eq!(first.fetched_history().unwrap()[0].kit_id(), Some(first.id()));
    }

    #[test]
    fn add_status_rejects_duplicates() {
        let mut kit = Kit::new("SK_CODE", "SK_BARCODE", KitStatus::New);
        kit.add_status(StatusEntry::new(KitStatus::New)).unwrap();
        let copy = kit.fetched_history().unwrap()[0].clone();

        let err = kit.add_status(copy.clone()).unwrap_err();
        assert_eq!(err, KitValidationError::DuplicateEntry(copy.uuid));
        assert_eq!(kit.fetched_history().unwrap().len(), 1);
    }

    #[test]
    fn removed_entry_is_unlinked_and_can_move_to_another_kit() {
        let loader = stub(None);
        let mut first = Kit::new("FIRST", "B1", KitStatus::New);
        let mut second = Kit::new("SECOND", "B2", KitStatus::New);
        let entry = StatusEntry::new(KitStatus::Active);
        let entry_id = entry.uuid;
        first.add_status(entry).unwrap();

        let removed = first.remove_status(entry_id, &loader).unwrap().unwrap();
        assert_eq!(removed.kit_id(), None);
        assert!(first.fetched_history().unwrap().is_empty());
        // Unsaved entries leave nothing behind to delete.
        assert_eq!(first.pending_removals(), &PendingRemovals::default());

        second.add_status(removed).unwrap();
        assert_eq!(second.fetched_history().unwrap()[0].kit_id(), Some(second.id()));
        assert_eq!(loader.calls.get(), 0);
    }

    #[test]
    fn delete_history_is_idempotent_and_needs_no_fetch() {
        let mut kit =
            Kit::from_storage_deferred(uuid::Uuid::new_v4(), "C".into(), "B".into(), KitStatus::New, 3);
        kit.add_status(StatusEntry::new(KitStatus::Active)).unwrap();

        kit.delete_history();
        kit.delete_history();

        assert_eq!(kit.fetched_history(), Some(&[][..]));
        assert!(kit.pending_removals().all);
        assert_eq!(kit.unsaved_entries().count(), 0);
    }

    #[test]
    fn deferred_history_fetches_once_in_the_same_transaction() {
        let loader = stub(Some(7));
        let mut kit =
            Kit::from_storage_deferred(uuid::Uuid::new_v4(), "C".into(), "B".into(), KitStatus::New, 7);
        kit.add_status(StatusEntry::with_operation_date(KitStatus::Closed, 30))
            .unwrap();
        assert!(kit.fetched_history().is_none());

        let statuses: Vec<KitStatus> = kit
            .status_history(&loader)
            .unwrap()
            .iter()
            .map(|entry| entry.status)
            .collect();
        assert_eq!(
            statuses,
            vec![KitStatus::New, KitStatus::Active, KitStatus::Closed]
        );
        assert!(!kit.is_history_empty(&loader).unwrap());
        assert_eq!(loader.calls.get(), 1);
        assert_eq!(kit.unsaved_entries().count(), 1);
    }

    #[test]
    fn deferred_history_fails_after_transaction_ends() {
        let loader = stub(Some(8));
        let mut kit =
            Kit::from_storage_deferred(uuid::Uuid::new_v4(), "C".into(), "B".into(), KitStatus::New, 7);

        let err = kit.status_history(&loader).unwrap_err();
        assert!(matches!(err, RepoError::SessionClosed(id) if id == kit.id()));
        assert!(!kit.is_history_fetched());
    }

    #[test]
    fn transition_updates_status_and_history() {
        let mut kit = Kit::new("SK_CODE", "SK_BARCODE", KitStatus::New);
        kit.transition_to(KitStatus::Active).unwrap();

        assert_eq!(kit.status, KitStatus::Active);
        assert_eq!(kit.fetched_history().unwrap()[0].status, KitStatus::Active);
    }

    #[test]
    fn validate_rejects_bad_code_and_barcode() {
        let kit = Kit::new("", "SK_BARCODE", KitStatus::New);
        assert!(matches!(kit.validate(), Err(KitValidationError::InvalidCode(_))));

        let kit = Kit::new("SK_CODE", " padded", KitStatus::New);
        assert!(matches!(
            kit.validate(),
            Err(KitValidationError::InvalidBarcode(_))
        ));

        let kit = Kit::new("X".repeat(65), "SK_BARCODE", KitStatus::New);
        assert!(matches!(kit.validate(), Err(KitValidationError::InvalidCode(_))));

        let kit = Kit::new("line\nbreak", "SK_BARCODE", KitStatus::New);
        assert!(matches!(kit.validate(), Err(KitValidationError::InvalidCode(_))));
    }

    #[test]
    fn validate_accepts_free_form_labels() {
        Kit::new("SK CODE 7", "BC/2024 #1", KitStatus::New)
            .validate()
            .unwrap();
        Kit::new("K", "é", KitStatus::New).validate().unwrap();
    }

    #[test]
    fn stored_entry_moved_to_another_kit_gets_a_fresh_id() {
        let loader = stub(None);
        let mut first = Kit::new("FIRST", "B1", KitStatus::New);
        let mut second = Kit::new("SECOND", "B2", KitStatus::New);
        first.add_status(StatusEntry::new(KitStatus::Active)).unwrap();
        first.mark_flushed();
        let stored_id = first.fetched_history().unwrap()[0].uuid;

        let removed = first.remove_status(stored_id, &loader).unwrap().unwrap();
        assert_eq!(first.pending_removals().entries, vec![stored_id]);
        second.add_status(removed).unwrap();

        let moved = &second.fetched_history().unwrap()[0];
        assert_ne!(moved.uuid, stored_id);
        assert_eq!(moved.status, KitStatus::Active);
        assert_eq!(second.unsaved_entries().count(), 1);
    }

    #[test]
    fn deferred_fetch_after_flush_does_not_repeat_entries() {
        let mut kit =
            Kit::from_storage_deferred(uuid::Uuid::new_v4(), "C".into(), "B".into(), KitStatus::New, 7);
        kit.add_status(StatusEntry::with_operation_date(KitStatus::Closed, 30))
            .unwrap();
        kit.mark_flushed();
        let flushed = kit.history[0].clone();
        let loader = StoredLoader {
            rows: vec![StatusEntry::from_storage(
                flushed.uuid,
                flushed.status,
                flushed.operation_date,
                kit.id(),
            )],
        };

        let history = kit.status_history(&loader).unwrap();
        assert_eq!(history, &[flushed][..]);
    }

    #[test]
    fn snapshot_serializes_history_with_back_reference() {
        let mut kit = Kit::new("SK_CODE", "SK_BARCODE", KitStatus::New);
        kit.add_status(StatusEntry::with_operation_date(KitStatus::New, 42))
            .unwrap();

        let value = serde_json::to_value(kit.snapshot()).unwrap();
        assert_eq!(value["code"], "SK_CODE");
        assert_eq!(value["status"], "new");
        assert_eq!(value["status_history"][0]["operation_date"], 42);
        assert_eq!(
            value["status_history"][0]["kit_uuid"],
            kit.id().to_string()
        );
    }
}
