//! Kit repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide the named kit queries (`find_all`, `find_all_with_history`,
//!   `delete_all`) plus aggregate persist/flush.
//! - Serve deferred history fetches for kits read in the running transaction.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Every statement runs through an active `Session`; nothing touches
//!   storage outside a transaction.
//! - Write paths call `Kit::validate()` before SQL mutations.
//! - History rows are returned in insertion order (`position ASC`).
//! - Constraint violations surface as `RepoError::Integrity`.

use crate::db::{DbError, Session, SessionError, TxGeneration};
use crate::model::kit::{Kit, KitId, KitStatus, KitValidationError, StatusEntry};
use log::{debug, info};
use rusqlite::{params, Connection, ErrorCode, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const KIT_SELECT_SQL: &str = "SELECT
    uuid,
    code,
    barcode,
    status
FROM kits";

const KIT_FIND_ALL_WITH_HISTORY_SQL: &str = "SELECT
    k.uuid AS kit_uuid,
    k.code AS code,
    k.barcode AS barcode,
    k.status AS kit_status,
    h.uuid AS entry_uuid,
    h.status AS entry_status,
    h.operation_date AS operation_date
FROM kits k
LEFT JOIN kit_status_history h ON h.kit_uuid = k.uuid
ORDER BY k.rowid ASC, h.position ASC;";

const HISTORY_SELECT_SQL: &str = "SELECT
    uuid,
    status,
    operation_date
FROM kit_status_history
WHERE kit_uuid = ?1
ORDER BY position ASC;";

const HISTORY_INSERT_SQL: &str = "INSERT INTO kit_status_history (
    uuid,
    kit_uuid,
    status,
    operation_date,
    position
) VALUES (
    ?1,
    ?2,
    ?3,
    ?4,
    (SELECT COALESCE(MAX(position), -1) + 1 FROM kit_status_history WHERE kit_uuid = ?2)
);";

const STATUS_DELETE_ALL_SQL: &str = "DELETE FROM kit_status_history;";
const KIT_DELETE_ALL_SQL: &str = "DELETE FROM kits;";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for kit persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(KitValidationError),
    /// Transaction boundary refused the operation.
    Session(SessionError),
    /// Uniqueness or foreign-key constraint violated.
    Integrity(String),
    /// Deferred history requested after its transaction ended.
    SessionClosed(KitId),
    NotFound(KitId),
    InvalidData(String),
    Db(DbError),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Session(err) => write!(f, "{err}"),
            Self::Integrity(message) => write!(f, "integrity violation: {message}"),
            Self::SessionClosed(id) => write!(
                f,
                "session closed: history of kit {id} cannot be fetched outside the transaction it was read in"
            ),
            Self::NotFound(id) => write!(f, "kit not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted kit data: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Session(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Integrity(_) => None,
            Self::SessionClosed(_) => None,
            Self::NotFound(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<KitValidationError> for RepoError {
    fn from(value: KitValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<SessionError> for RepoError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        match &value {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Self::Integrity(message.clone().unwrap_or_else(|| failure.to_string()))
            }
            _ => Self::Db(DbError::Sqlite(value)),
        }
    }
}

/// Source of deferred kit history.
///
/// Implementations must refuse to load history for a kit read in a
/// transaction other than the one currently running.
pub trait HistoryLoader {
    fn load_history(&self, kit_id: KitId, fetched_in: TxGeneration)
        -> RepoResult<Vec<StatusEntry>>;
}

/// Repository interface for kit aggregates.
pub trait KitRepository: HistoryLoader {
    /// Inserts a new kit and its history.
    fn persist(&self, kit: &mut Kit) -> RepoResult<KitId>;
    /// Writes kit fields and pending history changes of a stored kit.
    fn flush(&self, kit: &mut Kit) -> RepoResult<()>;
    fn find_by_id(&self, id: KitId) -> RepoResult<Option<Kit>>;
    fn find_by_code(&self, code: &str) -> RepoResult<Option<Kit>>;
    /// Lists kits in storage order; history is fetched on first access.
    fn find_all(&self) -> RepoResult<Vec<Kit>>;
    /// Lists kits in storage order with history fetched in the same query.
    fn find_all_with_history(&self) -> RepoResult<Vec<Kit>>;
    /// Deletes all history rows and kits, returning the affected row count.
    fn delete_all(&self) -> RepoResult<usize>;
}

/// SQLite-backed kit repository joined to one session.
pub struct SqliteKitRepository<'s> {
    session: &'s Session,
}

impl<'s> SqliteKitRepository<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self { session }
    }
}

impl HistoryLoader for SqliteKitRepository<'_> {
    fn load_history(
        &self,
        kit_id: KitId,
        fetched_in: TxGeneration,
    ) -> RepoResult<Vec<StatusEntry>> {
        let (conn, generation) = match self.session.joined() {
            Ok(joined) => joined,
            Err(SessionError::IllegalState { .. }) => return Err(RepoError::SessionClosed(kit_id)),
            Err(err) => return Err(err.into()),
        };
        if generation != fetched_in {
            return Err(RepoError::SessionClosed(kit_id));
        }

        let history = select_history(conn, kit_id)?;
        debug!(
            "event=kit_history_fetch module=repo status=ok kit={} entries={}",
            kit_id,
            history.len()
        );
        Ok(history)
    }
}

impl KitRepository for SqliteKitRepository<'_> {
    fn persist(&self, kit: &mut Kit) -> RepoResult<KitId> {
        kit.validate()?;
        let conn = self.session.connection()?;

        conn.execute(
            "INSERT INTO kits (
                uuid,
                code,
                barcode,
                status
            ) VALUES (?1, ?2, ?3, ?4);",
            params![
                kit.id().to_string(),
                kit.code.as_str(),
                kit.barcode.as_str(),
                kit_status_to_db(kit.status),
            ],
        )?;
        write_history_changes(conn, kit)?;
        kit.mark_flushed();

        debug!("event=kit_persist module=repo status=ok kit={}", kit.id());
        Ok(kit.id())
    }

    fn flush(&self, kit: &mut Kit) -> RepoResult<()> {
        kit.validate()?;
        let conn = self.session.connection()?;

        let changed = conn.execute(
            "UPDATE kits
             SET
                code = ?1,
                barcode = ?2,
                status = ?3,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE uuid = ?4;",
            params![
                kit.code.as_str(),
                kit.barcode.as_str(),
                kit_status_to_db(kit.status),
                kit.id().to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(kit.id()));
        }

        write_history_changes(conn, kit)?;
        kit.mark_flushed();

        debug!("event=kit_flush module=repo status=ok kit={}", kit.id());
        Ok(())
    }

    fn find_by_id(&self, id: KitId) -> RepoResult<Option<Kit>> {
        let (conn, generation) = self.session.joined()?;
        let mut stmt = conn.prepare(&format!("{KIT_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_kit_row(row, generation)?));
        }
        Ok(None)
    }

    fn find_by_code(&self, code: &str) -> RepoResult<Option<Kit>> {
        let (conn, generation) = self.session.joined()?;
        let mut stmt = conn.prepare(&format!("{KIT_SELECT_SQL} WHERE code = ?1;"))?;
        let mut rows = stmt.query([code])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_kit_row(row, generation)?));
        }
        Ok(None)
    }

    fn find_all(&self) -> RepoResult<Vec<Kit>> {
        let (conn, generation) = self.session.joined()?;
        let mut stmt = conn.prepare(&format!("{KIT_SELECT_SQL} ORDER BY rowid ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut kits = Vec::new();
        while let Some(row) = rows.next()? {
            kits.push(parse_kit_row(row, generation)?);
        }
        Ok(kits)
    }

    fn find_all_with_history(&self) -> RepoResult<Vec<Kit>> {
        let conn = self.session.connection()?;
        let mut stmt = conn.prepare(KIT_FIND_ALL_WITH_HISTORY_SQL)?;
        let mut rows = stmt.query([])?;

        let mut grouped: Vec<(KitColumns, Vec<StatusEntry>)> = Vec::new();
        while let Some(row) = rows.next()? {
            let kit_id = parse_uuid(&row.get::<_, String>("kit_uuid")?, "kits.uuid")?;
            let starts_new_kit = grouped
                .last()
                .map_or(true, |(columns, _)| columns.uuid != kit_id);
            if starts_new_kit {
                let status_text: String = row.get("kit_status")?;
                grouped.push((
                    KitColumns {
                        uuid: kit_id,
                        code: row.get("code")?,
                        barcode: row.get("barcode")?,
                        status: parse_status_column(&status_text, "kits.status")?,
                    },
                    Vec::new(),
                ));
            }

            let Some(entry_text) = row.get::<_, Option<String>>("entry_uuid")? else {
                continue;
            };
            let status_text: String = row.get("entry_status")?;
            let entry = StatusEntry::from_storage(
                parse_uuid(&entry_text, "kit_status_history.uuid")?,
                parse_status_column(&status_text, "kit_status_history.status")?,
                row.get("operation_date")?,
                kit_id,
            );
            if let Some((_, history)) = grouped.last_mut() {
                history.push(entry);
            }
        }

        let kits: Vec<Kit> = grouped
            .into_iter()
            .map(|(columns, history)| {
                Kit::from_storage_fetched(
                    columns.uuid,
                    columns.code,
                    columns.barcode,
                    columns.status,
                    history,
                )
            })
            .collect();
        debug!(
            "event=kit_find_all_with_history module=repo status=ok kits={}",
            kits.len()
        );
        Ok(kits)
    }

    fn delete_all(&self) -> RepoResult<usize> {
        let conn = self.session.connection()?;
        let entries = conn.execute(STATUS_DELETE_ALL_SQL, [])?;
        let kits = conn.execute(KIT_DELETE_ALL_SQL, [])?;
        info!(
            "event=kit_delete_all module=repo status=ok kits={} entries={}",
            kits, entries
        );
        Ok(kits + entries)
    }
}

struct KitColumns {
    uuid: KitId,
    code: String,
    barcode: String,
    status: KitStatus,
}

fn write_history_changes(conn: &Connection, kit: &Kit) -> RepoResult<()> {
    let kit_id = kit.id().to_string();
    let removals = kit.pending_removals();

    if removals.all {
        conn.execute(
            "DELETE FROM kit_status_history WHERE kit_uuid = ?1;",
            [kit_id.as_str()],
        )?;
    } else {
        for entry_id in &removals.entries {
            conn.execute(
                "DELETE FROM kit_status_history WHERE uuid = ?1 AND kit_uuid = ?2;",
                params![entry_id.to_string(), kit_id.as_str()],
            )?;
        }
    }

    let mut insert = conn.prepare_cached(HISTORY_INSERT_SQL)?;
    for entry in kit.unsaved_entries() {
        insert.execute(params![
            entry.uuid.to_string(),
            kit_id.as_str(),
            kit_status_to_db(entry.status),
            entry.operation_date,
        ])?;
    }

    Ok(())
}

fn select_history(conn: &Connection, kit_id: KitId) -> RepoResult<Vec<StatusEntry>> {
    let mut stmt = conn.prepare_cached(HISTORY_SELECT_SQL)?;
    let mut rows = stmt.query([kit_id.to_string()])?;
    let mut history = Vec::new();
    while let Some(row) = rows.next()? {
        let uuid_text: String = row.get("uuid")?;
        let status_text: String = row.get("status")?;
        history.push(StatusEntry::from_storage(
            parse_uuid(&uuid_text, "kit_status_history.uuid")?,
            parse_status_column(&status_text, "kit_status_history.status")?,
            row.get("operation_date")?,
            kit_id,
        ));
    }
    Ok(history)
}

fn parse_kit_row(row: &Row<'_>, generation: TxGeneration) -> RepoResult<Kit> {
    let uuid_text: String = row.get("uuid")?;
    let status_text: String = row.get("status")?;
    Ok(Kit::from_storage_deferred(
        parse_uuid(&uuid_text, "kits.uuid")?,
        row.get("code")?,
        row.get("barcode")?,
        parse_status_column(&status_text, "kits.status")?,
        generation,
    ))
}

fn parse_uuid(value: &str, column: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}

fn parse_status_column(value: &str, column: &str) -> RepoResult<KitStatus> {
    parse_kit_status(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid status `{value}` in {column}")))
}

fn kit_status_to_db(status: KitStatus) -> &'static str {
    match status {
        KitStatus::New => "new",
        KitStatus::Active => "active",
        KitStatus::Closed => "closed",
    }
}

fn parse_kit_status(value: &str) -> Option<KitStatus> {
    match value {
        "new" => Some(KitStatus::New),
        "active" => Some(KitStatus::Active),
        "closed" => Some(KitStatus::Closed),
        _ => None,
    }
}
