//! Explicit transaction boundary over one SQLite connection.
//!
//! # Responsibility
//! - Own the connection and the `NotActive -> Active -> NotActive` state machine.
//! - Hand out the connection only while a transaction is active.
//! - Number every transaction so lazily fetched state can detect staleness.
//!
//! # Invariants
//! - Reads and writes through `connection()` require `TxState::Active`.
//! - `begin` while active and `commit`/`rollback` while not active are
//!   illegal-state errors, never silent no-ops.
//! - A failed commit leaves the session `NotActive` with the transaction rolled
//!   back.
//! - Dropping a session with an active transaction rolls it back.

use crate::db::DbError;
use log::{debug, error, warn};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Monotonic number of the transaction a session is (or was) running.
pub type TxGeneration = u64;

pub type SessionResult<T> = Result<T, SessionError>;

/// Transaction state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    NotActive,
    Active,
}

impl TxState {
    fn as_str(self) -> &'static str {
        match self {
            Self::NotActive => "not_active",
            Self::Active => "active",
        }
    }
}

impl Display for TxState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the transaction boundary.
#[derive(Debug)]
pub enum SessionError {
    /// Operation is not allowed in the current transaction state.
    IllegalState {
        operation: &'static str,
        state: TxState,
    },
    Db(DbError),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalState { operation, state } => {
                write!(f, "illegal state: cannot {operation} while transaction is {state}")
            }
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::IllegalState { .. } => None,
            Self::Db(err) => Some(err),
        }
    }
}

impl From<DbError> for SessionError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// One connection plus its transaction state.
pub struct Session {
    conn: Connection,
    state: TxState,
    generation: TxGeneration,
}

impl Session {
    /// Wraps a migrated connection. The session starts `NotActive`.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            state: TxState::NotActive,
            generation: 0,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    /// Returns the running transaction number, or `None` outside a transaction.
    pub fn active_generation(&self) -> Option<TxGeneration> {
        self.is_active().then_some(self.generation)
    }

    /// Starts a new transaction and returns its generation.
    pub fn begin(&mut self) -> SessionResult<TxGeneration> {
        self.require_state("begin", TxState::NotActive)?;
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        self.generation += 1;
        self.state = TxState::Active;
        debug!(
            "event=tx_begin module=session status=ok generation={}",
            self.generation
        );
        Ok(self.generation)
    }

    /// Commits the running transaction.
    ///
    /// # Errors
    /// - `IllegalState` when no transaction is active.
    /// - `Db` when SQLite refuses the commit; the transaction is rolled back.
    pub fn commit(&mut self) -> SessionResult<()> {
        self.require_state("commit", TxState::Active)?;
        self.state = TxState::NotActive;

        if let Err(err) = self.conn.execute_batch("COMMIT;") {
            error!(
                "event=tx_commit module=session status=error generation={} error={}",
                self.generation, err
            );
            self.discard_open_transaction();
            return Err(err.into());
        }

        debug!(
            "event=tx_commit module=session status=ok generation={}",
            self.generation
        );
        Ok(())
    }

    /// Rolls back the running transaction.
    pub fn rollback(&mut self) -> SessionResult<()> {
        self.require_state("rollback", TxState::Active)?;
        self.state = TxState::NotActive;
        self.conn.execute_batch("ROLLBACK;")?;
        debug!(
            "event=tx_rollback module=session status=ok generation={}",
            self.generation
        );
        Ok(())
    }

    /// Returns the connection joined to the running transaction.
    ///
    /// # Errors
    /// - `IllegalState` when no transaction is active.
    pub fn connection(&self) -> SessionResult<&Connection> {
        self.require_state("access storage", TxState::Active)?;
        Ok(&self.conn)
    }

    /// Returns the connection together with the running transaction number.
    pub fn joined(&self) -> SessionResult<(&Connection, TxGeneration)> {
        let conn = self.connection()?;
        Ok((conn, self.generation))
    }

    /// Runs `work` inside one transaction.
    ///
    /// Commits when `work` succeeds; rolls back and returns the original
    /// error when it fails.
    pub fn transaction<T, E>(&mut self, work: impl FnOnce(&Session) -> Result<T, E>) -> Result<T, E>
    where
        E: From<SessionError>,
    {
        self.begin()?;
        match work(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    error!(
                        "event=tx_rollback module=session status=error generation={} error={}",
                        self.generation, rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    fn require_state(&self, operation: &'static str, expected: TxState) -> SessionResult<()> {
        if self.state != expected {
            return Err(SessionError::IllegalState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn discard_open_transaction(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK;") {
                error!(
                    "event=tx_rollback module=session status=error generation={} error={}",
                    self.generation, err
                );
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_active() {
            warn!(
                "event=session_drop module=session status=rollback generation={}",
                self.generation
            );
            self.state = TxState::NotActive;
            self.discard_open_transaction();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionError, TxState};
    use crate::db::{open_db, open_db_in_memory};

    fn insert_kit(session: &Session, uuid: &str, code: &str) {
        session
            .connection()
            .unwrap()
            .execute(
                "INSERT INTO kits (uuid, code, barcode, status) VALUES (?1, ?2, 'BC', 'new');",
                [uuid, code],
            )
            .unwrap();
    }

    fn kit_count(session: &Session) -> i64 {
        session
            .connection()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM kits;", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn begin_commit_walks_the_state_machine() {
        let mut session = Session::new(open_db_in_memory().unwrap());
        assert_eq!(session.state(), TxState::NotActive);
        assert_eq!(session.active_generation(), None);

        let generation = session.begin().unwrap();
        assert_eq!(session.state(), TxState::Active);
        assert_eq!(session.active_generation(), Some(generation));

        session.commit().unwrap();
        assert_eq!(session.state(), TxState::NotActive);

        let next = session.begin().unwrap();
        assert!(next > generation);
        session.rollback().unwrap();
    }

    #[test]
    fn operations_outside_active_transaction_are_illegal() {
        let mut session = Session::new(open_db_in_memory().unwrap());

        assert!(matches!(
            session.connection(),
            Err(SessionError::IllegalState {
                state: TxState::NotActive,
                ..
            })
        ));
        assert!(matches!(
            session.commit(),
            Err(SessionError::IllegalState { operation: "commit", .. })
        ));
        assert!(matches!(
            session.rollback(),
            Err(SessionError::IllegalState { operation: "rollback", .. })
        ));

        session.begin().unwrap();
        let err = session.begin().unwrap_err();
        assert!(matches!(
            err,
            SessionError::IllegalState {
                operation: "begin",
                state: TxState::Active
            }
        ));
        assert!(err.to_string().contains("illegal state"));
    }

    #[test]
    fn rollback_discards_writes() {
        let mut session = Session::new(open_db_in_memory().unwrap());

        session.begin().unwrap();
        insert_kit(&session, "kit-1", "CODE-1");
        session.rollback().unwrap();

        session.begin().unwrap();
        assert_eq!(kit_count(&session), 0);
        session.commit().unwrap();
    }

    #[test]
    fn failed_work_is_rolled_back_by_transaction_helper() {
        let mut session = Session::new(open_db_in_memory().unwrap());

        let result: Result<(), SessionError> = session.transaction(|tx| {
            insert_kit(tx, "kit-1", "CODE-1");
            Err(SessionError::IllegalState {
                operation: "test",
                state: TxState::Active,
            })
        });
        assert!(result.is_err());
        assert_eq!(session.state(), TxState::NotActive);

        let count = session
            .transaction(|tx| Ok::<_, SessionError>(kit_count(tx)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn dropping_active_session_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kits.db");

        let mut session = Session::new(open_db(&path).unwrap());
        session.begin().unwrap();
        insert_kit(&session, "kit-1", "CODE-1");
        drop(session);

        let mut reopened = Session::new(open_db(&path).unwrap());
        reopened.begin().unwrap();
        assert_eq!(kit_count(&reopened), 0);
        reopened.commit().unwrap();
    }
}
