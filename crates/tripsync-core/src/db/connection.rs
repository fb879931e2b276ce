//! Database connection management and the transactional store contract

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, Params, Row};

use crate::error::{Error, Result};

use super::migrations;

/// One parameterized statement of a store transaction
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Persistent store backed by a single `SQLite` connection.
///
/// All access goes through one mutex, so writes are serialized and every
/// transaction sees a consistent view.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations and index checks automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let database = Self {
            conn: Mutex::new(conn),
        };
        database.configure()?;
        database.check_consistency()?;
        database.check_indexes()?;
        Ok(database)
    }

    /// Configure `SQLite` for optimal performance
    fn configure(&self) -> Result<()> {
        let conn = self.lock()?;
        // journal_mode answers with a row and is unsupported for in-memory databases
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Create missing schema objects and run pending migrations.
    ///
    /// Safe on every start, including the first one.
    pub fn check_consistency(&self) -> Result<()> {
        let mut conn = self.lock()?;
        migrations::run(&mut conn)
    }

    /// Create any missing indexes.
    pub fn check_indexes(&self) -> Result<()> {
        let conn = self.lock()?;
        migrations::ensure_indexes(&conn)
    }

    /// Run a read-only query and map every row.
    pub fn run_query<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, map)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Run a single mutating statement.
    ///
    /// Returns `Ok(false)` on a constraint violation; any other failure is an error.
    pub fn run_update<P: Params>(&self, sql: &str, params: P) -> Result<bool> {
        let conn = self.lock()?;
        match conn.execute(sql, params) {
            Ok(_) => Ok(true),
            Err(error) if is_constraint_violation(&error) => {
                tracing::debug!("Update rejected by constraint: {}", error);
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Run statements as one all-or-nothing transaction.
    ///
    /// When any statement fails the whole transaction is rolled back and
    /// `Ok(false)` is returned. Errors are reserved for failing to begin or
    /// commit the transaction itself.
    pub fn run_transaction(&self, statements: &[SqlStatement]) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for statement in statements {
            if let Err(error) = tx.execute(&statement.sql, params_from_iter(statement.params.iter()))
            {
                tracing::warn!(
                    "Rolling back transaction of {} statements: {}",
                    statements.len(),
                    error
                );
                tx.rollback()?;
                return Ok(false);
            }
        }

        tx.commit()?;
        Ok(true)
    }

    /// Run several statements under one lock for a consistent snapshot
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("Store connection lock poisoned".to_string()))
    }
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}
