//! Favorites ledger: pending favorite-place changes against the last known server state

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::params;

use crate::db::{Database, SqlStatement};
use crate::error::{Error, Result};
use crate::models::{FavoriteIntent, FavoritesDiff};
use crate::util::unix_millis_now;

const CONFIRMED: i64 = 0;
const PENDING_ADD: i64 = 1;
const PENDING_REMOVE: i64 = -1;
/// A pending add undone before it was confirmed; kept until the next confirmation
const RETRACTED: i64 = 2;

const UPSERT_SQL: &str = "INSERT INTO favorites (place_id, state, updated_at) VALUES (?1, ?2, ?3)
                          ON CONFLICT(place_id) DO UPDATE SET
                             state = excluded.state,
                             updated_at = excluded.updated_at";

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: i64,
    updated_at: i64,
}

impl Entry {
    const fn wants_favorite(self) -> bool {
        self.state == CONFIRMED || self.state == PENDING_ADD
    }
}

/// Favorite membership as confirmed server state plus local intents
pub struct FavoritesLedger {
    db: Arc<Database>,
    write_lock: Mutex<()>,
}

impl FavoritesLedger {
    pub const fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Confirmed favorites plus pending adds, minus pending removes
    pub fn favorite_place_ids(&self) -> Result<Vec<String>> {
        self.db.run_query(
            "SELECT place_id FROM favorites WHERE state IN (?1, ?2) ORDER BY place_id",
            params![CONFIRMED, PENDING_ADD],
            |row| row.get(0),
        )
    }

    pub fn is_favorite(&self, place_id: &str) -> Result<bool> {
        Ok(self
            .entry(place_id)?
            .is_some_and(Entry::wants_favorite))
    }

    /// Record the user's intent for a place.
    ///
    /// Repeating an intent is a no-op. Undoing an unconfirmed intent cancels it,
    /// so it never shows up in the pending diff.
    pub fn update_favorite(&self, place_id: &str, is_favorite: bool) -> Result<bool> {
        let place_id = place_id.trim();
        if place_id.is_empty() {
            return Err(Error::InvalidInput("Place ID cannot be empty".to_string()));
        }

        let _guard = self.write_guard()?;
        let next = match (self.entry(place_id)?.map(|entry| entry.state), is_favorite) {
            (Some(CONFIRMED), true) | (None, false) => return Ok(true),
            (Some(PENDING_REMOVE), true) => CONFIRMED,
            (Some(PENDING_ADD | RETRACTED), false) => RETRACTED,
            (_, true) => PENDING_ADD,
            (_, false) => PENDING_REMOVE,
        };

        self.db
            .run_update(UPSERT_SQL, params![place_id, next, unix_millis_now()])
    }

    /// Unconfirmed intents keyed by place ID
    pub fn pending_diff(&self) -> Result<FavoritesDiff> {
        let rows = self.db.run_query(
            "SELECT place_id, state FROM favorites WHERE state IN (?1, ?2)",
            params![PENDING_ADD, PENDING_REMOVE],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        Ok(rows
            .into_iter()
            .filter_map(|(place_id, state)| {
                FavoriteIntent::from_sign(state).map(|intent| (place_id, intent))
            })
            .collect())
    }

    /// Merge server-confirmed membership into the base state in one transaction.
    ///
    /// `batch_started_at` is when the pushed diff was read (Unix ms). Local
    /// intents recorded after then win over the server's answer for that place.
    pub fn apply_server_confirmation(
        &self,
        added: &[String],
        removed: &[String],
        batch_started_at: i64,
    ) -> Result<bool> {
        let _guard = self.write_guard()?;
        let mut statements = Vec::with_capacity(added.len() + removed.len() + 1);

        for place_id in added {
            let statement = match self.entry(place_id)? {
                Some(entry) if entry.updated_at > batch_started_at && !entry.wants_favorite() => {
                    upsert(place_id, PENDING_REMOVE, entry.updated_at)
                }
                _ => upsert(place_id, CONFIRMED, batch_started_at),
            };
            statements.push(statement);
        }

        for place_id in removed {
            let statement = match self.entry(place_id)? {
                Some(entry) if entry.updated_at > batch_started_at && entry.wants_favorite() => {
                    upsert(place_id, PENDING_ADD, entry.updated_at)
                }
                _ => SqlStatement::new("DELETE FROM favorites WHERE place_id = ?")
                    .bind(place_id.clone()),
            };
            statements.push(statement);
        }

        statements.push(
            SqlStatement::new("DELETE FROM favorites WHERE state = ? AND updated_at <= ?")
                .bind(RETRACTED)
                .bind(batch_started_at),
        );

        self.db.run_transaction(&statements)
    }

    /// Forget every favorite (used when the account data is wiped)
    pub fn clear_all(&self) -> Result<bool> {
        let _guard = self.write_guard()?;
        self.db.run_update("DELETE FROM favorites", [])
    }

    fn entry(&self, place_id: &str) -> Result<Option<Entry>> {
        let entries = self.db.run_query(
            "SELECT state, updated_at FROM favorites WHERE place_id = ?",
            [place_id],
            |row| {
                Ok(Entry {
                    state: row.get(0)?,
                    updated_at: row.get(1)?,
                })
            },
        )?;
        Ok(entries.into_iter().next())
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Database("Favorites ledger lock poisoned".to_string()))
    }
}

fn upsert(place_id: &str, state: i64, updated_at: i64) -> SqlStatement {
    SqlStatement::new(UPSERT_SQL)
        .bind(place_id.to_string())
        .bind(state)
        .bind(updated_at)
}
