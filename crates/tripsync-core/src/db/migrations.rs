//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Create indexes that may be missing (e.g. dropped by an older client)
pub fn ensure_indexes(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE INDEX IF NOT EXISTS idx_trips_trashed ON trips(trashed)",
        "CREATE INDEX IF NOT EXISTS idx_trips_dirty ON trips(dirty)",
        "CREATE INDEX IF NOT EXISTS idx_trips_start_date ON trips(start_date)",
        "CREATE INDEX IF NOT EXISTS idx_trip_day_items_item ON trip_day_items(item_id)",
        "CREATE INDEX IF NOT EXISTS idx_favorites_state ON favorites(state)",
    ];

    for stmt in statements {
        conn.execute(stmt, [])?;
    }
    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn apply(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Trips table
        "CREATE TABLE IF NOT EXISTS trips (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            synced_version INTEGER NOT NULL DEFAULT 0,
            server_version INTEGER NOT NULL DEFAULT 0,
            dirty INTEGER NOT NULL DEFAULT 0,
            trashed INTEGER NOT NULL DEFAULT 0,
            privacy INTEGER NOT NULL DEFAULT 0,
            rights INTEGER NOT NULL DEFAULT 7,
            owner TEXT,
            start_date TEXT,
            last_update INTEGER
        )",
        // Days, keyed by trip and position
        "CREATE TABLE IF NOT EXISTS trip_days (
            trip_id TEXT NOT NULL REFERENCES trips(id) ON UPDATE CASCADE ON DELETE CASCADE,
            day_index INTEGER NOT NULL,
            note TEXT,
            PRIMARY KEY (trip_id, day_index)
        )",
        // Day items, keyed by trip, day position and item position
        "CREATE TABLE IF NOT EXISTS trip_day_items (
            trip_id TEXT NOT NULL REFERENCES trips(id) ON UPDATE CASCADE ON DELETE CASCADE,
            day_index INTEGER NOT NULL,
            item_index INTEGER NOT NULL,
            item_id TEXT NOT NULL,
            start_time INTEGER,
            duration INTEGER,
            note TEXT,
            transport_mode INTEGER,
            transport_type INTEGER,
            transport_avoid INTEGER,
            transport_start_time INTEGER,
            transport_duration INTEGER,
            transport_note TEXT,
            transport_polyline TEXT,
            PRIMARY KEY (trip_id, day_index, item_index)
        )",
        // Favorites: 0 = confirmed, 1 = pending add, -1 = pending remove, 2 = retracted add
        "CREATE TABLE IF NOT EXISTS favorites (
            place_id TEXT PRIMARY KEY,
            state INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        // Settings and session (local only)
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    ];

    apply(conn, 1, &statements)
}

/// Migration to version 2: empty-trash queue
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let statements = ["ALTER TABLE trips ADD COLUMN purge_requested INTEGER NOT NULL DEFAULT 0"];

    apply(conn, 2, &statements)
}

/// Migration to version 3: provisional IDs already replaced by server IDs
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    let statements = ["CREATE TABLE IF NOT EXISTS trip_id_remaps (
            old_id TEXT PRIMARY KEY,
            new_id TEXT NOT NULL
        )"];

    apply(conn, CURRENT_VERSION, &statements)
}
