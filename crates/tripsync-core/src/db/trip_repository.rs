//! Trip repository implementation

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite stores positions as i64

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Datelike, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{Database, SqlStatement};
use crate::error::{Error, Result};
use crate::models::{
    TransportAvoid, TransportLeg, TransportMode, TransportType, Trip, TripDay, TripDayItem,
    TripId, TripInfo, TripPrivacy, TripRights,
};
use crate::util::unix_millis_now;

const TRIP_COLUMNS: &str = "id, name, version, server_version, dirty, trashed, privacy, rights, \
                            owner, start_date, last_update";

const INFO_COLUMNS: &str = "id, name, version, dirty, trashed, privacy, rights, owner, \
                            start_date, last_update, \
                            (SELECT COUNT(*) FROM trip_days d WHERE d.trip_id = trips.id)";

/// Trait for Trip storage operations
pub trait TripRepository {
    /// Get a fully loaded Trip by ID
    fn trip_with_id(&self, id: &TripId) -> Result<Option<Trip>>;

    /// Get a lightweight Trip summary by ID
    fn info_for_trip_with_id(&self, id: &TripId) -> Result<Option<TripInfo>>;

    /// All Trips that are not in the trash
    fn all_trips(&self) -> Result<Vec<Trip>>;

    /// Summaries of all Trips that are not in the trash
    fn all_trip_infos(&self) -> Result<Vec<TripInfo>>;

    /// Scheduled Trips that are ongoing or still ahead
    fn upcoming_trip_infos(&self) -> Result<Vec<TripInfo>> {
        let today = local_today();
        self.filtered_trip_infos(&|info| info.is_upcoming(today))
    }

    /// Trips whose last day is before today
    fn past_trip_infos(&self) -> Result<Vec<TripInfo>> {
        let today = local_today();
        self.filtered_trip_infos(&|info| info.is_past(today))
    }

    /// Trips starting strictly after today
    fn future_trip_infos(&self) -> Result<Vec<TripInfo>> {
        let today = local_today();
        self.filtered_trip_infos(&|info| info.is_future(today))
    }

    /// Trips starting in the given year
    fn trip_infos_in_year(&self, year: i32) -> Result<Vec<TripInfo>> {
        self.filtered_trip_infos(&|info| info.is_in_year(year))
    }

    /// Trips without a start date
    fn unscheduled_trip_infos(&self) -> Result<Vec<TripInfo>> {
        self.filtered_trip_infos(&TripInfo::is_unscheduled)
    }

    /// Trips planned within a date range; open bounds are unbounded
    fn trip_infos_for_range(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        include_overlapping: bool,
    ) -> Result<Vec<TripInfo>> {
        self.filtered_trip_infos(&|info| info.is_within(start, end, include_overlapping))
    }

    /// Years in which some Trip starts, ascending
    fn years_of_active_trips(&self) -> Result<Vec<i32>> {
        let years: BTreeSet<i32> = self
            .all_trip_infos()?
            .iter()
            .filter_map(|info| info.start_date.map(|date| date.year()))
            .collect();
        Ok(years.into_iter().collect())
    }

    /// Trips in the trash
    fn deleted_trip_infos(&self) -> Result<Vec<TripInfo>>;

    /// Non-trashed Trip summaries matching a predicate
    fn filtered_trip_infos(&self, predicate: &dyn Fn(&TripInfo) -> bool) -> Result<Vec<TripInfo>> {
        Ok(self
            .all_trip_infos()?
            .into_iter()
            .filter(|info| predicate(info))
            .collect())
    }

    /// Persist a locally created or modified Trip.
    ///
    /// Bumps the version and marks the Trip dirty. On success the passed Trip
    /// is updated with the stored version; on `Ok(false)` nothing was written.
    fn save_trip(&self, trip: &mut Trip) -> Result<bool>;

    /// Rewrite a provisional Trip ID to its permanent ID.
    ///
    /// Unknown `old_id` is a no-op returning `true`, so retries are harmless.
    fn change_trip_id(&self, old_id: &TripId, new_id: &TripId) -> Result<bool>;

    /// Move a Trip to the trash
    fn archive_trip(&self, id: &TripId) -> Result<bool>;

    /// Take a Trip out of the trash
    fn restore_trip(&self, id: &TripId) -> Result<bool>;

    /// Permanently remove a Trip with all its days and items
    fn delete_trip(&self, id: &TripId) -> Result<bool>;
}

/// Stored bookkeeping of a Trip row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StoredVersions {
    version: i64,
    synced_version: i64,
    server_version: i64,
}

impl StoredVersions {
    const fn is_dirty(self) -> bool {
        self.version > self.synced_version
    }
}

/// `SQLite` implementation of `TripRepository`
pub struct SqliteTripRepository {
    db: Arc<Database>,
    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

impl SqliteTripRepository {
    /// Create a new repository over the given store
    pub const fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// All Trips with unsynchronized local changes, trashed ones included
    pub fn dirty_trips(&self) -> Result<Vec<Trip>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM trips WHERE dirty = 1 ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut trips = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(trip) = Self::load_trip(conn, &TripId::from(id))? {
                    trips.push(trip);
                }
            }
            Ok(trips)
        })
    }

    /// Record that the server accepted `pushed_version` of a Trip as `server_version`.
    ///
    /// The Trip stays dirty when it was edited again while the push was in flight.
    pub fn mark_trip_synced(
        &self,
        id: &TripId,
        pushed_version: i64,
        server_version: i64,
    ) -> Result<bool> {
        let _guard = self.write_guard()?;
        self.db.run_update(
            "UPDATE trips SET
                synced_version = MAX(synced_version, ?1),
                server_version = MAX(server_version, ?2),
                dirty = version > MAX(synced_version, ?1)
             WHERE id = ?3",
            params![pushed_version, server_version, id.as_str()],
        )
    }

    /// Overwrite the local copy of a Trip with the server's copy.
    ///
    /// Without `force`, a locally dirty Trip is left untouched (`Ok(false)`) and
    /// re-delivery of an already applied server version is a no-op.
    pub fn apply_remote_trip(&self, remote: &Trip, force: bool) -> Result<bool> {
        let _guard = self.write_guard()?;
        let stored = self.stored_versions(&remote.id)?;

        let version = match stored {
            Some(stored) if !force && stored.is_dirty() => {
                tracing::debug!("Not overwriting dirty trip {} with remote copy", remote.id);
                return Ok(false);
            }
            Some(stored) if !force && remote.version <= stored.server_version => {
                return Ok(true);
            }
            Some(stored) => (stored.version + 1).max(remote.version),
            None => remote.version.max(1),
        };

        let counters = StoredVersions {
            version,
            synced_version: version,
            server_version: remote.version,
        };
        let statements = trip_statements(remote, counters, remote.last_update);
        self.db.run_transaction(&statements)
    }

    /// Queue every trashed Trip for permanent deletion; returns the queued IDs
    pub fn request_empty_trash(&self) -> Result<Vec<TripId>> {
        let _guard = self.write_guard()?;
        self.db
            .run_update("UPDATE trips SET purge_requested = 1 WHERE trashed = 1", [])?;
        self.pending_purges()
    }

    /// Trashed Trips waiting for a server-confirmed permanent deletion
    pub fn pending_purges(&self) -> Result<Vec<TripId>> {
        self.db.run_query(
            "SELECT id FROM trips WHERE trashed = 1 AND purge_requested = 1 ORDER BY id",
            [],
            |row| row.get::<_, String>(0).map(TripId::from),
        )
    }

    /// The ID a Trip is stored under now.
    ///
    /// A provisional ID that was replaced by a server ID resolves to that
    /// server ID; every other ID resolves to itself.
    pub fn current_id(&self, id: &TripId) -> Result<TripId> {
        if !id.is_provisional() {
            return Ok(id.clone());
        }
        Ok(self.remapped_id(id)?.unwrap_or_else(|| id.clone()))
    }

    /// Remove every Trip (used when the account data is wiped)
    pub fn clear_all(&self) -> Result<bool> {
        let _guard = self.write_guard()?;
        self.db.run_transaction(&[
            SqlStatement::new("DELETE FROM trip_day_items"),
            SqlStatement::new("DELETE FROM trip_days"),
            SqlStatement::new("DELETE FROM trips"),
            SqlStatement::new("DELETE FROM trip_id_remaps"),
        ])
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Database("Trip repository lock poisoned".to_string()))
    }

    fn stored_versions(&self, id: &TripId) -> Result<Option<StoredVersions>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT version, synced_version, server_version FROM trips WHERE id = ?",
                    [id.as_str()],
                    |row| {
                        Ok(StoredVersions {
                            version: row.get(0)?,
                            synced_version: row.get(1)?,
                            server_version: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn remapped_id(&self, id: &TripId) -> Result<Option<TripId>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT new_id FROM trip_id_remaps WHERE old_id = ?",
                    [id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(TripId::from))
        })
    }

    fn exists(&self, id: &TripId) -> Result<bool> {
        Ok(self.stored_versions(id)?.is_some())
    }

    fn list_infos(&self, trashed: bool) -> Result<Vec<TripInfo>> {
        self.db.run_query(
            &format!(
                "SELECT {INFO_COLUMNS} FROM trips WHERE trashed = ? \
                 ORDER BY start_date IS NULL, start_date, name"
            ),
            [trashed],
            Self::parse_info,
        )
    }

    /// Load a Trip with all of its days and items
    fn load_trip(conn: &Connection, id: &TripId) -> Result<Option<Trip>> {
        let trip = conn
            .query_row(
                &format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?"),
                [id.as_str()],
                Self::parse_trip,
            )
            .optional()?;
        let Some(mut trip) = trip else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT note FROM trip_days WHERE trip_id = ? ORDER BY day_index",
        )?;
        trip.days = stmt
            .query_map([id.as_str()], |row| {
                Ok(TripDay {
                    items: Vec::new(),
                    note: row.get(0)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT day_index, item_id, start_time, duration, note,
                    transport_mode, transport_type, transport_avoid,
                    transport_start_time, transport_duration, transport_note, transport_polyline
             FROM trip_day_items
             WHERE trip_id = ?
             ORDER BY day_index, item_index",
        )?;
        let items = stmt
            .query_map([id.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, Self::parse_item(row)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (day_index, item) in items {
            let day = trip.days.get_mut(day_index as usize).ok_or_else(|| {
                Error::Database(format!("Trip {id} has an item in missing day {day_index}"))
            })?;
            day.items.push(item);
        }

        Ok(Some(trip))
    }

    /// Parse a trip row (without days) from a database row
    fn parse_trip(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trip> {
        Ok(Trip {
            id: TripId::from(row.get::<_, String>(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            server_version: row.get(3)?,
            changed: row.get(4)?,
            is_trashed: row.get(5)?,
            privacy: TripPrivacy::from_code(row.get(6)?),
            rights: parse_rights(row.get(7)?),
            owner_id: row.get(8)?,
            start_date: row.get(9)?,
            last_update: row.get(10)?,
            days: Vec::new(),
        })
    }

    fn parse_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<TripInfo> {
        Ok(TripInfo {
            id: TripId::from(row.get::<_, String>(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            changed: row.get(3)?,
            is_trashed: row.get(4)?,
            privacy: TripPrivacy::from_code(row.get(5)?),
            rights: parse_rights(row.get(6)?),
            owner_id: row.get(7)?,
            start_date: row.get(8)?,
            last_update: row.get(9)?,
            days_count: row.get::<_, i64>(10)? as usize,
        })
    }

    fn parse_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<TripDayItem> {
        let transport = match row.get::<_, Option<i64>>(5)? {
            Some(mode) => Some(TransportLeg {
                mode: TransportMode::from_code(mode),
                kind: TransportType::from_code(row.get::<_, Option<i64>>(6)?.unwrap_or(0)),
                avoid: TransportAvoid::from_bits_truncate(
                    u8::try_from(row.get::<_, Option<i64>>(7)?.unwrap_or(0)).unwrap_or(0),
                ),
                start_time: row.get(8)?,
                duration: row.get(9)?,
                note: row.get(10)?,
                polyline: row.get(11)?,
            }),
            None => None,
        };

        Ok(TripDayItem {
            item_id: row.get(1)?,
            start_time: row.get(2)?,
            duration: row.get(3)?,
            note: row.get(4)?,
            transport,
        })
    }
}

impl TripRepository for SqliteTripRepository {
    fn trip_with_id(&self, id: &TripId) -> Result<Option<Trip>> {
        self.db.with_connection(|conn| Self::load_trip(conn, id))
    }

    fn info_for_trip_with_id(&self, id: &TripId) -> Result<Option<TripInfo>> {
        let infos = self.db.run_query(
            &format!("SELECT {INFO_COLUMNS} FROM trips WHERE id = ?"),
            [id.as_str()],
            Self::parse_info,
        )?;
        Ok(infos.into_iter().next())
    }

    fn all_trips(&self) -> Result<Vec<Trip>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM trips WHERE trashed = 0 ORDER BY start_date IS NULL, start_date, name",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut trips = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(trip) = Self::load_trip(conn, &TripId::from(id))? {
                    trips.push(trip);
                }
            }
            Ok(trips)
        })
    }

    fn all_trip_infos(&self) -> Result<Vec<TripInfo>> {
        self.list_infos(false)
    }

    fn deleted_trip_infos(&self) -> Result<Vec<TripInfo>> {
        self.list_infos(true)
    }

    fn save_trip(&self, trip: &mut Trip) -> Result<bool> {
        if trip.name.trim().is_empty() {
            return Err(Error::InvalidInput("Trip name cannot be empty".to_string()));
        }

        let _guard = self.write_guard()?;
        let current_id = self.current_id(&trip.id)?;
        if current_id != trip.id {
            tracing::debug!("Saving trip {} under its server ID {}", trip.id, current_id);
            trip.id = current_id;
        }
        let stored = self.stored_versions(&trip.id)?;
        let base = stored.map_or(trip.version, |stored| stored.version.max(trip.version));
        let counters = StoredVersions {
            version: base + 1,
            synced_version: stored.map_or(0, |stored| stored.synced_version),
            server_version: stored.map_or(0, |stored| stored.server_version),
        };
        let now = unix_millis_now();

        if !self.db.run_transaction(&trip_statements(trip, counters, Some(now)))? {
            return Ok(false);
        }

        trip.version = counters.version;
        trip.server_version = counters.server_version;
        trip.changed = true;
        trip.last_update = Some(now);
        Ok(true)
    }

    fn change_trip_id(&self, old_id: &TripId, new_id: &TripId) -> Result<bool> {
        if old_id == new_id {
            return Ok(true);
        }

        let _guard = self.write_guard()?;
        if !self.exists(old_id)? {
            return Ok(true);
        }
        if self.exists(new_id)? {
            tracing::warn!("Cannot remap trip {old_id} to {new_id}: target already exists");
            return Ok(false);
        }

        // Days and items follow through ON UPDATE CASCADE inside the same transaction
        let remapped = self.db.run_transaction(&[
            SqlStatement::new("UPDATE trips SET id = ? WHERE id = ?")
                .bind(new_id.to_string())
                .bind(old_id.to_string()),
            SqlStatement::new("INSERT OR REPLACE INTO trip_id_remaps (old_id, new_id) VALUES (?, ?)")
                .bind(old_id.to_string())
                .bind(new_id.to_string()),
        ])?;

        if remapped {
            tracing::info!("Remapped trip {old_id} to {new_id}");
        }
        Ok(remapped)
    }

    fn archive_trip(&self, id: &TripId) -> Result<bool> {
        self.set_trashed(id, true)
    }

    fn restore_trip(&self, id: &TripId) -> Result<bool> {
        self.set_trashed(id, false)
    }

    fn delete_trip(&self, id: &TripId) -> Result<bool> {
        let _guard = self.write_guard()?;
        self.db
            .run_update("DELETE FROM trips WHERE id = ?", [id.as_str()])
    }
}

impl SqliteTripRepository {
    fn set_trashed(&self, id: &TripId, trashed: bool) -> Result<bool> {
        let _guard = self.write_guard()?;
        let id = &self.current_id(id)?;
        if !self.exists(id)? {
            return Ok(false);
        }
        // Trashing is a synchronized mutation; leaving the trash cancels a queued purge
        self.db.run_update(
            "UPDATE trips SET
                trashed = ?1,
                purge_requested = 0,
                version = version + 1,
                dirty = 1,
                last_update = ?2
             WHERE id = ?3 AND trashed != ?1",
            params![trashed, unix_millis_now(), id.as_str()],
        )
    }
}

fn local_today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn parse_rights(bits: i64) -> TripRights {
    TripRights::from_bits_truncate(u8::try_from(bits).unwrap_or(0))
}

/// Statements that replace a Trip row with its whole subtree
fn trip_statements(trip: &Trip, counters: StoredVersions, last_update: Option<i64>) -> Vec<SqlStatement> {
    let id = trip.id.to_string();
    let mut statements = vec![
        SqlStatement::new(
            "INSERT INTO trips (id, name, version, synced_version, server_version, dirty, trashed,
                                privacy, rights, owner, start_date, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                synced_version = excluded.synced_version,
                server_version = excluded.server_version,
                dirty = excluded.dirty,
                trashed = excluded.trashed,
                privacy = excluded.privacy,
                rights = excluded.rights,
                owner = excluded.owner,
                start_date = excluded.start_date,
                last_update = excluded.last_update",
        )
        .bind(id.clone())
        .bind(trip.name.trim().to_string())
        .bind(counters.version)
        .bind(counters.synced_version)
        .bind(counters.server_version)
        .bind(counters.is_dirty())
        .bind(trip.is_trashed)
        .bind(trip.privacy.code())
        .bind(i64::from(trip.rights.bits()))
        .bind(trip.owner_id.clone())
        .bind(trip.start_date.map(|date| date.format("%Y-%m-%d").to_string()))
        .bind(last_update),
        SqlStatement::new("DELETE FROM trip_day_items WHERE trip_id = ?").bind(id.clone()),
        SqlStatement::new("DELETE FROM trip_days WHERE trip_id = ?").bind(id.clone()),
    ];

    for (day_index, day) in trip.days.iter().enumerate() {
        statements.push(
            SqlStatement::new("INSERT INTO trip_days (trip_id, day_index, note) VALUES (?, ?, ?)")
                .bind(id.clone())
                .bind(day_index as i64)
                .bind(day.note.clone()),
        );

        for (item_index, item) in day.items.iter().enumerate() {
            let leg = item.transport.as_ref();
            statements.push(
                SqlStatement::new(
                    "INSERT INTO trip_day_items (
                        trip_id, day_index, item_index, item_id, start_time, duration, note,
                        transport_mode, transport_type, transport_avoid, transport_start_time,
                        transport_duration, transport_note, transport_polyline
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(id.clone())
                .bind(day_index as i64)
                .bind(item_index as i64)
                .bind(item.item_id.clone())
                .bind(item.start_time)
                .bind(item.duration)
                .bind(item.note.clone())
                .bind(leg.map(|leg| leg.mode.code()))
                .bind(leg.map(|leg| leg.kind.code()))
                .bind(leg.map(|leg| i64::from(leg.avoid.bits())))
                .bind(leg.and_then(|leg| leg.start_time))
                .bind(leg.and_then(|leg| leg.duration))
                .bind(leg.and_then(|leg| leg.note.clone()))
                .bind(leg.and_then(|leg| leg.polyline.clone())),
            );
        }
    }

    statements
}
