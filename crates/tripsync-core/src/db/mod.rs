//! Database layer for tripsync

mod connection;
mod favorites_ledger;
mod migrations;
mod settings_repository;
mod trip_repository;

pub use connection::{Database, SqlStatement};
pub use favorites_ledger::FavoritesLedger;
pub use settings_repository::{SettingsRepository, SqliteSettingsRepository};
pub use trip_repository::{SqliteTripRepository, TripRepository};
