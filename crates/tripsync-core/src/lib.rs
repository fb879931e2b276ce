//! tripsync-core - offline-first Trip store and synchronization engine
//!
//! Trips, favorites, and account settings live in a local SQLite store and are
//! reconciled with a server through an injected [`RemoteApi`]. Applications
//! open a [`TripSync`], register handlers on its [`EventHandlers`], and drive
//! passes through its [`SyncEngine`].

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod remote;
pub mod services;
pub mod session;
pub mod sync;
mod util;

pub use config::{CoreConfig, SyncSchedule};
pub use error::{Error, Result};
pub use events::{ConflictCompletion, EventHandlers};
pub use models::{SynchronizationResult, Trip, TripConflict, TripId, TripInfo};
pub use remote::{RemoteApi, TransportError};
pub use services::TripSync;
pub use session::SessionManager;
pub use sync::{SyncEngine, SyncState};
