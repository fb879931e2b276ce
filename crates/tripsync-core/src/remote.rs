//! Boundary of the remote trip service.
//!
//! The HTTP client lives in the application; the sync engine only talks to
//! this trait so tests can script the server side.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{FavoritesDiff, Trip, TripId};

/// Failure reported by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Request rejected: {0}")]
    Validation(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Server changes since a given timestamp
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Trips changed on the server, with their current server version
    pub updated_trips: BTreeMap<TripId, i64>,
    pub deleted_trip_ids: Vec<TripId>,
    pub updated_favorite_ids: Vec<String>,
    pub deleted_favorite_ids: Vec<String>,
    pub settings_changed: bool,
    /// Server timestamp to ask from next time
    pub timestamp: Option<i64>,
}

impl ChangeSet {
    pub fn has_favorite_changes(&self) -> bool {
        !self.updated_favorite_ids.is_empty() || !self.deleted_favorite_ids.is_empty()
    }
}

/// A Trip as stored on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrip {
    pub trip: Trip,
    /// Display name of the last editor, when the server knows it
    pub last_editor: Option<String>,
}

/// Server answer to a pushed favorites diff
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoritesConfirmation {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl FavoritesConfirmation {
    /// Every place ID the server answered for
    pub fn place_ids(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(&self.removed)
    }
}

/// Operations the sync engine needs from the remote service
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Changes since `timestamp`; `None` asks for everything
    async fn fetch_changes_since(&self, timestamp: Option<i64>) -> TransportResult<ChangeSet>;

    /// Current server copy of one Trip
    async fn fetch_trip(&self, id: &TripId) -> TransportResult<RemoteTrip>;

    /// Overwrite a server-known Trip; returns the stored copy with its new server version
    async fn push_trip(&self, trip: &Trip) -> TransportResult<Trip>;

    /// Create a Trip that only exists locally; returns it under its permanent ID
    async fn create_trip(&self, trip: &Trip) -> TransportResult<Trip>;

    /// Send pending favorite intents
    async fn push_favorites_diff(
        &self,
        diff: &FavoritesDiff,
    ) -> TransportResult<FavoritesConfirmation>;

    /// Permanently delete trashed Trips; returns the IDs the server removed
    async fn empty_trash(&self, ids: &[TripId]) -> TransportResult<Vec<TripId>>;
}
