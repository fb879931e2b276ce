//! Outcome of one synchronization pass

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::trip::TripId;

/// Per-entity failure that did not abort the pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFailure {
    /// Trip ID or place ID the failure relates to
    pub entity: String,
    pub message: String,
}

/// Snapshot published once per pass through the completion handler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationResult {
    pub success: bool,
    /// Pass was cancelled before reaching the end
    pub cancelled: bool,
    /// Pass-fatal error, if any
    pub error: Option<String>,
    pub changed_trip_ids: Vec<TripId>,
    /// Provisional → server-issued Trip IDs remapped during the pass
    pub created_trip_ids: BTreeMap<TripId, TripId>,
    pub changed_favorite_ids: Vec<String>,
    /// Server reported changed account settings
    pub settings_changed: bool,
    /// Conflicts that were surfaced but never resolved
    pub unresolved_conflicts: Vec<TripId>,
    pub failures: Vec<EntityFailure>,
}

impl SynchronizationResult {
    /// Succeeded overall but some entities failed to apply
    pub fn is_partial(&self) -> bool {
        self.success && !self.failures.is_empty()
    }
}
