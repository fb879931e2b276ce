//! Trip conflict model

use serde::{Deserialize, Serialize};

use super::trip::{Trip, TripId};

/// Divergent local and remote versions of the same Trip, surfaced for resolution.
///
/// Only lives for one sync pass. The handler flips `force_local_trip` on the
/// conflicts where the local edits should overwrite the server copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripConflict {
    pub local_trip: Trip,
    pub remote_trip: Trip,
    /// Display name of whoever last edited the remote copy
    pub last_editor: Option<String>,
    /// When the remote copy was last edited (Unix ms)
    pub last_remote_update: Option<i64>,
    /// `true` pushes the local Trip, `false` takes the remote one
    pub force_local_trip: bool,
}

impl TripConflict {
    pub fn new(local_trip: Trip, remote_trip: Trip, last_editor: Option<String>) -> Self {
        let last_remote_update = remote_trip.last_update;
        Self {
            local_trip,
            remote_trip,
            last_editor,
            last_remote_update,
            force_local_trip: false,
        }
    }

    pub const fn trip_id(&self) -> &TripId {
        &self.local_trip.id
    }
}
