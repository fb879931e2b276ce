//! Sync pass states and per-trip outcomes

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{TripConflict, TripId};

/// Where the engine currently is in a pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    #[default]
    Standby,
    Initializing,
    Favorites,
    Changes,
    Clearing,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standby => "standby",
            Self::Initializing => "initializing",
            Self::Favorites => "favorites",
            Self::Changes => "changes",
            Self::Clearing => "clearing",
        };
        f.write_str(name)
    }
}

/// What happened to one Trip during the changes state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TripOutcome {
    /// Local edits were accepted by the server
    Pushed(TripId),
    /// A provisional Trip was created and now lives under its permanent ID
    Created { provisional: TripId, permanent: TripId },
    /// The server copy replaced the local one
    Pulled(TripId),
    /// Deleted locally because the server deleted it
    Deleted(TripId),
    /// Both sides changed; the conflict goes to the conflict handler
    ConflictPending(Box<TripConflict>),
    Unchanged,
}
