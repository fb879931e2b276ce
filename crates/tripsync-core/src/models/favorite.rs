//! Favorite membership intents

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Locally recorded intent for one favorite place, awaiting server confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FavoriteIntent {
    Add,
    Remove,
}

impl FavoriteIntent {
    /// Signed wire/storage representation (+1 / -1)
    pub const fn sign(self) -> i64 {
        match self {
            Self::Add => 1,
            Self::Remove => -1,
        }
    }

    pub const fn from_sign(sign: i64) -> Option<Self> {
        match sign {
            1 => Some(Self::Add),
            -1 => Some(Self::Remove),
            _ => None,
        }
    }

    pub const fn is_favorite(self) -> bool {
        matches!(self, Self::Add)
    }
}

/// Pending favorite changes keyed by place ID
pub type FavoritesDiff = BTreeMap<String, FavoriteIntent>;
