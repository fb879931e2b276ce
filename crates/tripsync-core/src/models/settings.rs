//! Account-scoped settings model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persistent per-installation and per-account settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    /// Server timestamp of the last fully applied change set
    pub changes_timestamp: Option<i64>,
    /// Stable identifier of this installation
    pub install_id: String,
    /// Number of times the store has been opened
    pub launch_number: i64,
    /// First launch timestamp (Unix ms)
    pub installation_date: Option<i64>,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            changes_timestamp: None,
            install_id: Uuid::now_v7().to_string(),
            launch_number: 0,
            installation_date: None,
        }
    }
}
