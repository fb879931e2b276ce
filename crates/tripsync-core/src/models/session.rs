//! Authenticated session model

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sessions are treated as expiring this long before their hard expiry
const EXPIRY_SKEW_MILLIS: i64 = 60_000;

/// The current authenticated session of an account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiration timestamp (Unix ms)
    pub expires_at: i64,
    /// Account the session belongs to; owner of locally created Trips
    pub user_id: String,
}

impl Session {
    /// Whether the session is at (or close to) its expiration
    #[must_use]
    pub fn is_expiring(&self) -> bool {
        self.expires_at <= crate::util::unix_millis_now() + EXPIRY_SKEW_MILLIS
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .finish()
    }
}
