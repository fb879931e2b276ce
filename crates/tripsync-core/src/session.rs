//! Session and account state

use std::sync::{Arc, PoisonError, RwLock};

use crate::db::{SettingsRepository, SqliteSettingsRepository};
use crate::error::Result;
use crate::events::EventHandlers;
use crate::models::{AccountSettings, Session};

/// Owns the current session and the account-scoped settings
pub struct SessionManager {
    settings: SqliteSettingsRepository,
    events: Arc<EventHandlers>,
    session: RwLock<Option<Session>>,
}

impl SessionManager {
    /// Restore the persisted session, if any
    pub fn new(settings: SqliteSettingsRepository, events: Arc<EventHandlers>) -> Result<Self> {
        let session = settings.load_session()?;
        if let Some(session) = &session {
            tracing::debug!("Restored session for user {}", session.user_id);
        }

        Ok(Self {
            settings,
            events,
            session: RwLock::new(session),
        })
    }

    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_session(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Persist and publish a new session; `None` signs out
    pub fn set_session(&self, session: Option<Session>) -> Result<()> {
        self.settings.save_session(session.as_ref())?;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session.clone();
        self.events.session_updated(session.as_ref());
        Ok(())
    }

    /// Drop the session and every account-scoped setting
    pub fn clear_account(&self) -> Result<()> {
        self.settings.clear_account()?;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.events.session_updated(None);
        Ok(())
    }

    pub fn settings(&self) -> Result<AccountSettings> {
        self.settings.load()
    }

    /// Server timestamp of the last fully applied change set
    pub fn changes_timestamp(&self) -> Result<Option<i64>> {
        Ok(self.settings.load()?.changes_timestamp)
    }

    pub fn set_changes_timestamp(&self, timestamp: Option<i64>) -> Result<()> {
        let mut settings = self.settings.load()?;
        settings.changes_timestamp = timestamp;
        self.settings.save(&settings)
    }

    pub fn install_id(&self) -> Result<String> {
        Ok(self.settings.load()?.install_id)
    }

    pub(crate) fn record_launch(&self) -> Result<AccountSettings> {
        self.settings.record_launch()
    }
}
