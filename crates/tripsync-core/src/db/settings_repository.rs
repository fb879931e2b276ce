//! Settings repository implementation

use std::sync::Arc;

use uuid::Uuid;

use crate::db::{Database, SqlStatement};
use crate::error::{Error, Result};
use crate::models::{AccountSettings, Session};
use crate::util::unix_millis_now;

const CHANGES_TIMESTAMP: &str = "changes_timestamp";
const INSTALL_ID: &str = "install_id";
const LAUNCH_NUMBER: &str = "launch_number";
const INSTALLATION_DATE: &str = "installation_date";
const SESSION: &str = "session";

/// Trait for account settings and session storage
pub trait SettingsRepository {
    /// Load settings, generating the install identifier on first use
    fn load(&self) -> Result<AccountSettings>;

    /// Save settings to the database
    fn save(&self, settings: &AccountSettings) -> Result<()>;

    /// Load the persisted session, if any
    fn load_session(&self) -> Result<Option<Session>>;

    /// Persist or forget the current session
    fn save_session(&self, session: Option<&Session>) -> Result<()>;

    /// Drop everything tied to the signed-in account
    fn clear_account(&self) -> Result<()>;
}

/// `SQLite` implementation of `SettingsRepository`
pub struct SqliteSettingsRepository {
    db: Arc<Database>,
}

impl SqliteSettingsRepository {
    /// Create a new repository over the given store
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Count one more launch; stamps the installation date on the first one
    pub fn record_launch(&self) -> Result<AccountSettings> {
        let mut settings = self.load()?;
        settings.launch_number += 1;
        if settings.installation_date.is_none() {
            settings.installation_date = Some(unix_millis_now());
        }
        self.save(&settings)?;
        Ok(settings)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let values = self.db.run_query(
            "SELECT value FROM settings WHERE key = ?",
            [key],
            |row| row.get::<_, String>(0),
        )?;
        Ok(values.into_iter().next())
    }

    fn get_number(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .get_setting(key)?
            .and_then(|value| value.trim().parse().ok()))
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.write(&[set_statement(key, value)], key)
    }

    fn remove_setting(&self, key: &str) -> Result<()> {
        self.write(&[remove_statement(key)], key)
    }

    /// Apply setting writes all-or-nothing; a rollback is an error
    fn write(&self, statements: &[SqlStatement], what: &str) -> Result<()> {
        if self.db.run_transaction(statements)? {
            Ok(())
        } else {
            Err(Error::Database(format!("Writing {what} setting was rolled back")))
        }
    }
}

fn set_statement(key: &str, value: &str) -> SqlStatement {
    SqlStatement::new("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
        .bind(key.to_string())
        .bind(value.to_string())
}

fn remove_statement(key: &str) -> SqlStatement {
    SqlStatement::new("DELETE FROM settings WHERE key = ?").bind(key.to_string())
}

fn number_statement(key: &str, value: Option<i64>) -> SqlStatement {
    match value {
        Some(value) => set_statement(key, &value.to_string()),
        None => remove_statement(key),
    }
}

impl SettingsRepository for SqliteSettingsRepository {
    fn load(&self) -> Result<AccountSettings> {
        let mut settings = AccountSettings::default();

        match self.get_setting(INSTALL_ID)? {
            Some(install_id) if Uuid::parse_str(&install_id).is_ok() => {
                settings.install_id = install_id;
            }
            _ => {
                tracing::info!("Generated install ID {}", settings.install_id);
                self.set_setting(INSTALL_ID, &settings.install_id)?;
            }
        }

        settings.changes_timestamp = self.get_number(CHANGES_TIMESTAMP)?;
        settings.launch_number = self.get_number(LAUNCH_NUMBER)?.unwrap_or(0);
        settings.installation_date = self.get_number(INSTALLATION_DATE)?;

        Ok(settings)
    }

    fn save(&self, settings: &AccountSettings) -> Result<()> {
        self.write(
            &[
                set_statement(INSTALL_ID, &settings.install_id),
                number_statement(CHANGES_TIMESTAMP, settings.changes_timestamp),
                number_statement(LAUNCH_NUMBER, Some(settings.launch_number)),
                number_statement(INSTALLATION_DATE, settings.installation_date),
            ],
            "account",
        )
    }

    fn load_session(&self) -> Result<Option<Session>> {
        let Some(raw) = self.get_setting(SESSION)? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(error) => {
                tracing::warn!("Discarding unreadable stored session: {}", error);
                self.remove_setting(SESSION)?;
                Ok(None)
            }
        }
    }

    fn save_session(&self, session: Option<&Session>) -> Result<()> {
        match session {
            Some(session) => self.set_setting(SESSION, &serde_json::to_string(session)?),
            None => self.remove_setting(SESSION),
        }
    }

    fn clear_account(&self) -> Result<()> {
        self.write(
            &[remove_statement(SESSION), remove_statement(CHANGES_TIMESTAMP)],
            "account",
        )
    }
}
