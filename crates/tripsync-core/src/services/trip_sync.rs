//! Ownership graph of one trip store and its sync engine.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::db::{Database, FavoritesLedger, SqliteSettingsRepository, SqliteTripRepository};
use crate::events::EventHandlers;
use crate::remote::RemoteApi;
use crate::session::SessionManager;
use crate::sync::SyncEngine;
use crate::Result;

/// Entry point for applications: opens the store, wires the repositories to
/// the engine, and hands out shared references to each of them.
pub struct TripSync<R: RemoteApi> {
    config: CoreConfig,
    trips: Arc<SqliteTripRepository>,
    favorites: Arc<FavoritesLedger>,
    session: Arc<SessionManager>,
    events: Arc<EventHandlers>,
    engine: SyncEngine<R>,
}

impl<R: RemoteApi + 'static> TripSync<R> {
    /// Open the store described by `config`; without a database path the
    /// store lives in memory.
    pub fn open(config: CoreConfig, remote: Arc<R>) -> Result<Self> {
        config.validate()?;

        let db = match &config.database_path {
            Some(db_path) => {
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Self::open_database_with_recovery(db_path)?
            }
            None => {
                tracing::info!("Running with an in-memory trip store");
                Database::open_in_memory()?
            }
        };

        Self::assemble(config, Arc::new(db), remote)
    }

    /// Open an in-memory store with the default schedule (primarily for tests).
    pub fn open_in_memory(remote: Arc<R>) -> Result<Self> {
        Self::open(CoreConfig::default(), remote)
    }

    fn assemble(config: CoreConfig, db: Arc<Database>, remote: Arc<R>) -> Result<Self> {
        let trips = Arc::new(SqliteTripRepository::new(Arc::clone(&db)));
        let favorites = Arc::new(FavoritesLedger::new(Arc::clone(&db)));
        let events = Arc::new(EventHandlers::new());
        let session = Arc::new(SessionManager::new(
            SqliteSettingsRepository::new(db),
            Arc::clone(&events),
        )?);

        let launch = session.record_launch()?;
        tracing::info!(
            "Opened trip store (launch {}, install {})",
            launch.launch_number,
            launch.install_id
        );

        let engine = SyncEngine::new(
            remote,
            Arc::clone(&trips),
            Arc::clone(&favorites),
            Arc::clone(&session),
            Arc::clone(&events),
            config.sync,
        );

        Ok(Self {
            config,
            trips,
            favorites,
            session,
            events,
            engine,
        })
    }

    fn open_database_with_recovery(db_path: &Path) -> Result<Database> {
        match Database::open(db_path) {
            Ok(db) => Ok(db),
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Trip store at {} is unreadable: {}. Moving it aside and retrying once.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(db_path)?;
                Database::open(db_path)
            }
            Err(error) => Err(error),
        }
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };

        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted trip store from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let parent = match db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        // Journal files of the old store would be replayed into the new one
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale store file {}", path.display());
            }
        }

        Ok(())
    }

    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub const fn trips(&self) -> &Arc<SqliteTripRepository> {
        &self.trips
    }

    pub const fn favorites(&self) -> &Arc<FavoritesLedger> {
        &self.favorites
    }

    pub const fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub const fn events(&self) -> &Arc<EventHandlers> {
        &self.events
    }

    pub const fn engine(&self) -> &SyncEngine<R> {
        &self.engine
    }

    /// Start timer-driven passes when auto sync is enabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_auto_sync(&self) -> Option<JoinHandle<()>> {
        if !self.config.sync.auto_sync {
            tracing::info!("Automatic synchronization is disabled");
            return None;
        }
        tracing::info!(
            "Synchronizing every {}s (at least {}s apart)",
            self.config.sync.period_secs,
            self.config.sync.min_period_secs
        );
        Some(self.engine.spawn_periodic())
    }

    /// Sign out and wipe every Trip, favorite, and account setting.
    ///
    /// The installation ID and launch counters survive.
    pub fn clear_all_data(&self) -> Result<()> {
        self.engine.cancel_synchronization();
        self.trips.clear_all()?;
        self.favorites.clear_all()?;
        self.session.clear_account()?;
        tracing::info!("Cleared all local trip data");
        Ok(())
    }
}
