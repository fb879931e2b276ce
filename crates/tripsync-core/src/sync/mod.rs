//! Synchronization engine.
//!
//! A pass walks `Standby → Initializing → Favorites → Changes → Clearing` and
//! publishes exactly one [`SynchronizationResult`]. At most one pass runs at a
//! time; a second `synchronize()` while one is active returns `None`.
//!
//! Transport failures abort the pass and leave unapplied local state alone.
//! Store failures only affect the Trip they happened on and are reported in
//! `SynchronizationResult::failures`. The changes timestamp only advances
//! when the whole change set was applied.

mod state;
#[cfg(test)]
mod tests;

pub use state::{SyncState, TripOutcome};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SyncSchedule;
use crate::db::{FavoritesLedger, SqliteTripRepository, TripRepository};
use crate::error::{Error, Result};
use crate::events::{ConflictCompletion, EventHandlers};
use crate::models::{EntityFailure, SynchronizationResult, Trip, TripConflict, TripId};
use crate::remote::{RemoteApi, TransportError};
use crate::session::SessionManager;
use crate::util::unix_millis_now;

const MIN_TIMER_PERIOD: Duration = Duration::from_millis(100);

/// Why a pass stopped before reaching the end
#[derive(Debug)]
enum PassAbort {
    Cancelled,
    Failed(Error),
}

impl From<Error> for PassAbort {
    fn from(error: Error) -> Self {
        Self::Failed(error)
    }
}

impl From<TransportError> for PassAbort {
    fn from(error: TransportError) -> Self {
        Self::Failed(Error::Transport(error))
    }
}

type PassResult<T> = std::result::Result<T, PassAbort>;

/// Drives sync passes against a [`RemoteApi`].
///
/// Cheap to clone; clones share the same pass state.
pub struct SyncEngine<R: RemoteApi> {
    inner: Arc<EngineInner<R>>,
}

impl<R: RemoteApi> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<R> {
    remote: Arc<R>,
    trips: Arc<SqliteTripRepository>,
    favorites: Arc<FavoritesLedger>,
    session: Arc<SessionManager>,
    events: Arc<EventHandlers>,
    schedule: SyncSchedule,
    state: Mutex<SyncState>,
    in_progress: AtomicBool,
    cancelled: AtomicBool,
    blocked: AtomicBool,
    cancel_notify: Notify,
    last_pass_ended: Mutex<Option<Instant>>,
}

/// Marks a pass as running until dropped
struct RunningPass<'a> {
    in_progress: &'a AtomicBool,
    cancelled: &'a AtomicBool,
}

impl Drop for RunningPass<'_> {
    fn drop(&mut self) {
        self.in_progress.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

impl<R: RemoteApi + 'static> SyncEngine<R> {
    pub fn new(
        remote: Arc<R>,
        trips: Arc<SqliteTripRepository>,
        favorites: Arc<FavoritesLedger>,
        session: Arc<SessionManager>,
        events: Arc<EventHandlers>,
        schedule: SyncSchedule,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                remote,
                trips,
                favorites,
                session,
                events,
                schedule,
                state: Mutex::new(SyncState::Standby),
                in_progress: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                blocked: AtomicBool::new(false),
                cancel_notify: Notify::new(),
                last_pass_ended: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        *lock(&self.inner.state)
    }

    pub fn sync_in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::SeqCst)
    }

    /// While blocked, passes never leave Standby
    pub fn block_synchronization(&self, blocked: bool) {
        self.inner.blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    /// Stop the running pass at its next checkpoint
    pub fn cancel_synchronization(&self) {
        if self.sync_in_progress() {
            tracing::info!("Cancelling synchronization");
            self.inner.cancelled.store(true, Ordering::SeqCst);
            self.inner.cancel_notify.notify_waiters();
        }
    }

    /// Run one pass to completion.
    ///
    /// Returns `None` without doing anything when sync is blocked or a pass is
    /// already running.
    pub async fn synchronize(&self) -> Option<SynchronizationResult> {
        let inner = &self.inner;
        if self.is_blocked() {
            tracing::debug!("Synchronization is blocked");
            return None;
        }
        if inner
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Synchronization already in progress");
            return None;
        }
        let running = RunningPass {
            in_progress: &inner.in_progress,
            cancelled: &inner.cancelled,
        };

        let result = self.run_pass().await;
        self.set_state(SyncState::Standby);
        *lock(&inner.last_pass_ended) = Some(Instant::now());
        drop(running);

        tracing::info!(
            "Synchronization finished: success={}, changed trips={}, created trips={}, failures={}",
            result.success,
            result.changed_trip_ids.len(),
            result.created_trip_ids.len(),
            result.failures.len()
        );
        inner.events.sync_completed(&result);
        Some(result)
    }

    /// Start a pass in the background
    pub fn trigger(&self) -> JoinHandle<Option<SynchronizationResult>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.synchronize().await })
    }

    /// Run passes on the configured timer until the handle is aborted.
    ///
    /// A tick is skipped when the previous pass ended less than the minimum
    /// period ago.
    pub fn spawn_periodic(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.inner.schedule.period().max(MIN_TIMER_PERIOD);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if engine.due_for_timer_pass() {
                    engine.synchronize().await;
                }
            }
        })
    }

    fn due_for_timer_pass(&self) -> bool {
        let last_pass_ended = *lock(&self.inner.last_pass_ended);
        is_due(last_pass_ended, self.inner.schedule.min_period(), Instant::now())
    }

    async fn run_pass(&self) -> SynchronizationResult {
        let mut result = SynchronizationResult::default();

        match self.run_states(&mut result).await {
            Ok(()) => result.success = true,
            Err(PassAbort::Cancelled) => {
                tracing::info!("Synchronization cancelled in {} state", self.state());
                result.cancelled = true;
            }
            Err(PassAbort::Failed(error)) => {
                tracing::warn!("Synchronization failed in {} state: {}", self.state(), error);
                result.error = Some(error.to_string());
            }
        }

        result
    }

    async fn run_states(&self, result: &mut SynchronizationResult) -> PassResult<()> {
        self.enter(SyncState::Initializing)?;
        self.initialize()?;

        self.enter(SyncState::Favorites)?;
        self.sync_favorites(result).await?;

        self.enter(SyncState::Changes)?;
        self.sync_changes(result).await?;

        self.enter(SyncState::Clearing)?;
        self.clear_trash(result).await;
        Ok(())
    }

    fn initialize(&self) -> PassResult<()> {
        let Some(session) = self.inner.session.session() else {
            return Err(TransportError::Authentication("no active session".to_string()).into());
        };
        if session.is_expiring() {
            tracing::debug!("Session of user {} is about to expire", session.user_id);
        }
        Ok(())
    }

    async fn sync_favorites(&self, result: &mut SynchronizationResult) -> PassResult<()> {
        let inner = &self.inner;
        let batch_started_at = unix_millis_now();
        let diff = inner.favorites.pending_diff()?;
        if diff.is_empty() {
            return Ok(());
        }

        tracing::debug!("Pushing {} favorite changes", diff.len());
        let confirmation = inner.remote.push_favorites_diff(&diff).await?;
        let applied = inner.favorites.apply_server_confirmation(
            &confirmation.added,
            &confirmation.removed,
            batch_started_at,
        )?;
        if !applied {
            return Err(Error::Database("Favorites confirmation was rolled back".to_string()).into());
        }

        result
            .changed_favorite_ids
            .extend(confirmation.place_ids().cloned());
        Ok(())
    }

    async fn sync_changes(&self, result: &mut SynchronizationResult) -> PassResult<()> {
        let inner = &self.inner;
        let since = inner.session.changes_timestamp()?;
        let batch_started_at = unix_millis_now();
        let changes = inner.remote.fetch_changes_since(since).await?;
        tracing::debug!(
            "Server reports {} updated and {} deleted trips since {:?}",
            changes.updated_trips.len(),
            changes.deleted_trip_ids.len(),
            since
        );

        let deleted: BTreeSet<&TripId> = changes.deleted_trip_ids.iter().collect();
        let dirty = inner.trips.dirty_trips()?;
        let dirty_ids: BTreeSet<&TripId> = dirty.iter().map(|trip| &trip.id).collect();

        // Dirty Trips the server changed too
        let mut conflicts = Vec::new();
        for trip in &dirty {
            let Some(&server_version) = changes.updated_trips.get(&trip.id) else {
                continue;
            };
            if deleted.contains(&trip.id) {
                continue;
            }
            self.check_cancelled()?;
            let outcome = self.check_conflict(trip, server_version).await;
            if let Some(conflict) = Self::settle(result, trip.id.as_str(), outcome)? {
                conflicts.push(conflict);
            }
        }
        let conflict_ids: BTreeSet<TripId> = conflicts
            .iter()
            .map(|conflict| conflict.trip_id().clone())
            .collect();
        let resolution = self.surface_conflicts(conflicts, result).await?;

        for trip in &dirty {
            if conflict_ids.contains(&trip.id) || deleted.contains(&trip.id) {
                continue;
            }
            if trip.is_trashed && trip.id.is_provisional() {
                // Never reached the server; Clearing drops it locally
                continue;
            }
            self.check_cancelled()?;
            let outcome = self.push(trip).await;
            Self::settle(result, trip.id.as_str(), outcome)?;
        }

        for (id, &server_version) in &changes.updated_trips {
            if dirty_ids.contains(id) || deleted.contains(id) {
                continue;
            }
            self.check_cancelled()?;
            let outcome = self.pull(id, server_version).await;
            Self::settle(result, id.as_str(), outcome)?;
        }

        for id in &changes.deleted_trip_ids {
            self.check_cancelled()?;
            let outcome = self.delete_local(id);
            Self::settle(result, id.as_str(), outcome)?;
        }

        if changes.has_favorite_changes() {
            let applied = inner.favorites.apply_server_confirmation(
                &changes.updated_favorite_ids,
                &changes.deleted_favorite_ids,
                batch_started_at,
            );
            match applied {
                Ok(true) => result.changed_favorite_ids.extend(
                    changes
                        .updated_favorite_ids
                        .iter()
                        .chain(&changes.deleted_favorite_ids)
                        .cloned(),
                ),
                Ok(false) => record_failure(
                    result,
                    "favorites",
                    &Error::Database("Server favorite changes were rolled back".to_string()),
                ),
                Err(error) => record_failure(result, "favorites", &error),
            }
        }
        result.settings_changed = changes.settings_changed;

        if let Some(receiver) = resolution {
            self.await_resolution(receiver, &conflict_ids, result).await?;
        }

        if result.failures.is_empty() && result.unresolved_conflicts.is_empty() {
            if let Some(timestamp) = changes.timestamp {
                inner.session.set_changes_timestamp(Some(timestamp))?;
            }
        } else {
            tracing::info!(
                "Keeping changes timestamp: {} failures, {} unresolved conflicts",
                result.failures.len(),
                result.unresolved_conflicts.len()
            );
        }

        Ok(())
    }

    async fn check_conflict(&self, trip: &Trip, server_version: i64) -> Result<TripOutcome> {
        // Already observed this server version; the local edits are simply newer
        if server_version <= trip.server_version {
            return Ok(TripOutcome::Unchanged);
        }

        tracing::info!(
            "Trip {} changed on both sides (local version {}, server version {})",
            trip.id,
            trip.version,
            server_version
        );
        let remote = self.inner.remote.fetch_trip(&trip.id).await?;
        Ok(TripOutcome::ConflictPending(Box::new(TripConflict::new(
            trip.clone(),
            remote.trip,
            remote.last_editor,
        ))))
    }

    /// Hand conflicts to the application, or let the server copy win when no
    /// handler is registered
    async fn surface_conflicts(
        &self,
        conflicts: Vec<TripConflict>,
        result: &mut SynchronizationResult,
    ) -> PassResult<Option<oneshot::Receiver<Vec<TripConflict>>>> {
        if conflicts.is_empty() {
            return Ok(None);
        }

        let (completion, receiver) = ConflictCompletion::channel();
        match self.inner.events.trip_conflicts(conflicts, completion) {
            Ok(()) => Ok(Some(receiver)),
            Err(conflicts) => {
                tracing::warn!(
                    "No conflict handler registered; taking the server copy of {} trips",
                    conflicts.len()
                );
                self.resolve_conflicts(conflicts, result).await?;
                Ok(None)
            }
        }
    }

    async fn await_resolution(
        &self,
        receiver: oneshot::Receiver<Vec<TripConflict>>,
        conflict_ids: &BTreeSet<TripId>,
        result: &mut SynchronizationResult,
    ) -> PassResult<()> {
        tracing::debug!("Waiting for resolution of {} conflicts", conflict_ids.len());
        let resolved = tokio::select! {
            resolved = receiver => resolved.ok(),
            () = self.cancellation() => return Err(PassAbort::Cancelled),
        };

        let Some(resolved) = resolved else {
            tracing::warn!(
                "Conflict completion dropped; {} trips stay unresolved",
                conflict_ids.len()
            );
            result.unresolved_conflicts.extend(conflict_ids.iter().cloned());
            return Ok(());
        };

        let answered: Vec<TripConflict> = resolved
            .into_iter()
            .filter(|conflict| conflict_ids.contains(conflict.trip_id()))
            .collect();
        let answered_ids: BTreeSet<&TripId> =
            answered.iter().map(TripConflict::trip_id).collect();
        result.unresolved_conflicts.extend(
            conflict_ids
                .iter()
                .filter(|id| !answered_ids.contains(id))
                .cloned(),
        );

        self.resolve_conflicts(answered, result).await
    }

    async fn resolve_conflicts(
        &self,
        conflicts: Vec<TripConflict>,
        result: &mut SynchronizationResult,
    ) -> PassResult<()> {
        for conflict in conflicts {
            self.check_cancelled()?;
            let outcome = if conflict.force_local_trip {
                self.push_local_winner(conflict.trip_id()).await
            } else {
                self.take_remote(&conflict.remote_trip)
            };
            Self::settle(result, conflict.trip_id().as_str(), outcome)?;
        }
        Ok(())
    }

    async fn push_local_winner(&self, id: &TripId) -> Result<TripOutcome> {
        // Edits made while the handler was deciding go out as well
        let Some(local) = self.inner.trips.trip_with_id(id)? else {
            return Ok(TripOutcome::Unchanged);
        };
        tracing::info!("Keeping local copy of trip {id}");
        self.push(&local).await
    }

    fn take_remote(&self, remote: &Trip) -> Result<TripOutcome> {
        tracing::info!("Taking server copy of trip {}", remote.id);
        committed(
            self.inner.trips.apply_remote_trip(remote, true)?,
            &remote.id,
            "Applying the server copy of",
        )?;
        Ok(TripOutcome::Pulled(remote.id.clone()))
    }

    async fn push(&self, trip: &Trip) -> Result<TripOutcome> {
        let inner = &self.inner;

        if trip.id.is_provisional() {
            let created = inner.remote.create_trip(trip).await?;
            committed(
                inner.trips.change_trip_id(&trip.id, &created.id)?,
                &trip.id,
                "Remapping",
            )?;
            committed(
                inner
                    .trips
                    .mark_trip_synced(&created.id, trip.version, created.version)?,
                &created.id,
                "Sync bookkeeping for",
            )?;
            tracing::info!("Created trip {} as {}", trip.id, created.id);
            inner.events.trip_id_changed(&trip.id, &created.id);
            return Ok(TripOutcome::Created {
                provisional: trip.id.clone(),
                permanent: created.id,
            });
        }

        let pushed = inner.remote.push_trip(trip).await?;
        committed(
            inner
                .trips
                .mark_trip_synced(&trip.id, trip.version, pushed.version)?,
            &trip.id,
            "Sync bookkeeping for",
        )?;
        tracing::debug!("Pushed trip {} (version {})", trip.id, trip.version);
        Ok(TripOutcome::Pushed(trip.id.clone()))
    }

    async fn pull(&self, id: &TripId, server_version: i64) -> Result<TripOutcome> {
        if self
            .inner
            .trips
            .trip_with_id(id)?
            .is_some_and(|local| local.server_version >= server_version)
        {
            return Ok(TripOutcome::Unchanged);
        }

        let remote = self.inner.remote.fetch_trip(id).await?;
        // Refused when the Trip was edited locally since the pass started
        committed(
            self.inner.trips.apply_remote_trip(&remote.trip, false)?,
            id,
            "Applying the server copy of",
        )?;
        tracing::debug!("Pulled trip {id} (server version {server_version})");
        Ok(TripOutcome::Pulled(id.clone()))
    }

    fn delete_local(&self, id: &TripId) -> Result<TripOutcome> {
        let Some(info) = self.inner.trips.info_for_trip_with_id(id)? else {
            return Ok(TripOutcome::Unchanged);
        };
        if info.changed {
            tracing::warn!("Trip {id} was deleted on the server; dropping its unsynced local edits");
        }
        committed(self.inner.trips.delete_trip(id)?, id, "Deleting")?;
        tracing::debug!("Deleted trip {id} removed on the server");
        Ok(TripOutcome::Deleted(id.clone()))
    }

    /// Permanently delete trashed Trips the server agreed to purge.
    ///
    /// Failures are reported but never fail the pass.
    async fn clear_trash(&self, result: &mut SynchronizationResult) {
        let inner = &self.inner;
        let purges = match inner.trips.pending_purges() {
            Ok(purges) => purges,
            Err(error) => {
                record_failure(result, "trash", &error);
                return;
            }
        };
        if purges.is_empty() {
            return;
        }

        let (mut confirmed, known): (Vec<TripId>, Vec<TripId>) =
            purges.into_iter().partition(TripId::is_provisional);
        if !known.is_empty() {
            match inner.remote.empty_trash(&known).await {
                Ok(ids) => confirmed.extend(ids.into_iter().filter(|id| known.contains(id))),
                Err(error) => record_failure(result, "trash", &Error::Transport(error)),
            }
        }

        for id in confirmed {
            match inner.trips.delete_trip(&id) {
                Ok(true) => tracing::debug!("Purged trip {id}"),
                Ok(false) => record_failure(
                    result,
                    id.as_str(),
                    &Error::Database(format!("Purging trip {id} was rolled back")),
                ),
                Err(error) => record_failure(result, id.as_str(), &error),
            }
        }
    }

    /// Fold one Trip outcome into the result; only transport errors end the pass.
    ///
    /// A pending conflict is handed back to the caller for surfacing.
    fn settle(
        result: &mut SynchronizationResult,
        entity: &str,
        outcome: Result<TripOutcome>,
    ) -> PassResult<Option<TripConflict>> {
        match outcome {
            Ok(TripOutcome::Pushed(id) | TripOutcome::Pulled(id) | TripOutcome::Deleted(id)) => {
                result.changed_trip_ids.push(id);
            }
            Ok(TripOutcome::Created {
                provisional,
                permanent,
            }) => {
                result.changed_trip_ids.push(permanent.clone());
                result.created_trip_ids.insert(provisional, permanent);
            }
            Ok(TripOutcome::ConflictPending(conflict)) => return Ok(Some(*conflict)),
            Ok(TripOutcome::Unchanged) => {}
            Err(Error::Transport(error)) => return Err(error.into()),
            Err(error) => record_failure(result, entity, &error),
        }
        Ok(None)
    }

    fn enter(&self, state: SyncState) -> PassResult<()> {
        self.check_cancelled()?;
        tracing::debug!("Entering {state} state");
        self.set_state(state);
        Ok(())
    }

    fn set_state(&self, state: SyncState) {
        *lock(&self.inner.state) = state;
    }

    fn check_cancelled(&self) -> PassResult<()> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            Err(PassAbort::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the running pass is cancelled
    async fn cancellation(&self) {
        loop {
            let notified = self.inner.cancel_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

fn is_due(last_pass_ended: Option<Instant>, min_period: Duration, now: Instant) -> bool {
    last_pass_ended.is_none_or(|ended| now.saturating_duration_since(ended) >= min_period)
}

fn committed(applied: bool, id: &TripId, action: &str) -> Result<()> {
    if applied {
        Ok(())
    } else {
        Err(Error::Database(format!("{action} trip {id} was rolled back")))
    }
}

fn record_failure(result: &mut SynchronizationResult, entity: &str, error: &Error) {
    tracing::warn!("Failed to synchronize {}: {}", entity, error);
    result.failures.push(EntityFailure {
        entity: entity.to_string(),
        message: error.to_string(),
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
