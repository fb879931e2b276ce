//! Application-facing callbacks published by the sync engine and session manager

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::oneshot;

use crate::models::{Session, SynchronizationResult, TripConflict, TripId};

type SessionUpdateHandler = Arc<dyn Fn(Option<&Session>) + Send + Sync>;
type TripIdChangeHandler = Arc<dyn Fn(&TripId, &TripId) + Send + Sync>;
type TripConflictsHandler = Arc<dyn Fn(Vec<TripConflict>, ConflictCompletion) + Send + Sync>;
type SyncCompletionHandler = Arc<dyn Fn(&SynchronizationResult) + Send + Sync>;

/// Single-use continuation handed to the conflict handler.
///
/// Call [`ConflictCompletion::resolve`] with the conflicts after choosing a
/// side on each. Dropping it leaves the conflicts unresolved for this pass.
#[derive(Debug)]
pub struct ConflictCompletion {
    sender: oneshot::Sender<Vec<TripConflict>>,
}

impl ConflictCompletion {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Vec<TripConflict>>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    pub fn resolve(self, conflicts: Vec<TripConflict>) {
        if self.sender.send(conflicts).is_err() {
            tracing::debug!("Conflict resolution arrived after the pass ended");
        }
    }
}

/// Registered callbacks; every handler is optional
#[derive(Default)]
pub struct EventHandlers {
    session_update: RwLock<Option<SessionUpdateHandler>>,
    trip_id_change: RwLock<Option<TripIdChangeHandler>>,
    trip_conflicts: RwLock<Option<TripConflictsHandler>>,
    sync_completion: RwLock<Option<SyncCompletionHandler>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the new session whenever it changes (`None` on sign-out)
    pub fn set_session_update_handler(
        &self,
        handler: impl Fn(Option<&Session>) + Send + Sync + 'static,
    ) {
        let handler: SessionUpdateHandler = Arc::new(handler);
        store(&self.session_update, Some(handler));
    }

    /// Called with `(provisional, permanent)` after a created Trip was remapped
    pub fn set_trip_id_change_handler(
        &self,
        handler: impl Fn(&TripId, &TripId) + Send + Sync + 'static,
    ) {
        let handler: TripIdChangeHandler = Arc::new(handler);
        store(&self.trip_id_change, Some(handler));
    }

    /// Called with the conflicts of a pass. Without a handler the remote copy wins.
    pub fn set_trip_conflicts_handler(
        &self,
        handler: impl Fn(Vec<TripConflict>, ConflictCompletion) + Send + Sync + 'static,
    ) {
        let handler: TripConflictsHandler = Arc::new(handler);
        store(&self.trip_conflicts, Some(handler));
    }

    pub fn clear_trip_conflicts_handler(&self) {
        store(&self.trip_conflicts, None);
    }

    /// Called once at the end of every pass
    pub fn set_sync_completion_handler(
        &self,
        handler: impl Fn(&SynchronizationResult) + Send + Sync + 'static,
    ) {
        let handler: SyncCompletionHandler = Arc::new(handler);
        store(&self.sync_completion, Some(handler));
    }

    pub(crate) fn session_updated(&self, session: Option<&Session>) {
        if let Some(handler) = load(&self.session_update) {
            handler(session);
        }
    }

    pub(crate) fn trip_id_changed(&self, old_id: &TripId, new_id: &TripId) {
        if let Some(handler) = load(&self.trip_id_change) {
            handler(old_id, new_id);
        }
    }

    /// Hand conflicts to the application; gives them back when nobody listens
    pub(crate) fn trip_conflicts(
        &self,
        conflicts: Vec<TripConflict>,
        completion: ConflictCompletion,
    ) -> Result<(), Vec<TripConflict>> {
        match load(&self.trip_conflicts) {
            Some(handler) => {
                handler(conflicts, completion);
                Ok(())
            }
            None => Err(conflicts),
        }
    }

    pub(crate) fn sync_completed(&self, result: &SynchronizationResult) {
        if let Some(handler) = load(&self.sync_completion) {
            handler(result);
        }
    }
}

// Handlers are cloned out so they run without holding the lock
fn load<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn store<T>(slot: &RwLock<Option<T>>, value: Option<T>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = value;
}
