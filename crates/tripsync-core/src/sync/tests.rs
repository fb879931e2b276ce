use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::db::{Database, SqliteSettingsRepository};
use crate::models::{FavoriteIntent, FavoritesDiff, Session};
use crate::remote::{ChangeSet, FavoritesConfirmation, RemoteTrip, TransportResult};

/// Runs once when the matching remote call arrives
type Hook = Box<dyn FnOnce() + Send>;

/// In-process server double with scripted change sets and recorded calls
#[derive(Default)]
struct ScriptedRemote {
    before_push: Mutex<Option<Hook>>,
    before_favorites: Mutex<Option<Hook>>,
    changes: Mutex<VecDeque<TransportResult<ChangeSet>>>,
    server_trips: Mutex<BTreeMap<TripId, RemoteTrip>>,
    next_ids: Mutex<VecDeque<TripId>>,
    favorites_failure: Mutex<Option<TransportError>>,
    push_failure: Mutex<Option<TransportError>>,
    requested_since: Mutex<Vec<Option<i64>>>,
    pushed: Mutex<Vec<Trip>>,
    created: Mutex<Vec<Trip>>,
    pushed_favorites: Mutex<Vec<FavoritesDiff>>,
    trash_requests: Mutex<Vec<Vec<TripId>>>,
}

impl ScriptedRemote {
    fn script(&self, changes: ChangeSet) {
        self.changes.lock().unwrap().push_back(Ok(changes));
    }

    fn serve(&self, trip: Trip) {
        self.server_trips.lock().unwrap().insert(
            trip.id.clone(),
            RemoteTrip {
                trip,
                last_editor: Some("Alex".to_string()),
            },
        );
    }

    fn run_hook(slot: &Mutex<Option<Hook>>) {
        let hook = slot.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn requested_since(&self) -> Vec<Option<i64>> {
        self.requested_since.lock().unwrap().clone()
    }

    fn pushed(&self) -> Vec<Trip> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn fetch_changes_since(&self, timestamp: Option<i64>) -> TransportResult<ChangeSet> {
        self.requested_since.lock().unwrap().push(timestamp);
        self.changes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ChangeSet::default()))
    }

    async fn fetch_trip(&self, id: &TripId) -> TransportResult<RemoteTrip> {
        self.server_trips
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::Validation(format!("unknown trip {id}")))
    }

    async fn push_trip(&self, trip: &Trip) -> TransportResult<Trip> {
        Self::run_hook(&self.before_push);
        if let Some(error) = self.push_failure.lock().unwrap().take() {
            return Err(error);
        }
        let mut server_trips = self.server_trips.lock().unwrap();
        let version = server_trips
            .get(&trip.id)
            .map_or(1, |stored| stored.trip.version + 1);
        let accepted = Trip {
            version,
            changed: false,
            ..trip.clone()
        };
        server_trips.insert(
            trip.id.clone(),
            RemoteTrip {
                trip: accepted.clone(),
                last_editor: None,
            },
        );
        self.pushed.lock().unwrap().push(trip.clone());
        Ok(accepted)
    }

    async fn create_trip(&self, trip: &Trip) -> TransportResult<Trip> {
        let id = self.next_ids.lock().unwrap().pop_front().unwrap_or_else(|| {
            TripId::from(format!("trip_{}", 100 + self.created.lock().unwrap().len()))
        });
        self.created.lock().unwrap().push(trip.clone());
        Ok(Trip {
            id,
            version: 1,
            changed: false,
            ..trip.clone()
        })
    }

    async fn push_favorites_diff(
        &self,
        diff: &FavoritesDiff,
    ) -> TransportResult<FavoritesConfirmation> {
        Self::run_hook(&self.before_favorites);
        if let Some(error) = self.favorites_failure.lock().unwrap().take() {
            return Err(error);
        }
        self.pushed_favorites.lock().unwrap().push(diff.clone());
        let pick = |intent: FavoriteIntent| {
            diff.iter()
                .filter(|(_, wanted)| **wanted == intent)
                .map(|(place_id, _)| place_id.clone())
                .collect()
        };
        Ok(FavoritesConfirmation {
            added: pick(FavoriteIntent::Add),
            removed: pick(FavoriteIntent::Remove),
        })
    }

    async fn empty_trash(&self, ids: &[TripId]) -> TransportResult<Vec<TripId>> {
        self.trash_requests.lock().unwrap().push(ids.to_vec());
        Ok(ids.to_vec())
    }
}

struct Harness {
    engine: SyncEngine<ScriptedRemote>,
    remote: Arc<ScriptedRemote>,
    trips: Arc<SqliteTripRepository>,
    favorites: Arc<FavoritesLedger>,
    session: Arc<SessionManager>,
    events: Arc<EventHandlers>,
}

fn harness() -> Harness {
    harness_with(true, SyncSchedule::default())
}

fn harness_with(signed_in: bool, schedule: SyncSchedule) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let remote = Arc::new(ScriptedRemote::default());
    let trips = Arc::new(SqliteTripRepository::new(Arc::clone(&db)));
    let favorites = Arc::new(FavoritesLedger::new(Arc::clone(&db)));
    let events = Arc::new(EventHandlers::new());
    let session = Arc::new(
        SessionManager::new(SqliteSettingsRepository::new(db), Arc::clone(&events)).unwrap(),
    );
    if signed_in {
        session
            .set_session(Some(Session {
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: unix_millis_now() + 3_600_000,
                user_id: "user-1".to_string(),
            }))
            .unwrap();
    }

    let engine = SyncEngine::new(
        Arc::clone(&remote),
        Arc::clone(&trips),
        Arc::clone(&favorites),
        Arc::clone(&session),
        Arc::clone(&events),
        schedule,
    );
    Harness {
        engine,
        remote,
        trips,
        favorites,
        session,
        events,
    }
}

fn server_trip(id: &str, version: i64, name: &str) -> Trip {
    let mut trip = Trip::new(name);
    trip.id = TripId::from(id);
    trip.version = version;
    trip.add_item("poi:museum", 0);
    trip
}

/// Local copy at version 3 (dirty) that last saw server version 2; the server is at 4
fn diverged(h: &Harness, id: &str) -> TripId {
    let id = TripId::from(id);
    assert!(h.trips.apply_remote_trip(&server_trip(id.as_str(), 2, "Base"), false).unwrap());
    let mut local = h.trips.trip_with_id(&id).unwrap().unwrap();
    local.name = "Local edit".to_string();
    assert!(h.trips.save_trip(&mut local).unwrap());
    assert_eq!(local.version, 3);

    h.remote.serve(server_trip(id.as_str(), 4, "Remote edit"));
    h.remote.script(ChangeSet {
        updated_trips: BTreeMap::from([(id.clone(), 4)]),
        timestamp: Some(500),
        ..ChangeSet::default()
    });
    id
}

type ConflictInbox = mpsc::UnboundedReceiver<(Vec<TripConflict>, ConflictCompletion)>;

fn forward_conflicts(events: &EventHandlers) -> ConflictInbox {
    let (sender, receiver) = mpsc::unbounded_channel();
    events.set_trip_conflicts_handler(move |conflicts, completion| {
        sender.send((conflicts, completion)).unwrap();
    });
    receiver
}

#[tokio::test(flavor = "multi_thread")]
async fn test_provisional_trip_is_created_and_remapped() {
    let h = harness();
    let mut trip = Trip::new("Weekend");
    trip.id = TripId::from("*local-1");
    assert!(h.trips.save_trip(&mut trip).unwrap());
    assert_eq!(trip.version, 1);
    h.remote.next_ids.lock().unwrap().push_back(TripId::from("trip_9"));

    let remapped = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&remapped);
    h.events.set_trip_id_change_handler(move |old, new| {
        sink.lock().unwrap().push((old.clone(), new.clone()));
    });

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert_eq!(
        result.created_trip_ids,
        BTreeMap::from([(TripId::from("*local-1"), TripId::from("trip_9"))])
    );
    assert_eq!(result.changed_trip_ids, vec![TripId::from("trip_9")]);
    assert!(h.trips.trip_with_id(&TripId::from("*local-1")).unwrap().is_none());

    let stored = h.trips.trip_with_id(&TripId::from("trip_9")).unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert!(!stored.changed);
    assert!(h.trips.dirty_trips().unwrap().is_empty());
    assert_eq!(
        *remapped.lock().unwrap(),
        vec![(TripId::from("*local-1"), TripId::from("trip_9"))]
    );
    assert_eq!(h.engine.state(), SyncState::Standby);
    assert!(!h.engine.sync_in_progress());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_provisional_copy_is_saved_under_server_id() {
    let h = harness();
    let mut trip = Trip::new("Weekend");
    trip.id = TripId::from("*local-1");
    h.trips.save_trip(&mut trip).unwrap();
    h.remote.next_ids.lock().unwrap().push_back(TripId::from("trip_9"));
    h.engine.synchronize().await.unwrap();

    // The app still holds the copy it loaded before the pass
    trip.name = "Long weekend".to_string();
    assert!(h.trips.save_trip(&mut trip).unwrap());
    assert_eq!(trip.id, TripId::from("trip_9"));
    let ids: Vec<TripId> = h.trips.all_trips().unwrap().into_iter().map(|trip| trip.id).collect();
    assert_eq!(ids, vec![TripId::from("trip_9")]);

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert!(result.created_trip_ids.is_empty());
    assert_eq!(result.changed_trip_ids, vec![TripId::from("trip_9")]);
    assert_eq!(h.remote.created.lock().unwrap().len(), 1);
    let pushed = h.remote.pushed();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].id, TripId::from("trip_9"));
    assert_eq!(pushed[0].name, "Long weekend");
    assert!(h.trips.dirty_trips().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conflict_waits_for_resolution() {
    let h = harness();
    let id = diverged(&h, "trip_5");
    let mut inbox = forward_conflicts(&h.events);

    let pass = h.engine.trigger();
    let (conflicts, completion) = inbox.recv().await.unwrap();

    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local_trip.version, 3);
    assert_eq!(conflicts[0].local_trip.name, "Local edit");
    assert_eq!(conflicts[0].remote_trip.version, 4);
    assert_eq!(conflicts[0].last_editor.as_deref(), Some("Alex"));

    // Neither side is touched while the handler decides
    assert_eq!(h.trips.trip_with_id(&id).unwrap().unwrap().name, "Local edit");
    assert!(h.remote.pushed().is_empty());
    assert_eq!(h.engine.state(), SyncState::Changes);
    assert_eq!(h.engine.synchronize().await, None);

    completion.resolve(conflicts);
    let result = pass.await.unwrap().unwrap();

    assert!(result.success);
    assert_eq!(result.changed_trip_ids, vec![id.clone()]);
    assert!(result.unresolved_conflicts.is_empty());
    let stored = h.trips.trip_with_id(&id).unwrap().unwrap();
    assert_eq!(stored.name, "Remote edit");
    assert!(!stored.changed);
    assert!(h.remote.pushed().is_empty());
    assert_eq!(h.session.changes_timestamp().unwrap(), Some(500));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_force_local_resolution_pushes_local_copy() {
    let h = harness();
    let id = diverged(&h, "trip_5");
    h.events.set_trip_conflicts_handler(|mut conflicts, completion| {
        for conflict in &mut conflicts {
            conflict.force_local_trip = true;
        }
        completion.resolve(conflicts);
    });

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert_eq!(result.changed_trip_ids, vec![id.clone()]);
    let pushed = h.remote.pushed();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].name, "Local edit");

    let stored = h.trips.trip_with_id(&id).unwrap().unwrap();
    assert_eq!(stored.name, "Local edit");
    assert!(!stored.changed);
    assert_eq!(stored.server_version, 5);
    assert_eq!(h.session.changes_timestamp().unwrap(), Some(500));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_wins_without_conflict_handler() {
    let h = harness();
    let id = diverged(&h, "trip_5");

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert_eq!(result.changed_trip_ids, vec![id.clone()]);
    assert_eq!(h.trips.trip_with_id(&id).unwrap().unwrap().name, "Remote edit");
    assert!(h.remote.pushed().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_completion_leaves_conflict_unresolved() {
    let h = harness();
    let id = diverged(&h, "trip_5");
    h.events.set_trip_conflicts_handler(|_, completion| drop(completion));

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert_eq!(result.unresolved_conflicts, vec![id.clone()]);
    assert_eq!(h.trips.trip_with_id(&id).unwrap().unwrap().name, "Local edit");
    assert_eq!(h.session.changes_timestamp().unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_already_observed_server_version_is_not_a_conflict() {
    let h = harness();
    let id = TripId::from("trip_6");
    h.trips.apply_remote_trip(&server_trip("trip_6", 2, "Base"), false).unwrap();
    let mut local = h.trips.trip_with_id(&id).unwrap().unwrap();
    local.name = "Renamed".to_string();
    h.trips.save_trip(&mut local).unwrap();
    h.remote.serve(server_trip("trip_6", 2, "Base"));
    h.remote.script(ChangeSet {
        updated_trips: BTreeMap::from([(id.clone(), 2)]),
        ..ChangeSet::default()
    });

    let surfaced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&surfaced);
    h.events.set_trip_conflicts_handler(move |conflicts, completion| {
        counter.fetch_add(1, Ordering::SeqCst);
        completion.resolve(conflicts);
    });

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert_eq!(surfaced.load(Ordering::SeqCst), 0);
    assert_eq!(h.remote.pushed()[0].name, "Renamed");
    assert!(!h.trips.trip_with_id(&id).unwrap().unwrap().changed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transport_failure_keeps_timestamp() {
    let h = harness();
    h.session.set_changes_timestamp(Some(100)).unwrap();
    let mut trip = server_trip("trip_7", 1, "Lisbon");
    h.trips.apply_remote_trip(&trip, false).unwrap();
    trip.name = "Lisbon and Porto".to_string();
    h.trips.save_trip(&mut trip).unwrap();
    h.remote.script(ChangeSet {
        timestamp: Some(200),
        ..ChangeSet::default()
    });
    *h.remote.push_failure.lock().unwrap() =
        Some(TransportError::Network("connection reset".to_string()));

    let failed = h.engine.synchronize().await.unwrap();

    assert!(!failed.success);
    assert!(failed.error.unwrap().contains("connection reset"));
    assert_eq!(h.session.changes_timestamp().unwrap(), Some(100));
    assert_eq!(h.trips.dirty_trips().unwrap().len(), 1);

    let retried = h.engine.synchronize().await.unwrap();

    assert!(retried.success);
    assert_eq!(h.remote.requested_since(), vec![Some(100), Some(100)]);
    assert!(h.trips.dirty_trips().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_failure_is_isolated_to_its_trip() {
    let h = harness();
    h.trips.apply_remote_trip(&server_trip("trip_1", 1, "Existing"), false).unwrap();
    let mut trip = Trip::new("Collides");
    h.trips.save_trip(&mut trip).unwrap();
    h.remote.next_ids.lock().unwrap().push_back(TripId::from("trip_1"));
    h.remote.serve(server_trip("trip_2", 1, "Pulled"));
    h.remote.script(ChangeSet {
        updated_trips: BTreeMap::from([(TripId::from("trip_2"), 1)]),
        timestamp: Some(300),
        ..ChangeSet::default()
    });

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.is_partial());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].entity, trip.id.as_str());
    assert!(result.failures[0].message.contains("Remapping"));
    assert_eq!(result.changed_trip_ids, vec![TripId::from("trip_2")]);
    assert!(h.trips.trip_with_id(&trip.id).unwrap().is_some());
    assert_eq!(h.session.changes_timestamp().unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pull_applies_server_updates_once() {
    let h = harness();
    let id = TripId::from("trip_8");
    h.remote.serve(server_trip("trip_8", 2, "Kyoto"));
    let changes = ChangeSet {
        updated_trips: BTreeMap::from([(id.clone(), 2)]),
        settings_changed: true,
        timestamp: Some(42),
        ..ChangeSet::default()
    };
    h.remote.script(changes.clone());
    h.remote.script(changes);

    let first = h.engine.synchronize().await.unwrap();
    let second = h.engine.synchronize().await.unwrap();

    assert_eq!(first.changed_trip_ids, vec![id.clone()]);
    assert!(first.settings_changed);
    assert!(second.changed_trip_ids.is_empty());
    let stored = h.trips.trip_with_id(&id).unwrap().unwrap();
    assert_eq!(stored.name, "Kyoto");
    assert_eq!(stored.server_version, 2);
    assert!(!stored.changed);
    assert_eq!(h.remote.requested_since(), vec![None, Some(42)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_deletions_and_favorites_are_applied() {
    let h = harness();
    h.trips.apply_remote_trip(&server_trip("trip_3", 1, "Gone"), false).unwrap();
    h.favorites.update_favorite("poi:old", true).unwrap();
    h.engine.synchronize().await.unwrap();

    h.remote.script(ChangeSet {
        deleted_trip_ids: vec![TripId::from("trip_3"), TripId::from("trip_unknown")],
        updated_favorite_ids: vec!["poi:new".to_string()],
        deleted_favorite_ids: vec!["poi:old".to_string()],
        ..ChangeSet::default()
    });
    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert!(result.failures.is_empty());
    assert_eq!(result.changed_trip_ids, vec![TripId::from("trip_3")]);
    assert!(h.trips.trip_with_id(&TripId::from("trip_3")).unwrap().is_none());
    assert_eq!(result.changed_favorite_ids, vec!["poi:new", "poi:old"]);
    assert_eq!(h.favorites.favorite_place_ids().unwrap(), vec!["poi:new"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_favorites_are_pushed_and_confirmed() {
    let h = harness();
    h.favorites.update_favorite("poi:1", true).unwrap();

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert_eq!(result.changed_favorite_ids, vec!["poi:1"]);
    assert!(h.favorites.pending_diff().unwrap().is_empty());
    assert_eq!(h.favorites.favorite_place_ids().unwrap(), vec!["poi:1"]);
    assert_eq!(
        *h.remote.pushed_favorites.lock().unwrap(),
        vec![FavoritesDiff::from([("poi:1".to_string(), FavoriteIntent::Add)])]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_favorites_failure_preserves_diff() {
    let h = harness();
    h.favorites.update_favorite("poi:1", true).unwrap();
    h.favorites.update_favorite("poi:2", false).unwrap();
    let before = h.favorites.pending_diff().unwrap();
    *h.remote.favorites_failure.lock().unwrap() =
        Some(TransportError::Network("timed out".to_string()));

    let result = h.engine.synchronize().await.unwrap();

    assert!(!result.success);
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(h.favorites.pending_diff().unwrap(), before);
    assert!(h.remote.requested_since().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pass_without_session_fails() {
    let h = harness_with(false, SyncSchedule::default());

    let result = h.engine.synchronize().await.unwrap();

    assert!(!result.success);
    assert!(result.error.unwrap().contains("no active session"));
    assert!(h.remote.requested_since().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocked_engine_stays_in_standby() {
    let h = harness();
    h.engine.block_synchronization(true);

    assert_eq!(h.engine.synchronize().await, None);
    assert!(h.remote.requested_since().is_empty());
    assert_eq!(h.engine.state(), SyncState::Standby);

    h.engine.block_synchronization(false);
    assert!(h.engine.synchronize().await.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_completion_handler_sees_every_pass() {
    let h = harness();
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    h.events.set_sync_completion_handler(move |result| {
        sink.lock().unwrap().push(result.clone());
    });

    let first = h.engine.synchronize().await.unwrap();
    h.engine.synchronize().await.unwrap();

    let seen = results.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], first);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_while_waiting_for_conflicts() {
    let h = harness();
    let id = diverged(&h, "trip_5");
    let mut inbox = forward_conflicts(&h.events);

    let pass = h.engine.trigger();
    let (conflicts, completion) = inbox.recv().await.unwrap();
    h.engine.cancel_synchronization();
    let result = pass.await.unwrap().unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(h.session.changes_timestamp().unwrap(), None);
    let stored = h.trips.trip_with_id(&id).unwrap().unwrap();
    assert_eq!(stored.name, "Local edit");
    assert!(stored.changed);

    // A late answer goes nowhere and the next pass starts clean
    completion.resolve(conflicts);
    assert!(!h.engine.sync_in_progress());
    h.events.clear_trip_conflicts_handler();
    assert!(h.engine.synchronize().await.unwrap().success);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_between_trips_stops_pushing() {
    let h = harness();
    for (id, name) in [("trip_a", "Andes"), ("trip_b", "Baltic")] {
        let mut trip = server_trip(id, 1, name);
        h.trips.apply_remote_trip(&trip, false).unwrap();
        trip.name = format!("{name} again");
        h.trips.save_trip(&mut trip).unwrap();
    }
    h.remote.script(ChangeSet {
        timestamp: Some(700),
        ..ChangeSet::default()
    });
    let engine = h.engine.clone();
    *h.remote.before_push.lock().unwrap() =
        Some(Box::new(move || engine.cancel_synchronization()));

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    let pushed: Vec<TripId> = h.remote.pushed().into_iter().map(|trip| trip.id).collect();
    assert_eq!(pushed, vec![TripId::from("trip_a")]);
    let second = h.trips.trip_with_id(&TripId::from("trip_b")).unwrap().unwrap();
    assert!(second.changed);
    assert_eq!(h.session.changes_timestamp().unwrap(), None);
    assert_eq!(h.engine.state(), SyncState::Standby);
    assert!(!h.engine.sync_in_progress());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_during_favorites_skips_changes() {
    let h = harness();
    h.favorites.update_favorite("poi:1", true).unwrap();
    let engine = h.engine.clone();
    *h.remote.before_favorites.lock().unwrap() =
        Some(Box::new(move || engine.cancel_synchronization()));

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.cancelled);
    assert!(h.remote.requested_since().is_empty());
    assert_eq!(h.engine.state(), SyncState::Standby);

    // The flag does not leak into the next pass
    assert!(h.engine.synchronize().await.unwrap().success);
    assert_eq!(h.remote.requested_since(), vec![None]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_deletion_wins_over_local_edits() {
    let h = harness();
    let id = TripId::from("trip_3");
    let mut trip = server_trip("trip_3", 1, "Gone");
    h.trips.apply_remote_trip(&trip, false).unwrap();
    trip.name = "Edited offline".to_string();
    h.trips.save_trip(&mut trip).unwrap();
    h.remote.script(ChangeSet {
        deleted_trip_ids: vec![id.clone()],
        ..ChangeSet::default()
    });

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert_eq!(result.changed_trip_ids, vec![id.clone()]);
    assert!(h.remote.pushed().is_empty());
    assert!(h.trips.trip_with_id(&id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clearing_purges_confirmed_trash() {
    let h = harness();
    let known = TripId::from("trip_4");
    h.trips.apply_remote_trip(&server_trip("trip_4", 1, "Old"), false).unwrap();
    h.trips.archive_trip(&known).unwrap();
    let mut local_only = Trip::new("Never synced");
    h.trips.save_trip(&mut local_only).unwrap();
    h.trips.archive_trip(&local_only.id).unwrap();
    assert_eq!(h.trips.request_empty_trash().unwrap().len(), 2);

    let result = h.engine.synchronize().await.unwrap();

    assert!(result.success);
    assert!(result.failures.is_empty());
    assert_eq!(*h.remote.trash_requests.lock().unwrap(), vec![vec![known.clone()]]);
    assert!(h.remote.created.lock().unwrap().is_empty());
    assert!(h.trips.trip_with_id(&known).unwrap().is_none());
    assert!(h.trips.trip_with_id(&local_only.id).unwrap().is_none());
    assert!(h.trips.pending_purges().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_periodic_pass_runs_on_first_tick() {
    let schedule = SyncSchedule {
        period_secs: 3600,
        min_period_secs: 0,
        auto_sync: true,
    };
    let h = harness_with(true, schedule);

    let timer = h.engine.spawn_periodic();
    tokio::time::sleep(Duration::from_millis(300)).await;
    timer.abort();

    assert_eq!(h.remote.requested_since().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_periodic_pass_respects_min_period() {
    let h = harness();
    h.engine.synchronize().await.unwrap();

    let timer = h.engine.spawn_periodic();
    tokio::time::sleep(Duration::from_millis(300)).await;
    timer.abort();

    assert_eq!(h.remote.requested_since().len(), 1);
}

#[test]
fn test_is_due() {
    let now = Instant::now();
    let minute = Duration::from_secs(60);

    assert!(is_due(None, minute, now));
    assert!(is_due(Some(now), Duration::ZERO, now));
    assert!(!is_due(Some(now), minute, now));
    if let Some(earlier) = now.checked_sub(Duration::from_secs(61)) {
        assert!(is_due(Some(earlier), minute, now));
    }
}
