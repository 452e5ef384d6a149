//! Main Store struct tying collections, queries and subscriptions together.

use crate::error::{Result, SyncError};
use crate::query::{evaluate, Query};
use crate::records::Collection;
use crate::scheduler::{Clock, SystemClock};
use crate::subscriptions::{
    ChannelObserver, SubscriptionHandle, SubscriptionId, SubscriptionManager,
    SubscriptionObserver, UpdateMatching,
};
use crate::types::{ChangeEvent, ChangeKind, Fields, Record, RecordId, Sequence, StoreStats};
use crossbeam_channel::bounded;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Store configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How `updated` events are matched against subscription filters.
    #[serde(default)]
    pub update_matching: UpdateMatching,

    /// Buffer size for channel-backed subscriptions.
    /// Default: 1000
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

fn default_subscription_buffer() -> usize {
    1000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            update_matching: UpdateMatching::default(),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

impl StoreConfig {
    pub fn with_update_matching(mut self, matching: UpdateMatching) -> Self {
        self.update_matching = matching;
        self
    }

    pub fn with_subscription_buffer(mut self, size: usize) -> Self {
        self.subscription_buffer = size;
        self
    }
}

/// Identifier of an external change listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// The in-memory document store.
///
/// Provides a unified interface for:
/// - Creating and updating records in named collections
/// - One-shot queries
/// - Live queries (subscriptions) fed by every mutation
/// - External change listeners
///
/// All mutations go through one write path and are fanned out to
/// subscribers before the mutating call returns.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Source of record timestamps.
    clock: Arc<dyn Clock>,

    /// Collections by name, created on first write.
    collections: RwLock<HashMap<String, Collection>>,

    /// Live query registry.
    subscriptions: SubscriptionManager,

    /// External change listeners, in registration order.
    listeners: RwLock<Vec<(ListenerId, ChangeListener)>>,

    /// Last assigned mutation sequence.
    sequence: Mutex<Sequence>,

    /// Counter for generated record ids.
    next_record: AtomicU64,

    next_listener: AtomicU64,

    events_emitted: AtomicU64,

    /// Serializes a mutation together with its fan-out. Reentrant so that an
    /// observer may itself write to the store.
    write_lock: ReentrantMutex<()>,

    /// Events waiting for fan-out, in sequence order. Only touched with the
    /// write lock held.
    pending: Mutex<VecDeque<ChangeEvent>>,

    /// Set while the outermost `emit` drains `pending`.
    emitting: AtomicBool,
}

impl Store {
    /// Create a store stamping records with wall-clock time.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a store with an injected clock.
    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let subscriptions = SubscriptionManager::with_matching(config.update_matching);
        Self {
            config,
            clock,
            collections: RwLock::new(HashMap::new()),
            subscriptions,
            listeners: RwLock::new(Vec::new()),
            sequence: Mutex::new(Sequence::default()),
            next_record: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            events_emitted: AtomicU64::new(0),
            write_lock: ReentrantMutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            emitting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> crate::types::Timestamp {
        self.clock.now()
    }

    // --- Record Operations ---

    /// Create a record with a fresh id. The collection is created if needed.
    pub fn create(&self, collection: &str, fields: Fields) -> RecordId {
        let _lock = self.write_lock.lock();

        let id = RecordId(format!(
            "{}-{}",
            collection,
            self.next_record.fetch_add(1, Ordering::SeqCst)
        ));
        let now = self.clock.now();
        let sequence = self.next_sequence();

        let record = Record {
            id: id.clone(),
            collection: collection.to_string(),
            fields,
            created_at: now,
            updated_at: now,
            sequence,
        };

        {
            let mut collections = self.collections.write();
            collections
                .entry(collection.to_string())
                .or_insert_with(|| Collection::new(collection))
                .upsert(record.clone());
        }

        debug!(collection, id = %id, seq = sequence.0, "created record");
        self.emit(ChangeEvent {
            sequence,
            collection: collection.to_string(),
            record_id: id.clone(),
            kind: ChangeKind::Created,
            new_value: record,
        });

        id
    }

    /// Shallow-merge `partial` into an existing record.
    pub fn update(&self, collection: &str, id: &RecordId, partial: Fields) -> Result<Record> {
        let _lock = self.write_lock.lock();

        let now = self.clock.now();
        let record = {
            let mut collections = self.collections.write();
            let target = collections
                .get_mut(collection)
                .filter(|c| c.contains(id))
                .ok_or_else(|| SyncError::not_found(collection, id))?;
            let sequence = self.next_sequence();
            target
                .merge(id, partial, now, sequence)
                .cloned()
                .ok_or_else(|| SyncError::not_found(collection, id))?
        };

        debug!(collection, id = %id, seq = record.sequence.0, "updated record");
        self.emit(ChangeEvent {
            sequence: record.sequence,
            collection: collection.to_string(),
            record_id: id.clone(),
            kind: ChangeKind::Updated,
            new_value: record.clone(),
        });

        Ok(record)
    }

    /// Apply a change received from a remote feed.
    ///
    /// The remote record is upserted as-is (id and timestamps kept) and
    /// fanned out like a local mutation. The re-emitted event carries a
    /// local sequence number.
    pub fn apply_change(&self, event: ChangeEvent) -> Result<Record> {
        if event.new_value.id != event.record_id || event.new_value.collection != event.collection
        {
            return Err(SyncError::MalformedMessage(format!(
                "change for {}/{} carries record {}/{}",
                event.collection, event.record_id, event.new_value.collection, event.new_value.id
            )));
        }

        let _lock = self.write_lock.lock();

        let sequence = self.next_sequence();
        let mut record = event.new_value;
        record.sequence = sequence;
        record.updated_at = record.updated_at.max(record.created_at);

        let created = {
            let mut collections = self.collections.write();
            collections
                .entry(event.collection.clone())
                .or_insert_with(|| Collection::new(event.collection.clone()))
                .upsert(record.clone())
        };

        let kind = if created {
            ChangeKind::Created
        } else {
            ChangeKind::Updated
        };
        debug!(collection = %event.collection, id = %record.id, ?kind, "applied remote change");
        self.emit(ChangeEvent {
            sequence,
            collection: event.collection,
            record_id: record.id.clone(),
            kind,
            new_value: record.clone(),
        });

        Ok(record)
    }

    /// Get a record by ID.
    pub fn get(&self, collection: &str, id: &RecordId) -> Result<Record> {
        self.find(collection, id)
            .ok_or_else(|| SyncError::not_found(collection, id))
    }

    /// Get a record by ID, `None` if missing.
    pub fn find(&self, collection: &str, id: &RecordId) -> Option<Record> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Evaluate a query against the current state.
    pub fn query(&self, query: &Query) -> Vec<Record> {
        let collections = self.collections.read();
        match collections.get(&query.collection) {
            Some(collection) => evaluate(query, collection.iter()),
            None => Vec::new(),
        }
    }

    // --- Subscriptions ---

    /// Start a live query.
    ///
    /// The observer receives the current query result before this returns,
    /// then one delivery per matching mutation.
    pub fn subscribe(
        &self,
        query: Query,
        observer: impl SubscriptionObserver + 'static,
    ) -> SubscriptionId {
        self.subscribe_boxed(query, Box::new(observer))
    }

    /// Start a live query delivering into a bounded channel.
    pub fn subscribe_channel(&self, query: Query) -> SubscriptionHandle {
        let (sender, receiver) = bounded(self.config.subscription_buffer.max(1));
        let id = self.subscribe_boxed(query, Box::new(ChannelObserver::new(sender)));
        SubscriptionHandle { id, receiver }
    }

    fn subscribe_boxed(
        &self,
        query: Query,
        observer: Box<dyn SubscriptionObserver>,
    ) -> SubscriptionId {
        // hold the write path so no mutation lands between snapshot and registration
        let _lock = self.write_lock.lock();

        let snapshot = self.query(&query);
        let collection = query.collection.clone();
        // events still queued for fan-out are already part of the snapshot
        let id = self.subscriptions.register(
            query,
            observer,
            self.clock.now(),
            self.last_sequence(),
        );

        debug!(subscription = id.0, %collection, initial = snapshot.len(), "subscribed");
        self.subscriptions.deliver_snapshot(id, snapshot);
        id
    }

    /// Stop a live query. Returns false if it was not active.
    ///
    /// Waits for a fan-out running on another thread, so no delivery for
    /// `id` is in progress once this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let _lock = self.write_lock.lock();
        self.subscriptions.unsubscribe(id)
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    // --- Change Listeners ---

    /// Register a listener that sees every change event once.
    pub fn on_change(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a change listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    // --- Introspection ---

    /// Names of all collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(Collection::len)
            .unwrap_or(0)
    }

    /// Sequence of the last mutation.
    pub fn last_sequence(&self) -> Sequence {
        *self.sequence.lock()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let collections = self.collections.read();
        StoreStats {
            collection_count: collections.len() as u64,
            record_count: collections.values().map(|c| c.len() as u64).sum(),
            subscription_count: self.subscriptions.subscription_count() as u64,
            listener_count: self.listeners.read().len() as u64,
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
        }
    }

    // --- Internals ---

    fn next_sequence(&self) -> Sequence {
        let mut seq = self.sequence.lock();
        *seq = seq.next();
        *seq
    }

    /// Publish one change event: subscriptions first, then listeners.
    ///
    /// Called with the write lock held and no collection lock held. An event
    /// raised by an observer is queued and delivered after the current one,
    /// so every observer sees events in sequence order.
    fn emit(&self, event: ChangeEvent) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push_back(event);

        if self.emitting.swap(true, Ordering::AcqRel) {
            return;
        }
        let _draining = EmitGuard(&self.emitting);

        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(event) => self.fan_out(&event),
                None => break,
            }
        }
    }

    fn fan_out(&self, event: &ChangeEvent) {
        let delivered = self.subscriptions.broadcast(event);
        if delivered == 0 && self.subscriptions.subscription_count() > 0 {
            debug!(collection = %event.collection, seq = event.sequence.0, "no subscription matched");
        }

        let listeners: Vec<ChangeListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Clears the draining flag even if an observer panics.
struct EmitGuard<'a>(&'a AtomicBool);

impl Drop for EmitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Log and swallow a store error from a background path.
pub(crate) fn log_background_error(context: &str, err: &SyncError) {
    warn!(context, error = %err, "background store operation failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Direction;
    use crate::scheduler::ManualClock;
    use crate::subscriptions::{SubscriptionUpdate, UpdateKind};
    use crate::types::Timestamp;
    use serde_json::json;
    use std::time::Duration;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    fn test_store() -> (Store, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_secs(1_000));
        let store = Store::with_clock(StoreConfig::default(), Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_create_and_get() {
        let (store, _) = test_store();

        let id = store.create("shipments", fields(json!({"status": "pending"})));
        let record = store.get("shipments", &id).unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.collection, "shipments");
        assert_eq!(record.fields["status"], "pending");
        assert_eq!(record.created_at, Timestamp::from_secs(1_000));
        assert_eq!(record.created_at, record.updated_at);
        assert_eq!(store.count("shipments"), 1);
        assert_eq!(store.collections(), vec!["shipments".to_string()]);
    }

    #[test]
    fn test_update_merges_and_bumps_updated_at() {
        let (store, clock) = test_store();
        let id = store.create("shipments", fields(json!({"status": "pending", "eta": 3})));

        clock.advance(Duration::from_secs(5));
        let record = store
            .update("shipments", &id, fields(json!({"status": "in_transit"})))
            .unwrap();

        assert_eq!(record.fields["status"], "in_transit");
        assert_eq!(record.fields["eta"], 3);
        assert_eq!(record.updated_at, Timestamp::from_secs(1_005));
        assert_eq!(record.created_at, Timestamp::from_secs(1_000));
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let (store, _) = test_store();
        store.create("shipments", Fields::new());

        let missing = RecordId::from("shipments-999");
        let err = store.update("shipments", &missing, Fields::new()).unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));

        let err = store.update("vehicles", &missing, Fields::new()).unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));

        assert!(store.get("shipments", &missing).is_err());
        assert!(store.find("shipments", &missing).is_none());
        // failed updates emit nothing
        assert_eq!(store.stats().events_emitted, 1);
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let (store, _) = test_store();
        let a = store.create("x", Fields::new());
        let b = store.create("y", Fields::new());
        let updated = store.update("x", &a, Fields::new()).unwrap();

        assert_eq!(store.get("x", &a).unwrap().sequence, Sequence(3));
        assert_eq!(store.get("y", &b).unwrap().sequence, Sequence(2));
        assert_eq!(updated.sequence, Sequence(3));
        assert_eq!(store.last_sequence(), Sequence(3));
    }

    #[test]
    fn test_subscribe_delivers_snapshot_first() {
        let (store, _) = test_store();
        for value in [5, 1, 3] {
            store.create("x", fields(json!({"value": value})));
        }

        let query = Query::collection("x").order_by("value", Direction::Asc);
        let handle = store.subscribe_channel(query.clone());

        let snapshot = handle.try_recv().unwrap();
        assert_eq!(snapshot.kind, UpdateKind::Snapshot);
        assert_eq!(snapshot.records, store.query(&query));
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_change_listener_sees_every_event() {
        let (store, _) = test_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = store.on_change(move |event: &ChangeEvent| {
            sink.lock().push(event.kind);
        });

        let id = store.create("x", Fields::new());
        store.update("x", &id, Fields::new()).unwrap();
        assert!(store.remove_listener(listener));
        store.create("x", Fields::new());

        assert_eq!(*seen.lock(), vec![ChangeKind::Created, ChangeKind::Updated]);
        assert!(!store.remove_listener(listener));
    }

    #[test]
    fn test_observer_may_write_to_store() {
        let store = Arc::new(Store::default());
        let writer = Arc::clone(&store);

        store.subscribe(
            Query::collection("orders"),
            move |update: &SubscriptionUpdate| {
                if !update.is_snapshot() {
                    writer.create("audit", Fields::new());
                }
            },
        );

        store.create("orders", Fields::new());
        assert_eq!(store.count("audit"), 1);
    }

    #[test]
    fn test_nested_write_is_delivered_after_current_event() {
        let store = Arc::new(Store::default());
        let writer = Arc::clone(&store);
        store.subscribe(
            Query::collection("parcels").filter("kind", "root"),
            move |update: &SubscriptionUpdate| {
                if !update.is_snapshot() {
                    writer.create("parcels", fields(json!({"kind": "child"})));
                }
            },
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(
            Query::collection("parcels"),
            move |update: &SubscriptionUpdate| {
                if !update.is_snapshot() {
                    sink.lock().push(update.records[0].sequence);
                }
            },
        );
        let heard = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&heard);
        store.on_change(move |event: &ChangeEvent| sink.lock().push(event.sequence));

        store.create("parcels", fields(json!({"kind": "root"})));

        assert_eq!(*seen.lock(), vec![Sequence(1), Sequence(2)]);
        assert_eq!(*heard.lock(), vec![Sequence(1), Sequence(2)]);
        assert_eq!(store.count("parcels"), 2);
        assert_eq!(store.stats().events_emitted, 2);
    }

    #[test]
    fn test_subscribe_from_observer_skips_queued_events() {
        let store = Arc::new(Store::default());
        let inner = Arc::clone(&store);
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handles);
        store.subscribe(
            Query::collection("parcels").filter("kind", "root"),
            move |update: &SubscriptionUpdate| {
                if !update.is_snapshot() {
                    inner.create("parcels", fields(json!({"kind": "child"})));
                    let handle = inner.subscribe_channel(Query::collection("parcels"));
                    sink.lock().push(handle);
                }
            },
        );

        store.create("parcels", fields(json!({"kind": "root"})));

        let handles = handles.lock();
        let updates = handles[0].drain();
        // the queued child create is already in the snapshot
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_snapshot());
        assert_eq!(updates[0].records.len(), 2);

        store.create("parcels", Fields::new());
        assert_eq!(handles[0].drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe_waits_for_running_fan_out() {
        let store = Arc::new(Store::default());
        let (started_tx, started_rx) = bounded(1);
        let finished = Arc::new(AtomicBool::new(false));
        let deliveries = Arc::new(AtomicU64::new(0));

        let done = Arc::clone(&finished);
        let count = Arc::clone(&deliveries);
        let id = store.subscribe(
            Query::collection("orders"),
            move |update: &SubscriptionUpdate| {
                if !update.is_snapshot() {
                    count.fetch_add(1, Ordering::SeqCst);
                    let _ = started_tx.try_send(());
                    std::thread::sleep(Duration::from_millis(50));
                    done.store(true, Ordering::SeqCst);
                }
            },
        );

        let writer = Arc::clone(&store);
        let mutation = std::thread::spawn(move || {
            writer.create("orders", Fields::new());
        });

        started_rx.recv().unwrap();
        assert!(store.unsubscribe(id));
        // the delivery already under way finished before unsubscribe returned
        assert!(finished.load(Ordering::SeqCst));
        mutation.join().unwrap();

        store.create("orders", Fields::new());
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_apply_change_upserts_remote_record() {
        let (store, _) = test_store();
        let remote = Record {
            id: RecordId::from("remote-7"),
            collection: "vehicles".into(),
            fields: fields(json!({"plate": "AB-12"})),
            created_at: Timestamp(10),
            updated_at: Timestamp(20),
            sequence: Sequence(42),
        };
        let event = ChangeEvent {
            sequence: Sequence(42),
            collection: "vehicles".into(),
            record_id: remote.id.clone(),
            kind: ChangeKind::Updated,
            new_value: remote,
        };

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        store.on_change(move |event: &ChangeEvent| sink.lock().push(event.kind));

        let applied = store.apply_change(event.clone()).unwrap();
        assert_eq!(applied.created_at, Timestamp(10));
        assert_eq!(applied.sequence, Sequence(1));
        store.apply_change(event).unwrap();

        assert_eq!(*kinds.lock(), vec![ChangeKind::Created, ChangeKind::Updated]);
        assert_eq!(store.count("vehicles"), 1);
    }

    #[test]
    fn test_apply_change_rejects_mismatched_event() {
        let (store, _) = test_store();
        let id = store.create("vehicles", Fields::new());
        let mut event = ChangeEvent {
            sequence: Sequence(1),
            collection: "vehicles".into(),
            record_id: RecordId::from("other"),
            kind: ChangeKind::Updated,
            new_value: store.get("vehicles", &id).unwrap(),
        };
        assert!(matches!(
            store.apply_change(event.clone()),
            Err(SyncError::MalformedMessage(_))
        ));

        event.record_id = id;
        assert!(store.apply_change(event).is_ok());
    }

    #[test]
    fn test_stats() {
        let (store, _) = test_store();
        store.create("a", Fields::new());
        store.create("b", Fields::new());
        let _handle = store.subscribe_channel(Query::collection("a"));
        store.on_change(|_: &ChangeEvent| {});

        let stats = store.stats();
        assert_eq!(stats.collection_count, 2);
        assert_eq!(stats.record_count, 2);
        assert_eq!(stats.subscription_count, 1);
        assert_eq!(stats.listener_count, 1);
        assert_eq!(stats.events_emitted, 2);
    }
}
