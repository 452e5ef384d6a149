//! Subscription manager for fanning out change events.

use crate::query::Query;
use crate::types::{ChangeEvent, ChangeKind, Record, RecordId, Sequence, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{
    SubscriptionId, SubscriptionObserver, SubscriptionUpdate, UpdateKind, UpdateMatching,
};

/// Internal subscription state.
pub(crate) struct Subscription {
    id: SubscriptionId,
    query: Query,
    observer: Box<dyn SubscriptionObserver>,
    created_at: Timestamp,
    /// Events at or below this sequence are covered by the snapshot.
    since: Sequence,
    /// Cleared on unsubscribe; checked right before every delivery.
    active: AtomicBool,
    /// Record ids already shown to the observer.
    members: Mutex<HashSet<RecordId>>,
}

impl Subscription {
    /// Whether this subscription should see a change event.
    fn wants(&self, event: &ChangeEvent, matching: UpdateMatching) -> bool {
        let matches = self.query.matches(&event.new_value);

        match (event.kind, matching) {
            (ChangeKind::Created, _) | (ChangeKind::Updated, UpdateMatching::PostImage) => {
                if matches {
                    self.members.lock().insert(event.record_id.clone());
                }
                matches
            }
            (ChangeKind::Updated, UpdateMatching::TrackMembership) => {
                let mut members = self.members.lock();
                if matches {
                    members.insert(event.record_id.clone());
                    true
                } else {
                    // one last delivery with the value that left the result set
                    members.remove(&event.record_id)
                }
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Manages live query subscriptions.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// How update events are matched.
    matching: UpdateMatching,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self::with_matching(UpdateMatching::default())
    }

    /// Create a new subscription manager with a specific update matching mode.
    pub fn with_matching(matching: UpdateMatching) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            matching,
        }
    }

    pub fn matching(&self) -> UpdateMatching {
        self.matching
    }

    /// Register a subscription without delivering anything.
    ///
    /// The caller is expected to follow up with `deliver_snapshot` before any
    /// further mutation is fanned out. Events with a sequence up to `since`
    /// are never delivered to it.
    pub(crate) fn register(
        &self,
        query: Query,
        observer: Box<dyn SubscriptionObserver>,
        now: Timestamp,
        since: Sequence,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let subscription = Arc::new(Subscription {
            id,
            query,
            observer,
            created_at: now,
            since,
            active: AtomicBool::new(true),
            members: Mutex::new(HashSet::new()),
        });

        self.subscriptions.write().insert(id, subscription);
        id
    }

    /// Deliver the initial snapshot and seed the membership set.
    pub(crate) fn deliver_snapshot(&self, id: SubscriptionId, records: Vec<Record>) {
        let Some(sub) = self.subscriptions.read().get(&id).cloned() else {
            return;
        };

        sub.members
            .lock()
            .extend(records.iter().map(|r| r.id.clone()));

        let update = SubscriptionUpdate {
            subscription: id,
            kind: UpdateKind::Snapshot,
            records,
        };
        if !sub.is_active() || !sub.observer.deliver(&update) {
            self.drop_subscription(id);
        }
    }

    /// Unsubscribe. Returns false if the subscription did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.write().remove(&id) {
            Some(sub) => {
                sub.active.store(false, Ordering::Release);
                debug!(subscription = id.0, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Whether a subscription is still registered.
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }

    /// Get the query behind a subscription.
    pub fn query_for(&self, id: SubscriptionId) -> Option<Query> {
        self.subscriptions.read().get(&id).map(|s| s.query.clone())
    }

    /// When a subscription was created.
    pub fn created_at(&self, id: SubscriptionId) -> Option<Timestamp> {
        self.subscriptions.read().get(&id).map(|s| s.created_at)
    }

    // --- Broadcasting ---

    /// Fan a change event out to every interested subscription.
    ///
    /// Returns the number of deliveries made. Observers run without any
    /// registry lock held, so they may subscribe or unsubscribe.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let targets: Vec<Arc<Subscription>> = {
            let subs = self.subscriptions.read();
            subs.values()
                .filter(|sub| sub.query.collection == event.collection)
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        let mut to_remove = Vec::new();

        for sub in targets {
            // removal may have happened in an earlier observer of this event
            if !sub.is_active()
                || event.sequence <= sub.since
                || !sub.wants(event, self.matching)
            {
                continue;
            }

            let update = SubscriptionUpdate {
                subscription: sub.id,
                kind: UpdateKind::Change(event.kind),
                records: vec![event.new_value.clone()],
            };
            if sub.observer.deliver(&update) {
                delivered += 1;
            } else {
                to_remove.push(sub.id);
            }
        }

        for id in to_remove {
            self.drop_subscription(id);
        }

        delivered
    }

    fn drop_subscription(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            sub.active.store(false, Ordering::Release);
            debug!(subscription = id.0, "dropped subscription, observer gone or too slow");
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::types::ChannelObserver;
    use crate::types::Fields;
    use crossbeam_channel::bounded;
    use serde_json::json;

    fn make_event(id: &str, kind: ChangeKind, status: &str) -> ChangeEvent {
        let mut fields = Fields::new();
        fields.insert("status".into(), json!(status));
        let record = Record {
            id: RecordId::from(id),
            collection: "shipments".into(),
            fields,
            created_at: Timestamp(1),
            updated_at: Timestamp(1),
            sequence: Sequence(1),
        };
        ChangeEvent {
            sequence: Sequence(1),
            collection: "shipments".into(),
            record_id: record.id.clone(),
            kind,
            new_value: record,
        }
    }

    fn channel_sub(
        manager: &SubscriptionManager,
        query: Query,
        buffer: usize,
    ) -> (SubscriptionId, crossbeam_channel::Receiver<SubscriptionUpdate>) {
        let (sender, receiver) = bounded(buffer);
        let id = manager.register(
            query,
            Box::new(ChannelObserver::new(sender)),
            Timestamp(0),
            Sequence::default(),
        );
        manager.deliver_snapshot(id, Vec::new());
        (id, receiver)
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = SubscriptionManager::new();
        let (id, _rx) = channel_sub(&manager, Query::collection("shipments"), 10);
        assert_eq!(manager.subscription_count(), 1);

        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_broadcast_filters_by_collection_and_fields() {
        let manager = SubscriptionManager::new();
        let (_, open_rx) = channel_sub(
            &manager,
            Query::collection("shipments").filter("status", "open"),
            10,
        );
        let (_, vehicles_rx) = channel_sub(&manager, Query::collection("vehicles"), 10);

        // drain snapshots
        assert!(open_rx.try_recv().unwrap().is_snapshot());
        assert!(vehicles_rx.try_recv().unwrap().is_snapshot());

        assert_eq!(manager.broadcast(&make_event("a", ChangeKind::Created, "closed")), 0);
        assert_eq!(manager.broadcast(&make_event("b", ChangeKind::Created, "open")), 1);

        let update = open_rx.try_recv().unwrap();
        assert_eq!(update.kind, UpdateKind::Change(ChangeKind::Created));
        assert_eq!(update.records[0].id, RecordId::from("b"));
        assert!(open_rx.try_recv().is_err());
        assert!(vehicles_rx.try_recv().is_err());
    }

    #[test]
    fn test_track_membership_delivers_exit_once() {
        let manager = SubscriptionManager::new();
        let (id, rx) = channel_sub(
            &manager,
            Query::collection("shipments").filter("status", "open"),
            10,
        );
        rx.try_recv().unwrap();

        manager.broadcast(&make_event("a", ChangeKind::Created, "open"));
        manager.broadcast(&make_event("a", ChangeKind::Updated, "closed"));
        manager.broadcast(&make_event("a", ChangeKind::Updated, "archived"));

        let updates: Vec<_> = rx.try_iter().collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].records[0].fields["status"], "closed");
        assert!(manager.contains(id));
    }

    #[test]
    fn test_post_image_matching() {
        let manager = SubscriptionManager::with_matching(UpdateMatching::PostImage);
        let (_, rx) = channel_sub(
            &manager,
            Query::collection("shipments").filter("status", "open"),
            10,
        );
        rx.try_recv().unwrap();

        manager.broadcast(&make_event("a", ChangeKind::Created, "open"));
        manager.broadcast(&make_event("a", ChangeKind::Updated, "closed"));

        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let manager = SubscriptionManager::new();
        let (_, _rx) = channel_sub(&manager, Query::collection("shipments"), 2);

        // snapshot took one slot, flood the rest
        for i in 0..10 {
            manager.broadcast(&make_event(&format!("r{}", i), ChangeKind::Created, "open"));
        }

        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_events_covered_by_snapshot_are_skipped() {
        let manager = SubscriptionManager::new();
        let (sender, rx) = bounded(10);
        let id = manager.register(
            Query::collection("shipments"),
            Box::new(ChannelObserver::new(sender)),
            Timestamp(0),
            Sequence(1),
        );
        manager.deliver_snapshot(id, Vec::new());
        rx.try_recv().unwrap();

        // make_event stamps sequence 1
        assert_eq!(manager.broadcast(&make_event("a", ChangeKind::Created, "open")), 0);

        let mut later = make_event("b", ChangeKind::Created, "open");
        later.sequence = Sequence(2);
        assert_eq!(manager.broadcast(&later), 1);
        assert_eq!(rx.try_recv().unwrap().records[0].id, RecordId::from("b"));
    }

    #[test]
    fn test_unsubscribed_during_fanout_is_skipped() {
        let manager = Arc::new(SubscriptionManager::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        // ids are handed out sequentially, so the second subscription is 2
        let victim = SubscriptionId(2);
        let first = {
            let registry = Arc::clone(&manager);
            let seen = Arc::clone(&seen);
            manager.register(
                Query::collection("shipments"),
                Box::new(move |update: &SubscriptionUpdate| {
                    seen.lock().push(update.subscription);
                    registry.unsubscribe(victim);
                }),
                Timestamp(0),
                Sequence::default(),
            )
        };
        let second = {
            let seen = Arc::clone(&seen);
            manager.register(
                Query::collection("shipments"),
                Box::new(move |update: &SubscriptionUpdate| {
                    seen.lock().push(update.subscription);
                }),
                Timestamp(0),
                Sequence::default(),
            )
        };
        assert_eq!(second, victim);

        manager.broadcast(&make_event("a", ChangeKind::Created, "open"));

        // whichever ran first, the second never runs after the first has
        let seen = seen.lock().clone();
        if seen.first() == Some(&first) {
            assert_eq!(seen, vec![first]);
        } else {
            assert_eq!(seen, vec![second, first]);
        }
        assert!(!manager.contains(second));
    }
}
