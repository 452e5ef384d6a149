//! Subscription types for live queries.

use crate::types::{ChangeKind, Record};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

/// How `updated` events are matched against a subscription's filters.
///
/// `created` events always use the post-mutation filter test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMatching {
    /// Deliver when the new value matches, or when the record had already
    /// been shown to the subscriber. A record that stops matching is
    /// delivered once with its new value and then dropped from the
    /// subscriber's membership set. Nothing is ever retracted.
    #[default]
    TrackMembership,

    /// Deliver only when the new value matches the filters.
    PostImage,
}

/// Why a delivery was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum UpdateKind {
    /// Initial result of the query, sent once on subscribe.
    Snapshot,
    /// Incremental update caused by a mutation.
    Change(ChangeKind),
}

/// One delivery to a subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub subscription: SubscriptionId,
    pub kind: UpdateKind,
    /// Full result list for snapshots, a single record for changes.
    pub records: Vec<Record>,
}

impl SubscriptionUpdate {
    pub fn is_snapshot(&self) -> bool {
        self.kind == UpdateKind::Snapshot
    }
}

/// Receives deliveries for one subscription.
///
/// Any `Fn(&SubscriptionUpdate)` closure is an observer.
pub trait SubscriptionObserver: Send + Sync {
    /// Deliver an update. Returning false drops the subscription.
    fn deliver(&self, update: &SubscriptionUpdate) -> bool;
}

impl<F> SubscriptionObserver for F
where
    F: Fn(&SubscriptionUpdate) + Send + Sync,
{
    fn deliver(&self, update: &SubscriptionUpdate) -> bool {
        self(update);
        true
    }
}

/// Observer that forwards into a bounded channel.
///
/// A full buffer means a slow consumer; the subscription is dropped.
pub struct ChannelObserver {
    sender: Sender<SubscriptionUpdate>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<SubscriptionUpdate>) -> Self {
        Self { sender }
    }
}

impl SubscriptionObserver for ChannelObserver {
    fn deliver(&self, update: &SubscriptionUpdate) -> bool {
        self.sender.try_send(update.clone()).is_ok()
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

/// Handle to a channel-backed subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive updates.
    pub receiver: crossbeam_channel::Receiver<SubscriptionUpdate>,
}

impl SubscriptionHandle {
    /// Receive the next update (blocking).
    pub fn recv(&self) -> Result<SubscriptionUpdate, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an update (non-blocking).
    pub fn try_recv(&self) -> Result<SubscriptionUpdate, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<SubscriptionUpdate, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<SubscriptionUpdate> {
        self.receiver.try_iter().collect()
    }
}
