//! Remote change feed forwarded into the local store.

use super::messages::{encode_text, ChangeFeedMessage, ResumeRequest};
use super::{ClientConfig, StreamHandler, StreamingClient};
use crate::error::Result;
use crate::store::Store;
use crate::transport::{Frame, Transport};
use crate::types::{ChangeEvent, Sequence, Timestamp};
use std::sync::Arc;
use tracing::{debug, info};

/// Applies remote change events to a [`Store`], which fans them out to its
/// subscriptions.
pub struct ChangeFeed {
    store: Arc<Store>,
    /// Collections to mirror; empty means all.
    collections: Vec<String>,
    /// Highest remote sequence applied so far.
    last_sequence: Option<Sequence>,
    applied: u64,
    skipped: u64,
}

impl ChangeFeed {
    pub fn new(store: Arc<Store>, collections: Vec<String>) -> Self {
        Self {
            store,
            collections,
            last_sequence: None,
            applied: 0,
            skipped: 0,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn last_sequence(&self) -> Option<Sequence> {
        self.last_sequence
    }

    /// Events written to the store.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Events ignored as replays or outside the mirrored collections.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn wants(&self, event: &ChangeEvent) -> bool {
        self.collections.is_empty() || self.collections.contains(&event.collection)
    }

    fn forward(&mut self, event: ChangeEvent) -> Result<()> {
        if !self.wants(&event) || self.last_sequence.is_some_and(|last| event.sequence <= last) {
            debug!(seq = event.sequence.0, collection = %event.collection, "skipping change");
            self.skipped += 1;
            return Ok(());
        }

        let sequence = event.sequence;
        self.store.apply_change(event)?;
        self.last_sequence = Some(sequence);
        self.applied += 1;
        Ok(())
    }
}

impl StreamHandler for ChangeFeed {
    type Message = ChangeFeedMessage;

    fn name(&self) -> &'static str {
        "change-feed"
    }

    fn on_open(&mut self) -> Result<Vec<Frame>> {
        let resume = ResumeRequest {
            since: self.last_sequence.map(|s| s.0).unwrap_or(0),
            collections: self.collections.clone(),
        };
        debug!(since = resume.since, "resuming change feed");
        Ok(vec![encode_text(&resume)?])
    }

    fn apply(&mut self, message: ChangeFeedMessage, _now: Timestamp) -> Result<()> {
        match message {
            ChangeFeedMessage::Change(event) => self.forward(event),
            ChangeFeedMessage::Ping => Ok(()),
            ChangeFeedMessage::Connected => {
                info!("change feed acknowledged");
                Ok(())
            }
        }
    }
}

/// Change-feed client.
pub type ChangeFeedClient<T> = StreamingClient<T, ChangeFeed>;

impl<T: Transport> StreamingClient<T, ChangeFeed> {
    /// Create a disconnected change-feed client mirroring `collections`
    /// (all collections when empty) into `store`.
    pub fn change_feed(
        config: ClientConfig,
        transport: T,
        store: Arc<Store>,
        collections: Vec<String>,
    ) -> Self {
        Self::new(config, transport, ChangeFeed::new(store, collections))
    }

    pub fn last_sequence(&self) -> Option<Sequence> {
        self.handler().last_sequence()
    }
}
