//! Server-push notification feed.

use super::messages::{NotificationMessage, NotificationPayload, NotificationStatus};
use super::{ClientConfig, StreamHandler, StreamingClient};
use crate::error::{Result, SyncError};
use crate::transport::Transport;
use crate::types::{RecordId, Timestamp};
use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use tracing::{debug, info};

/// Collection name reported in `NotFound` errors.
const NOTIFICATIONS: &str = "notifications";

/// Local notification feed, newest first.
///
/// Keeps at most `dedupe_window` notifications; the oldest fall off.
pub struct NotificationFeed {
    items: VecDeque<NotificationPayload>,
    unread: usize,
    /// Recently seen ids; replays after a reconnect are ignored.
    seen: LruCache<String, ()>,
    /// Set by the server's `connected` greeting.
    acknowledged: bool,
}

impl NotificationFeed {
    pub fn new(dedupe_window: usize) -> Self {
        let window = NonZeroUsize::new(dedupe_window).unwrap_or(NonZeroUsize::MIN);
        Self {
            items: VecDeque::with_capacity(window.get().min(64)),
            unread: 0,
            seen: LruCache::new(window),
            acknowledged: false,
        }
    }

    /// Notifications, newest first.
    pub fn items(&self) -> &VecDeque<NotificationPayload> {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Whether the server greeted the current connection.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn get(&self, id: &str) -> Option<&NotificationPayload> {
        self.items.iter().find(|n| n.id == id)
    }

    /// Mark one notification read. Returns true if it was unread.
    pub fn mark_as_read(&mut self, id: &str, now: Timestamp) -> Result<bool> {
        let item = self
            .items
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| SyncError::not_found(NOTIFICATIONS, &RecordId::from(id)))?;

        if item.is_read() {
            return Ok(false);
        }
        item.read_at = Some(now);
        item.status = NotificationStatus::Read;
        self.unread = self.unread.saturating_sub(1);
        Ok(true)
    }

    /// Mark everything read. Returns how many changed.
    pub fn mark_all_as_read(&mut self, now: Timestamp) -> usize {
        let mut changed = 0;
        for item in self.items.iter_mut().filter(|n| !n.is_read()) {
            item.read_at = Some(now);
            item.status = NotificationStatus::Read;
            changed += 1;
        }
        self.unread = 0;
        changed
    }

    fn push(&mut self, notification: NotificationPayload) {
        // `contains` leaves the recency order alone, so the cache evicts in
        // arrival order just like `items`
        if self.seen.contains(&notification.id) {
            debug!(id = %notification.id, "duplicate notification ignored");
            return;
        }
        self.seen.put(notification.id.clone(), ());

        if !notification.is_read() {
            self.unread += 1;
        }
        self.items.push_front(notification);

        while self.items.len() > self.seen.cap().get() {
            if let Some(evicted) = self.items.pop_back() {
                if !evicted.is_read() {
                    self.unread = self.unread.saturating_sub(1);
                }
            }
        }
    }
}

impl Default for NotificationFeed {
    fn default() -> Self {
        Self::new(ClientConfig::default().dedupe_window)
    }
}

impl StreamHandler for NotificationFeed {
    type Message = NotificationMessage;

    fn name(&self) -> &'static str {
        "notifications"
    }

    fn on_open(&mut self) -> Result<Vec<crate::transport::Frame>> {
        self.acknowledged = false;
        Ok(Vec::new())
    }

    fn apply(&mut self, message: NotificationMessage, _now: Timestamp) -> Result<()> {
        match message {
            NotificationMessage::Notification(payload) => self.push(payload),
            NotificationMessage::Ping => {}
            NotificationMessage::Connected => {
                info!("notification stream acknowledged");
                self.acknowledged = true;
            }
        }
        Ok(())
    }
}

/// Notification stream client.
pub type NotificationClient<T> = StreamingClient<T, NotificationFeed>;

impl<T: Transport> StreamingClient<T, NotificationFeed> {
    /// Create a disconnected notification client.
    pub fn notifications(config: ClientConfig, transport: T) -> Self {
        let feed = NotificationFeed::new(config.dedupe_window);
        Self::new(config, transport, feed)
    }

    pub fn unread_count(&self) -> usize {
        self.handler().unread_count()
    }

    pub fn feed(&self) -> &VecDeque<NotificationPayload> {
        self.handler().items()
    }

    pub fn mark_as_read(&mut self, id: &str, now: Timestamp) -> Result<bool> {
        self.handler_mut().mark_as_read(id, now)
    }

    pub fn mark_all_as_read(&mut self, now: Timestamp) -> usize {
        self.handler_mut().mark_all_as_read(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::messages::NotificationPriority;

    fn notification(id: &str) -> NotificationPayload {
        NotificationPayload {
            id: id.into(),
            kind: "shipment_update".into(),
            priority: NotificationPriority::Medium,
            title: "Update".into(),
            message: format!("Shipment {} moved", id),
            recipients: vec![],
            channels: vec!["in_app".into()],
            status: NotificationStatus::Delivered,
            created_at: Timestamp(1),
            read_at: None,
        }
    }

    #[test]
    fn test_unread_counter_and_order() {
        let mut feed = NotificationFeed::new(16);
        feed.apply(NotificationMessage::Notification(notification("a")), Timestamp(1))
            .unwrap();
        feed.apply(NotificationMessage::Ping, Timestamp(2)).unwrap();
        feed.apply(NotificationMessage::Notification(notification("b")), Timestamp(3))
            .unwrap();

        assert_eq!(feed.unread_count(), 2);
        let ids: Vec<&str> = feed.items().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_mark_as_read_is_idempotent() {
        let mut feed = NotificationFeed::new(16);
        feed.apply(NotificationMessage::Notification(notification("a")), Timestamp(1))
            .unwrap();

        assert!(feed.mark_as_read("a", Timestamp(5)).unwrap());
        assert!(!feed.mark_as_read("a", Timestamp(6)).unwrap());
        assert_eq!(feed.unread_count(), 0);
        assert_eq!(feed.get("a").unwrap().read_at, Some(Timestamp(5)));
        assert_eq!(feed.get("a").unwrap().status, NotificationStatus::Read);

        assert!(matches!(
            feed.mark_as_read("zzz", Timestamp(7)),
            Err(SyncError::NotFound { .. })
        ));
    }

    #[test]
    fn test_mark_all_as_read() {
        let mut feed = NotificationFeed::new(16);
        for id in ["a", "b", "c"] {
            feed.apply(NotificationMessage::Notification(notification(id)), Timestamp(1))
                .unwrap();
        }
        feed.mark_as_read("b", Timestamp(2)).unwrap();

        assert_eq!(feed.mark_all_as_read(Timestamp(3)), 2);
        assert_eq!(feed.mark_all_as_read(Timestamp(4)), 0);
        assert_eq!(feed.unread_count(), 0);
        assert_eq!(feed.get("b").unwrap().read_at, Some(Timestamp(2)));
    }

    #[test]
    fn test_duplicates_and_read_on_arrival() {
        let mut feed = NotificationFeed::new(16);
        feed.apply(NotificationMessage::Notification(notification("a")), Timestamp(1))
            .unwrap();
        feed.apply(NotificationMessage::Notification(notification("a")), Timestamp(2))
            .unwrap();

        let mut already_read = notification("r");
        already_read.read_at = Some(Timestamp(0));
        feed.apply(NotificationMessage::Notification(already_read), Timestamp(3))
            .unwrap();

        assert_eq!(feed.items().len(), 2);
        assert_eq!(feed.unread_count(), 1);
    }

    #[test]
    fn test_feed_is_bounded_by_dedupe_window() {
        let mut feed = NotificationFeed::new(2);
        for id in ["a", "b", "a", "c", "a", "c", "b"] {
            feed.apply(NotificationMessage::Notification(notification(id)), Timestamp(1))
                .unwrap();

            let ids: Vec<&str> = feed.items().iter().map(|n| n.id.as_str()).collect();
            let mut unique = ids.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), ids.len(), "duplicate in {:?}", ids);
            assert!(ids.len() <= 2);

            let unread = feed.items().iter().filter(|n| !n.is_read()).count();
            assert_eq!(feed.unread_count(), unread);
        }

        // a, b, c then a replayed after falling out, then b likewise
        let ids: Vec<&str> = feed.items().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(feed.get("c").is_none());
    }
}
