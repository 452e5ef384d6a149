//! Live query subscriptions.
//!
//! A subscription binds one [`Query`](crate::query::Query) to an observer:
//! - On subscribe, the observer gets the query's current result once
//! - On every later mutation in the query's collection, the observer gets
//!   the mutated record if it passes the filter test
//!
//! Deliveries are synchronous and FIFO per subscription. Removing a
//! subscription takes effect before the next delivery, even one already in
//! progress for the same event.
//!
//! # Example
//!
//! ```ignore
//! let store = Store::new(StoreConfig::default());
//!
//! let handle = store.subscribe_channel(Query::collection("shipments").filter("status", "pending"));
//!
//! let snapshot = handle.recv()?;
//! assert!(snapshot.is_snapshot());
//!
//! store.create("shipments", fields);
//! let update = handle.recv()?;
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    ChannelObserver, SubscriptionHandle, SubscriptionId, SubscriptionObserver, SubscriptionUpdate,
    UpdateKind, UpdateMatching,
};
