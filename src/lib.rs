//! # fleetsync
//!
//! The real-time synchronization core of a logistics dashboard: an
//! in-memory document store with live queries, and streaming clients that
//! keep one connection alive with exponential backoff.
//!
//! ## Core Concepts
//!
//! - **Collections**: Named partitions of records, created on first write
//! - **Queries**: Equality filters, single-field stable sort, offset/limit
//! - **Subscriptions**: Live queries that get an initial snapshot and then
//!   incremental updates, synchronously, on every mutation
//! - **Streaming clients**: Change-feed and notification clients, each
//!   driven by its own reconnect state machine
//! - **Event loop**: Virtual-time scheduler so background work is testable
//!
//! ## Example
//!
//! ```ignore
//! use fleetsync::{Query, Store, StoreConfig, SubscriptionUpdate};
//!
//! let store = Store::new(StoreConfig::default());
//!
//! let id = store.create("shipments", fields);
//!
//! let sub = store.subscribe(
//!     Query::collection("shipments").filter("status", "pending"),
//!     |update: &SubscriptionUpdate| println!("{:?}", update.records),
//! );
//!
//! store.update("shipments", &id, patch)?;
//! store.unsubscribe(sub);
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod generator;
pub mod query;
pub mod records;
pub mod scheduler;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use client::{
    ChangeFeed, ChangeFeedClient, ChangeFeedMessage, ClientConfig, ClientStatus,
    NotificationClient, NotificationFeed, NotificationMessage, NotificationPayload,
    NotificationPriority, NotificationStatus, ResumeRequest, StreamHandler, StreamingClient,
};
pub use connection::{
    BackoffPolicy, ConnectionEvent, ConnectionState, ConnectionStateMachine, RetryDecision,
};
pub use error::{Result, SyncError};
pub use generator::{Activity, ActivityGenerator, GeneratorConfig};
pub use query::{evaluate, matches_filters, Direction, OrderBy, Query};
pub use records::Collection;
pub use scheduler::{Clock, EventLoop, ManualClock, SystemClock, Task, TaskId};
pub use store::{ListenerId, Store, StoreConfig};
pub use subscriptions::{
    ChannelObserver, SubscriptionHandle, SubscriptionId, SubscriptionManager,
    SubscriptionObserver, SubscriptionUpdate, UpdateKind, UpdateMatching,
};
pub use transport::{Frame, LocalTransport, LocalTransportHandle, Transport, TransportError};
pub use types::*;
