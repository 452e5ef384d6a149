//! Connection state machine shared by the streaming clients.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                                 |                  |
//!                               error              drop
//!                                 v                  v
//!            Failed <--exhausted-- Reconnecting <----+
//!              |                    |  ^
//!              +--connect()--+   delay |
//!                            v      v  |
//!                           Connecting-+ (error)
//! ```
//!
//! Retry `n` waits `min(base * 2^(n-1), max)`. After `max_attempts` failed
//! retries the machine settles in `Failed` until a manual `connect()`.

mod machine;

pub use machine::{
    BackoffPolicy, ConnectionEvent, ConnectionState, ConnectionStateMachine, RetryDecision,
};
