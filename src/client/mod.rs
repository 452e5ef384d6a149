//! Streaming clients with automatic reconnect.
//!
//! [`StreamingClient`] owns one transport, one [`ConnectionStateMachine`]
//! and a [`StreamHandler`] that knows how to apply one kind of feed:
//! - [`NotificationClient`]: server-push notifications with an unread counter
//! - [`ChangeFeedClient`]: remote change events forwarded into a [`Store`]
//!
//! The client never blocks or sleeps. Its owner calls [`StreamingClient::tick`]
//! with the current time (the event loop does this when the client is
//! spawned as a task); each tick drains inbound frames, enforces the
//! liveness timeout and fires any reconnect whose backoff has elapsed.
//!
//! [`Store`]: crate::store::Store

mod change_feed;
mod messages;
mod notifications;

pub use change_feed::{ChangeFeed, ChangeFeedClient};
pub use messages::{
    decode, encode_binary, encode_text, ChangeFeedMessage, NotificationMessage,
    NotificationPayload, NotificationPriority, NotificationStatus, ResumeRequest,
};
pub use notifications::{NotificationClient, NotificationFeed};

use crate::connection::{
    BackoffPolicy, ConnectionEvent, ConnectionState, ConnectionStateMachine, RetryDecision,
};
use crate::error::{Result, SyncError};
use crate::scheduler::Task;
use crate::transport::{Frame, Transport, TransportError};
use crate::types::Timestamp;
use crossbeam_channel::Receiver;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Streaming client configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Reconnect backoff.
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Silence (no frame at all, keep-alives included) longer than this
    /// counts as a dropped connection.
    /// Default: 45000ms
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// How often the event loop ticks the client.
    /// Default: 100ms
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of recent notification ids remembered for de-duplication.
    /// Default: 512
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,
}

fn default_stale_after_ms() -> u64 {
    45_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_dedupe_window() -> usize {
    512
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            stale_after_ms: default_stale_after_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            dedupe_window: default_dedupe_window(),
        }
    }
}

impl ClientConfig {
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_ms = stale_after.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_dedupe_window(mut self, window: usize) -> Self {
        self.dedupe_window = window;
        self
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Snapshot of a client's connection for display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    /// Current retry number while reconnecting, 0 otherwise.
    pub attempt: u32,
    /// When the next retry fires, if one is scheduled.
    pub next_retry_at: Option<Timestamp>,
    /// When the last inbound frame arrived.
    pub last_message_at: Option<Timestamp>,
}

impl ClientStatus {
    /// Whether the UI should offer a manual retry.
    pub fn needs_manual_retry(&self) -> bool {
        self.state == ConnectionState::Failed
    }
}

/// Applies one kind of feed.
pub trait StreamHandler: Send {
    /// Decoded inbound message type.
    type Message: DeserializeOwned;

    /// Name used for logs and the connection.
    fn name(&self) -> &'static str;

    /// Frames to send right after every successful open.
    fn on_open(&mut self) -> Result<Vec<Frame>> {
        Ok(Vec::new())
    }

    /// Apply one message. Errors are logged and the message dropped.
    fn apply(&mut self, message: Self::Message, now: Timestamp) -> Result<()>;
}

/// A resilient single-connection streaming client.
pub struct StreamingClient<T: Transport, H: StreamHandler> {
    config: ClientConfig,
    transport: T,
    handler: H,
    machine: ConnectionStateMachine,
    next_retry_at: Option<Timestamp>,
    last_message_at: Option<Timestamp>,
    malformed: u64,
}

impl<T: Transport, H: StreamHandler> StreamingClient<T, H> {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig, transport: T, handler: H) -> Self {
        let machine = ConnectionStateMachine::new(handler.name(), config.backoff);
        Self {
            config,
            transport,
            handler,
            machine,
            next_retry_at: None,
            last_message_at: None,
            malformed: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn status(&self) -> ClientStatus {
        let attempt = match self.machine.state() {
            ConnectionState::Reconnecting
            | ConnectionState::Connecting
            | ConnectionState::Failed => self.machine.attempt(),
            _ => 0,
        };
        ClientStatus {
            state: self.machine.state(),
            attempt,
            next_retry_at: self.next_retry_at,
            last_message_at: self.last_message_at,
        }
    }

    /// Stream of `connected` / `disconnected` / `connection_failed` events.
    pub fn events(&mut self) -> Receiver<ConnectionEvent> {
        self.machine.subscribe()
    }

    /// Frames dropped because they could not be decoded or applied.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    /// Surface a terminal failure to the caller.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.machine.state() == ConnectionState::Failed {
            Err(SyncError::ConnectionFailed {
                attempts: self.machine.attempt(),
            })
        } else {
            Ok(())
        }
    }

    /// Open the connection. Also the manual retry from `Failed`.
    pub fn connect(&mut self, now: Timestamp) -> Result<()> {
        self.machine.connect()?;
        self.next_retry_at = None;
        self.open(now);
        Ok(())
    }

    /// Manual retry after the client gave up.
    pub fn retry(&mut self, now: Timestamp) -> Result<()> {
        self.connect(now)
    }

    /// Close on purpose; no reconnect is attempted.
    pub fn disconnect(&mut self) {
        self.transport.close();
        self.machine.disconnect();
        self.next_retry_at = None;
    }

    /// Drive the client at time `now`.
    pub fn tick(&mut self, now: Timestamp) {
        match self.machine.state() {
            ConnectionState::Connected => {
                self.drain(now);
                if self.machine.state() == ConnectionState::Connected && self.is_stale(now) {
                    warn!(client = self.handler.name(), "no messages within liveness window");
                    self.on_transport_error(now, TransportError::Closed("stale connection".into()));
                }
            }
            ConnectionState::Reconnecting => {
                if self.next_retry_at.is_some_and(|at| at <= now) {
                    self.next_retry_at = None;
                    if self.machine.begin_retry().is_ok() {
                        self.open(now);
                    }
                }
            }
            _ => {}
        }
    }

    fn is_stale(&self, now: Timestamp) -> bool {
        self.last_message_at
            .is_some_and(|at| now.since(at) >= self.config.stale_after())
    }

    fn open(&mut self, now: Timestamp) {
        if let Err(e) = self.transport.open() {
            self.on_transport_error(now, e);
            return;
        }
        if self.machine.on_connected().is_err() {
            return;
        }
        self.last_message_at = Some(now);

        let frames = match self.handler.on_open() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(client = self.handler.name(), error = %e, "could not build handshake");
                Vec::new()
            }
        };
        for frame in frames {
            if let Err(e) = self.transport.send(frame) {
                self.on_transport_error(now, e);
                return;
            }
        }
    }

    fn drain(&mut self, now: Timestamp) {
        while let Some(item) = self.transport.poll() {
            match item {
                Ok(frame) => {
                    self.last_message_at = Some(now);
                    self.dispatch(&frame, now);
                }
                Err(e) => {
                    self.on_transport_error(now, e);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, frame: &Frame, now: Timestamp) {
        let result = decode::<H::Message>(frame).and_then(|m| self.handler.apply(m, now));
        match result {
            Ok(()) => {}
            Err(e @ SyncError::MalformedMessage(_)) => {
                self.malformed += 1;
                warn!(client = self.handler.name(), error = %e, "dropping malformed message");
            }
            Err(e) => {
                warn!(client = self.handler.name(), error = %e, "failed to apply message");
            }
        }
    }

    fn on_transport_error(&mut self, now: Timestamp, error: TransportError) {
        self.transport.close();
        debug!(client = self.handler.name(), %error, "transport error");

        match self.machine.on_error() {
            Ok(RetryDecision::Retry { delay, .. }) => {
                self.next_retry_at = Some(now.after(delay));
            }
            Ok(RetryDecision::GiveUp) => {
                self.next_retry_at = None;
                info!(client = self.handler.name(), "connection failed, waiting for manual retry");
            }
            Err(e) => {
                debug!(client = self.handler.name(), error = %e, "ignoring transport error");
            }
        }
    }
}

impl<T: Transport, H: StreamHandler> Task for StreamingClient<T, H> {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.handler.name())
    }

    fn run(&mut self, now: Timestamp) -> Option<Duration> {
        self.tick(now);
        Some(self.config.poll_interval())
    }
}
