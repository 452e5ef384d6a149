//! Reconnect-with-backoff state machine.

use crate::error::{Result, SyncError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Disconnected,
    /// Opening the connection
    Connecting,
    /// Connection is live
    Connected,
    /// Waiting for a scheduled retry
    Reconnecting,
    /// Retries exhausted; needs a manual `connect()`
    Failed,
}

/// Observable connection transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    ConnectionFailed,
}

/// Exponential backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    /// Default: 1000ms
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay.
    /// Default: 30000ms
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failed retries before giving up.
    /// Default: 5
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffPolicy {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(63);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// What the owner should do after a connection error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then call `begin_retry`.
    Retry { attempt: u32, delay: Duration },
    /// Retries exhausted; the machine is `Failed`.
    GiveUp,
}

/// One connection's reconnect state.
///
/// Each streaming client owns its own instance, so one client's failures
/// never touch another's attempt counter.
pub struct ConnectionStateMachine {
    name: String,
    policy: BackoffPolicy,
    state: ConnectionState,
    /// Retries scheduled since the last successful connect.
    attempt: u32,
    observers: Vec<Sender<ConnectionEvent>>,
}

impl ConnectionStateMachine {
    pub fn new(name: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            observers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Stream of transitions for this connection.
    pub fn subscribe(&mut self) -> Receiver<ConnectionEvent> {
        let (sender, receiver) = unbounded();
        self.observers.push(sender);
        receiver
    }

    /// Start connecting. From `Failed` this is the manual reset.
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.attempt = 0;
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            from => Err(SyncError::InvalidTransition {
                from,
                action: "connect",
            }),
        }
    }

    /// The pending open succeeded.
    pub fn on_connected(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                action: "complete a connection",
            });
        }
        if self.attempt > 0 {
            info!(connection = %self.name, attempts = self.attempt, "reconnected");
        } else {
            info!(connection = %self.name, "connected");
        }
        self.attempt = 0;
        self.state = ConnectionState::Connected;
        self.publish(ConnectionEvent::Connected);
        Ok(())
    }

    /// The pending open failed, or the live connection dropped.
    pub fn on_error(&mut self) -> Result<RetryDecision> {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => self.publish(ConnectionEvent::Disconnected),
            from => {
                return Err(SyncError::InvalidTransition {
                    from,
                    action: "report a connection error",
                })
            }
        }

        if self.attempt < self.policy.max_attempts {
            self.attempt += 1;
            let delay = self.policy.delay_for(self.attempt);
            self.state = ConnectionState::Reconnecting;
            info!(
                connection = %self.name,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            Ok(RetryDecision::Retry {
                attempt: self.attempt,
                delay,
            })
        } else {
            warn!(connection = %self.name, attempts = self.attempt, "giving up on connection");
            self.state = ConnectionState::Failed;
            self.publish(ConnectionEvent::ConnectionFailed);
            Ok(RetryDecision::GiveUp)
        }
    }

    /// The backoff delay elapsed; try again.
    pub fn begin_retry(&mut self) -> Result<()> {
        if self.state != ConnectionState::Reconnecting {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                action: "retry",
            });
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Drop the connection on purpose. Any scheduled retry is abandoned.
    pub fn disconnect(&mut self) {
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
        if was_connected {
            self.publish(ConnectionEvent::Disconnected);
        }
    }

    fn publish(&mut self, event: ConnectionEvent) {
        self.observers.retain(|observer| observer.send(event).is_ok());
    }
}
