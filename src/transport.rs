//! Transport seam between a streaming client and its wire.
//!
//! [`LocalTransport`] is an in-memory implementation whose far end is driven
//! through a [`LocalTransportHandle`]: push frames, refuse connections, drop
//! the link, and inspect what the client sent.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// One inbound or outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// JSON text.
    Text(String),
    /// MessagePack bytes.
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }
}

/// Transport-level failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("not connected")]
    NotConnected,
}

/// A bidirectional message channel.
///
/// Nothing here blocks: `poll` returns `None` when no inbound frame is
/// waiting.
pub trait Transport: Send {
    /// Open (or reopen) the connection.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Send one frame.
    fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound frame or transport error, if any.
    fn poll(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

#[derive(Debug, Default)]
struct LocalState {
    connected: bool,
    /// Remaining opens to refuse.
    refuse_opens: u32,
    /// Refuse every open until cleared.
    refuse_all: bool,
    inbound: VecDeque<Result<Frame, TransportError>>,
    sent: Vec<Frame>,
    opens: u32,
}

/// In-memory transport.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    state: Arc<Mutex<LocalState>>,
}

/// Far end of a [`LocalTransport`].
#[derive(Clone, Debug)]
pub struct LocalTransportHandle {
    state: Arc<Mutex<LocalState>>,
}

impl LocalTransport {
    /// Create a transport and the handle that drives it.
    pub fn pair() -> (LocalTransport, LocalTransportHandle) {
        let state = Arc::new(Mutex::new(LocalState::default()));
        (
            LocalTransport {
                state: Arc::clone(&state),
            },
            LocalTransportHandle { state },
        )
    }
}

impl Transport for LocalTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.opens += 1;

        if state.refuse_all {
            return Err(TransportError::Refused("server unavailable".into()));
        }
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(TransportError::Refused("server unavailable".into()));
        }

        state.connected = true;
        Ok(())
    }

    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.sent.push(frame);
        Ok(())
    }

    fn poll(&mut self) -> Option<Result<Frame, TransportError>> {
        let mut state = self.state.lock();
        if !state.connected {
            return None;
        }
        let item = state.inbound.pop_front()?;
        if item.is_err() {
            state.connected = false;
            state.inbound.clear();
        }
        Some(item)
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.connected = false;
        // frames in flight are lost with the connection
        state.inbound.clear();
    }
}

impl LocalTransportHandle {
    /// Queue a raw text frame.
    pub fn push_text(&self, text: impl Into<String>) {
        self.state.lock().inbound.push_back(Ok(Frame::Text(text.into())));
    }

    /// Queue a raw binary frame.
    pub fn push_binary(&self, bytes: Vec<u8>) {
        self.state.lock().inbound.push_back(Ok(Frame::Binary(bytes)));
    }

    /// Queue `message` encoded as JSON text.
    pub fn push_json<T: Serialize>(&self, message: &T) -> Result<(), serde_json::Error> {
        let text = serde_json::to_string(message)?;
        self.push_text(text);
        Ok(())
    }

    /// Queue `message` encoded as MessagePack.
    pub fn push_msgpack<T: Serialize>(&self, message: &T) -> Result<(), rmp_serde::encode::Error> {
        let bytes = rmp_serde::to_vec_named(message)?;
        self.push_binary(bytes);
        Ok(())
    }

    /// Drop the live connection; the client sees the error on its next poll.
    pub fn drop_connection(&self, reason: impl Into<String>) {
        self.state
            .lock()
            .inbound
            .push_back(Err(TransportError::Closed(reason.into())));
    }

    /// Refuse the next `count` opens.
    pub fn refuse_next(&self, count: u32) {
        self.state.lock().refuse_opens = count;
    }

    /// Refuse every open until called again with `false`.
    pub fn refuse_all(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// How many times the client tried to open.
    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    /// Frames sent by the client so far.
    pub fn sent(&self) -> Vec<Frame> {
        self.state.lock().sent.clone()
    }

    /// Inbound frames not yet consumed.
    pub fn pending_inbound(&self) -> usize {
        self.state.lock().inbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_then_open() {
        let (mut transport, handle) = LocalTransport::pair();
        handle.refuse_next(2);

        assert!(transport.open().is_err());
        assert!(transport.open().is_err());
        assert!(transport.open().is_ok());
        assert_eq!(handle.open_count(), 3);
        assert!(handle.is_connected());
    }

    #[test]
    fn test_poll_only_while_connected() {
        let (mut transport, handle) = LocalTransport::pair();
        handle.push_text("{}");
        assert!(transport.poll().is_none());

        transport.open().unwrap();
        assert_eq!(transport.poll(), Some(Ok(Frame::Text("{}".into()))));
        assert!(transport.poll().is_none());
    }

    #[test]
    fn test_drop_discards_later_frames() {
        let (mut transport, handle) = LocalTransport::pair();
        transport.open().unwrap();
        handle.drop_connection("reset by peer");
        handle.push_text("lost");

        assert!(matches!(transport.poll(), Some(Err(TransportError::Closed(_)))));
        assert!(!handle.is_connected());
        assert_eq!(handle.pending_inbound(), 0);
        assert!(transport.send(Frame::Text("x".into())).is_err());
    }
}
