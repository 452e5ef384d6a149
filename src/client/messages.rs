//! Wire messages for the streaming feeds.

use crate::error::{Result, SyncError};
use crate::transport::Frame;
use crate::types::{ChangeEvent, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Frame on the notification stream: `{ type, data? }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NotificationMessage {
    Notification(NotificationPayload),
    Ping,
    Connected,
}

/// Frame on the change feed: `{ type, data? }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChangeFeedMessage {
    Change(ChangeEvent),
    Ping,
    Connected,
}

/// Sent by the change-feed client right after (re)connecting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "resume")]
pub struct ResumeRequest {
    /// Last remote sequence applied; 0 when starting fresh.
    pub since: u64,
    /// Collections of interest; empty means all.
    pub collections: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// A server-pushed notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub id: String,
    /// Application category, e.g. "delivery_delayed".
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    pub status: NotificationStatus,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<Timestamp>,
}

impl NotificationPayload {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Decode a frame: JSON for text, MessagePack for binary.
pub fn decode<M: DeserializeOwned>(frame: &Frame) -> Result<M> {
    match frame {
        Frame::Text(text) => {
            serde_json::from_str(text).map_err(|e| SyncError::MalformedMessage(e.to_string()))
        }
        Frame::Binary(bytes) => {
            rmp_serde::from_slice(bytes).map_err(|e| SyncError::MalformedMessage(e.to_string()))
        }
    }
}

/// Encode a message as a JSON text frame.
pub fn encode_text<M: Serialize>(message: &M) -> Result<Frame> {
    Ok(Frame::Text(serde_json::to_string(message)?))
}

/// Encode a message as a MessagePack binary frame.
pub fn encode_binary<M: Serialize>(message: &M) -> Result<Frame> {
    Ok(Frame::Binary(rmp_serde::to_vec_named(message)?))
}
