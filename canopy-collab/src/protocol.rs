//! JSON wire protocol for channel messages.
//!
//! Every frame on the socket is one envelope (UTF-8 JSON text):
//! ```text
//! {
//!   "type":      "presence" | "leave" | "edit" | ...,
//!   "channel":   "<subscribed channel>",
//!   "data":      <kind-specific payload>,
//!   "sender":    "<user id>"            (optional),
//!   "timestamp": "2024-05-01T12:00:00Z" (RFC 3339)
//! }
//! ```
//!
//! The `type` tag is a closed enumeration ([`MessageKind`]) so inbound
//! dispatch never matches on free-form strings.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Message kinds carried on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Participant presence record (cursor, selection, status)
    Presence,
    /// Participant left the channel
    Leave,
    /// Field-level edit published by a participant
    Edit,
    /// Conflict notification relayed by a participant
    Conflict,
    /// Comment thread traffic
    Comment,
    /// Full or partial state sync
    Sync,
    /// Application-level keepalive
    Heartbeat,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Presence,
        MessageKind::Leave,
        MessageKind::Edit,
        MessageKind::Conflict,
        MessageKind::Comment,
        MessageKind::Sync,
        MessageKind::Heartbeat,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Presence => "presence",
            MessageKind::Leave => "leave",
            MessageKind::Edit => "edit",
            MessageKind::Conflict => "conflict",
            MessageKind::Comment => "comment",
            MessageKind::Sync => "sync",
            MessageKind::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied identity of the local participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl CurrentUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Envelope for every message on a channel.
///
/// `T` defaults to an untyped JSON value; handlers that know the payload
/// shape re-type it with [`ChannelMessage::into_typed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage<T = serde_json::Value> {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub channel: String,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ChannelMessage<T> {
    /// Build an envelope stamped with the current wall-clock time.
    pub fn new(kind: MessageKind, channel: impl Into<String>, data: T) -> Self {
        Self {
            kind,
            channel: channel.into(),
            data,
            sender: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_sender(mut self, sender: Option<String>) -> Self {
        self.sender = sender;
        self
    }

    /// Whether this message belongs to `channel`.
    pub fn is_for(&self, channel: &str) -> bool {
        self.channel == channel
    }
}

impl<T: Serialize> ChannelMessage<T> {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

impl ChannelMessage {
    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Parse a frame and reject it unless it targets `channel`.
    pub fn decode_for(text: &str, channel: &str) -> Result<Self, ProtocolError> {
        let msg = Self::decode(text)?;
        if !msg.is_for(channel) {
            return Err(ProtocolError::ChannelMismatch {
                expected: channel.to_string(),
                got: msg.channel,
            });
        }
        Ok(msg)
    }

    /// Re-type the envelope, decoding the payload.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<ChannelMessage<T>, ProtocolError> {
        let data = T::deserialize(self.data)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(ChannelMessage {
            kind: self.kind,
            channel: self.channel,
            data,
            sender: self.sender,
            timestamp: self.timestamp,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ChannelMismatch { expected: String, got: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ChannelMismatch { expected, got } => {
                write!(f, "Channel mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
