//! Typed gateway payloads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{codec::DecodeError, op::OpCode};

/// Minimal user object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub discriminator: String,
    #[serde(default)]
    pub bot: bool,
}

/// Message object as carried by `MESSAGE_CREATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Op 10: first frame after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloEvent {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: u64,
}

/// Op 1: the server asks for an immediate heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeartbeatEvent(pub Option<u64>);

/// Op 11.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAckEvent;

/// Op 7.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectEvent;

/// Op 9. The flag reports whether the session may be resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvalidSessionEvent(pub bool);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyEvent {
    #[serde(rename = "v")]
    pub version: u8,
    pub user: User,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_gateway_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumedEvent {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageCreateEvent(pub Message);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeleteEvent {
    pub id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStartEvent {
    pub channel_id: String,
    pub user_id: String,
    pub timestamp: u64,
}

/// A payload registered for pass-through: the discriminator and the bytes
/// of `d`, undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub code: OpCode,
    pub event_type: String,
    pub data: Vec<u8>,
}

/// A decode-time problem, delivered in-band like any other event.
#[derive(Debug, Clone)]
pub struct BackgroundErrorEvent {
    pub error: Arc<DecodeError>,
}

impl BackgroundErrorEvent {
    #[must_use]
    pub fn new(error: DecodeError) -> Self {
        Self {
            error: Arc::new(error),
        }
    }
}

impl PartialEq for BackgroundErrorEvent {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.error, &other.error) || self.error.to_string() == other.error.to_string()
    }
}

/// Every payload the codec can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Hello(HelloEvent),
    Heartbeat(HeartbeatEvent),
    HeartbeatAck(HeartbeatAckEvent),
    Reconnect(ReconnectEvent),
    InvalidSession(InvalidSessionEvent),
    Ready(ReadyEvent),
    Resumed(ResumedEvent),
    MessageCreate(MessageCreateEvent),
    MessageDelete(MessageDeleteEvent),
    TypingStart(TypingStartEvent),
    Raw(RawEvent),
    BackgroundError(BackgroundErrorEvent),
}

impl Event {
    /// Whether this event marks the session as fully established.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Resumed(_))
    }

    /// Name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatAck(_) => "heartbeat_ack",
            Self::Reconnect(_) => "reconnect",
            Self::InvalidSession(_) => "invalid_session",
            Self::Ready(_) => "ready",
            Self::Resumed(_) => "resumed",
            Self::MessageCreate(_) => "message_create",
            Self::MessageDelete(_) => "message_delete",
            Self::TypingStart(_) => "typing_start",
            Self::Raw(_) => "raw",
            Self::BackgroundError(_) => "background_error",
        }
    }
}

macro_rules! impl_from_event {
    ($($payload:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$payload> for Event {
                fn from(ev: $payload) -> Self {
                    Self::$variant(ev)
                }
            }
        )*
    };
}

impl_from_event! {
    HelloEvent => Hello,
    HeartbeatEvent => Heartbeat,
    HeartbeatAckEvent => HeartbeatAck,
    ReconnectEvent => Reconnect,
    InvalidSessionEvent => InvalidSession,
    ReadyEvent => Ready,
    ResumedEvent => Resumed,
    MessageCreateEvent => MessageCreate,
    MessageDeleteEvent => MessageDelete,
    TypingStartEvent => TypingStart,
    RawEvent => Raw,
    BackgroundErrorEvent => BackgroundError,
}
