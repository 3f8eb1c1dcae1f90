//! Discriminator-keyed payload registry.
//!
//! Maps `(opcode, event type)` to the decoder for that payload. Built once,
//! then shared read-only through a [`Codec`](crate::Codec).

use std::{collections::HashMap, fmt};

use serde::de::DeserializeOwned;

use crate::{
    event::{
        Event, HeartbeatAckEvent, HeartbeatEvent, HelloEvent, InvalidSessionEvent,
        MessageCreateEvent, MessageDeleteEvent, RawEvent, ReadyEvent, ReconnectEvent,
        ResumedEvent, TypingStartEvent,
    },
    op::{self, OpCode},
};

/// Decodes the raw `d` bytes of a frame into a typed event.
pub type PayloadDecoder = fn(&[u8]) -> serde_json::Result<Event>;

/// How a registered discriminator is turned into an [`Event`].
#[derive(Clone, Copy)]
pub enum PayloadKind {
    /// Deserialize into a known payload type.
    Typed(PayloadDecoder),
    /// Keep the bytes as an [`Event::Raw`].
    Raw,
}

impl PayloadKind {
    /// Produce the event for this discriminator.
    ///
    /// # Errors
    /// Returns the unmarshal error if the data does not match the payload type.
    pub fn decode(self, code: OpCode, event_type: &str, data: &[u8]) -> serde_json::Result<Event> {
        match self {
            Self::Typed(decode) => decode(data),
            Self::Raw => Ok(Event::Raw(RawEvent {
                code,
                event_type: event_type.to_string(),
                data: data.to_vec(),
            })),
        }
    }
}

impl fmt::Debug for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed(_) => f.write_str("Typed"),
            Self::Raw => f.write_str("Raw"),
        }
    }
}

fn decode_as<T>(data: &[u8]) -> serde_json::Result<Event>
where
    T: DeserializeOwned + Into<Event>,
{
    serde_json::from_slice::<T>(data).map(Into::into)
}

/// Registry of payload decoders keyed by `(opcode, event type)`.
///
/// Non-dispatch opcodes use an empty event type.
#[derive(Debug, Clone, Default)]
pub struct PayloadRegistry {
    entries: HashMap<OpCode, HashMap<String, PayloadKind>>,
}

impl PayloadRegistry {
    /// An empty registry. Every frame decodes to an unknown-event error.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every gateway payload this crate knows about.
    #[must_use]
    pub fn gateway() -> Self {
        let mut registry = Self::new();
        registry
            .register::<HeartbeatEvent>(op::HEARTBEAT, "")
            .register::<ReconnectEvent>(op::RECONNECT, "")
            .register::<InvalidSessionEvent>(op::INVALID_SESSION, "")
            .register::<HelloEvent>(op::HELLO, "")
            .register::<HeartbeatAckEvent>(op::HEARTBEAT_ACK, "")
            .register::<ReadyEvent>(op::DISPATCH, "READY")
            .register::<ResumedEvent>(op::DISPATCH, "RESUMED")
            .register::<MessageCreateEvent>(op::DISPATCH, "MESSAGE_CREATE")
            .register::<MessageDeleteEvent>(op::DISPATCH, "MESSAGE_DELETE")
            .register::<TypingStartEvent>(op::DISPATCH, "TYPING_START")
            .register_raw(op::DISPATCH, "GUILD_CREATE");
        registry
    }

    /// Register a typed payload for a discriminator, replacing any previous entry.
    pub fn register<T>(&mut self, code: OpCode, event_type: &str) -> &mut Self
    where
        T: DeserializeOwned + Into<Event>,
    {
        self.insert(code, event_type, PayloadKind::Typed(decode_as::<T>))
    }

    /// Register a discriminator whose payload is passed through undecoded.
    pub fn register_raw(&mut self, code: OpCode, event_type: &str) -> &mut Self {
        self.insert(code, event_type, PayloadKind::Raw)
    }

    fn insert(&mut self, code: OpCode, event_type: &str, kind: PayloadKind) -> &mut Self {
        self.entries
            .entry(code)
            .or_default()
            .insert(event_type.to_string(), kind);
        self
    }

    /// Look up the decoder for a discriminator.
    #[must_use]
    pub fn lookup(&self, code: OpCode, event_type: &str) -> Option<PayloadKind> {
        self.entries.get(&code)?.get(event_type).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
