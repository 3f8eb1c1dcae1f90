//! The generic frame envelope.

use crate::event::{BackgroundErrorEvent, Event};

/// Numeric opcode of a gateway frame.
pub type OpCode = i32;

pub const DISPATCH: OpCode = 0;
pub const HEARTBEAT: OpCode = 1;
pub const IDENTIFY: OpCode = 2;
pub const RECONNECT: OpCode = 7;
pub const INVALID_SESSION: OpCode = 9;
pub const HELLO: OpCode = 10;
pub const HEARTBEAT_ACK: OpCode = 11;

/// Opcode reserved for synthesized decode-error frames. Never sent by a server.
pub const BACKGROUND_ERROR: OpCode = -1;

/// Event type of synthesized decode-error frames.
pub const BACKGROUND_ERROR_TYPE: &str = "__background_error";

/// A decoded frame: the `(code, event_type)` discriminator and the payload it
/// selected.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub code: OpCode,
    /// Sequence number, present on dispatches.
    pub sequence: Option<u64>,
    /// Dispatch name, empty for non-dispatch opcodes.
    pub event_type: String,
    pub payload: Event,
}

impl Op {
    /// Wrap a background error into an op.
    #[must_use]
    pub fn background_error(event: BackgroundErrorEvent) -> Self {
        Self {
            code: BACKGROUND_ERROR,
            sequence: None,
            event_type: BACKGROUND_ERROR_TYPE.to_string(),
            payload: Event::BackgroundError(event),
        }
    }

    #[must_use]
    pub const fn is_background_error(&self) -> bool {
        matches!(self.payload, Event::BackgroundError(_))
    }
}
