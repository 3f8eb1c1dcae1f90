//! Core types for a chat-platform gateway session.
//!
//! This crate provides the fundamental building blocks:
//! - `Identifier` / `Intents` - What a session identifies with
//! - `Op` / `Event` - Decoded frame envelope and typed payloads
//! - `Codec` / `DecodeBuffer` - Registry-driven frame decoding
//! - `Handler` - Pub/sub registry for decoded events
//! - `Gateway` / `Connector` traits

pub mod codec;
pub mod event;
pub mod handler;
pub mod identifier;
pub mod op;
pub mod registry;
pub mod traits;

pub use codec::{Codec, DecodeBuffer, DecodeError};
pub use event::Event;
pub use handler::{Handler, HandlerGuard};
pub use identifier::{Identifier, Intents};
pub use op::{Op, OpCode};
pub use registry::PayloadRegistry;
pub use traits::{Connector, Gateway, GatewayError};
