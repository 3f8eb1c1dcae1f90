//! Session management for a chat-platform gateway.
//!
//! Provides:
//! - `Session` - owns the REST client and gateway, opens and closes the connection
//! - `SessionView` - a session borrowed with a request-scoped REST client
//! - `login` - email/password login with an optional TOTP code

pub mod auth;
mod bridge;
pub mod manager;

pub use auth::{AuthError, login};
pub use chatwire_core::{Event, Handler, HandlerGuard, Identifier, Intents};
pub use manager::{Session, SessionError, SessionView};
