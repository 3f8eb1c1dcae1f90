//! Transport traits consumed by the session.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::identifier::{Identifier, Intents};

/// Gateway transport error.
///
/// Cloneable so a transport can record its last failure and hand it out on
/// every [`Gateway::last_error`] call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway connect failed: {0}")]
    Connect(String),
    #[error("Gateway closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },
    #[error("Gateway transport error: {0}")]
    Transport(String),
    #[error("Gateway protocol error: {0}")]
    Protocol(String),
}

/// A persistent, event-streaming connection.
pub trait Gateway: Send + Sync {
    /// Start the connection and return the stream of raw frames it receives.
    ///
    /// The stream ends when `cancel` fires or the connection dies; in the
    /// latter case [`Gateway::last_error`] reports why.
    fn connect(&self, cancel: CancellationToken) -> BoxStream<'static, Bytes>;

    /// Merge intents into the identifier used for the next identify.
    fn add_intents(&self, intents: Intents);

    /// The failure that ended the most recent connection, if any.
    fn last_error(&self) -> Option<GatewayError>;

    /// Snapshot of the identifier this gateway identifies with.
    fn identifier(&self) -> Identifier;
}

/// Builds [`Gateway`] handles from an identifier.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Construct an unopened gateway for `id`.
    async fn connect(&self, id: &Identifier) -> Result<Arc<dyn Gateway>, GatewayError>;
}
