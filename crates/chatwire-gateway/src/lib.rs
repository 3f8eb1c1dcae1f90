//! Websocket gateway transport.
//!
//! Provides:
//! - `WsGateway` - `Gateway` implementation over tokio-tungstenite
//! - `WsConnector` - `Connector` that discovers the gateway URL over REST

pub mod connector;
pub mod websocket;

pub use connector::{GatewayConfig, WsConnector};
pub use websocket::WsGateway;
