//! REST API client for chatwire sessions.
//!
//! Provides:
//! - `ApiClient` - login, TOTP exchange and gateway discovery
//! - `ApiConfig` - base URL, user agent and timeout

pub mod client;
pub mod config;

pub use client::{ApiClient, ApiError, LoginResponse};
pub use config::ApiConfig;
