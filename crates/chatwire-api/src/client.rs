//! HTTP client for the REST endpoints a session needs.

use std::sync::Arc;

use reqwest::{RequestBuilder, header::AUTHORIZATION};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::config::ApiConfig;

/// REST client error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Request cancelled")]
    Cancelled,
}

/// Response of the login and TOTP endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Access token. Absent while a further factor is pending.
    #[serde(default)]
    pub token: Option<String>,
    /// Whether the account requires a second factor.
    #[serde(default)]
    pub mfa: bool,
    /// Opaque ticket binding a TOTP exchange to this login.
    #[serde(default)]
    pub ticket: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct TotpRequest<'a> {
    code: &'a str,
    ticket: &'a str,
}

#[derive(Deserialize)]
struct GatewayResponse {
    url: String,
}

/// REST API client.
///
/// Cheap to clone. [`ApiClient::with_context`] derives a client whose
/// requests are abandoned once the given token is cancelled.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ApiConfig>,
    token: String,
    cancel: Option<CancellationToken>,
}

impl ApiClient {
    /// Create a client with default configuration. An empty token sends no
    /// `Authorization` header.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_config(token, ApiConfig::default())
    }

    /// Create a client with the given configuration.
    #[must_use]
    pub fn with_config(token: impl Into<String>, config: ApiConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build configured HTTP client, using defaults: {e}");
                reqwest::Client::new()
            });

        Self {
            http,
            config: Arc::new(config),
            token: token.into(),
            cancel: None,
        }
    }

    /// Derive a client whose requests are scoped to `cancel`.
    #[must_use]
    pub fn with_context(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..self.clone()
        }
    }

    /// Same client, different token.
    #[must_use]
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Log in with email and password.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-success status.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let body = LoginRequest {
            login: email,
            password,
        };
        self.send(self.http.post(self.config.endpoint("auth/login")).json(&body))
            .await
    }

    /// Complete a login with a time-based one-time code.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-success status.
    pub async fn totp(&self, code: &str, ticket: &str) -> Result<LoginResponse, ApiError> {
        let body = TotpRequest { code, ticket };
        self.send(self.http.post(self.config.endpoint("auth/mfa/totp")).json(&body))
            .await
    }

    /// Fetch the websocket URL of the gateway.
    ///
    /// # Errors
    /// Returns error on transport failure or a non-success status.
    pub async fn gateway_url(&self) -> Result<String, ApiError> {
        let resp: GatewayResponse = self
            .send(self.http.get(self.config.endpoint("gateway")))
            .await?;
        Ok(resp.url)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let req = if self.token.is_empty() {
            req
        } else {
            req.header(AUTHORIZATION, &self.token)
        };

        let exchange = async {
            let resp = req.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                tracing::debug!(status = status.as_u16(), "API request rejected");
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok::<T, ApiError>(resp.json::<T>().await?)
        };

        match &self.cancel {
            Some(cancel) => tokio::select! {
                biased;
                () = cancel.cancelled() => Err(ApiError::Cancelled),
                res = exchange => res,
            },
            None => exchange.await,
        }
    }
}
