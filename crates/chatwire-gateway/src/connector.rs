//! Builds websocket gateways from an identifier.

use std::sync::Arc;

use async_trait::async_trait;
use chatwire_api::ApiClient;
use chatwire_core::{Connector, Gateway, GatewayError, Identifier};
use serde::{Deserialize, Serialize};

use crate::websocket::WsGateway;

/// Gateway URL settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Fixed gateway URL. Discovered through the REST API when unset.
    pub url: Option<String>,
    pub version: u8,
    pub encoding: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            version: 10,
            encoding: "json".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Append version and encoding query parameters to a base URL.
    #[must_use]
    pub fn connect_url(&self, base: &str) -> String {
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{base}{sep}v={}&encoding={}", self.version, self.encoding)
    }
}

/// [`Connector`] producing [`WsGateway`]s.
#[derive(Debug, Clone)]
pub struct WsConnector {
    api: ApiClient,
    config: GatewayConfig,
}

impl WsConnector {
    /// Connector that discovers the gateway URL through `api`.
    #[must_use]
    pub fn new(api: ApiClient) -> Self {
        Self::with_config(api, GatewayConfig::default())
    }

    #[must_use]
    pub const fn with_config(api: ApiClient, config: GatewayConfig) -> Self {
        Self { api, config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, id: &Identifier) -> Result<Arc<dyn Gateway>, GatewayError> {
        let base = match &self.config.url {
            Some(url) => url.clone(),
            None => self
                .api
                .with_token(id.token.clone())
                .gateway_url()
                .await
                .map_err(|e| GatewayError::Connect(format!("cannot get gateway URL: {e}")))?,
        };

        let url = self.config.connect_url(&base);
        tracing::debug!(%url, "Constructed gateway");
        Ok(Arc::new(WsGateway::new(url, id.clone())))
    }
}
