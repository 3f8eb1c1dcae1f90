//! REST client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// Environment variable overriding [`ApiConfig::base_url`].
pub const BASE_URL_ENV: &str = "CHATWIRE_API_URL";

/// Environment variable overriding [`ApiConfig::user_agent`].
pub const USER_AGENT_ENV: &str = "CHATWIRE_USER_AGENT";

/// Settings for [`ApiClient`](crate::ApiClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API root, without a trailing slash.
    pub base_url: String,
    pub user_agent: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!(
                "DiscordBot (https://github.com/jamie/chatwire, {})",
                env!("CARGO_PKG_VERSION")
            ),
            timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    /// Defaults, overridden by `CHATWIRE_API_URL` and `CHATWIRE_USER_AGENT`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            config.base_url = url;
        }
        if let Ok(agent) = std::env::var(USER_AGENT_ENV) {
            config.user_agent = agent;
        }
        config
    }

    /// Config pointing at a different API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Join an endpoint path onto the base URL.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
