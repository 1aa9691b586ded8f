use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RestError, Result};

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_API_VERSION: &str = "7.1";

/// Connection settings for the REST adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestConfig {
    /// Organization URL, e.g. `https://dev.azure.com/contoso`.
    pub base_url: String,
    pub personal_access_token: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            personal_access_token: String::new(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, personal_access_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            personal_access_token: personal_access_token.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Rejects settings that cannot produce a working client.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(RestError::invalid_request("base URL is required"));
        }
        if self.personal_access_token.is_empty() {
            return Err(RestError::auth("personal access token is required"));
        }
        if self.api_version.trim().is_empty() {
            return Err(RestError::invalid_request("API version is required"));
        }
        Ok(())
    }
}
