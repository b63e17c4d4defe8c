//! Configuration for the wire adapter and model selection
//!
//! All settings are carried in an explicit [`ClientConfig`] passed at
//! construction. [`ClientConfig::from_env`] is a convenience for hosts that
//! keep credentials in the environment; nothing in the crate reads the
//! environment on its own.

use crate::{Error, Result};
use std::env;
use std::time::Duration;

/// Default chat-completions base URL
pub const DEFAULT_BASE_URL: &str = "https://api.z.ai/api/paas/v4";

/// Model used when the caller does not choose one
pub const DEFAULT_MODEL: &str = "glm-4.6";

/// Cheaper model substituted while the router is in fallback mode
pub const DEFAULT_FLASH_MODEL: &str = "glm-4-flash";

/// Lightest tier
pub const DEFAULT_FLASH_LITE_MODEL: &str = "glm-4.5-air";

const API_KEY_VARS: [&str; 2] = ["Z_AI_API_KEY", "ZAI_API_KEY"];
const BASE_URL_VAR: &str = "Z_AI_BASE_URL";
const ORGANIZATION_VAR: &str = "Z_AI_ORGANIZATION";

/// Whether a model name denotes a lite/flash tier.
pub fn is_lite_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    ["lite", "flash", "air"].iter().any(|tier| lower.contains(tier))
}

/// Resolves the model actually sent to the backend.
///
/// In fallback mode any non-lite model is replaced by [`DEFAULT_FLASH_MODEL`];
/// a requested lite/flash model is honoured as-is.
///
/// ```
/// use turnwise::get_effective_model;
///
/// assert_eq!(get_effective_model(true, "big-model"), "glm-4-flash");
/// assert_eq!(get_effective_model(true, "small-flash"), "small-flash");
/// assert_eq!(get_effective_model(false, "big-model"), "big-model");
/// ```
pub fn get_effective_model(is_in_fallback_mode: bool, requested_model: &str) -> String {
    effective_model_with(is_in_fallback_mode, requested_model, DEFAULT_FLASH_MODEL)
}

/// [`get_effective_model`] with an explicit fallback model.
pub fn effective_model_with(
    is_in_fallback_mode: bool,
    requested_model: &str,
    fallback_model: &str,
) -> String {
    if is_in_fallback_mode && !is_lite_model(requested_model) {
        fallback_model.to_string()
    } else {
        requested_model.to_string()
    }
}

fn default_user_agent() -> String {
    format!(
        "turnwise/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        env::consts::OS,
        env::consts::ARCH
    )
}

/// Connection settings for [`ChatCompletionsClient`](crate::ChatCompletionsClient)
#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    /// Base URL without trailing slash
    pub base_url: String,
    pub organization: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub model: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("model", &self.model)
            .finish()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Builds a config from `Z_AI_API_KEY`/`ZAI_API_KEY`, `Z_AI_BASE_URL`
    /// and `Z_AI_ORGANIZATION`.
    pub fn from_env() -> Result<Self> {
        let api_key = API_KEY_VARS
            .iter()
            .find_map(|var| env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .ok_or_else(|| {
                Error::config("Z_AI_API_KEY (or ZAI_API_KEY) must be set to use this backend")
            })?;

        let mut builder = ClientConfig::builder().api_key(api_key);
        if let Ok(url) = env::var(BASE_URL_VAR) {
            builder = builder.base_url(url);
        }
        if let Ok(org) = env::var(ORGANIZATION_VAR) {
            builder = builder.organization(org);
        }
        builder.build()
    }

    /// `{base_url}/chat/completions`
    pub fn endpoint_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    organization: Option<String>,
    user_agent: Option<String>,
    timeout: Option<Duration>,
    model: Option<String>,
}

impl ClientConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::config("api_key is required"))?;

        let base_url = self
            .base_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config(format!(
                "base_url must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        Ok(ClientConfig {
            api_key,
            base_url,
            organization: self.organization.filter(|o| !o.trim().is_empty()),
            user_agent: self.user_agent.unwrap_or_else(default_user_agent),
            timeout: self.timeout.unwrap_or(Duration::from_secs(120)),
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_model_table() {
        assert_eq!(get_effective_model(true, "big-model"), DEFAULT_FLASH_MODEL);
        assert_eq!(get_effective_model(true, "small-flash"), "small-flash");
        assert_eq!(get_effective_model(true, "glm-4.5-air"), "glm-4.5-air");
        assert_eq!(get_effective_model(true, "Gemini-Flash-Lite"), "Gemini-Flash-Lite");
        assert_eq!(get_effective_model(false, "big-model"), "big-model");
    }

    #[test]
    fn test_effective_model_custom_fallback() {
        assert_eq!(effective_model_with(true, "glm-4.6", "cheap"), "cheap");
        assert_eq!(effective_model_with(false, "glm-4.6", "cheap"), "glm-4.6");
    }

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::builder().api_key("sk-test").build().unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert!(config.user_agent.starts_with("turnwise/"));
        assert_eq!(
            config.endpoint_url(),
            "https://api.z.ai/api/paas/v4/chat/completions"
        );
    }

    #[test]
    fn test_builder_trims_trailing_slash() {
        let config = ClientConfig::builder()
            .api_key("sk-test")
            .base_url("http://localhost:8080/v1/")
            .build()
            .unwrap();
        assert_eq!(config.endpoint_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_builder_requires_api_key() {
        let err = ClientConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = ClientConfig::builder().api_key("   ").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_rejects_non_http_url() {
        let err = ClientConfig::builder()
            .api_key("k")
            .base_url("ftp://example.com")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_debug_masks_api_key() {
        let config = ClientConfig::builder().api_key("sk-secret").build().unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("***"));
    }
}
