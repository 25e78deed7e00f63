//! Transport configuration.
//!
//! Deserialized from the `transport:` section of `toolstream.yaml`; see
//! `agent_core::config` for loading and env-var interpolation.

use serde::Deserialize;

use super::errors::StreamError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// How a tool-call segment encodes its arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentDialect {
    /// A JSON object streamed as text fragments.
    #[default]
    Json,
    /// `<invoke name="..."><parameter name="...">…</parameter></invoke>` blocks.
    Tagged,
}

/// Endpoint and request settings for the model service.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Base URL; `/messages` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Sent as `x-api-key` when non-empty.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub dialect: ArgumentDialect,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on a whole streamed response.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.anthropic.com/v1".into()
}
fn default_model() -> String {
    "claude-sonnet-4-5".into()
}
fn default_api_version() -> String {
    "2023-06-01".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    600
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            api_version: default_api_version(),
            max_tokens: default_max_tokens(),
            system_prompt: None,
            dialect: ArgumentDialect::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(StreamError::ConfigError {
                reason: format!("transport.base_url must be an http(s) URL, got '{}'", self.base_url),
            });
        }
        if self.model.trim().is_empty() {
            return Err(StreamError::ConfigError {
                reason: "transport.model must not be empty".into(),
            });
        }
        if self.max_tokens == 0 {
            return Err(StreamError::ConfigError {
                reason: "transport.max_tokens must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }
}
