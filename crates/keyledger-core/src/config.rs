use crate::error::{Error, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Optional TOML file merged over the defaults.
pub const DEFAULT_CONFIG_FILE: &str = "keyledger.toml";

/// Prefix for environment overrides, e.g. `KEYLEDGER_CODEC__ENDPOINT`.
pub const ENV_PREFIX: &str = "KEYLEDGER_";

/// Top-level configuration, layered by Figment:
/// defaults < `keyledger.toml` < `KEYLEDGER_*` environment variables.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub pagination: PaginationConfig,
}

/// Remote encryption service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodecConfig {
    /// URL accepting `POST {operation, text}`.
    #[serde(default = "default_codec_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_codec_timeout")]
    pub timeout_secs: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            endpoint: default_codec_endpoint(),
            timeout_secs: default_codec_timeout(),
        }
    }
}

impl CodecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Message-send edge function that talks to the actual LLM providers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_endpoint")]
    pub endpoint: String,

    /// Completions are slow; keep this well above the codec timeout.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_provider_endpoint(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Default page sizes for list operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaginationConfig {
    #[serde(default = "default_messages_limit")]
    pub messages_limit: usize,

    #[serde(default = "default_usage_limit")]
    pub usage_limit: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            messages_limit: default_messages_limit(),
            usage_limit: default_usage_limit(),
        }
    }
}

impl Config {
    /// Defaults, then `keyledger.toml` (if present), then the environment.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

fn default_codec_endpoint() -> String {
    "http://127.0.0.1:54321/functions/v1/encryption".to_string()
}

fn default_codec_timeout() -> u64 {
    30
}

fn default_provider_endpoint() -> String {
    "http://127.0.0.1:54321/functions/v1/send-message".to_string()
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_messages_limit() -> usize {
    50
}

fn default_usage_limit() -> usize {
    20
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_figment(Figment::from(Serialized::defaults(Config::default())))
            .unwrap();
        assert_eq!(cfg.codec.timeout_secs, 30);
        assert_eq!(cfg.provider.timeout(), Duration::from_secs(60));
        assert_eq!(cfg.pagination.messages_limit, 50);
        assert_eq!(cfg.pagination.usage_limit, 20);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(
            r#"
            [codec]
            endpoint = "https://vault.example.test/encrypt"

            [pagination]
            usage_limit = 5
            "#,
        ));
        let cfg = Config::from_figment(figment).unwrap();
        assert_eq!(cfg.codec.endpoint, "https://vault.example.test/encrypt");
        assert_eq!(cfg.codec.timeout_secs, 30);
        assert_eq!(cfg.pagination.usage_limit, 5);
        assert_eq!(cfg.pagination.messages_limit, 50);
    }

    #[test]
    fn test_bad_type_is_config_error() {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string("[codec]\ntimeout_secs = \"soon\"\n"));
        let err = Config::from_figment(figment).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
