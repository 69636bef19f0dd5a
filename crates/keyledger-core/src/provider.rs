use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::http::http_client;
use crate::model::Settings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Everything the provider bridge needs for one completion.
///
/// The credential travels as ciphertext; the bridge decrypts it server-side.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    pub message: String,
    pub chat_session_id: String,
    #[serde(rename = "encrypted_key")]
    pub credential_ciphertext: String,
    #[serde(rename = "provider")]
    pub provider_name: String,
    pub model_id: Option<String>,
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderResponse {
    pub response: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
}

/// Seam to the external LLM providers.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

// ---------------------------------------------------------------------------
// EdgeProviderClient — message-send edge function over HTTP
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct EdgeError {
    error: Option<String>,
}

pub struct EdgeProviderClient {
    client: reqwest::Client,
    endpoint: String,
    bearer: Zeroizing<String>,
}

impl EdgeProviderClient {
    /// `bearer` is the access token of the caller's authenticated session.
    pub fn new(config: &ProviderConfig, bearer: impl Into<String>) -> Self {
        Self {
            client: http_client(config.timeout()),
            endpoint: config.endpoint.clone(),
            bearer: Zeroizing::new(bearer.into()),
        }
    }
}

impl std::fmt::Debug for EdgeProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeProviderClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderClient for EdgeProviderClient {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.bearer.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("request failed: {}", e.without_url())))?;

        let status = resp.status();
        if !status.is_success() {
            let reason = resp
                .json::<EdgeError>()
                .await
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            return Err(Error::Provider(format!(
                "Error from provider API: {} (HTTP {})",
                reason,
                status.as_u16()
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse provider response: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
