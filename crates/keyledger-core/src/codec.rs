use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::http::{check_response, http_client};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// Format check
// ---------------------------------------------------------------------------

/// Anything shorter cannot be a provider key.
pub const MIN_KEY_LEN: usize = 8;

/// Shapes `verify_format` knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    /// `sk-...` (OpenAI, Anthropic `sk-ant-...`, DeepSeek, ...)
    SecretKeyPrefixed,
    /// Long bare alphanumeric token (Mistral, Cohere, ...)
    Alphanumeric,
    Unrecognized,
}

pub fn classify(candidate: &str) -> KeyShape {
    let candidate = candidate.trim();
    if candidate.starts_with("sk-") {
        KeyShape::SecretKeyPrefixed
    } else if candidate.len() >= 32 && candidate.chars().all(|c| c.is_ascii_alphanumeric()) {
        KeyShape::Alphanumeric
    } else {
        KeyShape::Unrecognized
    }
}

/// Cheap local plausibility check run before a key is sent for encryption.
///
/// A `true` result says nothing about whether the provider will accept the
/// key. Unrecognized shapes pass so that new providers are never blocked.
pub fn verify_format(candidate: &str) -> bool {
    let candidate = candidate.trim();
    if candidate.chars().count() < MIN_KEY_LEN {
        return false;
    }
    match classify(candidate) {
        KeyShape::SecretKeyPrefixed => candidate.len() > 20,
        KeyShape::Alphanumeric => true,
        KeyShape::Unrecognized => true,
    }
}

// ---------------------------------------------------------------------------
// SecretCodec trait
// ---------------------------------------------------------------------------

/// Reversible transform between a plaintext secret and its stored form.
/// `decrypt(encrypt(x)) == x` for every string `x`.
#[async_trait]
pub trait SecretCodec: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Fails with `Error::Decryption` when `ciphertext` was not produced by this codec.
    async fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>>;
}

// ---------------------------------------------------------------------------
// RemoteCodec — production implementation backed by the encryption service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Operation {
    Encrypt,
    Decrypt,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Encrypt => "encrypt",
            Operation::Decrypt => "decrypt",
        }
    }

    fn error(self, msg: String) -> Error {
        match self {
            Operation::Encrypt => Error::Encryption(msg),
            Operation::Decrypt => Error::Decryption(msg),
        }
    }
}

#[derive(Serialize)]
struct CodecRequest<'a> {
    operation: &'static str,
    text: &'a str,
}

#[derive(Deserialize)]
struct CodecResponse {
    result: String,
}

/// Talks to `POST {operation, text} -> {result}` with the caller's bearer token.
pub struct RemoteCodec {
    client: reqwest::Client,
    endpoint: String,
    bearer: Option<Zeroizing<String>>,
}

impl RemoteCodec {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            client: http_client(config.timeout()),
            endpoint: config.endpoint.clone(),
            bearer: None,
        }
    }

    /// Access token of the authenticated caller's session.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(Zeroizing::new(token.into()));
        self
    }

    async fn call(&self, op: Operation, text: &str) -> Result<Zeroizing<String>> {
        let Some(bearer) = &self.bearer else {
            return Err(op.error("authentication required".to_string()));
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(bearer.as_str())
            .json(&CodecRequest {
                operation: op.as_str(),
                text,
            })
            .send()
            .await
            .map_err(|e| op.error(format!("codec service unreachable: {}", e.without_url())))?;

        // The body may echo the submitted text; report the status only.
        let resp = check_response(resp).await.map_err(|e| match e {
            Error::HttpError { status, .. } => {
                op.error(format!("codec service returned HTTP {}", status))
            }
            other => op.error(other.to_string()),
        })?;

        let body: CodecResponse = resp
            .json()
            .await
            .map_err(|_| op.error("malformed codec response".to_string()))?;
        Ok(Zeroizing::new(body.result))
    }
}

impl std::fmt::Debug for RemoteCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCodec")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.bearer.is_some())
            .finish()
    }
}

#[async_trait]
impl SecretCodec for RemoteCodec {
    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let sealed = self.call(Operation::Encrypt, plaintext).await?;
        Ok(sealed.to_string())
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>> {
        if ciphertext.is_empty() {
            return Err(Error::Decryption("empty ciphertext".to_string()));
        }
        self.call(Operation::Decrypt, ciphertext).await
    }
}

// ---------------------------------------------------------------------------
// MockCodec — in-memory implementation for testing
// ---------------------------------------------------------------------------

const MOCK_PREFIX: &str = "sealed:";

/// Reversible but NOT confidential. Never wire this into production.
pub struct MockCodec {
    unavailable: AtomicBool,
}

impl MockCodec {
    pub fn new() -> Self {
        Self {
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage of the encryption service.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }
}

impl Default for MockCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretCodec for MockCodec {
    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        if self.is_unavailable() {
            return Err(Error::Encryption("codec service unreachable".to_string()));
        }
        let sealed = Zeroizing::new(format!("{}{}", MOCK_PREFIX, plaintext));
        Ok(STANDARD.encode(sealed.as_bytes()))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<String>> {
        if self.is_unavailable() {
            return Err(Error::Decryption("codec service unreachable".to_string()));
        }
        let malformed = || Error::Decryption("ciphertext was not produced by this codec".to_string());
        let bytes = Zeroizing::new(STANDARD.decode(ciphertext).map_err(|_| malformed())?);
        let text = std::str::from_utf8(&bytes).map_err(|_| malformed())?;
        let plain = text.strip_prefix(MOCK_PREFIX).ok_or_else(malformed)?;
        Ok(Zeroizing::new(plain.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // -- Format --

    #[test]
    fn test_verify_format_rejects_short() {
        assert!(!verify_format(""));
        assert!(!verify_format("short"));
        assert!(!verify_format("   abc   "));
    }

    #[test]
    fn test_verify_format_sk_prefixed() {
        assert!(verify_format(&format!("sk-{}", "a".repeat(25))));
        assert!(verify_format("sk-ant-REDACTED"));
        // recognized shape, too short to be real
        assert!(!verify_format("sk-abcdef123"));
    }

    #[test]
    fn test_verify_format_alphanumeric() {
        assert!(verify_format(&"x".repeat(40)));
        assert_eq!(classify(&"x".repeat(40)), KeyShape::Alphanumeric);
        assert_eq!(classify(&"x".repeat(31)), KeyShape::Unrecognized);
    }

    #[test]
    fn test_verify_format_unrecognized_is_permissive() {
        assert!(verify_format("AIzaSy-novel_key"));
        assert!(verify_format("12345678"));
        assert!(verify_format("gsk_live.v2/abcdef"));
        assert_eq!(classify("gsk_live.v2/abcdef"), KeyShape::Unrecognized);
    }

    // -- MockCodec --

    #[tokio::test]
    async fn test_mock_round_trip() {
        let codec = MockCodec::new();
        for plain in ["sk-abc", "", "ключ-🔑", "with spaces and\nnewlines"] {
            let sealed = codec.encrypt(plain).await.unwrap();
            assert_ne!(sealed, plain);
            assert_eq!(&*codec.decrypt(&sealed).await.unwrap(), plain);
        }
    }

    #[tokio::test]
    async fn test_mock_rejects_foreign_ciphertext() {
        let codec = MockCodec::new();
        let err = codec.decrypt("not base64 at all!").await.unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));

        let foreign = STANDARD.encode("plain:sk-abc");
        let err = codec.decrypt(&foreign).await.unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let codec = MockCodec::new();
        let sealed = codec.encrypt("sk-abc").await.unwrap();
        codec.set_unavailable(true);
        assert!(matches!(codec.encrypt("x").await, Err(Error::Encryption(_))));
        assert!(matches!(codec.decrypt(&sealed).await, Err(Error::Decryption(_))));
    }

    // -- RemoteCodec --

    fn remote(server: &MockServer) -> RemoteCodec {
        RemoteCodec::new(&CodecConfig {
            endpoint: format!("{}/functions/v1/encryption", server.uri()),
            timeout_secs: 5,
        })
    }

    #[tokio::test]
    async fn test_remote_encrypt_sends_bearer_and_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/encryption"))
            .and(header("authorization", "Bearer session-token"))
            .and(body_json(json!({"operation": "encrypt", "text": "sk-plain"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "c1ph3r"})))
            .expect(1)
            .mount(&server)
            .await;

        let codec = remote(&server).with_bearer("session-token");
        assert_eq!(codec.encrypt("sk-plain").await.unwrap(), "c1ph3r");
    }

    #[tokio::test]
    async fn test_remote_decrypt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"operation": "decrypt", "text": "c1ph3r"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "sk-plain"})))
            .mount(&server)
            .await;

        let codec = remote(&server).with_bearer("t");
        assert_eq!(&*codec.decrypt("c1ph3r").await.unwrap(), "sk-plain");
    }

    #[tokio::test]
    async fn test_remote_non_success_is_hard_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("echo: sk-plain"))
            .mount(&server)
            .await;

        let codec = remote(&server).with_bearer("t");
        let err = codec.encrypt("sk-plain").await.unwrap_err();
        assert!(matches!(err, Error::Encryption(_)));
        assert!(!err.to_string().contains("sk-plain"));

        let err = codec.decrypt("garbage").await.unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
    }

    #[tokio::test]
    async fn test_remote_requires_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "x"})))
            .expect(0)
            .mount(&server)
            .await;

        let codec = remote(&server);
        assert!(matches!(codec.encrypt("sk-plain").await, Err(Error::Encryption(_))));
    }

    #[tokio::test]
    async fn test_remote_unreachable() {
        let codec = RemoteCodec::new(&CodecConfig {
            endpoint: "http://127.0.0.1:1/encrypt".to_string(),
            timeout_secs: 2,
        })
        .with_bearer("t");
        assert!(matches!(codec.encrypt("sk-plain").await, Err(Error::Encryption(_))));
    }

    #[test]
    fn test_remote_debug_hides_token() {
        let codec = RemoteCodec::new(&CodecConfig::default()).with_bearer("super-secret-token");
        assert!(!format!("{:?}", codec).contains("super-secret-token"));
    }
}
