use crate::catalog::ProviderCatalog;
use crate::codec::SecretCodec;
use crate::config::PaginationConfig;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::ledger::{NewSession, SessionLedger};
use crate::meter::{NewUsage, UsageMeter};
use crate::model::{ChatSession, Credential, Message, Settings, UsageRecord, merge_settings};
use crate::provider::{ProviderClient, ProviderRequest};
use crate::store::Store;
use crate::tiers::TierGate;
use std::sync::Arc;
use tracing::{info, warn};

/// Request type recorded for ordinary chat completions.
pub const CHAT_REQUEST: &str = "chat";

/// Outcome of one `send_message`.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub user_message: Message,
    pub assistant_message: Message,
    pub tokens_used: u64,
    pub cost: f64,
    /// `None` when metering was unavailable; the reply itself still stands.
    pub usage: Option<UsageRecord>,
}

/// Wires the components together for the conversational path:
/// admission, credential, provider call, ordered append, metering.
pub struct ChatService {
    credentials: Arc<CredentialStore>,
    catalog: Arc<ProviderCatalog>,
    ledger: Arc<SessionLedger>,
    meter: Arc<UsageMeter>,
    gate: Arc<TierGate>,
    provider: Arc<dyn ProviderClient>,
    pagination: PaginationConfig,
}

impl ChatService {
    /// Build every component over one store and codec.
    pub fn new(
        store: Arc<dyn Store>,
        codec: Arc<dyn SecretCodec>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        let credentials = Arc::new(CredentialStore::new(store.clone(), codec));
        let catalog = Arc::new(ProviderCatalog::new(store.clone()));
        let ledger = Arc::new(SessionLedger::new(
            store.clone(),
            credentials.clone(),
            catalog.clone(),
        ));
        let meter = Arc::new(UsageMeter::new(store.clone(), catalog.clone()));
        let gate = Arc::new(TierGate::new(store));
        Self::from_components(credentials, catalog, ledger, meter, gate, provider)
    }

    /// Assemble from components the caller already holds.
    pub fn from_components(
        credentials: Arc<CredentialStore>,
        catalog: Arc<ProviderCatalog>,
        ledger: Arc<SessionLedger>,
        meter: Arc<UsageMeter>,
        gate: Arc<TierGate>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            credentials,
            catalog,
            ledger,
            meter,
            gate,
            provider,
            pagination: PaginationConfig::default(),
        }
    }

    /// Page sizes for `history` and `usage_log`, usually `Config::pagination`.
    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    pub fn gate(&self) -> &TierGate {
        &self.gate
    }

    /// Register a key if the owner's plan has room for another one.
    pub async fn add_credential(
        &self,
        owner_id: &str,
        provider_id: &str,
        plaintext: &str,
        display_name: Option<&str>,
    ) -> Result<Credential> {
        self.gate.ensure_can_add_credential(owner_id).await?;
        self.credentials
            .add(owner_id, provider_id, plaintext, display_name)
            .await
    }

    /// Open a session if the owner's plan has room for another one.
    pub async fn start_session(&self, owner_id: &str, new: NewSession) -> Result<ChatSession> {
        self.gate.ensure_can_create_session(owner_id).await?;
        self.ledger.create_session(owner_id, new).await
    }

    /// One page of a session the caller owns, oldest first. Page size is
    /// `pagination.messages_limit`.
    pub async fn history(&self, owner_id: &str, session_id: &str, page: usize) -> Result<Vec<Message>> {
        self.ledger.get_session(session_id, owner_id).await?;
        let limit = self.pagination.messages_limit;
        self.ledger
            .list_messages(session_id, limit, page * limit)
            .await
    }

    /// One page of the caller's usage log, newest first. Page size is
    /// `pagination.usage_limit`.
    pub async fn usage_log(&self, owner_id: &str, page: usize) -> Result<Vec<UsageRecord>> {
        self.meter
            .paginated_log(owner_id, page, self.pagination.usage_limit)
            .await
    }

    /// Send `content` to the session's provider and record the exchange.
    ///
    /// Nothing is appended unless the provider call succeeds. Once it has,
    /// the call is metered even if the append fails; metering itself is
    /// best-effort and never fails the reply.
    pub async fn send_message(
        &self,
        owner_id: &str,
        session_id: &str,
        content: &str,
        settings: Option<&Settings>,
    ) -> Result<ChatReply> {
        if content.trim().is_empty() {
            return Err(Error::Validation("Message must not be empty".to_string()));
        }

        let session = self.ledger.get_session(session_id, owner_id).await?;
        let limits = self.gate.limits_for_owner(owner_id).await?;
        self.gate
            .ensure_message_capacity(owner_id, session_id, 2)
            .await?;

        let credential = self
            .credentials
            .first_active(owner_id, &session.provider_id)
            .await?
            .ok_or_else(|| {
                Error::Precondition("No active API key found for this provider".to_string())
            })?;
        let provider = self.catalog.get(&session.provider_id).await?;

        let request = ProviderRequest {
            message: content.to_string(),
            chat_session_id: session.id.clone(),
            credential_ciphertext: credential.ciphertext.clone(),
            provider_name: provider.name.clone(),
            model_id: session.model_id.clone(),
            settings: merge_settings(&session.settings, settings),
        };
        let response = self.provider.send(&request).await?;

        // Concurrent sends may both pass the early check; the cap is enforced
        // again under the session's lock.
        let appended = self
            .ledger
            .append_exchange_capped(
                session_id,
                content,
                &response.response,
                limits.messages_per_session,
            )
            .await;
        if let Err(e) = &appended {
            warn!(error = %e, session_id, "provider reply not appended, metering the call anyway");
        }

        let usage = self
            .meter
            .record(NewUsage {
                owner_id: owner_id.to_string(),
                credential_id: credential.id.clone(),
                session_id: session_id.to_string(),
                message_id: appended.as_ref().ok().map(|(_, answer)| answer.id.clone()),
                tokens_used: response.tokens_used,
                cost: response.cost,
                request_type: CHAT_REQUEST.to_string(),
            })
            .await;

        if let Err(e) = self
            .credentials
            .record_usage(&credential.id, owner_id, response.tokens_used, response.cost)
            .await
        {
            warn!(error = %e, credential_id = %credential.id, "credential usage accrual failed");
        }

        let (user_message, assistant_message) = appended?;
        info!(
            session_id,
            provider = %provider.name,
            tokens = response.tokens_used,
            "message exchanged"
        );
        Ok(ChatReply {
            user_message,
            assistant_message,
            tokens_used: response.tokens_used,
            cost: response.cost,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
