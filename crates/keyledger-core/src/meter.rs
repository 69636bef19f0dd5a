use crate::catalog::ProviderCatalog;
use crate::error::Result;
use crate::model::{Credential, UsageRecord, new_id};
use crate::store::{Filter, Query, Store, from_rows, tables, to_row};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bucket for records whose credential (or its provider) no longer exists.
pub const UNKNOWN_PROVIDER: &str = "Unknown";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One provider call to be metered.
#[derive(Debug, Clone)]
pub struct NewUsage {
    pub owner_id: String,
    pub credential_id: String,
    pub session_id: String,
    pub message_id: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
    pub request_type: String,
}

/// Optional exact-match narrowing for `aggregate`.
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub credential_id: Option<String>,
    pub session_id: Option<String>,
    pub request_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderUsage {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Totals over a user's usage records, grouped by provider name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_provider: BTreeMap<String, ProviderUsage>,
}

// ---------------------------------------------------------------------------
// UsageMeter
// ---------------------------------------------------------------------------

/// Append-only log of provider calls.
pub struct UsageMeter {
    store: Arc<dyn Store>,
    catalog: Arc<ProviderCatalog>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<ProviderCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Best-effort: a failed write is logged and yields `None` so that a
    /// metering outage never fails a provider call that already succeeded.
    pub async fn record(&self, usage: NewUsage) -> Option<UsageRecord> {
        let credential_id = usage.credential_id.clone();
        let session_id = usage.session_id.clone();
        match self.try_record(usage).await {
            Ok(record) => {
                debug!(usage_id = %record.id, %credential_id, tokens = record.tokens_used, "usage recorded");
                Some(record)
            }
            Err(e) => {
                warn!(error = %e, %credential_id, %session_id, "usage recording failed");
                None
            }
        }
    }

    /// Same as `record`, for callers that want the failure.
    pub async fn try_record(&self, usage: NewUsage) -> Result<UsageRecord> {
        let record = UsageRecord {
            id: new_id(),
            owner_id: usage.owner_id,
            credential_id: usage.credential_id,
            session_id: usage.session_id,
            message_id: usage.message_id,
            tokens_used: usage.tokens_used,
            cost: usage.cost,
            request_type: usage.request_type,
            created_at: Utc::now(),
        };
        self.store.insert(tables::USAGE, to_row(&record)?).await?;
        Ok(record)
    }

    pub async fn aggregate(&self, owner_id: &str, filter: &UsageFilter) -> Result<UsageStats> {
        let mut query = Filter::new().eq("owner_id", owner_id);
        if let Some(id) = &filter.credential_id {
            query = query.eq("credential_id", id.as_str());
        }
        if let Some(id) = &filter.session_id {
            query = query.eq("session_id", id.as_str());
        }
        if let Some(kind) = &filter.request_type {
            query = query.eq("request_type", kind.as_str());
        }
        let records: Vec<UsageRecord> = from_rows(
            self.store
                .select(tables::USAGE, &Query::filtered(query))
                .await?,
        )?;

        let mut stats = UsageStats {
            total_requests: records.len() as u64,
            total_tokens: records.iter().map(|r| r.tokens_used).sum(),
            total_cost: records.iter().map(|r| r.cost).sum(),
            by_provider: BTreeMap::new(),
        };
        if records.is_empty() {
            return Ok(stats);
        }

        let provider_names = self.provider_names_by_credential(owner_id).await?;
        for record in &records {
            let name = provider_names
                .get(&record.credential_id)
                .map(String::as_str)
                .unwrap_or(UNKNOWN_PROVIDER);
            let bucket = stats.by_provider.entry(name.to_string()).or_default();
            bucket.requests += 1;
            bucket.tokens += record.tokens_used;
            bucket.cost += record.cost;
        }
        Ok(stats)
    }

    /// Newest first; page `n` covers `[n*limit, n*limit + limit)`.
    pub async fn paginated_log(&self, owner_id: &str, page: usize, limit: usize) -> Result<Vec<UsageRecord>> {
        let rows = self
            .store
            .select(
                tables::USAGE,
                &Query::filtered(Filter::new().eq("owner_id", owner_id))
                    .desc("created_at")
                    .page(page.saturating_mul(limit), limit),
            )
            .await?;
        from_rows(rows)
    }

    /// credential id -> provider name, for every credential the owner still has.
    async fn provider_names_by_credential(&self, owner_id: &str) -> Result<HashMap<String, String>> {
        let credentials: Vec<Credential> = from_rows(
            self.store
                .select(
                    tables::CREDENTIALS,
                    &Query::filtered(Filter::new().eq("owner_id", owner_id)),
                )
                .await?,
        )?;

        let mut providers: HashMap<String, String> = HashMap::new();
        let mut names = HashMap::new();
        for credential in credentials {
            if !providers.contains_key(&credential.provider_id) {
                let name = self
                    .catalog
                    .find(&credential.provider_id)
                    .await?
                    .map(|p| p.name)
                    .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string());
                providers.insert(credential.provider_id.clone(), name);
            }
            names.insert(credential.id, providers[&credential.provider_id].clone());
        }
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
