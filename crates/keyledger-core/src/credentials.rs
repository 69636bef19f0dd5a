use crate::codec::{SecretCodec, verify_format};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::model::{Credential, new_id};
use crate::store::{Filter, Query, Row, Store, from_row, from_rows, patch, tables, to_row};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

const ENTITY: &str = "Credential";

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Fields a caller may change on an existing credential.
///
/// A new `secret` is format-checked and re-encrypted; the plaintext itself is
/// never written to the store.
#[derive(Default)]
pub struct CredentialPatch {
    pub display_name: Option<String>,
    pub is_active: Option<bool>,
    pub secret: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for CredentialPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPatch")
            .field("display_name", &self.display_name)
            .field("is_active", &self.is_active)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Key under which a day's token count accumulates, e.g. `usage_2026-03-01`.
pub fn daily_usage_key(day: DateTime<Utc>) -> String {
    format!("usage_{}", day.format("%Y-%m-%d"))
}

fn default_display_name(now: DateTime<Utc>) -> String {
    format!("Key {}", now.format("%Y-%m-%d %H:%M:%S"))
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Lifecycle of users' provider credentials: create, read, rotate, accrue
/// usage, deactivate, delete.
pub struct CredentialStore {
    store: Arc<dyn Store>,
    codec: Arc<dyn SecretCodec>,
    accrual_locks: KeyedLocks,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn Store>, codec: Arc<dyn SecretCodec>) -> Self {
        Self {
            store,
            codec,
            accrual_locks: KeyedLocks::new(),
        }
    }

    /// Encrypt and persist a new active credential.
    pub async fn add(
        &self,
        owner_id: &str,
        provider_id: &str,
        plaintext: &str,
        display_name: Option<&str>,
    ) -> Result<Credential> {
        if !verify_format(plaintext) {
            return Err(Error::Validation(
                "API key format is not recognized. Check that the whole key was pasted."
                    .to_string(),
            ));
        }
        let ciphertext = self.codec.encrypt(plaintext).await?;

        let now = Utc::now();
        let credential = Credential {
            id: new_id(),
            owner_id: owner_id.to_string(),
            provider_id: provider_id.to_string(),
            ciphertext,
            display_name: display_name
                .filter(|n| !n.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| default_display_name(now)),
            is_active: true,
            usage_stats: Default::default(),
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .insert(tables::CREDENTIALS, to_row(&credential)?)
            .await?;

        info!(credential_id = %credential.id, owner_id, provider_id, "credential added");
        Ok(credential)
    }

    /// Fetch a credential owned by `owner_id`, active or not.
    pub async fn get(&self, id: &str, owner_id: &str) -> Result<Credential> {
        let row = self
            .store
            .get_by_id(tables::CREDENTIALS, id)
            .await?
            .ok_or_else(|| Error::not_found(ENTITY, id))?;
        let credential: Credential = from_row(row)?;
        // Someone else's credential is indistinguishable from a missing one.
        if credential.owner_id != owner_id {
            return Err(Error::not_found(ENTITY, id));
        }
        Ok(credential)
    }

    /// All of the owner's credentials, most recently updated first.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<Credential>> {
        let rows = self
            .store
            .select(
                tables::CREDENTIALS,
                &Query::filtered(Filter::new().eq("owner_id", owner_id)).desc("updated_at"),
            )
            .await?;
        from_rows(rows)
    }

    /// First active credential for `(owner, provider)`, if any.
    pub async fn first_active(&self, owner_id: &str, provider_id: &str) -> Result<Option<Credential>> {
        let rows = self
            .store
            .select(
                tables::CREDENTIALS,
                &Query::filtered(
                    Filter::new()
                        .eq("owner_id", owner_id)
                        .eq("provider_id", provider_id)
                        .eq("is_active", true),
                )
                .asc("created_at")
                .page(0, 1),
            )
            .await?;
        rows.into_iter().next().map(from_row).transpose()
    }

    pub async fn update(&self, id: &str, owner_id: &str, changes: CredentialPatch) -> Result<Credential> {
        self.get(id, owner_id).await?;

        let mut row = Row::new();
        if let Some(secret) = &changes.secret {
            if !verify_format(secret) {
                return Err(Error::Validation(
                    "API key format is not recognized. Check that the whole key was pasted."
                        .to_string(),
                ));
            }
            row.insert("ciphertext".to_string(), json!(self.codec.encrypt(secret).await?));
        }
        if let Some(name) = changes.display_name {
            row.insert("display_name".to_string(), json!(name));
        }
        if let Some(active) = changes.is_active {
            row.insert("is_active".to_string(), json!(active));
        }
        row.insert("updated_at".to_string(), json!(Utc::now()));

        let rotated = row.contains_key("ciphertext");
        let updated = self.write(id, row).await?;
        info!(credential_id = id, rotated, "credential updated");
        Ok(updated)
    }

    /// Decrypted secret for a provider call. Keep the result away from logs
    /// and client-visible responses.
    pub async fn decrypted_secret(&self, id: &str, owner_id: &str) -> Result<Zeroizing<String>> {
        let credential = self.get(id, owner_id).await?;
        if !credential.is_active {
            return Err(Error::not_found(ENTITY, id));
        }
        self.codec.decrypt(&credential.ciphertext).await
    }

    /// Fold one call's cost into the credential's running totals.
    ///
    /// Serialized per credential within this process. Writers in other
    /// processes can still interleave, in which case the last write wins.
    pub async fn record_usage(
        &self,
        id: &str,
        owner_id: &str,
        tokens_used: u64,
        cost: f64,
    ) -> Result<Credential> {
        let _guard = self.accrual_locks.lock(id).await;
        let credential = self.get(id, owner_id).await?;

        let now = Utc::now();
        let mut stats = credential.usage_stats;
        *stats.entry("total_tokens".to_string()).or_default() += tokens_used as f64;
        *stats.entry("total_cost".to_string()).or_default() += cost;
        *stats.entry(daily_usage_key(now)).or_default() += tokens_used as f64;

        let updated = self
            .write(
                id,
                patch([
                    ("usage_stats", serde_json::to_value(&stats)?),
                    ("last_used_at", json!(now)),
                    ("updated_at", json!(now)),
                ]),
            )
            .await?;
        debug!(credential_id = id, tokens_used, cost, "usage accrued");
        Ok(updated)
    }

    /// Soft removal: the row stays, but it no longer serves provider calls.
    pub async fn deactivate(&self, id: &str, owner_id: &str) -> Result<Credential> {
        self.get(id, owner_id).await?;
        let updated = self
            .write(
                id,
                patch([("is_active", Value::Bool(false)), ("updated_at", json!(Utc::now()))]),
            )
            .await?;
        info!(credential_id = id, "credential deactivated");
        Ok(updated)
    }

    /// Hard removal. Usage history keeps its (now dangling) `credential_id`.
    pub async fn delete(&self, id: &str, owner_id: &str) -> Result<()> {
        self.get(id, owner_id).await?;
        self.store
            .delete(tables::CREDENTIALS, &Filter::by_id(id))
            .await?;
        info!(credential_id = id, "credential deleted");
        Ok(())
    }

    async fn write(&self, id: &str, row: Row) -> Result<Credential> {
        let rows = self
            .store
            .update(tables::CREDENTIALS, row, &Filter::by_id(id))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(ENTITY, id))?;
        from_row(row)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
