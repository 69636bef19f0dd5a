use crate::error::{Error, Result};
use crate::model::{Subscription, Tier, new_id};
use crate::store::{Filter, Query, Row, Store, WriteOp, from_row, from_rows, tables, to_row};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Numeric caps attached to a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub api_keys: u32,
    pub chat_sessions: u32,
    pub messages_per_session: u32,
    pub saved_prompts: u32,
}

const FREE: TierLimits = TierLimits {
    api_keys: 1,
    chat_sessions: 5,
    messages_per_session: 50,
    saved_prompts: 0,
};

const PLUS: TierLimits = TierLimits {
    api_keys: 3,
    chat_sessions: 20,
    messages_per_session: 200,
    saved_prompts: 10,
};

const PREMIUM: TierLimits = TierLimits {
    api_keys: 10,
    chat_sessions: 100,
    messages_per_session: 1000,
    saved_prompts: 50,
};

pub fn limits_for(tier: Tier) -> TierLimits {
    match tier {
        Tier::Free => FREE,
        Tier::Plus => PLUS,
        Tier::Premium => PREMIUM,
    }
}

/// Lookup by name. Never fails: unknown names get the free table.
pub fn limits_for_name(tier: &str) -> TierLimits {
    limits_for(Tier::from(tier))
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub tier: Tier,
    pub end_date: Option<DateTime<Utc>>,
    pub payment_status: Option<String>,
}

impl NewSubscription {
    pub fn open_ended(tier: Tier) -> Self {
        Self {
            tier,
            end_date: None,
            payment_status: None,
        }
    }
}

/// Changes to an existing subscription. Activation is not patchable; a new
/// plan goes through `create_subscription`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub tier: Option<Tier>,
    pub end_date: Option<Option<DateTime<Utc>>>,
    pub payment_status: Option<String>,
}

// ---------------------------------------------------------------------------
// TierGate
// ---------------------------------------------------------------------------

/// Subscription lookup and admission control.
pub struct TierGate {
    store: Arc<dyn Store>,
}

impl TierGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The owner's active subscription. Should several be active, the one
    /// ending last wins, open-ended first.
    pub async fn current_subscription(&self, owner_id: &str) -> Result<Option<Subscription>> {
        let rows = self
            .store
            .select(
                tables::SUBSCRIPTIONS,
                &Query::filtered(Filter::new().eq("owner_id", owner_id).eq("is_active", true)),
            )
            .await?;
        let subs: Vec<Subscription> = from_rows(rows)?;
        Ok(subs
            .into_iter()
            .max_by_key(|s| s.end_date.unwrap_or(DateTime::<Utc>::MAX_UTC)))
    }

    /// No active subscription means free.
    pub async fn current_tier(&self, owner_id: &str) -> Result<Tier> {
        Ok(self
            .current_subscription(owner_id)
            .await?
            .map_or(Tier::Free, |s| s.tier))
    }

    pub async fn has_access(&self, owner_id: &str, required: Tier) -> Result<bool> {
        Ok(self.current_tier(owner_id).await?.rank() >= required.rank())
    }

    pub async fn limits_for_owner(&self, owner_id: &str) -> Result<TierLimits> {
        Ok(limits_for(self.current_tier(owner_id).await?))
    }

    /// Whether one more active credential fits the owner's plan.
    pub async fn can_add_credential(&self, owner_id: &str) -> Result<bool> {
        let limits = self.limits_for_owner(owner_id).await?;
        let held = self
            .count(
                tables::CREDENTIALS,
                Filter::new().eq("owner_id", owner_id).eq("is_active", true),
            )
            .await?;
        Ok(held < limits.api_keys as usize)
    }

    /// Whether one more session (archived ones included) fits the owner's plan.
    pub async fn can_create_session(&self, owner_id: &str) -> Result<bool> {
        let limits = self.limits_for_owner(owner_id).await?;
        let held = self
            .count(tables::SESSIONS, Filter::new().eq("owner_id", owner_id))
            .await?;
        Ok(held < limits.chat_sessions as usize)
    }

    pub async fn ensure_can_add_credential(&self, owner_id: &str) -> Result<()> {
        if !self.can_add_credential(owner_id).await? {
            return Err(Error::LimitExceeded {
                resource: "api keys",
                limit: self.limits_for_owner(owner_id).await?.api_keys,
            });
        }
        Ok(())
    }

    pub async fn ensure_can_create_session(&self, owner_id: &str) -> Result<()> {
        if !self.can_create_session(owner_id).await? {
            return Err(Error::LimitExceeded {
                resource: "chat sessions",
                limit: self.limits_for_owner(owner_id).await?.chat_sessions,
            });
        }
        Ok(())
    }

    /// Fails unless `additional` more messages fit in the session.
    pub async fn ensure_message_capacity(
        &self,
        owner_id: &str,
        session_id: &str,
        additional: usize,
    ) -> Result<()> {
        let limit = self.limits_for_owner(owner_id).await?.messages_per_session;
        let held = self
            .count(tables::MESSAGES, Filter::new().eq("session_id", session_id))
            .await?;
        if held + additional > limit as usize {
            return Err(Error::LimitExceeded {
                resource: "messages per session",
                limit,
            });
        }
        Ok(())
    }

    /// Switch the owner to a new plan. Deactivating the previous plan and
    /// inserting the new one happen in a single atomic batch.
    pub async fn create_subscription(&self, owner_id: &str, new: NewSubscription) -> Result<Subscription> {
        let subscription = Subscription {
            id: new_id(),
            owner_id: owner_id.to_string(),
            tier: new.tier,
            start_date: Utc::now(),
            end_date: new.end_date,
            is_active: true,
            payment_status: new.payment_status,
        };

        let mut deactivate = Row::new();
        deactivate.insert("is_active".to_string(), json!(false));
        self.store
            .apply_atomic(vec![
                WriteOp::Update {
                    table: tables::SUBSCRIPTIONS.to_string(),
                    patch: deactivate,
                    filter: Filter::new().eq("owner_id", owner_id).eq("is_active", true),
                },
                WriteOp::Insert {
                    table: tables::SUBSCRIPTIONS.to_string(),
                    row: to_row(&subscription)?,
                },
            ])
            .await?;

        info!(subscription_id = %subscription.id, owner_id, tier = %subscription.tier, "subscription activated");
        Ok(subscription)
    }

    pub async fn update_subscription(
        &self,
        id: &str,
        owner_id: &str,
        changes: SubscriptionPatch,
    ) -> Result<Subscription> {
        let existing: Subscription = self
            .store
            .get_by_id(tables::SUBSCRIPTIONS, id)
            .await?
            .map(from_row)
            .transpose()?
            .filter(|s: &Subscription| s.owner_id == owner_id)
            .ok_or_else(|| Error::not_found("Subscription", id))?;

        let mut row = Row::new();
        if let Some(tier) = changes.tier {
            row.insert("tier".to_string(), json!(tier));
        }
        if let Some(end_date) = changes.end_date {
            row.insert("end_date".to_string(), json!(end_date));
        }
        if let Some(status) = changes.payment_status {
            row.insert("payment_status".to_string(), json!(status));
        }
        if row.is_empty() {
            return Ok(existing);
        }

        let rows = self
            .store
            .update(tables::SUBSCRIPTIONS, row, &Filter::by_id(id))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("Subscription", id))?;
        from_row(row)
    }

    async fn count(&self, table: &str, filter: Filter) -> Result<usize> {
        let rows = self
            .store
            .select(table, &Query::filtered(filter).columns(&["id"]))
            .await?;
        Ok(rows.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Duration;

    fn setup() -> (Arc<MemoryStore>, TierGate) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), TierGate::new(store))
    }

    async fn active_count(store: &MemoryStore, owner: &str) -> usize {
        store
            .select(
                tables::SUBSCRIPTIONS,
                &Query::filtered(Filter::new().eq("owner_id", owner).eq("is_active", true)),
            )
            .await
            .unwrap()
            .len()
    }

    async fn seed(store: &MemoryStore, table: &str, owner: &str, n: usize) {
        for _ in 0..n {
            let mut row = Row::new();
            row.insert("id".to_string(), json!(new_id()));
            row.insert("owner_id".to_string(), json!(owner));
            row.insert("session_id".to_string(), json!("s1"));
            row.insert("is_active".to_string(), json!(true));
            store.insert(table, row).await.unwrap();
        }
    }

    // -- Limits --

    #[test]
    fn test_limits_table() {
        assert_eq!(limits_for(Tier::Free).api_keys, 1);
        assert_eq!(limits_for(Tier::Plus).chat_sessions, 20);
        assert_eq!(limits_for(Tier::Premium).messages_per_session, 1000);
        assert_eq!(limits_for(Tier::Free).saved_prompts, 0);
    }

    #[test]
    fn test_unknown_tier_name_gets_free_limits() {
        assert_eq!(limits_for_name("enterprise"), limits_for(Tier::Free));
        assert_eq!(limits_for_name(""), limits_for(Tier::Free));
        assert_eq!(limits_for_name("plus"), limits_for(Tier::Plus));
    }

    // -- Access --

    #[tokio::test]
    async fn test_has_access_without_subscription() {
        let (_, gate) = setup();
        assert!(gate.has_access("nobody", Tier::Free).await.unwrap());
        assert!(!gate.has_access("nobody", Tier::Plus).await.unwrap());
        assert!(!gate.has_access("nobody", Tier::Premium).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_access_by_rank() {
        let (_, gate) = setup();
        gate.create_subscription("u1", NewSubscription::open_ended(Tier::Plus))
            .await
            .unwrap();
        assert!(gate.has_access("u1", Tier::Free).await.unwrap());
        assert!(gate.has_access("u1", Tier::Plus).await.unwrap());
        assert!(!gate.has_access("u1", Tier::Premium).await.unwrap());
    }

    // -- Subscriptions --

    #[tokio::test]
    async fn test_create_subscription_leaves_one_active() {
        let (store, gate) = setup();
        let first = gate
            .create_subscription("u1", NewSubscription::open_ended(Tier::Plus))
            .await
            .unwrap();
        let second = gate
            .create_subscription("u1", NewSubscription::open_ended(Tier::Premium))
            .await
            .unwrap();
        gate.create_subscription("u2", NewSubscription::open_ended(Tier::Plus))
            .await
            .unwrap();

        assert_eq!(active_count(&store, "u1").await, 1);
        assert_eq!(active_count(&store, "u2").await, 1);
        let current = gate.current_subscription("u1").await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_ne!(current.id, first.id);
        assert_eq!(gate.current_tier("u1").await.unwrap(), Tier::Premium);
    }

    #[tokio::test]
    async fn test_create_subscription_failure_changes_nothing() {
        let (store, gate) = setup();
        let first = gate
            .create_subscription("u1", NewSubscription::open_ended(Tier::Plus))
            .await
            .unwrap();
        store.fail_writes_to(tables::SUBSCRIPTIONS);
        assert!(
            gate.create_subscription("u1", NewSubscription::open_ended(Tier::Premium))
                .await
                .is_err()
        );
        store.restore_writes_to(tables::SUBSCRIPTIONS);

        let current = gate.current_subscription("u1").await.unwrap().unwrap();
        assert_eq!(current.id, first.id);
        assert_eq!(active_count(&store, "u1").await, 1);
    }

    #[tokio::test]
    async fn test_current_subscription_prefers_latest_end() {
        let (store, gate) = setup();
        let now = Utc::now();
        for (tier, end) in [
            (Tier::Plus, Some(now + Duration::days(10))),
            (Tier::Premium, Some(now + Duration::days(40))),
        ] {
            let sub = Subscription {
                id: new_id(),
                owner_id: "u1".to_string(),
                tier,
                start_date: now,
                end_date: end,
                is_active: true,
                payment_status: None,
            };
            store
                .insert(tables::SUBSCRIPTIONS, to_row(&sub).unwrap())
                .await
                .unwrap();
        }
        assert_eq!(gate.current_tier("u1").await.unwrap(), Tier::Premium);
    }

    #[tokio::test]
    async fn test_update_subscription() {
        let (_, gate) = setup();
        let sub = gate
            .create_subscription("u1", NewSubscription::open_ended(Tier::Plus))
            .await
            .unwrap();
        let end = Utc::now() + Duration::days(30);
        let updated = gate
            .update_subscription(
                &sub.id,
                "u1",
                SubscriptionPatch {
                    end_date: Some(Some(end)),
                    payment_status: Some("paid".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.end_date, Some(end));
        assert_eq!(updated.payment_status.as_deref(), Some("paid"));
        assert!(updated.is_active);

        assert!(matches!(
            gate.update_subscription(&sub.id, "u2", SubscriptionPatch::default()).await,
            Err(Error::NotFound { .. })
        ));
    }

    // -- Admission --

    #[tokio::test]
    async fn test_credential_admission() {
        let (store, gate) = setup();
        assert!(gate.can_add_credential("u1").await.unwrap());
        seed(&store, tables::CREDENTIALS, "u1", 1).await;
        assert!(!gate.can_add_credential("u1").await.unwrap());
        assert!(matches!(
            gate.ensure_can_add_credential("u1").await,
            Err(Error::LimitExceeded { limit: 1, .. })
        ));

        gate.create_subscription("u1", NewSubscription::open_ended(Tier::Plus))
            .await
            .unwrap();
        assert!(gate.can_add_credential("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_admission() {
        let (store, gate) = setup();
        seed(&store, tables::SESSIONS, "u1", 4).await;
        assert!(gate.can_create_session("u1").await.unwrap());
        seed(&store, tables::SESSIONS, "u1", 1).await;
        assert!(!gate.can_create_session("u1").await.unwrap());
        assert!(gate.ensure_can_create_session("u2").await.is_ok());
    }

    #[tokio::test]
    async fn test_message_capacity() {
        let (store, gate) = setup();
        seed(&store, tables::MESSAGES, "u1", 48).await;
        assert!(gate.ensure_message_capacity("u1", "s1", 2).await.is_ok());
        assert!(matches!(
            gate.ensure_message_capacity("u1", "s1", 3).await,
            Err(Error::LimitExceeded { limit: 50, .. })
        ));
    }
}
