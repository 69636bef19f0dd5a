use crate::catalog::ProviderCatalog;
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::model::{ChatSession, Message, Role, Settings, merge_settings, new_id};
use crate::store::{Filter, Query, Row, Store, WriteOp, from_row, from_rows, patch, tables, to_row};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ENTITY: &str = "ChatSession";

/// Upper bound on conditional-insert attempts when writers in other
/// processes keep claiming the next sequence number first.
const MAX_SEQUENCE_ATTEMPTS: usize = 32;

/// Uniqueness key enforced by the store for messages.
const SEQUENCE_KEY: &[&str] = &["session_id", "sequence_number"];

/// Caller-supplied parameters for a new session. Anything omitted falls back
/// to the provider's defaults.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub provider_id: String,
    pub title: Option<String>,
    pub model_id: Option<String>,
    pub settings: Option<Settings>,
}

impl NewSession {
    pub fn for_provider(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// SessionLedger
// ---------------------------------------------------------------------------

/// Chat sessions and their strictly ordered message sequences.
///
/// Session states: active <-> archived, and deleted (terminal). Deletion
/// removes the messages before the session row.
pub struct SessionLedger {
    store: Arc<dyn Store>,
    credentials: Arc<CredentialStore>,
    catalog: Arc<ProviderCatalog>,
    sequence_locks: KeyedLocks,
}

impl SessionLedger {
    pub fn new(
        store: Arc<dyn Store>,
        credentials: Arc<CredentialStore>,
        catalog: Arc<ProviderCatalog>,
    ) -> Self {
        Self {
            store,
            credentials,
            catalog,
            sequence_locks: KeyedLocks::new(),
        }
    }

    pub async fn create_session(&self, owner_id: &str, new: NewSession) -> Result<ChatSession> {
        if self
            .credentials
            .first_active(owner_id, &new.provider_id)
            .await?
            .is_none()
        {
            return Err(Error::Precondition(
                "No active API key found for this provider. Please add an API key first."
                    .to_string(),
            ));
        }

        let provider = self.catalog.get(&new.provider_id).await?;
        let now = Utc::now();
        let session = ChatSession {
            id: new_id(),
            owner_id: owner_id.to_string(),
            provider_id: provider.id.clone(),
            title: new
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| {
                    format!("Chat with {} - {}", provider.name, now.format("%Y-%m-%d %H:%M"))
                }),
            model_id: new
                .model_id
                .or_else(|| provider.available_models.first().map(|m| m.id.clone())),
            settings: merge_settings(&provider.default_settings, new.settings.as_ref()),
            last_message_at: now,
            is_archived: false,
            created_at: now,
        };
        self.store.insert(tables::SESSIONS, to_row(&session)?).await?;

        info!(session_id = %session.id, owner_id, provider_id = %session.provider_id, "session created");
        Ok(session)
    }

    /// Session owned by `owner_id`; anyone else's is reported as missing.
    pub async fn get_session(&self, id: &str, owner_id: &str) -> Result<ChatSession> {
        let session = self.load(id).await?;
        if session.owner_id != owner_id {
            return Err(Error::not_found(ENTITY, id));
        }
        Ok(session)
    }

    /// Most recently active first.
    pub async fn list_sessions(&self, owner_id: &str, include_archived: bool) -> Result<Vec<ChatSession>> {
        let mut filter = Filter::new().eq("owner_id", owner_id);
        if !include_archived {
            filter = filter.eq("is_archived", false);
        }
        let rows = self
            .store
            .select(tables::SESSIONS, &Query::filtered(filter).desc("last_message_at"))
            .await?;
        from_rows(rows)
    }

    pub async fn archive(&self, id: &str, owner_id: &str) -> Result<ChatSession> {
        self.set_archived(id, owner_id, true).await
    }

    pub async fn unarchive(&self, id: &str, owner_id: &str) -> Result<ChatSession> {
        self.set_archived(id, owner_id, false).await
    }

    pub async fn rename(&self, id: &str, owner_id: &str, title: &str) -> Result<ChatSession> {
        self.get_session(id, owner_id).await?;
        self.write(id, patch([("title", json!(title))])).await
    }

    /// Append one message at the end of the session.
    pub async fn append_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        let _guard = self.sequence_locks.lock(session_id).await;
        let session = self.load(session_id).await?;
        let run = self.insert_run(&session, &[(role, content)], None).await?;
        self.touch(session_id, &run).await?;
        run.into_iter()
            .next()
            .ok_or_else(|| Error::Store(format!("message was not appended to {}", session_id)))
    }

    /// Append a user message and the assistant's reply back to back. Both
    /// rows are written in one batch, so neither is stored without the other.
    pub async fn append_exchange(
        &self,
        session_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<(Message, Message)> {
        self.exchange(session_id, user_content, assistant_content, None)
            .await
    }

    /// Like `append_exchange`, but fails with `Error::LimitExceeded` when the
    /// session would end up holding more than `max_messages`. The check runs
    /// under the session's lock against the last sequence number.
    pub async fn append_exchange_capped(
        &self,
        session_id: &str,
        user_content: &str,
        assistant_content: &str,
        max_messages: u32,
    ) -> Result<(Message, Message)> {
        self.exchange(session_id, user_content, assistant_content, Some(max_messages))
            .await
    }

    /// Ascending by sequence number.
    pub async fn list_messages(&self, session_id: &str, limit: usize, offset: usize) -> Result<Vec<Message>> {
        let rows = self
            .store
            .select(
                tables::MESSAGES,
                &Query::filtered(Filter::new().eq("session_id", session_id))
                    .asc("sequence_number")
                    .page(offset, limit),
            )
            .await?;
        from_rows(rows)
    }

    pub async fn count_messages(&self, session_id: &str) -> Result<usize> {
        let rows = self
            .store
            .select(
                tables::MESSAGES,
                &Query::filtered(Filter::new().eq("session_id", session_id)).columns(&["id"]),
            )
            .await?;
        Ok(rows.len())
    }

    /// Remove the session and every message in it. Messages go first; if that
    /// fails the session row is left untouched.
    pub async fn delete_session(&self, id: &str, owner_id: &str) -> Result<()> {
        let _guard = self.sequence_locks.lock(id).await;
        self.get_session(id, owner_id).await?;

        let removed = self
            .store
            .delete(tables::MESSAGES, &Filter::new().eq("session_id", id))
            .await?;
        self.store
            .delete(
                tables::SESSIONS,
                &Filter::by_id(id).eq("owner_id", owner_id),
            )
            .await?;
        // Appends from other processes may land between the two deletes.
        let late = self
            .store
            .delete(tables::MESSAGES, &Filter::new().eq("session_id", id))
            .await?;
        let removed = removed + late;

        info!(session_id = id, messages = removed, "session deleted");
        Ok(())
    }

    // -- internals --

    async fn load(&self, id: &str) -> Result<ChatSession> {
        let row = self
            .store
            .get_by_id(tables::SESSIONS, id)
            .await?
            .ok_or_else(|| Error::not_found(ENTITY, id))?;
        from_row(row)
    }

    async fn last_message(&self, session_id: &str) -> Result<Option<Message>> {
        let rows = self
            .store
            .select(
                tables::MESSAGES,
                &Query::filtered(Filter::new().eq("session_id", session_id))
                    .desc("sequence_number")
                    .page(0, 1),
            )
            .await?;
        rows.into_iter().next().map(from_row).transpose()
    }

    async fn exchange(
        &self,
        session_id: &str,
        user_content: &str,
        assistant_content: &str,
        max_messages: Option<u32>,
    ) -> Result<(Message, Message)> {
        let _guard = self.sequence_locks.lock(session_id).await;
        let session = self.load(session_id).await?;
        let mut run = self
            .insert_run(
                &session,
                &[(Role::User, user_content), (Role::Assistant, assistant_content)],
                max_messages,
            )
            .await?;
        self.touch(session_id, &run).await?;

        let answer = run.pop();
        let question = run.pop();
        match (question, answer) {
            (Some(question), Some(answer)) => Ok((question, answer)),
            _ => Err(Error::Store(format!(
                "exchange was not appended to {}",
                session_id
            ))),
        }
    }

    /// Read-max-then-insert, guarded by the store's uniqueness on
    /// `(session_id, sequence_number)`. Callers hold the session's lock.
    async fn insert_run(
        &self,
        session: &ChatSession,
        entries: &[(Role, &str)],
        max_messages: Option<u32>,
    ) -> Result<Vec<Message>> {
        for attempt in 1..=MAX_SEQUENCE_ATTEMPTS {
            let (mut sequence_number, mut parent_message_id) =
                match self.last_message(&session.id).await? {
                    Some(m) => (m.sequence_number, Some(m.id)),
                    None => (0, None),
                };
            // Sequence numbers are gap-free, so the last one is the count.
            if let Some(limit) = max_messages {
                if sequence_number + entries.len() as i64 > i64::from(limit) {
                    return Err(Error::LimitExceeded {
                        resource: "messages per session",
                        limit,
                    });
                }
            }

            let created_at = Utc::now();
            let mut run = Vec::with_capacity(entries.len());
            for (role, content) in entries {
                sequence_number += 1;
                let message = Message {
                    id: new_id(),
                    session_id: session.id.clone(),
                    role: *role,
                    content: content.to_string(),
                    sequence_number,
                    parent_message_id: parent_message_id.take(),
                    created_at,
                };
                parent_message_id = Some(message.id.clone());
                run.push(message);
            }

            match self.write_run(&run).await {
                Ok(()) => {
                    debug!(session_id = %session.id, last = sequence_number, count = run.len(), "messages appended");
                    return Ok(run);
                }
                Err(Error::Conflict { .. }) => {
                    debug!(session_id = %session.id, sequence_number, attempt, "sequence number taken, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Store(format!(
            "could not assign a sequence number in session {} after {} attempts",
            session.id, MAX_SEQUENCE_ATTEMPTS
        )))
    }

    async fn write_run(&self, run: &[Message]) -> Result<()> {
        if let [message] = run {
            self.store
                .insert_unique(tables::MESSAGES, to_row(message)?, SEQUENCE_KEY)
                .await?;
            return Ok(());
        }
        let ops = run
            .iter()
            .map(|m| -> Result<WriteOp> {
                Ok(WriteOp::InsertUnique {
                    table: tables::MESSAGES.to_string(),
                    row: to_row(m)?,
                    key_columns: SEQUENCE_KEY.iter().map(|c| c.to_string()).collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.store.apply_atomic(ops).await
    }

    /// Advance `last_message_at` to the newest message in `run`; the store
    /// never moves it backwards. If the session was deleted meanwhile the run
    /// is withdrawn and the append reports the session as missing.
    async fn touch(&self, session_id: &str, run: &[Message]) -> Result<()> {
        let Some(newest) = run.last() else {
            return Ok(());
        };
        let matched = self
            .store
            .update_max(
                tables::SESSIONS,
                &Filter::by_id(session_id),
                "last_message_at",
                json!(newest.created_at),
            )
            .await?;
        if matched > 0 {
            return Ok(());
        }

        for message in run {
            self.store
                .delete(tables::MESSAGES, &Filter::by_id(&message.id))
                .await?;
        }
        warn!(session_id, withdrawn = run.len(), "session deleted during append");
        Err(Error::not_found(ENTITY, session_id))
    }

    async fn set_archived(&self, id: &str, owner_id: &str, archived: bool) -> Result<ChatSession> {
        self.get_session(id, owner_id).await?;
        let session = self.write(id, patch([("is_archived", json!(archived))])).await?;
        info!(session_id = id, archived, "session archive state changed");
        Ok(session)
    }

    async fn write(&self, id: &str, row: Row) -> Result<ChatSession> {
        let rows = self
            .store
            .update(tables::SESSIONS, row, &Filter::by_id(id))
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
