use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Free-form provider/session settings (temperature, max_tokens, ...).
pub type Settings = Map<String, Value>;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shallow merge: keys in `overrides` win.
pub fn merge_settings(base: &Settings, overrides: Option<&Settings>) -> Settings {
    let mut merged = base.clone();
    if let Some(overrides) = overrides {
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

// ---------------------------------------------------------------------------
// Credentials and providers
// ---------------------------------------------------------------------------

/// A user's encrypted API key for one provider.
/// Only the ciphertext is ever stored; the plaintext lives in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub owner_id: String,
    pub provider_id: String,
    pub ciphertext: String,
    pub display_name: String,
    pub is_active: bool,
    /// Accumulated metrics: `total_tokens`, `total_cost`, `usage_<YYYY-MM-DD>`.
    #[serde(default)]
    pub usage_stats: BTreeMap<String, f64>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn total_tokens(&self) -> f64 {
        self.usage_stats.get("total_tokens").copied().unwrap_or(0.0)
    }

    pub fn total_cost(&self) -> f64 {
        self.usage_stats.get("total_cost").copied().unwrap_or(0.0)
    }
}

/// Entry of a provider's `available_models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference data describing an LLM provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub available_models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub default_settings: Settings,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Sessions and messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub owner_id: String,
    pub provider_id: String,
    pub title: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub settings: Settings,
    pub last_message_at: DateTime<Utc>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Immutable once written. `sequence_number` is 1-based and gap-free per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub sequence_number: i64,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// One completed provider call. Append-only.
///
/// `credential_id` may dangle after the credential is deleted; the row is
/// kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub owner_id: String,
    pub credential_id: String,
    pub session_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
    pub request_type: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Subscription level. Declaration order is rank order.
///
/// Unrecognized names deserialize to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Tier {
    Free,
    Plus,
    Premium,
}

impl Tier {
    pub fn rank(self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Plus => 1,
            Tier::Premium => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Plus => "plus",
            Tier::Premium => "premium",
        }
    }
}

impl From<String> for Tier {
    fn from(name: String) -> Self {
        Tier::from(name.as_str())
    }
}

impl From<&str> for Tier {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "plus" => Tier::Plus,
            "premium" => Tier::Premium,
            _ => Tier::Free,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub owner_id: String,
    pub tier: Tier,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(default)]
    pub payment_status: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
