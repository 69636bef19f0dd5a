pub mod catalog;
pub mod chat;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod meter;
pub mod model;
pub mod provider;
pub mod store;
pub mod tiers;

mod http;
mod locks;
#[cfg(test)]
mod testing;

pub use catalog::ProviderCatalog;
pub use chat::{ChatReply, ChatService};
pub use codec::{MockCodec, RemoteCodec, SecretCodec, verify_format};
pub use config::Config;
pub use credentials::{CredentialPatch, CredentialStore};
pub use error::{Error, Result};
pub use ledger::{NewSession, SessionLedger};
pub use memory::MemoryStore;
pub use meter::{NewUsage, UsageFilter, UsageMeter, UsageStats};
pub use model::{ChatSession, Credential, Message, Provider, Role, Subscription, Tier, UsageRecord};
pub use provider::{EdgeProviderClient, ProviderClient, ProviderRequest, ProviderResponse};
pub use store::{Filter, Query, Store};
pub use tiers::{NewSubscription, TierGate, TierLimits};
