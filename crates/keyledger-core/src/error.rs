use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Tier limit reached: {resource} is capped at {limit} on the current plan")]
    LimitExceeded { resource: &'static str, limit: u32 },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unique constraint violated on {table}: {detail}")]
    Conflict { table: String, detail: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("Malformed row: {}", e))
    }
}
