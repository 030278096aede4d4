//! Error types for external services.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Trade {id} is not newer than the stored watermark {last_id}")]
    NonMonotonicTrade { id: i64, last_id: i64 },

    #[error("Unsupported storage connection string: {0}")]
    UnsupportedStorage(String),
}

impl Error {
    /// True when the remote service could not be reached or refused the
    /// request at the HTTP level, as opposed to answering with something
    /// we could not use.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Error::Http(e) => !e.is_decode(),
            Error::Api { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
