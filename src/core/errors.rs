// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the supervisor.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait
/// implementations.
#[derive(Error, Debug)]
pub enum StewardError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Store Error: {0}")]
    StoreUnavailable(String),

    #[error("Database Error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Invalid member URL '{0}'")]
    InvalidMemberUrl(String),

    #[error("Subprocess failed: {0}")]
    Subprocess(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl StewardError {
    /// True when the failure came from talking to the consensus store. The HA
    /// cycle treats this class specially: a leader isolates itself to
    /// read-only and lets the lease expire on its own.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            StewardError::StoreUnavailable(_) | StewardError::HttpClient(_)
        )
    }

    /// True when the failure came from the local SQL channel. The cycle logs
    /// it and retries on the next tick.
    pub fn is_database_error(&self) -> bool {
        matches!(self, StewardError::Database(_))
    }
}

// --- From trait implementations for easy error conversion ---

impl From<reqwest::Error> for StewardError {
    fn from(e: reqwest::Error) -> Self {
        StewardError::HttpClient(e.to_string())
    }
}
