//! Error type for store operations.

use thiserror::Error;

/// Errors raised by the persistent ledger store.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// XDR serialization failure while encoding or decoding a row.
    #[error("XDR error: {0}")]
    Xdr(String),

    /// A stored blob was not valid base64.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A stored key column could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The caller asked for something the store cannot answer.
    #[error("unsupported query: {0}")]
    Unsupported(&'static str),
}

impl From<stellar_xdr::curr::Error> for DbError {
    fn from(e: stellar_xdr::curr::Error) -> Self {
        DbError::Xdr(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;
