//! Error type for the ledger-state engine.
//!
//! Every fallible public operation returns one of these variants; the engine
//! never throws its way through control flow. [`StateError::InvariantViolated`]
//! is the exception in spirit: it reports a broken internal invariant
//! (an exchange crediting over a limit, an unknown key type, a tombstone with
//! no ancestor). A caller that sees it must abandon the enclosing root view;
//! the state it guards can no longer be trusted.

use meridian_common::MathError;
use meridian_db::DbError;
use thiserror::Error;

/// Errors raised by ledger-state views, handles and the store root.
#[derive(Debug, Error)]
pub enum StateError {
    /// `create` found the key already present somewhere on the lookup path.
    #[error("key already exists")]
    KeyExists,

    /// The key does not resolve to a live entry anywhere on the lookup path.
    #[error("key does not exist")]
    NotFound,

    /// The key is already backing a live entry handle in this view.
    #[error("key is active")]
    AlreadyActive,

    /// A header handle is already live in this view.
    #[error("header is active")]
    HeaderActive,

    /// The view has been sealed by a change-set extraction.
    #[error("view is sealed")]
    Sealed,

    /// `unseal_header` was called on a view that was never sealed.
    #[error("view is not sealed")]
    NotSealed,

    /// The view has a live child; only the child may be operated on.
    #[error("view has an active child")]
    HasChild,

    /// The handle's owning view has ended, or the handle was superseded.
    #[error("handle has expired")]
    HandleExpired,

    /// The view was already terminated (committed, rolled back, or closed by
    /// an ancestor's rollback).
    #[error("view is closed")]
    Closed,

    /// Fixed-point arithmetic overflowed in liability or price math.
    #[error("arithmetic overflow")]
    Overflow,

    /// An internal invariant no longer holds. Fatal to the enclosing root.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// The persistent store failed.
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

impl From<MathError> for StateError {
    fn from(e: MathError) -> Self {
        match e {
            MathError::Overflow => StateError::Overflow,
            other => StateError::InvariantViolated(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, StateError>;
