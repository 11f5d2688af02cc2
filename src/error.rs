//! Crate-wide error taxonomy (spec §7).
//!
//! Every fallible state-manager operation returns [`NfsError`]. Variants are
//! grouped by the kind column of the error-handling table in the spec:
//! protocol errors, share-state errors, resource exhaustion, back-channel
//! faults, and store errors (translated from [`crate::store::StoreError`]).

use thiserror::Error;

/// Result alias used throughout the state-manager and dispatcher.
pub type NfsResult<T> = std::result::Result<T, NfsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NfsError {
    // --- Protocol errors ---
    #[error("client id is stale")]
    StaleClientId,
    #[error("sequence id is misordered")]
    SeqMisordered,
    #[error("session does not exist")]
    BadSession,
    #[error("malformed XDR payload")]
    BadXdr,
    #[error("stateid is invalid or superseded")]
    BadStateid,
    #[error("slot sequence mismatch")]
    BadSlot,

    // --- Share-state errors ---
    #[error("share reservation conflicts with an existing open")]
    ShareDenied,
    #[error("lock requested on a file not opened in that mode")]
    OpenMode,
    #[error("open-state has locks outstanding")]
    LocksHeld,
    #[error("requested access/deny is not a subset of the current open")]
    Invalid,

    // --- Resource exhaustion ---
    #[error("resource limit exceeded (e.g. per-client session cap)")]
    Resource,
    #[error("request must be retried; server is momentarily busy")]
    Delay,

    // --- Lock conflicts ---
    #[error("lock range conflicts with another owner")]
    LockConflict,
    #[error("server is in its post-restart grace period")]
    Grace,

    // --- Back-channel faults ---
    #[error("callback timed out")]
    CallbackTimeout,
    #[error("back channel connection closed")]
    CallbackEof,

    // --- Store errors translated per spec §7 ---
    #[error("no such file or directory")]
    NoEnt,
    #[error("I/O error in a backing store")]
    Io,
    #[error("permission denied")]
    Access,
    #[error("cancelled by shutdown or connection close")]
    Cancelled,
}

impl From<crate::store::StoreError> for NfsError {
    fn from(value: crate::store::StoreError) -> Self {
        match value {
            crate::store::StoreError::NotFound => NfsError::NoEnt,
            crate::store::StoreError::Exists => NfsError::Invalid,
            crate::store::StoreError::NotEmpty => NfsError::Invalid,
            crate::store::StoreError::NotDir => NfsError::Invalid,
            crate::store::StoreError::IsDir => NfsError::Invalid,
            crate::store::StoreError::Io => NfsError::Io,
            crate::store::StoreError::Denied => NfsError::Access,
        }
    }
}
