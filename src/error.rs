//! # Error Taxonomy
//!
//! Storage operations surface a small closed set of error codes. The codes
//! fall into three families with different handling:
//!
//! - **Retry control flow**: [`ErrorCode::MasstreeRetry`] drives the internal
//!   retry loops (stale page version, structure changed under a reader). It
//!   never escapes the public API; the outermost loop converts it into
//!   another descent from the first root.
//! - **Fatal for the operation**: `NoFreePages`, `TooLongPayload`,
//!   `AlreadyExists`. The operation cannot succeed as issued; the caller
//!   typically needs to free pages or change the request.
//! - **Transactional misses**: `KeyNotFound`, `TooShortPayload`,
//!   `TooSmallPayloadBuffer`. The transaction stays open; the caller decides
//!   whether to continue or abort.
//!
//! Engine-level setup APIs (construction, storage creation plumbing) return
//! `eyre::Result` and wrap these codes via `?`; the hot-path record
//! operations return [`StorageResult`] directly so callers can match.

use std::fmt;

/// Result alias for core storage operations.
pub type StorageResult<T> = Result<T, ErrorCode>;

/// Error codes returned by storage operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The engine is not initialized, or has been torn down.
    NotInitialized,
    /// The volatile page pool has no free frames left.
    NoFreePages,
    /// A storage with the requested name or id already exists, or an insert
    /// found a committed record under the key.
    AlreadyExists,
    /// No record exists under the key (or it is logically deleted).
    KeyNotFound,
    /// The payload does not fit in a border page even after a split.
    TooLongPayload,
    /// The record's payload is shorter than the requested offset + count.
    TooShortPayload,
    /// The caller's buffer is smaller than the record's payload.
    TooSmallPayloadBuffer,
    /// A structural change invalidated the traversal; restart from the root.
    /// Internal control flow only.
    MasstreeRetry,
    /// The transaction observed a conflicting concurrent commit and must be
    /// retried by the caller.
    XctRaceAbort,
}

impl ErrorCode {
    /// True for codes that abort the operation but leave the transaction
    /// open and usable.
    pub fn is_transactional_miss(self) -> bool {
        matches!(
            self,
            ErrorCode::KeyNotFound | ErrorCode::TooShortPayload | ErrorCode::TooSmallPayloadBuffer
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorCode::NotInitialized => "engine not initialized",
            ErrorCode::NoFreePages => "volatile page pool exhausted",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::KeyNotFound => "key not found",
            ErrorCode::TooLongPayload => "payload too long for a border page",
            ErrorCode::TooShortPayload => "record payload shorter than requested range",
            ErrorCode::TooSmallPayloadBuffer => "payload buffer too small",
            ErrorCode::MasstreeRetry => "masstree traversal must restart",
            ErrorCode::XctRaceAbort => "transaction aborted by a concurrent conflict",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ErrorCode {}
