//! Error types for agentdna-core operations.
//!
//! Trust problems found while verifying an inbound envelope are *not* errors: they are
//! reported as [`TrustIssue`](crate::TrustIssue)s inside a [`TrustResult`](crate::TrustResult).
//! The variants here cover local and infrastructure failures where no meaningful partial
//! result exists.

use thiserror::Error;

use crate::coordinator::{CoordinatorState, Role};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("identity unavailable for alias {alias:?}: {reason}")]
    IdentityUnavailable { alias: String, reason: String },

    #[error("unknown signer: {0}")]
    UnknownSigner(String),

    #[error("key resolution for {did} timed out after {timeout_ms}ms")]
    ResolutionTimeout { did: String, timeout_ms: u64 },

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("{role} coordinator cannot {operation}")]
    RoleViolation {
        role: Role,
        operation: &'static str,
    },

    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        state: CoordinatorState,
        operation: &'static str,
    },

    #[error("audit ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("trust result does not belong to envelope {0}")]
    AuditMismatch(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid DID: {0}")]
    InvalidDid(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("response generation failed: {0}")]
    Generation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

/// Result type for agentdna-core operations
pub type Result<T> = std::result::Result<T, Error>;
