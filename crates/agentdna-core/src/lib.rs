#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! # agentdna-core
//!
//! Signed trust envelopes for host/remote agent conversations.
//!
//! This crate provides:
//! - Ed25519 agent identities with `did:dna:` identifiers and pluggable key resolution
//! - Canonical JSON (RFC 8785) envelope encoding and signing
//! - Light and heavy verification producing a structured [`TrustResult`]
//! - Host and remote coordinators driving one turn of the protocol
//! - An append-only audit ledger with memory, SQLite and HTTP backends
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use agentdna_core::{
//!     BuildInput, EnvelopeBuilder, EnvelopeKind, Identity, Keypair, PeerDirectory, Verifier,
//!     VerifierConfig, VerifyMode,
//! };
//!
//! let host = Arc::new(Identity::new("host", Keypair::generate()));
//! let envelope = EnvelopeBuilder::new(host.clone())
//!     .build(BuildInput::host(
//!         "Are you free tomorrow?",
//!         serde_json::json!({ "task_id": "t1" }),
//!     ))
//!     .unwrap();
//!
//! let verifier = Verifier::new(VerifierConfig::default(), Arc::new(PeerDirectory::new()));
//! let trust = verifier.assess(
//!     &envelope,
//!     host.public_key(),
//!     VerifyMode::Heavy,
//!     Some(EnvelopeKind::HostRequest),
//!     chrono::Utc::now(),
//! );
//! assert!(trust.is_fully_trusted());
//! assert_eq!(trust.original_message(), Some("Are you free tomorrow?"));
//! ```

pub mod builder;
pub mod canonical;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod hashing;
pub mod identity;
pub mod ledger;
pub mod replay;
pub mod trust;
pub mod verifier;

#[cfg(test)]
mod test_support;

pub use builder::{BuildInput, EnvelopeBuilder};
pub use canonical::canonicalize as canonicalize_json;
pub use config::AgentdnaConfig;
pub use coordinator::{
    AuditOutcome, Coordinator, CoordinatorState, HandleOutcome, HostCoordinator, HostOptions,
    HostOutcome, InboundRequest, RemoteCoordinator, RemoteOptions, Responder, Role,
    ServeOutcome,
};
pub use envelope::{Envelope, EnvelopeKind, Payload};
pub use error::{Error, Result};
pub use hashing::{sha256, Hash};
pub use identity::{
    AgentId, Did, FileKeyStore, Identity, KeyResolver, KeyStore, Keypair, MemoryKeyStore,
    PeerDirectory, PublicKey, Signature,
};
pub use ledger::{
    AuditFilter, AuditLedger, AuditRecord, LedgerClient, MemoryLedger, RecordId, SqliteLedger,
    TrustSummary,
};
pub use replay::NonceWindow;
pub use trust::{TrustIssue, TrustIssueKind, TrustResult, TrustStatus, VerifyMode};
pub use verifier::{Verifier, VerifierConfig};

/// Commonly used types
pub mod prelude {
    pub use crate::{
        BuildInput, Coordinator, Did, Envelope, EnvelopeBuilder, EnvelopeKind, Error, Identity,
        Keypair, Result, TrustIssue, TrustResult, Verifier, VerifyMode,
    };
}
