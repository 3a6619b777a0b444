//! Append-only audit ledger anchoring verification outcomes.
//!
//! Backends implement [`AuditLedger`]; callers go through [`LedgerClient`], which bounds every
//! call with a timeout and reports all backend failures as [`Error::LedgerUnavailable`].
//! Ledger failures never change a trust decision that has already been made.

mod http;
mod memory;
mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::EnvelopeKind;
use crate::error::{Error, Result};
use crate::hashing::Hash;
use crate::identity::{AgentId, Did, Identity};
use crate::trust::{TrustIssueKind, TrustResult, TrustStatus, VerifyMode};

pub use http::HttpLedger;
pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Records fetched per page by [`LedgerClient::fetch_history`].
pub const HISTORY_PAGE_SIZE: usize = 100;

/// Ledger-assigned record identifier (UUIDv7, so ids sort by creation time).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::LedgerUnavailable(format!("invalid record id {s:?}: {e}")))
    }
}

/// What the ledger keeps about one verified exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustSummary {
    pub status: TrustStatus,
    pub verified: bool,
    pub trust_issues: Vec<TrustIssueKind>,
    pub verify_mode: VerifyMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EnvelopeKind>,
    /// Signer of the verified envelope, when it could be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_did: Option<Did>,
    /// The local agent that ran the verification.
    pub executor_did: Did,
    pub agent_id: AgentId,
    /// Hash of the request this envelope answers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<Hash>,
}

impl TrustSummary {
    pub fn new(trust: &TrustResult, executor: &Identity, request_hash: Option<Hash>) -> Self {
        Self {
            status: trust.status(),
            verified: trust.verified(),
            trust_issues: trust.issue_kinds(),
            verify_mode: trust.verify_mode(),
            kind: trust.kind(),
            peer_did: trust.signer_id().cloned(),
            executor_did: executor.did().clone(),
            agent_id: executor.agent_id(),
            request_hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Set by the ledger on append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    pub envelope_hash: Hash,
    pub trust_result_summary: TrustSummary,
    pub written_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(envelope_hash: Hash, summary: TrustSummary) -> Self {
        let now = Utc::now();
        let written_at = DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        Self {
            record_id: None,
            envelope_hash,
            trust_result_summary: summary,
            written_at,
        }
    }
}

/// History query. Every set field must match; `since` is inclusive, `until` exclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_id: Option<Did>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        let summary = &record.trust_result_summary;
        if let Some(signer) = &self.signer_id {
            if summary.peer_did.as_ref() != Some(signer) {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if &summary.agent_id != agent_id {
                return false;
            }
        }
        if let Some(verified) = self.verified {
            if summary.verified != verified {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.written_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.written_at >= until {
                return false;
            }
        }
        true
    }
}

/// Storage backend. Records come back in append order.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    fn name(&self) -> &'static str;
    async fn append(&self, record: AuditRecord) -> Result<RecordId>;
    async fn fetch_page(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditRecord>>;
}

/// Timeout-bounded access to an [`AuditLedger`].
#[derive(Clone)]
pub struct LedgerClient {
    ledger: Arc<dyn AuditLedger>,
    timeout: Duration,
}

impl LedgerClient {
    pub fn new(ledger: Arc<dyn AuditLedger>, timeout: Duration) -> Self {
        Self { ledger, timeout }
    }

    pub fn backend(&self) -> &'static str {
        self.ledger.name()
    }

    pub async fn append(&self, record: AuditRecord) -> Result<RecordId> {
        let envelope_hash = record.envelope_hash;
        let id = self.bounded("append", self.ledger.append(record)).await?;
        tracing::info!(
            backend = self.ledger.name(),
            record_id = %id,
            envelope_hash = %envelope_hash,
            "Appended audit record"
        );
        Ok(id)
    }

    pub async fn fetch_page(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        self.bounded("fetch", self.ledger.fetch_page(filter, offset, limit))
            .await
    }

    /// Lazily page through every record matching `filter`.
    ///
    /// The stream ends after the first short page. Calling this again starts over from the
    /// oldest record.
    pub fn fetch_history(&self, filter: AuditFilter) -> BoxStream<'static, Result<AuditRecord>> {
        let client = self.clone();
        stream::try_unfold(Some(0usize), move |offset| {
            let client = client.clone();
            let filter = filter.clone();
            async move {
                let Some(offset) = offset else {
                    return Ok::<_, Error>(None);
                };
                let page = client
                    .fetch_page(&filter, offset, HISTORY_PAGE_SIZE)
                    .await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = (page.len() == HISTORY_PAGE_SIZE).then_some(offset + page.len());
                Ok(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, Error>)))
        .try_flatten()
        .boxed()
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(Error::LedgerUnavailable(reason))) => Err(Error::LedgerUnavailable(reason)),
            Ok(Err(other)) => Err(Error::LedgerUnavailable(format!(
                "{} {operation} failed: {other}",
                self.ledger.name()
            ))),
            Err(_) => Err(Error::LedgerUnavailable(format!(
                "{} {operation} timed out after {}ms",
                self.ledger.name(),
                self.timeout.as_millis()
            ))),
        }
    }
}

impl fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerClient")
            .field("backend", &self.ledger.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
