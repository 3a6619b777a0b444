use std::sync::Arc;

use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

use super::{expect_state, CoordinatorState, Role};
use crate::builder::{BuildInput, EnvelopeBuilder};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{Error, Result};
use crate::hashing::Hash;
use crate::identity::Identity;
use crate::ledger::{AuditFilter, AuditRecord, LedgerClient, RecordId, TrustSummary};
use crate::trust::{TrustIssue, TrustResult, VerifyMode};
use crate::verifier::Verifier;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostOptions {
    pub default_mode: VerifyMode,
    /// Anchor every verified response in the ledger.
    pub execute_audit: bool,
    /// Fail the turn when the ledger append fails instead of logging and continuing.
    pub require_audit: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            default_mode: VerifyMode::Light,
            execute_audit: false,
            require_audit: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "audit", content = "detail", rename_all = "snake_case")]
pub enum AuditOutcome {
    Recorded(RecordId),
    Skipped,
    Failed(String),
}

/// Result of one host turn.
#[derive(Clone, Debug, Serialize)]
pub struct HostOutcome {
    pub trust: TrustResult,
    pub audit: AuditOutcome,
}

struct PendingRequest {
    original_message: String,
    envelope_hash: Hash,
}

/// Host side: sends requests, verifies agent responses and anchors the outcome.
pub struct HostCoordinator {
    builder: EnvelopeBuilder,
    verifier: Verifier,
    ledger: Option<LedgerClient>,
    options: HostOptions,
    state: CoordinatorState,
    pending: Option<PendingRequest>,
}

impl HostCoordinator {
    pub fn new(
        identity: Arc<Identity>,
        verifier: Verifier,
        ledger: Option<LedgerClient>,
        options: HostOptions,
    ) -> Self {
        Self {
            builder: EnvelopeBuilder::new(identity),
            verifier,
            ledger,
            options,
            state: CoordinatorState::Idle,
            pending: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn identity(&self) -> &Arc<Identity> {
        self.builder.identity()
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// Build and sign a `host_request`. The caller ships it over its own transport.
    pub fn send_request(
        &mut self,
        original_message: impl Into<String>,
        state: Value,
    ) -> Result<Envelope> {
        self.send(BuildInput::host(original_message, state))
    }

    pub(super) fn send(&mut self, input: BuildInput) -> Result<Envelope> {
        expect_state(self.state, CoordinatorState::Idle, "send a request")?;
        self.transition(CoordinatorState::Building);

        let original_message = match &input {
            BuildInput::Host {
                original_message, ..
            } => original_message.clone(),
            BuildInput::Remote { .. } => {
                self.reset();
                return Err(Error::RoleViolation {
                    role: Role::Host,
                    operation: "build agent responses",
                });
            }
        };

        let envelope = match self.builder.build(input).and_then(|e| Ok((e.hash()?, e))) {
            Ok((envelope_hash, envelope)) => {
                self.pending = Some(PendingRequest {
                    original_message,
                    envelope_hash,
                });
                envelope
            }
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        self.transition(CoordinatorState::AwaitingPeer);
        Ok(envelope)
    }

    /// Verify the agent's response to the pending request and, if enabled, anchor it.
    pub async fn receive_response(
        &mut self,
        raw: &[u8],
        mode: Option<VerifyMode>,
    ) -> Result<HostOutcome> {
        expect_state(self.state, CoordinatorState::AwaitingPeer, "receive a response")?;
        self.transition(CoordinatorState::Verifying);

        let mode = mode.unwrap_or(self.options.default_mode);
        let mut trust = match self
            .verifier
            .handle(raw, mode, Some(EnvelopeKind::AgentResponse))
            .await
        {
            Ok(trust) => trust,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        let Some(pending) = self.pending.take() else {
            self.reset();
            return Err(Error::InvalidTransition {
                state: CoordinatorState::Verifying,
                operation: "receive a response without a pending request",
            });
        };
        if let Some(echoed) = trust.original_message() {
            if echoed != pending.original_message {
                let actual = echoed.to_string();
                trust.reject(TrustIssue::OriginalMessageMismatch {
                    expected: pending.original_message.clone(),
                    actual,
                });
            }
        }

        let audit = if self.options.execute_audit {
            self.transition(CoordinatorState::Audited);
            match self.anchor(&trust, Some(pending.envelope_hash)).await {
                Ok(id) => AuditOutcome::Recorded(id),
                Err(e) if self.options.require_audit => {
                    self.reset();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Audit append failed; continuing without anchor");
                    AuditOutcome::Failed(e.to_string())
                }
            }
        } else {
            AuditOutcome::Skipped
        };

        self.reset();
        Ok(HostOutcome { trust, audit })
    }

    /// Anchor an already verified envelope explicitly.
    pub async fn append_audit(&self, envelope: &Envelope, trust: &TrustResult) -> Result<RecordId> {
        let envelope_hash = envelope.hash()?;
        if trust.envelope_hash() != &envelope_hash {
            return Err(Error::AuditMismatch(envelope_hash.to_string()));
        }
        self.anchor(trust, None).await
    }

    pub fn fetch_audit_history(
        &self,
        filter: AuditFilter,
    ) -> Result<BoxStream<'static, Result<AuditRecord>>> {
        Ok(self.ledger()?.fetch_history(filter))
    }

    /// Drop any pending request and return to idle.
    pub fn abandon(&mut self) {
        if self.state != CoordinatorState::Idle {
            tracing::debug!(state = %self.state, "Abandoning host turn");
        }
        self.reset();
    }

    fn ledger(&self) -> Result<&LedgerClient> {
        self.ledger
            .as_ref()
            .ok_or_else(|| Error::LedgerUnavailable("no audit ledger configured".into()))
    }

    async fn anchor(&self, trust: &TrustResult, request_hash: Option<Hash>) -> Result<RecordId> {
        let ledger = self.ledger()?;
        let summary = TrustSummary::new(trust, self.builder.identity(), request_hash);
        ledger
            .append(AuditRecord::new(*trust.envelope_hash(), summary))
            .await
    }

    fn transition(&mut self, next: CoordinatorState) {
        tracing::debug!(role = "host", from = %self.state, to = %next, "Coordinator transition");
        self.state = next;
    }

    fn reset(&mut self) {
        self.pending = None;
        self.state = CoordinatorState::Idle;
    }
}
