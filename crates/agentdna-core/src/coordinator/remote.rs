use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{expect_state, CoordinatorState, Role};
use crate::builder::{BuildInput, EnvelopeBuilder};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::trust::{TrustIssueKind, TrustResult, VerifyMode};
use crate::verifier::Verifier;

/// Metadata key carrying the issue kinds the remote saw on the host's request.
pub const HOST_TRUST_ISSUES_KEY: &str = "host_trust_issues";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteOptions {
    pub default_mode: VerifyMode,
    /// Produce a response even when the request was not verified, as long as its content
    /// could be extracted.
    pub proceed_on_issues: bool,
}

/// Verified inbound request.
#[derive(Clone, Debug, Serialize)]
pub struct InboundRequest {
    pub trust: TrustResult,
    /// Whether the coordinator is now waiting for [`RemoteCoordinator::respond`].
    pub may_proceed: bool,
}

/// Result of [`RemoteCoordinator::serve`].
#[derive(Clone, Debug, Serialize)]
pub struct ServeOutcome {
    pub trust: TrustResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Envelope>,
}

/// External generation step: turns a verified request into response text.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn generate(&self, request: &TrustResult) -> Result<String>;
}

struct Accepted {
    original_message: String,
    host_block: Option<Map<String, Value>>,
    issues: Vec<Value>,
}

/// Remote side: verifies host requests and signs responses.
pub struct RemoteCoordinator {
    builder: EnvelopeBuilder,
    verifier: Verifier,
    options: RemoteOptions,
    state: CoordinatorState,
    accepted: Option<Accepted>,
}

impl RemoteCoordinator {
    pub fn new(identity: Arc<Identity>, verifier: Verifier, options: RemoteOptions) -> Self {
        Self {
            builder: EnvelopeBuilder::new(identity),
            verifier,
            options,
            state: CoordinatorState::Idle,
            accepted: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn identity(&self) -> &Arc<Identity> {
        self.builder.identity()
    }

    pub fn options(&self) -> &RemoteOptions {
        &self.options
    }

    pub async fn receive_request(
        &mut self,
        raw: &[u8],
        mode: Option<VerifyMode>,
    ) -> Result<InboundRequest> {
        expect_state(self.state, CoordinatorState::Idle, "receive a request")?;
        self.transition(CoordinatorState::Verifying);

        let mode = mode.unwrap_or(self.options.default_mode);
        let trust = match self
            .verifier
            .handle(raw, mode, Some(EnvelopeKind::HostRequest))
            .await
        {
            Ok(trust) => trust,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        // An unidentified signer is never answered, even when its content is readable.
        let extractable = trust.original_message().is_some();
        let identified = !trust.has_issue(TrustIssueKind::UnknownSigner);
        let may_proceed = extractable
            && identified
            && (trust.verified() || self.options.proceed_on_issues);

        if may_proceed {
            let issues = trust
                .issue_kinds()
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            self.accepted = Some(Accepted {
                original_message: trust.original_message().unwrap_or_default().to_string(),
                host_block: trust.host_block().cloned(),
                issues,
            });
            self.transition(CoordinatorState::Building);
        } else {
            tracing::warn!(
                status = %trust.status(),
                issues = ?trust.issue_kinds(),
                "Declining to answer untrusted request"
            );
            self.reset();
        }

        Ok(InboundRequest { trust, may_proceed })
    }

    /// Sign the response to the accepted request, echoing its message and state block.
    pub fn respond(&mut self, response: impl Into<String>) -> Result<Envelope> {
        expect_state(self.state, CoordinatorState::Building, "respond")?;
        let Some(accepted) = self.accepted.take() else {
            self.reset();
            return Err(Error::InvalidTransition {
                state: CoordinatorState::Building,
                operation: "respond without an accepted request",
            });
        };

        let mut extra = Map::new();
        extra.insert(
            HOST_TRUST_ISSUES_KEY.to_string(),
            Value::Array(accepted.issues),
        );
        let input = BuildInput::remote(
            accepted.original_message,
            response,
            accepted.host_block.map(Value::Object).unwrap_or(Value::Null),
        )
        .with_extra(extra);
        self.finish(input)
    }

    /// Sign a caller-shaped response while a request is accepted.
    pub fn respond_with(&mut self, input: BuildInput) -> Result<Envelope> {
        if input.role() != Role::Remote {
            return Err(Error::RoleViolation {
                role: Role::Remote,
                operation: "build host requests",
            });
        }
        expect_state(self.state, CoordinatorState::Building, "respond")?;
        self.accepted = None;
        self.finish(input)
    }

    /// Run a whole remote turn: verify, generate through `responder`, sign.
    pub async fn serve(
        &mut self,
        raw: &[u8],
        mode: Option<VerifyMode>,
        responder: &dyn Responder,
    ) -> Result<ServeOutcome> {
        let inbound = self.receive_request(raw, mode).await?;
        if !inbound.may_proceed {
            return Ok(ServeOutcome {
                trust: inbound.trust,
                response: None,
            });
        }

        let text = match responder.generate(&inbound.trust).await {
            Ok(text) => text,
            Err(e) => {
                self.reset();
                return Err(match e {
                    Error::Generation(_) => e,
                    other => Error::Generation(other.to_string()),
                });
            }
        };
        let envelope = self.respond(text)?;
        Ok(ServeOutcome {
            trust: inbound.trust,
            response: Some(envelope),
        })
    }

    /// Drop an accepted request and return to idle.
    pub fn abandon(&mut self) {
        self.reset();
    }

    fn finish(&mut self, input: BuildInput) -> Result<Envelope> {
        let result = self.builder.build(input);
        self.reset();
        result
    }

    fn transition(&mut self, next: CoordinatorState) {
        tracing::debug!(role = "remote", from = %self.state, to = %next, "Coordinator transition");
        self.state = next;
    }

    fn reset(&mut self) {
        self.accepted = None;
        self.state = CoordinatorState::Idle;
    }
}
