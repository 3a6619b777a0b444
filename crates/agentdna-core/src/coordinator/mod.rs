//! Per-role protocol drivers.
//!
//! A coordinator owns one identity, one verifier and (on the host side) an optional ledger.
//! It walks a small state machine per turn:
//!
//! ```text
//! host:   idle -> building -> awaiting_peer -> verifying -> [audited] -> idle
//! remote: idle -> verifying -> building -> idle
//! ```
//!
//! Operations invoked out of order fail with [`Error::InvalidTransition`]; operations that
//! belong to the other role fail with [`Error::RoleViolation`].

use std::fmt;
use std::str::FromStr;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::builder::BuildInput;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::ledger::{AuditFilter, AuditRecord, RecordId};
use crate::trust::{TrustResult, VerifyMode};

mod host;
mod remote;

pub use host::{AuditOutcome, HostCoordinator, HostOptions, HostOutcome};
pub use remote::{
    InboundRequest, RemoteCoordinator, RemoteOptions, Responder, ServeOutcome,
    HOST_TRUST_ISSUES_KEY,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Remote,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "remote" => Ok(Self::Remote),
            other => Err(Error::Config(format!(
                "unknown role {other:?} (expected host or remote)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Building,
    AwaitingPeer,
    Verifying,
    Audited,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::AwaitingPeer => "awaiting_peer",
            Self::Verifying => "verifying",
            Self::Audited => "audited",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn expect_state(
    current: CoordinatorState,
    expected: CoordinatorState,
    operation: &'static str,
) -> Result<()> {
    if current == expected {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            state: current,
            operation,
        })
    }
}

/// What [`Coordinator::handle`] produced for the configured role.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum HandleOutcome {
    Host(HostOutcome),
    Remote(InboundRequest),
}

impl HandleOutcome {
    pub fn trust(&self) -> &TrustResult {
        match self {
            Self::Host(outcome) => &outcome.trust,
            Self::Remote(inbound) => &inbound.trust,
        }
    }
}

/// Role-erased coordinator, as assembled from configuration.
pub enum Coordinator {
    Host(HostCoordinator),
    Remote(RemoteCoordinator),
}

impl Coordinator {
    pub fn role(&self) -> Role {
        match self {
            Self::Host(_) => Role::Host,
            Self::Remote(_) => Role::Remote,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        match self {
            Self::Host(host) => host.state(),
            Self::Remote(remote) => remote.state(),
        }
    }

    /// Build and sign an outbound envelope for this role.
    pub fn build(&mut self, input: BuildInput) -> Result<Envelope> {
        match self {
            Self::Host(host) => host.send(input),
            Self::Remote(remote) => remote.respond_with(input),
        }
    }

    /// Verify an inbound envelope of the kind this role expects.
    pub async fn handle(&mut self, raw: &[u8], mode: Option<VerifyMode>) -> Result<HandleOutcome> {
        match self {
            Self::Host(host) => host
                .receive_response(raw, mode)
                .await
                .map(HandleOutcome::Host),
            Self::Remote(remote) => remote
                .receive_request(raw, mode)
                .await
                .map(HandleOutcome::Remote),
        }
    }

    pub async fn append_audit(&self, envelope: &Envelope, trust: &TrustResult) -> Result<RecordId> {
        self.host("append audit records")?
            .append_audit(envelope, trust)
            .await
    }

    pub fn fetch_audit_history(
        &self,
        filter: AuditFilter,
    ) -> Result<BoxStream<'static, Result<AuditRecord>>> {
        self.host("fetch audit history")?.fetch_audit_history(filter)
    }

    fn host(&self, operation: &'static str) -> Result<&HostCoordinator> {
        match self {
            Self::Host(host) => Ok(host),
            Self::Remote(_) => Err(Error::RoleViolation {
                role: Role::Remote,
                operation,
            }),
        }
    }
}
