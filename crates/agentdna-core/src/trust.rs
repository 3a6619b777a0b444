//! Trust results and the issues that degrade them.
//!
//! A [`TrustResult`] can only be produced inside this crate by the verifier, and once an
//! issue has set `verified = false` nothing flips it back. Callers decide what to do with a
//! degraded result by inspecting [`TrustResult::status`] and [`TrustResult::trust_issues`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{Envelope, EnvelopeKind, Payload};
use crate::error::{Error, Result};
use crate::hashing::Hash;
use crate::identity::Did;

/// Verification rigor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Signature only.
    #[default]
    Light,
    /// Signature, timestamp freshness and nonce replay.
    Heavy,
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Light => "light",
            Self::Heavy => "heavy",
        })
    }
}

impl FromStr for VerifyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "heavy" => Ok(Self::Heavy),
            other => Err(Error::Config(format!(
                "unknown verify mode {other:?} (expected light or heavy)"
            ))),
        }
    }
}

/// One reason a result is not fully trusted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum TrustIssue {
    MalformedEnvelope {
        reason: String,
    },
    UnknownSigner {
        signer_id: String,
        reason: String,
    },
    InvalidSignature,
    StaleTimestamp {
        age_secs: i64,
        bound_secs: u64,
    },
    FutureTimestamp {
        ahead_secs: i64,
        skew_secs: u64,
    },
    ReplayDetected {
        nonce: String,
    },
    UnexpectedKind {
        expected: EnvelopeKind,
        actual: EnvelopeKind,
    },
    OriginalMessageMismatch {
        expected: String,
        actual: String,
    },
}

impl TrustIssue {
    pub fn kind(&self) -> TrustIssueKind {
        match self {
            Self::MalformedEnvelope { .. } => TrustIssueKind::MalformedEnvelope,
            Self::UnknownSigner { .. } => TrustIssueKind::UnknownSigner,
            Self::InvalidSignature => TrustIssueKind::InvalidSignature,
            Self::StaleTimestamp { .. } => TrustIssueKind::StaleTimestamp,
            Self::FutureTimestamp { .. } => TrustIssueKind::FutureTimestamp,
            Self::ReplayDetected { .. } => TrustIssueKind::ReplayDetected,
            Self::UnexpectedKind { .. } => TrustIssueKind::UnexpectedKind,
            Self::OriginalMessageMismatch { .. } => TrustIssueKind::OriginalMessageMismatch,
        }
    }
}

impl fmt::Display for TrustIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedEnvelope { reason } => write!(f, "malformed envelope: {reason}"),
            Self::UnknownSigner { signer_id, reason } => {
                write!(f, "unknown signer {signer_id}: {reason}")
            }
            Self::InvalidSignature => f.write_str("invalid signature"),
            Self::StaleTimestamp {
                age_secs,
                bound_secs,
            } => write!(f, "timestamp is {age_secs}s old (bound {bound_secs}s)"),
            Self::FutureTimestamp {
                ahead_secs,
                skew_secs,
            } => write!(
                f,
                "timestamp is {ahead_secs}s in the future (allowed skew {skew_secs}s)"
            ),
            Self::ReplayDetected { nonce } => write!(f, "nonce {nonce} already seen"),
            Self::UnexpectedKind { expected, actual } => {
                write!(f, "expected {expected}, got {actual}")
            }
            Self::OriginalMessageMismatch { .. } => {
                f.write_str("original message differs from the one sent")
            }
        }
    }
}

/// Fieldless mirror of [`TrustIssue`] for filtering and summaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustIssueKind {
    MalformedEnvelope,
    UnknownSigner,
    InvalidSignature,
    StaleTimestamp,
    FutureTimestamp,
    ReplayDetected,
    UnexpectedKind,
    OriginalMessageMismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustStatus {
    /// Verified with no issues.
    #[serde(rename = "ok")]
    Trusted,
    /// Verified, but with reported issues.
    Degraded,
    Rejected,
}

impl TrustStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trusted => "ok",
            Self::Degraded => "degraded",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of verifying one inbound envelope.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrustResult {
    verified: bool,
    trust_issues: Vec<TrustIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<EnvelopeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signer_id: Option<Did>,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_block: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<Map<String, Value>>,
    envelope_hash: Hash,
    verify_mode: VerifyMode,
}

impl TrustResult {
    /// Nothing could be decoded; only the hash of the raw bytes is known.
    pub(crate) fn malformed(reason: String, raw_hash: Hash, mode: VerifyMode) -> Self {
        Self {
            verified: false,
            trust_issues: vec![TrustIssue::MalformedEnvelope { reason }],
            kind: None,
            signer_id: None,
            original_message: None,
            host_block: None,
            response: None,
            extra: None,
            envelope_hash: raw_hash,
            verify_mode: mode,
        }
    }

    /// A decoded envelope with its extracted content, not yet degraded by any issue.
    pub(crate) fn for_envelope(envelope: &Envelope, envelope_hash: Hash, mode: VerifyMode) -> Self {
        let (response, extra) = match envelope.payload() {
            Payload::AgentResponse(p) => (
                Some(p.response.clone()),
                (!p.extra.is_empty()).then(|| p.extra.clone()),
            ),
            Payload::HostRequest(_) => (None, None),
        };
        Self {
            verified: true,
            trust_issues: Vec::new(),
            kind: Some(envelope.kind()),
            signer_id: Some(envelope.signer_id().clone()),
            original_message: Some(envelope.original_message().to_string()),
            host_block: envelope.host_block().cloned(),
            response,
            extra,
            envelope_hash,
            verify_mode: mode,
        }
    }

    /// Record an issue without changing `verified`.
    pub(crate) fn flag(&mut self, issue: TrustIssue) {
        self.trust_issues.push(issue);
    }

    /// Record an issue and mark the result unverified.
    pub(crate) fn reject(&mut self, issue: TrustIssue) {
        self.verified = false;
        self.trust_issues.push(issue);
    }

    /// Drop extracted content that cannot be attributed to the signer.
    pub(crate) fn withhold_content(&mut self) {
        self.original_message = None;
        self.host_block = None;
        self.response = None;
        self.extra = None;
    }

    pub fn verified(&self) -> bool {
        self.verified
    }

    pub fn trust_issues(&self) -> &[TrustIssue] {
        &self.trust_issues
    }

    pub fn issue_kinds(&self) -> Vec<TrustIssueKind> {
        self.trust_issues.iter().map(TrustIssue::kind).collect()
    }

    pub fn has_issue(&self, kind: TrustIssueKind) -> bool {
        self.trust_issues.iter().any(|issue| issue.kind() == kind)
    }

    /// The only fully-trusted state: verified with no issues.
    pub fn is_fully_trusted(&self) -> bool {
        self.verified && self.trust_issues.is_empty()
    }

    pub fn status(&self) -> TrustStatus {
        match (self.verified, self.trust_issues.is_empty()) {
            (true, true) => TrustStatus::Trusted,
            (true, false) => TrustStatus::Degraded,
            (false, _) => TrustStatus::Rejected,
        }
    }

    pub fn kind(&self) -> Option<EnvelopeKind> {
        self.kind
    }

    pub fn signer_id(&self) -> Option<&Did> {
        self.signer_id.as_ref()
    }

    pub fn original_message(&self) -> Option<&str> {
        self.original_message.as_deref()
    }

    pub fn host_block(&self) -> Option<&Map<String, Value>> {
        self.host_block.as_ref()
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn extra(&self) -> Option<&Map<String, Value>> {
        self.extra.as_ref()
    }

    pub fn envelope_hash(&self) -> &Hash {
        &self.envelope_hash
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256;

    fn blank() -> TrustResult {
        TrustResult::malformed("x".into(), sha256(b"x"), VerifyMode::Light)
    }

    #[test]
    fn verify_mode_parses_case_insensitively() {
        assert_eq!("HEAVY".parse::<VerifyMode>().unwrap(), VerifyMode::Heavy);
        assert_eq!(" light ".parse::<VerifyMode>().unwrap(), VerifyMode::Light);
        assert!("paranoid".parse::<VerifyMode>().is_err());
        assert_eq!(VerifyMode::default(), VerifyMode::Light);
    }

    #[test]
    fn malformed_result_is_rejected_and_empty() {
        let result = blank();
        assert!(!result.verified());
        assert_eq!(result.status(), TrustStatus::Rejected);
        assert_eq!(result.issue_kinds(), vec![TrustIssueKind::MalformedEnvelope]);
        assert!(result.original_message().is_none());
        assert!(result.kind().is_none());
    }

    #[test]
    fn flag_degrades_but_reject_rejects() {
        let mut result = blank();
        result.verified = true;
        result.trust_issues.clear();
        assert_eq!(result.status(), TrustStatus::Trusted);

        result.flag(TrustIssue::StaleTimestamp {
            age_secs: 400,
            bound_secs: 300,
        });
        assert!(result.verified());
        assert_eq!(result.status(), TrustStatus::Degraded);
        assert!(!result.is_fully_trusted());

        result.reject(TrustIssue::ReplayDetected { nonce: "n".into() });
        assert_eq!(result.status(), TrustStatus::Rejected);
        assert!(result.has_issue(TrustIssueKind::ReplayDetected));
        assert_eq!(
            result.issue_kinds(),
            vec![TrustIssueKind::StaleTimestamp, TrustIssueKind::ReplayDetected]
        );
    }

    #[test]
    fn issues_serialize_with_tag() {
        let issue = TrustIssue::UnexpectedKind {
            expected: EnvelopeKind::HostRequest,
            actual: EnvelopeKind::AgentResponse,
        };
        assert_eq!(
            serde_json::to_value(&issue).unwrap(),
            serde_json::json!({
                "issue": "unexpected_kind",
                "expected": "host_request",
                "actual": "agent_response",
            })
        );
        assert_eq!(
            serde_json::to_value(TrustIssue::InvalidSignature).unwrap(),
            serde_json::json!({"issue": "invalid_signature"})
        );
        assert_eq!(
            serde_json::to_value(TrustStatus::Trusted).unwrap(),
            serde_json::json!("ok")
        );
    }
}
