//! Inbound envelope verification.
//!
//! [`Verifier::handle`] decodes raw bytes and resolves the signer (the only async step), then
//! hands off to [`Verifier::assess`], a synchronous decision over the decoded envelope, the
//! resolved key and an explicit clock reading. Checks run in a fixed order:
//!
//! 1. decode, else `MalformedEnvelope` (stop)
//! 2. resolve `signer_id`, else `UnknownSigner` (stop)
//! 3. signature over the recomputed canonical bytes, else `InvalidSignature` (stop, any mode)
//! 4. heavy mode only: freshness (`StaleTimestamp`, `FutureTimestamp`) and nonce replay
//! 5. expected kind, else `UnexpectedKind`
//!
//! Replay checks only see envelopes whose signature is valid, so forged traffic cannot fill
//! the nonce window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::codec;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{Error, Result};
use crate::hashing::{sha256, Hash};
use crate::identity::{resolve_public_key, KeyResolver, PublicKey};
use crate::replay::NonceWindow;
use crate::trust::{TrustIssue, TrustResult, VerifyMode};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Age beyond which a timestamp is stale.
    pub staleness_bound: Duration,
    /// How far ahead of the local clock a timestamp may be.
    pub max_clock_skew: Duration,
    pub replay_window_size: usize,
    /// Treat a stale timestamp as a rejection instead of a reported issue.
    pub reject_stale: bool,
    pub resolution_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            staleness_bound: Duration::from_secs(300),
            max_clock_skew: Duration::from_secs(30),
            replay_window_size: 4096,
            reject_stale: false,
            resolution_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Verifier {
    config: VerifierConfig,
    resolver: Arc<dyn KeyResolver>,
    nonces: Arc<NonceWindow>,
}

impl Verifier {
    pub fn new(config: VerifierConfig, resolver: Arc<dyn KeyResolver>) -> Self {
        let nonces = Arc::new(NonceWindow::new(config.replay_window_size));
        Self::with_nonce_window(config, resolver, nonces)
    }

    /// Share one replay window between several verifiers.
    pub fn with_nonce_window(
        config: VerifierConfig,
        resolver: Arc<dyn KeyResolver>,
        nonces: Arc<NonceWindow>,
    ) -> Self {
        Self {
            config,
            resolver,
            nonces,
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn nonce_window(&self) -> &Arc<NonceWindow> {
        &self.nonces
    }

    /// Verify raw envelope bytes against the current clock.
    ///
    /// Decode, signature and policy problems are reported inside the returned
    /// [`TrustResult`]. The only error is [`Error::ResolutionTimeout`].
    pub async fn handle(
        &self,
        raw: &[u8],
        mode: VerifyMode,
        expected_kind: Option<EnvelopeKind>,
    ) -> Result<TrustResult> {
        self.handle_at(raw, mode, expected_kind, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        raw: &[u8],
        mode: VerifyMode,
        expected_kind: Option<EnvelopeKind>,
        now: DateTime<Utc>,
    ) -> Result<TrustResult> {
        let envelope = match codec::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = match e {
                    Error::MalformedEnvelope(reason) => reason,
                    other => other.to_string(),
                };
                tracing::warn!(reason = %reason, "Rejected malformed envelope");
                return Ok(TrustResult::malformed(reason, sha256(raw), mode));
            }
        };
        let envelope_hash = match envelope.hash() {
            Ok(hash) => hash,
            Err(e) => return Ok(TrustResult::malformed(e.to_string(), sha256(raw), mode)),
        };

        let signer = envelope.signer_id();
        let key = match resolve_public_key(
            self.resolver.as_ref(),
            signer,
            self.config.resolution_timeout,
        )
        .await
        {
            Ok(key) => key,
            Err(e @ Error::ResolutionTimeout { .. }) => {
                tracing::warn!(signer = %signer, error = %e, "Signer resolution timed out");
                return Err(e);
            }
            Err(e) => {
                let reason = match e {
                    Error::UnknownSigner(reason) => reason,
                    other => other.to_string(),
                };
                tracing::warn!(signer = %signer, reason = %reason, "Rejected envelope from unknown signer");
                let mut result = TrustResult::for_envelope(&envelope, envelope_hash, mode);
                result.reject(TrustIssue::UnknownSigner {
                    signer_id: signer.to_string(),
                    reason,
                });
                return Ok(result);
            }
        };

        Ok(self.assess_hashed(&envelope, envelope_hash, &key, mode, expected_kind, now))
    }

    /// The synchronous trust decision for an already decoded envelope and resolved key.
    pub fn assess(
        &self,
        envelope: &Envelope,
        key: &PublicKey,
        mode: VerifyMode,
        expected_kind: Option<EnvelopeKind>,
        now: DateTime<Utc>,
    ) -> TrustResult {
        match envelope.hash() {
            Ok(hash) => self.assess_hashed(envelope, hash, key, mode, expected_kind, now),
            Err(e) => {
                let fallback = sha256(envelope.original_message().as_bytes());
                TrustResult::malformed(e.to_string(), fallback, mode)
            }
        }
    }

    fn assess_hashed(
        &self,
        envelope: &Envelope,
        envelope_hash: Hash,
        key: &PublicKey,
        mode: VerifyMode,
        expected_kind: Option<EnvelopeKind>,
        now: DateTime<Utc>,
    ) -> TrustResult {
        let mut result = TrustResult::for_envelope(envelope, envelope_hash, mode);

        if !envelope.signer_id().matches_key(key) {
            result.reject(TrustIssue::UnknownSigner {
                signer_id: envelope.signer_id().to_string(),
                reason: "supplied key does not belong to signer_id".into(),
            });
            return result;
        }

        let signature_ok = match envelope.signing_bytes() {
            Ok(bytes) => key.verify(&bytes, envelope.signature()),
            Err(_) => false,
        };
        if !signature_ok {
            tracing::warn!(
                signer = %envelope.signer_id(),
                envelope_hash = %envelope_hash,
                "Rejected envelope with invalid signature"
            );
            result.reject(TrustIssue::InvalidSignature);
            result.withhold_content();
            return result;
        }

        if mode == VerifyMode::Heavy {
            self.check_freshness(envelope, now, &mut result);
            if !self
                .nonces
                .check_and_insert(envelope.signer_id().as_str(), envelope.nonce())
            {
                result.reject(TrustIssue::ReplayDetected {
                    nonce: envelope.nonce().to_string(),
                });
            }
        }

        if let Some(expected) = expected_kind {
            if expected != envelope.kind() {
                result.reject(TrustIssue::UnexpectedKind {
                    expected,
                    actual: envelope.kind(),
                });
            }
        }

        if result.is_fully_trusted() {
            tracing::info!(
                kind = %envelope.kind(),
                signer = %envelope.signer_id(),
                mode = %mode,
                envelope_hash = %envelope_hash,
                "Verified envelope"
            );
        } else {
            tracing::warn!(
                kind = %envelope.kind(),
                signer = %envelope.signer_id(),
                mode = %mode,
                status = %result.status(),
                issues = ?result.issue_kinds(),
                "Envelope trust degraded"
            );
        }
        result
    }

    fn check_freshness(&self, envelope: &Envelope, now: DateTime<Utc>, result: &mut TrustResult) {
        let age_ms = (now - envelope.timestamp()).num_milliseconds();
        let bound_ms = millis(self.config.staleness_bound);
        let skew_ms = millis(self.config.max_clock_skew);

        if age_ms > bound_ms {
            let issue = TrustIssue::StaleTimestamp {
                age_secs: age_ms / 1000,
                bound_secs: self.config.staleness_bound.as_secs(),
            };
            if self.config.reject_stale {
                result.reject(issue);
            } else {
                result.flag(issue);
            }
        } else if -age_ms > skew_ms {
            result.reject(TrustIssue::FutureTimestamp {
                ahead_secs: -age_ms / 1000,
                skew_secs: self.config.max_clock_skew.as_secs(),
            });
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Value};

    use super::*;
    use crate::builder::{BuildInput, EnvelopeBuilder};
    use crate::identity::{Identity, Keypair, PeerDirectory};
    use crate::trust::{TrustIssueKind, TrustStatus};

    struct Fixture {
        builder: EnvelopeBuilder,
        directory: Arc<PeerDirectory>,
    }

    impl Fixture {
        fn new() -> Self {
            let identity = Arc::new(Identity::new("host", Keypair::generate()));
            let directory = Arc::new(PeerDirectory::new());
            directory.register_key(identity.public_key().clone());
            Self {
                builder: EnvelopeBuilder::new(identity),
                directory,
            }
        }

        fn verifier(&self, config: VerifierConfig) -> Verifier {
            Verifier::new(config, self.directory.clone())
        }

        fn host_bytes(&self, now: DateTime<Utc>) -> Vec<u8> {
            self.builder
                .build_at(
                    BuildInput::host("Are you free tomorrow?", json!({"task_id": "t1"})),
                    now,
                )
                .unwrap()
                .to_json_bytes()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn light_round_trip_is_fully_trusted() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig::default());
        let now = Utc::now();
        let result = verifier
            .handle_at(&fx.host_bytes(now), VerifyMode::Light, None, now)
            .await
            .unwrap();

        assert!(result.is_fully_trusted());
        assert_eq!(result.status(), TrustStatus::Trusted);
        assert_eq!(result.original_message(), Some("Are you free tomorrow?"));
        assert_eq!(result.host_block().unwrap()["task_id"], json!("t1"));
        assert_eq!(result.kind(), Some(EnvelopeKind::HostRequest));
    }

    #[tokio::test]
    async fn tampered_payload_fails_signature_in_both_modes() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig::default());
        let now = Utc::now();
        let mut value: Value = serde_json::from_slice(&fx.host_bytes(now)).unwrap();
        value["payload"]["state"]["task_id"] = json!("t2");
        let tampered = serde_json::to_vec(&value).unwrap();

        for mode in [VerifyMode::Light, VerifyMode::Heavy] {
            let result = verifier.handle_at(&tampered, mode, None, now).await.unwrap();
            assert!(!result.verified());
            assert_eq!(result.issue_kinds(), vec![TrustIssueKind::InvalidSignature]);
            assert!(result.original_message().is_none());
            assert!(result.host_block().is_none());
        }
        assert!(verifier.nonce_window().is_empty());
    }

    #[tokio::test]
    async fn replay_detected_only_in_heavy_mode() {
        let fx = Fixture::new();
        let now = Utc::now();
        let bytes = fx.host_bytes(now);

        let light = fx.verifier(VerifierConfig::default());
        for _ in 0..2 {
            let result = light
                .handle_at(&bytes, VerifyMode::Light, None, now)
                .await
                .unwrap();
            assert!(result.is_fully_trusted());
        }

        let heavy = fx.verifier(VerifierConfig::default());
        let first = heavy
            .handle_at(&bytes, VerifyMode::Heavy, None, now)
            .await
            .unwrap();
        assert!(first.is_fully_trusted());
        let second = heavy
            .handle_at(&bytes, VerifyMode::Heavy, None, now)
            .await
            .unwrap();
        assert!(!second.verified());
        assert_eq!(second.issue_kinds(), vec![TrustIssueKind::ReplayDetected]);
        assert_eq!(second.original_message(), Some("Are you free tomorrow?"));
    }

    #[tokio::test]
    async fn stale_timestamp_flagged_under_heavy_only() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig::default());
        let sent = Utc::now() - ChronoDuration::seconds(600);
        let bytes = fx.host_bytes(sent);
        let now = Utc::now();

        let light = verifier
            .handle_at(&bytes, VerifyMode::Light, None, now)
            .await
            .unwrap();
        assert!(light.is_fully_trusted());

        let heavy = verifier
            .handle_at(&bytes, VerifyMode::Heavy, None, now)
            .await
            .unwrap();
        assert!(heavy.verified());
        assert_eq!(heavy.status(), TrustStatus::Degraded);
        assert_eq!(heavy.issue_kinds(), vec![TrustIssueKind::StaleTimestamp]);
    }

    #[tokio::test]
    async fn reject_stale_turns_staleness_into_rejection() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig {
            reject_stale: true,
            ..VerifierConfig::default()
        });
        let now = Utc::now();
        let bytes = fx.host_bytes(now - ChronoDuration::seconds(301));
        let result = verifier
            .handle_at(&bytes, VerifyMode::Heavy, None, now)
            .await
            .unwrap();
        assert!(!result.verified());
        assert!(result.has_issue(TrustIssueKind::StaleTimestamp));
    }

    #[tokio::test]
    async fn future_timestamp_beyond_skew_is_rejected() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig::default());
        let now = Utc::now();

        let slightly_ahead = fx.host_bytes(now + ChronoDuration::seconds(10));
        let ok = verifier
            .handle_at(&slightly_ahead, VerifyMode::Heavy, None, now)
            .await
            .unwrap();
        assert!(ok.is_fully_trusted());

        let far_ahead = fx.host_bytes(now + ChronoDuration::seconds(120));
        let result = verifier
            .handle_at(&far_ahead, VerifyMode::Heavy, None, now)
            .await
            .unwrap();
        assert!(!result.verified());
        assert_eq!(result.issue_kinds(), vec![TrustIssueKind::FutureTimestamp]);
    }

    #[tokio::test]
    async fn unknown_signer_skips_signature_check() {
        let fx = Fixture::new();
        let stranger = EnvelopeBuilder::new(Arc::new(Identity::new("x", Keypair::generate())));
        let envelope = stranger
            .build(BuildInput::host("hello", json!({})))
            .unwrap();
        let mut value: Value = serde_json::from_slice(&envelope.to_json_bytes().unwrap()).unwrap();
        value["signature"] = json!("00".repeat(64));
        let bytes = serde_json::to_vec(&value).unwrap();

        let result = fx
            .verifier(VerifierConfig::default())
            .handle(&bytes, VerifyMode::Heavy, None)
            .await
            .unwrap();
        assert!(!result.verified());
        assert_eq!(result.issue_kinds(), vec![TrustIssueKind::UnknownSigner]);
        assert_eq!(result.original_message(), Some("hello"));
    }

    #[tokio::test]
    async fn unexpected_kind_is_rejected() {
        let fx = Fixture::new();
        let now = Utc::now();
        let result = fx
            .verifier(VerifierConfig::default())
            .handle_at(
                &fx.host_bytes(now),
                VerifyMode::Light,
                Some(EnvelopeKind::AgentResponse),
                now,
            )
            .await
            .unwrap();
        assert!(!result.verified());
        assert_eq!(
            result.trust_issues(),
            &[TrustIssue::UnexpectedKind {
                expected: EnvelopeKind::AgentResponse,
                actual: EnvelopeKind::HostRequest,
            }]
        );
    }

    #[tokio::test]
    async fn malformed_bytes_never_error() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig::default());
        for raw in [
            b"garbage".as_slice(),
            b"{}".as_slice(),
            br#"{"kind":"host_request"}"#.as_slice(),
        ] {
            let result = verifier.handle(raw, VerifyMode::Heavy, None).await.unwrap();
            assert!(!result.verified());
            assert_eq!(result.issue_kinds(), vec![TrustIssueKind::MalformedEnvelope]);
            assert_eq!(result.envelope_hash(), &sha256(raw));
        }
    }

    #[test]
    fn assess_is_synchronous_and_uses_explicit_clock() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig::default());
        let sent = Utc::now();
        let envelope = codec::decode(&fx.host_bytes(sent)).unwrap();
        let key = fx.builder.identity().public_key().clone();

        let fresh = verifier.assess(&envelope, &key, VerifyMode::Heavy, None, sent);
        assert!(fresh.is_fully_trusted());
        assert_eq!(fresh.envelope_hash(), &envelope.hash().unwrap());

        let later = sent + ChronoDuration::hours(1);
        let stale = verifier.assess(&envelope, &key, VerifyMode::Heavy, None, later);
        assert!(stale.has_issue(TrustIssueKind::StaleTimestamp));
        assert!(stale.has_issue(TrustIssueKind::ReplayDetected));
    }

    #[test]
    fn assess_rejects_key_of_other_signer() {
        let fx = Fixture::new();
        let verifier = fx.verifier(VerifierConfig::default());
        let now = Utc::now();
        let envelope = codec::decode(&fx.host_bytes(now)).unwrap();
        let wrong = Keypair::generate().public_key();
        let result = verifier.assess(&envelope, &wrong, VerifyMode::Light, None, now);
        assert_eq!(result.issue_kinds(), vec![TrustIssueKind::UnknownSigner]);
    }
}
