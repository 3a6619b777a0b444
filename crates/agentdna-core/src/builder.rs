//! Outbound envelope construction and signing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec;
use crate::coordinator::Role;
use crate::envelope::{
    AgentResponsePayload, Envelope, HostRequestPayload, Payload, UnsignedEnvelope,
    ENVELOPE_VERSION,
};
use crate::error::{Error, Result};
use crate::identity::Identity;

/// Conversation identifiers guaranteed on every host request's `state`.
pub const CONVERSATION_KEYS: [&str; 2] = ["task_id", "context_id"];

/// Role-specific inputs to [`EnvelopeBuilder::build`].
#[derive(Clone, Debug, PartialEq)]
pub enum BuildInput {
    Host {
        original_message: String,
        /// Must be a JSON object.
        state: Value,
    },
    Remote {
        original_message: String,
        response: String,
        /// Must be a JSON object or `null`.
        host_block: Value,
        extra: Map<String, Value>,
    },
}

impl BuildInput {
    pub fn host(original_message: impl Into<String>, state: Value) -> Self {
        Self::Host {
            original_message: original_message.into(),
            state,
        }
    }

    pub fn remote(
        original_message: impl Into<String>,
        response: impl Into<String>,
        host_block: Value,
    ) -> Self {
        Self::Remote {
            original_message: original_message.into(),
            response: response.into(),
            host_block,
            extra: Map::new(),
        }
    }

    /// Attach response metadata. Ignored for host inputs.
    pub fn with_extra(mut self, extra_fields: Map<String, Value>) -> Self {
        if let Self::Remote { extra, .. } = &mut self {
            *extra = extra_fields;
        }
        self
    }

    /// The role allowed to build this input.
    pub fn role(&self) -> Role {
        match self {
            Self::Host { .. } => Role::Host,
            Self::Remote { .. } => Role::Remote,
        }
    }
}

/// Signs envelopes with the local identity. Pure apart from clock and nonce generation.
#[derive(Clone, Debug)]
pub struct EnvelopeBuilder {
    identity: Arc<Identity>,
}

impl EnvelopeBuilder {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn build(&self, input: BuildInput) -> Result<Envelope> {
        self.build_at(input, Utc::now())
    }

    /// Build with an explicit timestamp (truncated to milliseconds).
    pub fn build_at(&self, input: BuildInput, now: DateTime<Utc>) -> Result<Envelope> {
        let (original_message, payload) = shape_payload(input)?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis())
            .ok_or_else(|| Error::SigningFailed(format!("timestamp {now} out of range")))?;

        let unsigned = UnsignedEnvelope {
            version: ENVELOPE_VERSION,
            original_message,
            payload,
            signer_id: self.identity.did().clone(),
            timestamp,
            nonce: Uuid::new_v4().to_string(),
        };

        let bytes = codec::encode(&unsigned).map_err(|e| Error::SigningFailed(e.to_string()))?;
        let signature = self.identity.sign(&bytes).map_err(|e| match e {
            Error::SigningFailed(_) => e,
            other => Error::SigningFailed(other.to_string()),
        })?;
        if !self.identity.public_key().verify(&bytes, &signature) {
            return Err(Error::SigningFailed(
                "signer produced a signature that does not verify under its public key".into(),
            ));
        }

        let envelope = Envelope::from_parts(unsigned, signature);
        tracing::info!(
            kind = %envelope.kind(),
            signer = %envelope.signer_id(),
            nonce = envelope.nonce(),
            "Built signed envelope"
        );
        Ok(envelope)
    }
}

fn shape_payload(input: BuildInput) -> Result<(String, Payload)> {
    match input {
        BuildInput::Host {
            original_message,
            state,
        } => {
            require_message(&original_message)?;
            let Value::Object(mut state) = state else {
                return Err(Error::SigningFailed("state must be a JSON object".into()));
            };
            for key in CONVERSATION_KEYS {
                if !state.contains_key(key) {
                    state.insert(key.to_string(), Value::String(Uuid::new_v4().to_string()));
                }
            }
            Ok((
                original_message,
                Payload::HostRequest(HostRequestPayload { state }),
            ))
        }
        BuildInput::Remote {
            original_message,
            response,
            host_block,
            extra,
        } => {
            require_message(&original_message)?;
            let host_block = match host_block {
                Value::Object(map) => Some(map),
                Value::Null => None,
                other => {
                    return Err(Error::SigningFailed(format!(
                        "host_block must be a JSON object or null, got {}",
                        json_type(&other)
                    )))
                }
            };
            Ok((
                original_message,
                Payload::AgentResponse(AgentResponsePayload {
                    response,
                    host_block,
                    extra,
                }),
            ))
        }
    }
}

fn require_message(original_message: &str) -> Result<()> {
    if original_message.is_empty() {
        return Err(Error::SigningFailed("original_message is empty".into()));
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::identity::{Keypair, PublicKey, Signature, Signer};

    fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new(Arc::new(Identity::new("host", Keypair::generate())))
    }

    #[test]
    fn host_envelope_signature_validates() {
        let builder = builder();
        let envelope = builder
            .build(BuildInput::host("Are you free tomorrow?", json!({"task_id": "t1"})))
            .unwrap();

        assert_eq!(envelope.kind(), EnvelopeKind::HostRequest);
        assert_eq!(envelope.signer_id(), builder.identity().did());
        let bytes = envelope.signing_bytes().unwrap();
        assert!(builder.identity().public_key().verify(&bytes, envelope.signature()));
    }

    #[test]
    fn host_state_gains_conversation_ids() {
        let envelope = builder()
            .build(BuildInput::host("hi", json!({"task_id": "t1"})))
            .unwrap();
        let state = envelope.host_block().unwrap();
        assert_eq!(state["task_id"], json!("t1"));
        let context_id = state["context_id"].as_str().unwrap();
        assert!(Uuid::parse_str(context_id).is_ok());
    }

    #[test]
    fn timestamp_is_truncated_to_millis_and_nonce_is_fresh() {
        let builder = builder();
        let now = Utc.timestamp_opt(1_790_000_000, 123_456_789).unwrap();
        let a = builder
            .build_at(BuildInput::host("hi", json!({})), now)
            .unwrap();
        let b = builder
            .build_at(BuildInput::host("hi", json!({})), now)
            .unwrap();
        assert_eq!(a.timestamp().timestamp_subsec_nanos(), 123_000_000);
        assert_ne!(a.nonce(), b.nonce());
        assert!(Uuid::parse_str(a.nonce()).is_ok());
    }

    #[test]
    fn remote_envelope_carries_response_and_extra() {
        let mut extra = Map::new();
        extra.insert("host_trust_issues".into(), json!([]));
        let envelope = builder()
            .build(
                BuildInput::remote("hi", "Yes, 3pm works.", json!({"task_id": "t1"}))
                    .with_extra(extra.clone()),
            )
            .unwrap();
        match envelope.payload() {
            Payload::AgentResponse(p) => {
                assert_eq!(p.response, "Yes, 3pm works.");
                assert_eq!(p.extra, extra);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_shapes() {
        let builder = builder();
        for input in [
            BuildInput::host("", json!({})),
            BuildInput::host("hi", json!(["not", "an", "object"])),
            BuildInput::remote("hi", "r", json!("string block")),
            BuildInput::remote("", "r", Value::Null),
        ] {
            assert!(matches!(builder.build(input), Err(Error::SigningFailed(_))));
        }
    }

    struct BrokenSigner(Keypair);

    impl Signer for BrokenSigner {
        fn public_key(&self) -> PublicKey {
            self.0.public_key()
        }

        fn sign(&self, _message: &[u8]) -> Result<Signature> {
            Ok(Signature::from_bytes(&[0u8; 64]))
        }
    }

    struct LockedSigner(Keypair);

    impl Signer for LockedSigner {
        fn public_key(&self) -> PublicKey {
            self.0.public_key()
        }

        fn sign(&self, _message: &[u8]) -> Result<Signature> {
            Err(Error::InvalidKey("hardware key is locked".into()))
        }
    }

    #[test]
    fn signer_failures_become_signing_failed() {
        for signer in [
            Box::new(BrokenSigner(Keypair::generate())) as Box<dyn Signer + Send + Sync>,
            Box::new(LockedSigner(Keypair::generate())),
        ] {
            let builder = EnvelopeBuilder::new(Arc::new(Identity::with_signer("x", signer)));
            assert!(matches!(
                builder.build(BuildInput::host("hi", json!({}))),
                Err(Error::SigningFailed(_))
            ));
        }
    }
}
