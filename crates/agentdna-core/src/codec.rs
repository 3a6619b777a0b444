//! Canonical envelope codec.
//!
//! [`encode`] produces the signing input: JCS canonical JSON of every envelope field except
//! `signature`. [`decode`] is strict: unknown top-level fields, an unsupported `version`, an
//! unknown `kind`, a payload that does not match its kind, or a timestamp that is not in the
//! fixed `YYYY-MM-DDTHH:MM:SS.mmmZ` form are all [`Error::MalformedEnvelope`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::to_canonical_bytes;
use crate::envelope::{
    AgentResponsePayload, Envelope, EnvelopeKind, HostRequestPayload, Payload, UnsignedEnvelope,
    ENVELOPE_VERSION,
};
use crate::error::{Error, Result};
use crate::hashing::{sha256, Hash};
use crate::identity::{Did, Signature};

/// Render a timestamp in the wire format: RFC 3339, UTC, milliseconds, `Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Serialize)]
struct SignedFields<'a> {
    version: u32,
    kind: EnvelopeKind,
    original_message: &'a str,
    payload: &'a Payload,
    signer_id: &'a Did,
    timestamp: String,
    nonce: &'a str,
}

impl<'a> From<&'a UnsignedEnvelope> for SignedFields<'a> {
    fn from(e: &'a UnsignedEnvelope) -> Self {
        Self {
            version: e.version,
            kind: e.kind(),
            original_message: &e.original_message,
            payload: &e.payload,
            signer_id: &e.signer_id,
            timestamp: format_timestamp(&e.timestamp),
            nonce: &e.nonce,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct WireEnvelope<'a> {
    #[serde(flatten)]
    fields: SignedFields<'a>,
    signature: &'a Signature,
}

impl<'a> WireEnvelope<'a> {
    pub(crate) fn new(envelope: &'a Envelope) -> Self {
        Self {
            fields: SignedFields::from(envelope.unsigned()),
            signature: envelope.signature(),
        }
    }
}

/// Canonical bytes of the signed fields.
pub fn encode(envelope: &UnsignedEnvelope) -> Result<Vec<u8>> {
    to_canonical_bytes(&SignedFields::from(envelope))
}

/// Canonical bytes of the full envelope, signature included.
pub fn to_wire_bytes(envelope: &Envelope) -> Result<Vec<u8>> {
    to_canonical_bytes(&WireEnvelope::new(envelope))
}

/// SHA-256 over [`to_wire_bytes`].
pub fn envelope_hash(envelope: &Envelope) -> Result<Hash> {
    Ok(sha256(&to_wire_bytes(envelope)?))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    version: u32,
    kind: String,
    original_message: String,
    payload: Value,
    signer_id: String,
    timestamp: String,
    nonce: String,
    signature: String,
}

/// Parse wire bytes into an (unverified) envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(malformed)?;

    if raw.version != ENVELOPE_VERSION {
        return Err(Error::MalformedEnvelope(format!(
            "unsupported version {}",
            raw.version
        )));
    }
    let kind: EnvelopeKind = raw.kind.parse()?;

    let payload = match kind {
        EnvelopeKind::HostRequest => Payload::HostRequest(
            serde_json::from_value::<HostRequestPayload>(raw.payload).map_err(malformed)?,
        ),
        EnvelopeKind::AgentResponse => Payload::AgentResponse(
            serde_json::from_value::<AgentResponsePayload>(raw.payload).map_err(malformed)?,
        ),
    };

    let signer_id = Did::parse(&raw.signer_id)
        .map_err(|e| Error::MalformedEnvelope(format!("signer_id: {e}")))?;
    let timestamp = parse_timestamp(&raw.timestamp)?;

    if raw.nonce.is_empty() {
        return Err(Error::MalformedEnvelope("nonce is empty".into()));
    }
    let signature = Signature::from_hex(&raw.signature)
        .map_err(|e| Error::MalformedEnvelope(format!("signature: {e}")))?;

    Ok(Envelope::from_parts(
        UnsignedEnvelope {
            version: raw.version,
            original_message: raw.original_message,
            payload,
            signer_id,
            timestamp,
            nonce: raw.nonce,
        },
        signature,
    ))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| Error::MalformedEnvelope(format!("timestamp {raw:?}: {e}")))?
        .with_timezone(&Utc);
    // Re-encoding must reproduce the signed bytes, so only the canonical form is accepted.
    if format_timestamp(&parsed) != raw {
        return Err(Error::MalformedEnvelope(format!(
            "timestamp {raw:?} is not UTC with millisecond precision"
        )));
    }
    Ok(parsed)
}

fn malformed(e: serde_json::Error) -> Error {
    Error::MalformedEnvelope(e.to_string())
}
