//! Envelope data model.
//!
//! An [`Envelope`] is an [`UnsignedEnvelope`] plus the Ed25519 signature over its canonical
//! encoding (see [`codec`](crate::codec)). Envelopes are only produced by the
//! [`EnvelopeBuilder`](crate::EnvelopeBuilder) or by [`codec::decode`](crate::codec::decode);
//! a decoded envelope is *not* trusted until it has been through the verifier.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::codec;
use crate::error::{Error, Result};
use crate::hashing::Hash;
use crate::identity::{Did, Signature};

/// Wire format version carried in every envelope.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    HostRequest,
    AgentResponse,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostRequest => "host_request",
            Self::AgentResponse => "agent_response",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host_request" => Ok(Self::HostRequest),
            "agent_response" => Ok(Self::AgentResponse),
            other => Err(Error::MalformedEnvelope(format!("unknown kind {other:?}"))),
        }
    }
}

/// Payload of a host-built request: opaque conversation state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostRequestPayload {
    pub state: Map<String, Value>,
}

/// Payload of a remote-built response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentResponsePayload {
    pub response: String,
    /// Echo of the host's state block, or `null`.
    pub host_block: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    HostRequest(HostRequestPayload),
    AgentResponse(AgentResponsePayload),
}

impl Payload {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::HostRequest(_) => EnvelopeKind::HostRequest,
            Self::AgentResponse(_) => EnvelopeKind::AgentResponse,
        }
    }

    /// The block the receiver hands back to its caller: the response's `host_block`, or the
    /// request's `state`.
    pub fn host_block(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::HostRequest(p) => Some(&p.state),
            Self::AgentResponse(p) => p.host_block.as_ref(),
        }
    }
}

/// Every signed field of an envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct UnsignedEnvelope {
    pub version: u32,
    pub original_message: String,
    pub payload: Payload,
    pub signer_id: Did,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
}

impl UnsignedEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    unsigned: UnsignedEnvelope,
    signature: Signature,
}

impl Envelope {
    /// Attach a signature. Nothing is checked here; use the verifier for that.
    pub fn from_parts(unsigned: UnsignedEnvelope, signature: Signature) -> Self {
        Self {
            unsigned,
            signature,
        }
    }

    pub fn into_parts(self) -> (UnsignedEnvelope, Signature) {
        (self.unsigned, self.signature)
    }

    pub fn unsigned(&self) -> &UnsignedEnvelope {
        &self.unsigned
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.unsigned.kind()
    }

    pub fn version(&self) -> u32 {
        self.unsigned.version
    }

    pub fn original_message(&self) -> &str {
        &self.unsigned.original_message
    }

    pub fn payload(&self) -> &Payload {
        &self.unsigned.payload
    }

    pub fn host_block(&self) -> Option<&Map<String, Value>> {
        self.unsigned.payload.host_block()
    }

    pub fn signer_id(&self) -> &Did {
        &self.unsigned.signer_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.unsigned.timestamp
    }

    pub fn nonce(&self) -> &str {
        &self.unsigned.nonce
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The exact bytes the signature covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(&self.unsigned)
    }

    /// Canonical wire bytes, signature included.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        codec::to_wire_bytes(self)
    }

    pub fn hash(&self) -> Result<Hash> {
        codec::envelope_hash(self)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        codec::WireEnvelope::new(self).serialize(serializer)
    }
}
