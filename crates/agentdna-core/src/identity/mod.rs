//! Local identities and peer key resolution.
//!
//! An [`Identity`] is created once per agent instance (usually through a [`KeyStore`]) and
//! passed explicitly to the builder and coordinators, typically as `Arc<Identity>`. Peer keys
//! are looked up by [`Did`] through a [`KeyResolver`] and are never cached on the identity.

mod keys;
mod keystore;
mod resolver;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::sha256;

pub use keys::{Keypair, PublicKey, Signature, Signer};
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use resolver::{
    resolve_public_key, CachingResolver, ChainResolver, HttpDirectory, KeyResolver,
    PeerDirectory, PeerRecord,
};

const DID_PREFIX: &str = "did:dna:";
const DID_HEX_LEN: usize = 40;

/// Decentralized identifier: `did:dna:` followed by the first 20 bytes of SHA-256 over the
/// raw Ed25519 public key, as lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = sha256(key.as_bytes());
        Self(format!(
            "{DID_PREFIX}{}",
            hex::encode(&digest.as_bytes()[..DID_HEX_LEN / 2])
        ))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let suffix = raw
            .strip_prefix(DID_PREFIX)
            .ok_or_else(|| Error::InvalidDid(format!("{raw:?} does not start with {DID_PREFIX}")))?;
        let well_formed = suffix.len() == DID_HEX_LEN
            && suffix
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(Error::InvalidDid(format!(
                "{raw:?} must end in {DID_HEX_LEN} lowercase hex characters"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Whether `key` is the key this DID was derived from.
    pub fn matches_key(&self, key: &PublicKey) -> bool {
        Self::from_public_key(key) == *self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

/// Stable ledger identifier for a local agent: hex SHA-256 of `"<did>.<alias>"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn derive(did: &Did, alias: &str) -> Self {
        Self(sha256(format!("{did}.{alias}").as_bytes()).to_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The local agent's identity: alias, DID and the signer holding its private key.
pub struct Identity {
    alias: String,
    did: Did,
    public_key: PublicKey,
    signer: Box<dyn Signer + Send + Sync>,
}

impl Identity {
    pub fn new(alias: impl Into<String>, keypair: Keypair) -> Self {
        Self::with_signer(alias, Box::new(keypair))
    }

    pub fn with_signer(alias: impl Into<String>, signer: Box<dyn Signer + Send + Sync>) -> Self {
        let public_key = signer.public_key();
        Self {
            alias: alias.into(),
            did: Did::from_public_key(&public_key),
            public_key,
            signer,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId::derive(&self.did, &self.alias)
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        self.signer.sign(message)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("alias", &self.alias)
            .field("did", &self.did)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_is_derived_from_key() {
        let keypair = Keypair::from_seed(&[3u8; 32]);
        let did = Did::from_public_key(&keypair.public_key());
        assert!(did.as_str().starts_with("did:dna:"));
        assert_eq!(did.as_str().len(), DID_PREFIX.len() + DID_HEX_LEN);
        assert!(did.matches_key(&keypair.public_key()));
        assert!(!did.matches_key(&Keypair::generate().public_key()));
        assert_eq!(Did::parse(did.as_str()).unwrap(), did);
    }

    #[test]
    fn did_parse_rejects_garbage() {
        for raw in [
            "",
            "did:web:example.com",
            "did:dna:1234",
            "did:dna:ABCDEF0123456789ABCDEF0123456789ABCDEF01",
            "did:dna:zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz",
        ] {
            assert!(matches!(Did::parse(raw), Err(Error::InvalidDid(_))), "{raw}");
        }
    }

    #[test]
    fn did_serde_validates() {
        let ok: Result<Did> = serde_json::from_str("\"did:dna:0123456789abcdef0123456789abcdef01234567\"")
            .map_err(Error::from);
        assert!(ok.is_ok());
        assert!(serde_json::from_str::<Did>("\"did:dna:nope\"").is_err());
    }

    #[test]
    fn identity_exposes_did_and_agent_id() {
        let identity = Identity::new("host", Keypair::from_seed(&[5u8; 32]));
        assert_eq!(identity.alias(), "host");
        assert!(identity.did().matches_key(identity.public_key()));

        let expected = sha256(format!("{}.host", identity.did()).as_bytes()).to_hex();
        assert_eq!(identity.agent_id().as_str(), expected);

        let other = Identity::new("remote", Keypair::from_seed(&[5u8; 32]));
        assert_eq!(other.did(), identity.did());
        assert_ne!(other.agent_id(), identity.agent_id());
    }

    #[test]
    fn identity_signatures_verify_under_its_key() {
        let identity = Identity::new("a", Keypair::generate());
        let sig = identity.sign(b"bytes").unwrap();
        assert!(identity.public_key().verify(b"bytes", &sig));
    }
}
