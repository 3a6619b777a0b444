use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Did, PublicKey};
use crate::error::{Error, Result};

/// Resolves a peer DID to its public key.
///
/// `Ok(None)` means the resolver has no record for the DID; `Err` means the lookup itself
/// failed. Both end up as `UnknownSigner` at the verifier, except
/// [`Error::ResolutionTimeout`], which is passed through.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn resolve(&self, did: &Did) -> Result<Option<PublicKey>>;
}

/// Resolve `did` through `resolver`, bounded by `timeout`.
///
/// A key that does not hash to `did` is treated as unresolved.
pub async fn resolve_public_key(
    resolver: &dyn KeyResolver,
    did: &Did,
    timeout: Duration,
) -> Result<PublicKey> {
    let resolved = match tokio::time::timeout(timeout, resolver.resolve(did)).await {
        Ok(resolved) => resolved,
        Err(_) => return Err(timed_out(did, timeout)),
    };

    match resolved {
        Ok(Some(key)) if did.matches_key(&key) => {
            tracing::debug!(resolver = resolver.name(), did = %did, "Resolved signer key");
            Ok(key)
        }
        Ok(Some(_)) => {
            tracing::warn!(resolver = resolver.name(), did = %did, "Resolved key does not match DID");
            Err(Error::UnknownSigner(format!(
                "{did}: {} returned a key for a different DID",
                resolver.name()
            )))
        }
        Ok(None) => Err(Error::UnknownSigner(format!(
            "{did}: not found via {}",
            resolver.name()
        ))),
        Err(Error::UnknownSigner(reason)) => Err(Error::UnknownSigner(reason)),
        // A resolver's own deadline is reported against the caller's bound.
        Err(Error::ResolutionTimeout { .. }) => Err(timed_out(did, timeout)),
        Err(e) => Err(Error::UnknownSigner(format!("{did}: {e}"))),
    }
}

fn timed_out(did: &Did, timeout: Duration) -> Error {
    Error::ResolutionTimeout {
        did: did.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// A registered peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub did: Did,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// In-memory directory of known peers.
#[derive(Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<Did, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Did, PeerRecord>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Did, PeerRecord>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a peer, replacing any previous record for the same DID.
    pub fn register(&self, record: PeerRecord) -> Result<()> {
        if !record.did.matches_key(&record.public_key) {
            return Err(Error::InvalidDid(format!(
                "{} is not derived from the supplied public key",
                record.did
            )));
        }
        self.lock_write().insert(record.did.clone(), record);
        Ok(())
    }

    /// Register a bare key under its derived DID.
    pub fn register_key(&self, public_key: PublicKey) -> Did {
        let did = Did::from_public_key(&public_key);
        self.lock_write().insert(
            did.clone(),
            PeerRecord {
                did: did.clone(),
                public_key,
                alias: None,
            },
        );
        did
    }

    pub fn get(&self, did: &Did) -> Option<PeerRecord> {
        self.lock_read().get(did).cloned()
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers = self.lock_read().values().cloned().collect::<Vec<_>>();
        peers.sort_by(|a, b| a.did.cmp(&b.did));
        peers
    }

    pub fn remove(&self, did: &Did) -> Option<PeerRecord> {
        self.lock_write().remove(did)
    }
}

#[async_trait]
impl KeyResolver for PeerDirectory {
    fn name(&self) -> &'static str {
        "peer_directory"
    }

    async fn resolve(&self, did: &Did) -> Result<Option<PublicKey>> {
        Ok(self.get(did).map(|record| record.public_key))
    }
}

/// Remote key directory: `GET {base}/v1/dids/{did}` returning `{did, public_key}`.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("directory client: {e}")))?;
        Ok(Self::with_client(client, base_url, timeout))
    }

    /// `timeout` is the deadline reported when `client` gives up on a lookup.
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn lookup_failed(&self, did: &Did, context: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            timed_out(did, self.timeout)
        } else {
            Error::UnknownSigner(format!("{did}: {context}: {e}"))
        }
    }
}

#[async_trait]
impl KeyResolver for HttpDirectory {
    fn name(&self) -> &'static str {
        "http_directory"
    }

    async fn resolve(&self, did: &Did) -> Result<Option<PublicKey>> {
        let url = format!("{}/v1/dids/{did}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.lookup_failed(did, "directory request failed", e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::UnknownSigner(format!(
                "{did}: directory returned {}",
                resp.status()
            )));
        }

        let record: PeerRecord = resp
            .json()
            .await
            .map_err(|e| self.lookup_failed(did, "bad directory record", e))?;
        if record.did != *did {
            return Ok(None);
        }
        Ok(Some(record.public_key))
    }
}

/// Positive cache in front of another resolver. Misses and failures are not cached.
pub struct CachingResolver {
    inner: Arc<dyn KeyResolver>,
    cache: RwLock<HashMap<Did, PublicKey>>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn KeyResolver>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl KeyResolver for CachingResolver {
    fn name(&self) -> &'static str {
        "caching"
    }

    async fn resolve(&self, did: &Did) -> Result<Option<PublicKey>> {
        if let Some(key) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(did)
            .cloned()
        {
            return Ok(Some(key));
        }

        let resolved = self.inner.resolve(did).await?;
        if let Some(key) = &resolved {
            if did.matches_key(key) {
                self.cache
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(did.clone(), key.clone());
            }
        }
        Ok(resolved)
    }
}

/// Tries resolvers in order; the first one that returns a key wins.
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn KeyResolver>>,
}

impl ChainResolver {
    pub fn new(resolvers: Vec<Arc<dyn KeyResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl KeyResolver for ChainResolver {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn resolve(&self, did: &Did) -> Result<Option<PublicKey>> {
        let mut last_error = None;
        for resolver in &self.resolvers {
            match resolver.resolve(did).await {
                Ok(Some(key)) => return Ok(Some(key)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(resolver = resolver.name(), did = %did, error = %e, "Key resolver failed");
                    if !matches!(last_error, Some(Error::ResolutionTimeout { .. })) {
                        last_error = Some(e);
                    }
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}
