//! TOML configuration for an agent endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::coordinator::{
    Coordinator, HostCoordinator, HostOptions, RemoteCoordinator, RemoteOptions, Role,
};
use crate::error::{Error, Result};
use crate::identity::{
    CachingResolver, ChainResolver, Did, FileKeyStore, HttpDirectory, Identity, KeyResolver,
    KeyStore, PeerDirectory, PeerRecord, PublicKey,
};
use crate::ledger::{AuditLedger, HttpLedger, LedgerClient, MemoryLedger, SqliteLedger};
use crate::trust::VerifyMode;
use crate::verifier::{Verifier, VerifierConfig};

/// Overrides `verify.default_mode`.
pub const ENV_VERIFY_MODE: &str = "AGENTDNA_VERIFY_MODE";
/// Names the config file the CLI loads.
pub const ENV_CONFIG: &str = "AGENTDNA_CONFIG";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentdnaConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub verify: VerifySection,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Local identity and role.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default = "default_role")]
    pub role: Role,
    /// Directory holding `<alias>.key`. `~/` is expanded.
    #[serde(default)]
    pub key_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            alias: default_alias(),
            role: default_role(),
            key_dir: None,
        }
    }
}

fn default_alias() -> String {
    "default".to_string()
}

fn default_role() -> Role {
    Role::Host
}

/// Verification policy.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifySection {
    #[serde(default)]
    pub default_mode: VerifyMode,
    #[serde(default = "default_staleness_bound_secs")]
    pub staleness_bound_secs: u64,
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
    #[serde(default = "default_replay_window_size")]
    pub replay_window_size: usize,
    #[serde(default)]
    pub reject_stale: bool,
    #[serde(default = "default_timeout_ms")]
    pub resolution_timeout_ms: u64,
    /// Remote only: answer requests that verified with issues.
    #[serde(default)]
    pub proceed_on_issues: bool,
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            default_mode: VerifyMode::default(),
            staleness_bound_secs: default_staleness_bound_secs(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
            replay_window_size: default_replay_window_size(),
            reject_stale: false,
            resolution_timeout_ms: default_timeout_ms(),
            proceed_on_issues: false,
        }
    }
}

fn default_staleness_bound_secs() -> u64 {
    300
}

fn default_max_clock_skew_secs() -> u64 {
    30
}

fn default_replay_window_size() -> usize {
    4096
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Where peer keys come from.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Base URL of an HTTP key directory.
    #[serde(default)]
    pub url: Option<String>,
    /// Cache keys resolved over HTTP.
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: None,
            cache: true,
            peers: Vec::new(),
        }
    }
}

/// Statically configured peer.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub did: Did,
    pub public_key: PublicKey,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Audit anchoring (host role only).
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default)]
    pub execute_audit: bool,
    #[serde(default)]
    pub require_audit: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub backend: Option<AuditBackendConfig>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            execute_audit: false,
            require_audit: false,
            timeout_ms: default_timeout_ms(),
            backend: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuditBackendConfig {
    Memory,
    Sqlite { path: PathBuf },
    Http { url: String },
}

impl AgentdnaConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| Error::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.alias.trim().is_empty() {
            return Err(Error::Config("agent.alias must not be empty".into()));
        }
        if self.verify.staleness_bound_secs == 0 {
            return Err(Error::Config(
                "verify.staleness_bound_secs must be greater than 0".into(),
            ));
        }
        if self.verify.replay_window_size == 0 {
            return Err(Error::Config(
                "verify.replay_window_size must be greater than 0".into(),
            ));
        }
        if self.verify.resolution_timeout_ms == 0 || self.audit.timeout_ms == 0 {
            return Err(Error::Config("timeouts must be greater than 0".into()));
        }
        if matches!(&self.directory.url, Some(url) if url.trim().is_empty()) {
            return Err(Error::Config("directory.url must not be empty".into()));
        }
        for peer in &self.directory.peers {
            if !peer.did.matches_key(&peer.public_key) {
                return Err(Error::Config(format!(
                    "directory.peers: {} does not match its public_key",
                    peer.did
                )));
            }
        }
        if self.agent.role == Role::Remote && self.audit.execute_audit {
            return Err(Error::Config(
                "audit.execute_audit is only supported for the host role".into(),
            ));
        }
        if self.audit.execute_audit && self.audit.backend.is_none() {
            return Err(Error::Config(
                "audit.execute_audit requires audit.backend".into(),
            ));
        }
        if matches!(&self.audit.backend, Some(AuditBackendConfig::Http { url }) if url.trim().is_empty())
        {
            return Err(Error::Config("audit.backend.url must not be empty".into()));
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(ENV_VERIFY_MODE).filter(|v| !v.trim().is_empty()) {
            self.verify.default_mode = mode.parse()?;
        }
        Ok(())
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            staleness_bound: Duration::from_secs(self.verify.staleness_bound_secs),
            max_clock_skew: Duration::from_secs(self.verify.max_clock_skew_secs),
            replay_window_size: self.verify.replay_window_size,
            reject_stale: self.verify.reject_stale,
            resolution_timeout: Duration::from_millis(self.verify.resolution_timeout_ms),
        }
    }

    pub fn key_store(&self) -> FileKeyStore {
        match &self.agent.key_dir {
            Some(dir) => FileKeyStore::new(expand_home(dir)),
            None => FileKeyStore::new(FileKeyStore::default_dir()),
        }
    }

    pub fn load_identity(&self) -> Result<Arc<Identity>> {
        self.key_store().load(&self.agent.alias).map(Arc::new)
    }

    /// Static peers first, then the HTTP directory if one is configured.
    pub fn build_resolver(&self) -> Result<Arc<dyn KeyResolver>> {
        let peers = PeerDirectory::new();
        for peer in &self.directory.peers {
            peers.register(PeerRecord {
                did: peer.did.clone(),
                public_key: peer.public_key.clone(),
                alias: peer.alias.clone(),
            })?;
        }
        let peers: Arc<dyn KeyResolver> = Arc::new(peers);

        let Some(url) = &self.directory.url else {
            return Ok(peers);
        };
        let timeout = Duration::from_millis(self.verify.resolution_timeout_ms);
        let mut http: Arc<dyn KeyResolver> = Arc::new(HttpDirectory::new(url.clone(), timeout)?);
        if self.directory.cache {
            http = Arc::new(CachingResolver::new(http));
        }
        Ok(Arc::new(ChainResolver::new(vec![peers, http])))
    }

    pub fn build_ledger(&self) -> Result<Option<LedgerClient>> {
        let timeout = Duration::from_millis(self.audit.timeout_ms);
        let ledger: Arc<dyn AuditLedger> = match &self.audit.backend {
            None => return Ok(None),
            Some(AuditBackendConfig::Memory) => Arc::new(MemoryLedger::new()),
            Some(AuditBackendConfig::Sqlite { path }) => {
                Arc::new(SqliteLedger::open(expand_home(path))?)
            }
            Some(AuditBackendConfig::Http { url }) => {
                Arc::new(HttpLedger::new(url.clone(), timeout)?)
            }
        };
        Ok(Some(LedgerClient::new(ledger, timeout)))
    }

    pub fn build_verifier(&self) -> Result<Verifier> {
        Ok(Verifier::new(self.verifier_config(), self.build_resolver()?))
    }

    /// Assemble the coordinator for the configured role and identity.
    pub fn build_coordinator(&self) -> Result<Coordinator> {
        let identity = self.load_identity()?;
        let verifier = self.build_verifier()?;
        let coordinator = match self.agent.role {
            Role::Host => Coordinator::Host(HostCoordinator::new(
                identity,
                verifier,
                self.build_ledger()?,
                HostOptions {
                    default_mode: self.verify.default_mode,
                    execute_audit: self.audit.execute_audit,
                    require_audit: self.audit.require_audit,
                },
            )),
            Role::Remote => Coordinator::Remote(RemoteCoordinator::new(
                identity,
                verifier,
                RemoteOptions {
                    default_mode: self.verify.default_mode,
                    proceed_on_issues: self.verify.proceed_on_issues,
                },
            )),
        };
        tracing::info!(
            alias = %self.agent.alias,
            role = %self.agent.role,
            mode = %self.verify.default_mode,
            "Coordinator configured"
        );
        Ok(coordinator)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AgentdnaConfig::parse("").unwrap();
        assert_eq!(config.agent.role, Role::Host);
        assert_eq!(config.verify.default_mode, VerifyMode::Light);
        assert_eq!(config.verifier_config(), VerifierConfig::default());
        assert!(config.build_ledger().unwrap().is_none());
    }

    #[test]
    fn parses_full_config() {
        let key = Keypair::from_seed(&[9u8; 32]).public_key();
        let did = Did::from_public_key(&key);
        let toml = format!(
            r#"
[agent]
alias = "scheduler"
role = "host"
key_dir = "/tmp/agentdna-keys"

[verify]
default_mode = "heavy"
staleness_bound_secs = 60
reject_stale = true

[directory]
url = "http://127.0.0.1:20000"
cache = false

[[directory.peers]]
did = "{did}"
public_key = "{key}"
alias = "calendar"

[audit]
execute_audit = true
require_audit = true
backend = {{ type = "sqlite", path = "/tmp/audit.db" }}
"#,
            key = key.to_hex()
        );
        let config = AgentdnaConfig::parse(&toml).unwrap();
        assert_eq!(config.agent.alias, "scheduler");
        assert_eq!(config.verify.default_mode, VerifyMode::Heavy);
        assert_eq!(config.verifier_config().staleness_bound, Duration::from_secs(60));
        assert!(config.verifier_config().reject_stale);
        assert_eq!(config.directory.peers[0].did, did);
        assert!(!config.directory.cache);
        assert_eq!(
            config.audit.backend,
            Some(AuditBackendConfig::Sqlite {
                path: PathBuf::from("/tmp/audit.db")
            })
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = AgentdnaConfig::parse("[verify]\nmode = \"heavy\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("Invalid TOML")));
    }

    #[test]
    fn remote_role_cannot_audit() {
        let toml = r#"
[agent]
role = "remote"
[audit]
execute_audit = true
backend = { type = "memory" }
"#;
        let err = AgentdnaConfig::parse(toml).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("host role")));
    }

    #[test]
    fn audit_requires_backend() {
        let err = AgentdnaConfig::parse("[audit]\nexecute_audit = true\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("audit.backend")));
    }

    #[test]
    fn peer_with_foreign_key_is_rejected() {
        let did = Did::from_public_key(&Keypair::generate().public_key());
        let key = Keypair::generate().public_key();
        let toml = format!(
            "[[directory.peers]]\ndid = \"{did}\"\npublic_key = \"{}\"\n",
            key.to_hex()
        );
        assert!(matches!(
            AgentdnaConfig::parse(&toml),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn env_override_sets_verify_mode() {
        let mut config = AgentdnaConfig::default();
        config
            .apply_env_overrides_from(|key| (key == ENV_VERIFY_MODE).then(|| "Heavy".to_string()))
            .unwrap();
        assert_eq!(config.verify.default_mode, VerifyMode::Heavy);

        let err = config
            .apply_env_overrides_from(|_| Some("paranoid".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn resolver_serves_static_peers() {
        let key = Keypair::generate().public_key();
        let did = Did::from_public_key(&key);
        let toml = format!(
            "[[directory.peers]]\ndid = \"{did}\"\npublic_key = \"{}\"\n",
            key.to_hex()
        );
        let resolver = AgentdnaConfig::parse(&toml)
            .unwrap()
            .build_resolver()
            .unwrap();
        assert_eq!(resolver.resolve(&did).await.unwrap(), Some(key));
    }

    #[tokio::test]
    async fn silent_directory_surfaces_as_resolution_timeout() {
        let url = crate::test_support::serve_silent().await;
        let toml = format!(
            "[verify]\nresolution_timeout_ms = 200\n\n[directory]\nurl = \"{url}\"\n"
        );
        let verifier = AgentdnaConfig::parse(&toml)
            .unwrap()
            .build_verifier()
            .unwrap();
        let stranger = Arc::new(crate::identity::Identity::new("stranger", Keypair::generate()));
        let raw = crate::builder::EnvelopeBuilder::new(stranger)
            .build(crate::builder::BuildInput::host("hi", serde_json::json!({})))
            .unwrap()
            .to_json_bytes()
            .unwrap();

        // The client deadline and the outer bound are equal; either may fire first.
        for _ in 0..5 {
            let err = verifier.handle(&raw, VerifyMode::Light, None).await.unwrap_err();
            assert!(
                matches!(err, Error::ResolutionTimeout { timeout_ms: 200, .. }),
                "{err:?}"
            );
        }
    }

    #[test]
    fn builds_coordinator_for_role() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
[agent]
alias = "calendar"
role = "remote"
key_dir = "{}"
"#,
            dir.path().display()
        );
        let config = AgentdnaConfig::parse(&toml).unwrap();
        let coordinator = config.build_coordinator().unwrap();
        assert_eq!(coordinator.role(), Role::Remote);
        assert!(dir.path().join("calendar.key").exists());
    }

    #[test]
    fn home_prefix_is_expanded() {
        let expanded = expand_home(Path::new("~/keys"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("keys"));
        }
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
