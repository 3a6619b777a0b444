use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Identity, Keypair};
use crate::error::{Error, Result};

/// Loads (or creates) the keypair behind a local alias.
pub trait KeyStore: Send + Sync {
    fn load(&self, alias: &str) -> Result<Identity>;
}

/// Hex seeds stored as `<dir>/<alias>.key`, generated on first load.
#[derive(Clone, Debug)]
pub struct FileKeyStore {
    dir: PathBuf,
    generate_missing: bool,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            generate_missing: true,
        }
    }

    /// `<local data dir>/agentdna/keys`, falling back to `./.agentdna/keys`.
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("agentdna").join("keys"))
            .unwrap_or_else(|| PathBuf::from(".agentdna").join("keys"))
    }

    /// Only load existing keys; a missing key file becomes `IdentityUnavailable`.
    pub fn read_only(mut self) -> Self {
        self.generate_missing = false;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.key"))
    }

    fn read_existing(&self, alias: &str, path: &Path) -> Result<Option<Keypair>> {
        match fs::read_to_string(path) {
            Ok(contents) => Keypair::from_seed_hex(&contents)
                .map(Some)
                .map_err(|e| unavailable(alias, format!("corrupt key file {}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(alias, format!("read {}: {e}", path.display()))),
        }
    }

    fn create(&self, alias: &str, path: &Path) -> Result<Keypair> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| unavailable(alias, format!("create {}: {e}", self.dir.display())))?;

        let keypair = Keypair::generate();
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        match options.open(path) {
            Ok(mut file) => {
                file.write_all(keypair.seed_hex().as_bytes())
                    .and_then(|()| file.sync_all())
                    .map_err(|e| unavailable(alias, format!("write {}: {e}", path.display())))?;
                tracing::info!(alias, path = %path.display(), "Generated new identity key");
                Ok(keypair)
            }
            // Another process created it first; use theirs.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self
                .read_existing(alias, path)?
                .ok_or_else(|| unavailable(alias, "key file vanished during creation".into())),
            Err(e) => Err(unavailable(alias, format!("create {}: {e}", path.display()))),
        }
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self, alias: &str) -> Result<Identity> {
        validate_alias(alias)?;
        let path = self.key_path(alias);

        let keypair = match self.read_existing(alias, &path)? {
            Some(keypair) => keypair,
            None if self.generate_missing => self.create(alias, &path)?,
            None => {
                return Err(unavailable(
                    alias,
                    format!("no key at {} and generation is disabled", path.display()),
                ))
            }
        };

        let identity = Identity::new(alias, keypair);
        tracing::debug!(alias, did = %identity.did(), "Loaded identity");
        Ok(identity)
    }
}

/// In-process key store for tests and embedding.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, Keypair>>,
    generate_missing: bool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            generate_missing: true,
        }
    }

    /// A store that only serves inserted keys.
    pub fn fixed() -> Self {
        Self::default()
    }

    pub fn insert(&self, alias: impl Into<String>, keypair: Keypair) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(alias.into(), keypair);
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, alias: &str) -> Result<Identity> {
        validate_alias(alias)?;
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let keypair = match keys.get(alias) {
            Some(keypair) => keypair.clone(),
            None if self.generate_missing => {
                let keypair = Keypair::generate();
                keys.insert(alias.to_string(), keypair.clone());
                keypair
            }
            None => return Err(unavailable(alias, "no key registered".into())),
        };
        Ok(Identity::new(alias, keypair))
    }
}

fn validate_alias(alias: &str) -> Result<()> {
    let ok = !alias.is_empty()
        && alias != "."
        && alias != ".."
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(unavailable(alias, "alias must be non-empty [A-Za-z0-9._-]".into()))
    }
}

fn unavailable(alias: &str, reason: String) -> Error {
    Error::IdentityUnavailable {
        alias: alias.to_string(),
        reason,
    }
}
