//! Client credentials for secured brokers.
//!
//! The [`CredentialStore`] owns the identity, the Basic authorization value
//! obtained at registration and the bearer token. Every mutation is written
//! through to a [`CredentialStorage`] before the mutator returns, so a crash
//! never loses a registration. The YAML layout of [`YamlFileStorage`] is:
//!
//! ```yaml
//! security:
//!   client_id: my-host
//!   client_secret: Basic bXktaG9zdDpzM2NyM3Q=
//!   jwt: eyJhbGciOi...
//!   expires: 2026-10-19T10:00:00+00:00
//!   type: XXX
//! ```

// used for token expiry instants
use chrono::{DateTime, Duration, Utc};
// used to build the Basic authorization value
use base64::{engine::general_purpose::STANDARD, Engine as _};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Result, SepaError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialState {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub jwt: Option<String>,
    pub expires: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl CredentialState {
    pub fn is_registered(&self) -> bool {
        self.client_secret.is_some()
    }
    pub fn has_token(&self) -> bool {
        self.jwt.is_some()
    }
    /// True when an expiry is stored and lies at or before `now`. Unparseable
    /// expiries count as expired.
    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.expires {
            Some(expires) => DateTime::parse_from_rfc3339(expires)
                .map(|instant| instant.with_timezone(&Utc) <= now)
                .unwrap_or(true),
            None => false,
        }
    }
}

/// `Basic <base64(id:secret)>`
pub fn basic_authorization(client_id: &str, client_secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{client_secret}")))
}

// ------------- Storage -------------
pub trait CredentialStorage: Send {
    fn load(&mut self) -> Result<CredentialState>;
    fn store(&mut self, state: &CredentialState) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    security: CredentialState,
    #[serde(flatten)]
    other: BTreeMap<String, serde_yaml::Value>,
}

/// The credentials file. A missing file reads as empty credentials and is
/// created on the first write; other top-level keys survive rewrites. Writes go
/// to a sibling `.tmp` file that is then renamed over the original.
#[derive(Debug)]
pub struct YamlFileStorage {
    path: PathBuf,
    other: BTreeMap<String, serde_yaml::Value>,
}

impl YamlFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), other: BTreeMap::new() }
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(OsString::from).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CredentialStorage for YamlFileStorage {
    fn load(&mut self) -> Result<CredentialState> {
        if !self.path.exists() {
            debug!(file = %self.path.display(), "no credentials file yet");
            return Ok(CredentialState::default());
        }
        let text = fs::read_to_string(&self.path)?;
        let file: CredentialFile = if text.trim().is_empty() {
            CredentialFile::default()
        } else {
            serde_yaml::from_str(&text).map_err(|e| {
                SepaError::Credentials(format!("parsing {} failed: {e}", self.path.display()))
            })?
        };
        self.other = file.other;
        Ok(file.security)
    }
    fn store(&mut self, state: &CredentialState) -> Result<()> {
        let file = CredentialFile { security: state.clone(), other: self.other.clone() };
        let staging = self.staging_path();
        fs::write(&staging, serde_yaml::to_string(&file)?)?;
        fs::rename(&staging, &self.path)?;
        debug!(file = %self.path.display(), "credentials stored");
        Ok(())
    }
}

/// Holds only the latest state. Used when no credentials file is configured.
#[derive(Debug, Default)]
pub struct VolatileStorage {
    state: CredentialState,
}

impl CredentialStorage for VolatileStorage {
    fn load(&mut self) -> Result<CredentialState> {
        Ok(self.state.clone())
    }
    fn store(&mut self, state: &CredentialState) -> Result<()> {
        self.state.clone_from(state);
        Ok(())
    }
}

/// Keeps every stored snapshot, the handle is shared so writes can be inspected.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    snapshots: Arc<Mutex<Vec<CredentialState>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn seeded(state: CredentialState) -> Self {
        Self { snapshots: Arc::new(Mutex::new(vec![state])) }
    }
    pub fn snapshots(&self) -> Vec<CredentialState> {
        self.snapshots.lock().map(|s| s.clone()).unwrap_or_default()
    }
    pub fn latest(&self) -> Option<CredentialState> {
        self.snapshots.lock().ok().and_then(|s| s.last().cloned())
    }
}

impl CredentialStorage for MemoryStorage {
    fn load(&mut self) -> Result<CredentialState> {
        Ok(self.snapshots.lock()?.last().cloned().unwrap_or_default())
    }
    fn store(&mut self, state: &CredentialState) -> Result<()> {
        self.snapshots.lock()?.push(state.clone());
        Ok(())
    }
}

// ------------- Store -------------
pub struct CredentialStore {
    state: CredentialState,
    storage: Box<dyn CredentialStorage>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("client_id", &self.state.client_id)
            .field("registered", &self.state.is_registered())
            .field("has_token", &self.state.has_token())
            .finish()
    }
}

impl CredentialStore {
    pub fn open(mut storage: Box<dyn CredentialStorage>) -> Result<Self> {
        let state = storage.load()?;
        Ok(Self { state, storage })
    }
    pub fn in_memory() -> Self {
        Self { state: CredentialState::default(), storage: Box::new(VolatileStorage::default()) }
    }
    pub fn state(&self) -> &CredentialState {
        &self.state
    }
    pub fn authorization(&self) -> Option<&str> {
        self.state.client_secret.as_deref()
    }
    pub fn jwt(&self) -> Option<&str> {
        self.state.jwt.as_deref()
    }

    fn persist(&mut self) -> Result<()> {
        self.storage.store(&self.state)
    }

    /// Records a registration: our identity plus the Basic authorization built
    /// from the id and secret the broker issued.
    pub fn set_registration(&mut self, identity: &str, client_id: &str, client_secret: &str) -> Result<()> {
        self.state.client_id = Some(identity.to_string());
        self.state.client_secret = Some(basic_authorization(client_id, client_secret));
        self.persist()
    }
    /// Stores a bearer token, with its expiry when the broker gave a lifetime.
    pub fn set_token(&mut self, jwt: impl Into<String>, expires_in: Option<i64>, now: DateTime<Utc>) -> Result<()> {
        self.state.jwt = Some(jwt.into());
        self.state.expires = expires_in
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .map(|instant| instant.to_rfc3339());
        self.persist()
    }
    pub fn clear_token(&mut self) -> Result<()> {
        self.state.jwt = None;
        self.state.expires = None;
        self.persist()
    }
}
