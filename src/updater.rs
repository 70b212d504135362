//! Trust root distribution
//!
//! [`TrustRootUpdater`] pulls a fresh `trusted_root.json` from a
//! [`TrustRootSource`] and replaces the persisted copy atomically: readers
//! see either the previous file or the complete new one, never a partial
//! write. A root that fails to parse is never written. Writers to one path
//! are serialized process-wide, however many updaters point at it.
//!
//! [`TufHttpSource`] walks the Sigstore TUF repository's consistent-snapshot
//! layout, checking expiry, lengths and hashes at each hop.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::VerifierConfig;
use crate::error::{Error, Result};
use crate::sigstore::TrustedRoot;

/// TUF target name of the Sigstore trusted root
pub const TRUSTED_ROOT_TARGET: &str = "trusted_root.json";

/// Somewhere a trusted root can be fetched from
#[async_trait]
pub trait TrustRootSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>>;
}

#[derive(Debug, Deserialize)]
struct Signed<T> {
    signed: T,
}

#[derive(Debug, Deserialize)]
struct MetaFile {
    version: u64,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    hashes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotLike {
    expires: DateTime<Utc>,
    meta: HashMap<String, MetaFile>,
}

#[derive(Debug, Deserialize)]
struct TargetFile {
    length: u64,
    hashes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Targets {
    expires: DateTime<Utc>,
    targets: HashMap<String, TargetFile>,
}

fn distribution(msg: impl Into<String>) -> Error {
    Error::TrustRootDistribution(msg.into())
}

fn check_expiry(role: &str, expires: &DateTime<Utc>) -> Result<()> {
    if *expires <= Utc::now() {
        return Err(distribution(format!("{} metadata expired at {}", role, expires)));
    }
    Ok(())
}

fn check_content(name: &str, data: &[u8], length: Option<u64>, sha256: Option<&String>) -> Result<()> {
    if let Some(length) = length {
        if data.len() as u64 != length {
            return Err(distribution(format!("{} is {} bytes, expected {}", name, data.len(), length)));
        }
    }
    if let Some(expected) = sha256 {
        let actual = hex::encode(Sha256::digest(data));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(distribution(format!("{} hash mismatch: {} != {}", name, actual, expected)));
        }
    }
    Ok(())
}

/// Reads the trusted root target from a TUF repository over HTTP(S)
///
/// Expiry, versions, lengths and hashes are checked. Role signatures are
/// not; see DESIGN.md.
#[derive(Debug, Clone)]
pub struct TufHttpSource {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl TufHttpSource {
    pub fn new(config: &VerifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.tuf_url.trim_end_matches('/').to_string(),
            timeout: config.fetch_timeout(),
        })
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, path);
        tracing::debug!(%url, "fetching TUF metadata");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout)
            } else {
                distribution(format!("GET {}: {}", url, e))
            }
        })?;
        if !response.status().is_success() {
            return Err(distribution(format!("GET {}: HTTP {}", url, response.status())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| distribution(format!("Failed to read {}: {}", url, e)))?;
        Ok(body.to_vec())
    }

    fn decode<T: serde::de::DeserializeOwned>(name: &str, raw: &[u8]) -> Result<T> {
        serde_json::from_slice(raw).map_err(|e| distribution(format!("Failed to parse {}: {}", name, e)))
    }
}

#[async_trait]
impl TrustRootSource for TufHttpSource {
    async fn fetch(&self) -> Result<Vec<u8>> {
        // 1. timestamp → snapshot version
        let timestamp: Signed<SnapshotLike> = Self::decode("timestamp.json", &self.get("timestamp.json").await?)?;
        check_expiry("timestamp", &timestamp.signed.expires)?;
        let snapshot_meta = timestamp
            .signed
            .meta
            .get("snapshot.json")
            .ok_or_else(|| distribution("timestamp does not list snapshot.json"))?;

        // 2. snapshot → targets version
        let snapshot_name = format!("{}.snapshot.json", snapshot_meta.version);
        let raw = self.get(&snapshot_name).await?;
        check_content(&snapshot_name, &raw, snapshot_meta.length, snapshot_meta.hashes.get("sha256"))?;
        let snapshot: Signed<SnapshotLike> = Self::decode(&snapshot_name, &raw)?;
        check_expiry("snapshot", &snapshot.signed.expires)?;
        let targets_meta = snapshot
            .signed
            .meta
            .get("targets.json")
            .ok_or_else(|| distribution("snapshot does not list targets.json"))?;

        // 3. targets → trusted root hash
        let targets_name = format!("{}.targets.json", targets_meta.version);
        let raw = self.get(&targets_name).await?;
        check_content(&targets_name, &raw, targets_meta.length, targets_meta.hashes.get("sha256"))?;
        let targets: Signed<Targets> = Self::decode(&targets_name, &raw)?;
        check_expiry("targets", &targets.signed.expires)?;
        let target = targets
            .signed
            .targets
            .get(TRUSTED_ROOT_TARGET)
            .ok_or_else(|| distribution(format!("targets do not list {}", TRUSTED_ROOT_TARGET)))?;
        let sha256 = target
            .hashes
            .get("sha256")
            .ok_or_else(|| distribution(format!("{} has no sha256 hash", TRUSTED_ROOT_TARGET)))?;

        // 4. the target itself, by hash
        let target_name = format!("targets/{}.{}", sha256, TRUSTED_ROOT_TARGET);
        let raw = self.get(&target_name).await?;
        check_content(&target_name, &raw, Some(target.length), Some(sha256))?;

        tracing::debug!(snapshot = snapshot_meta.version, targets = targets_meta.version, "TUF walk complete");
        Ok(raw)
    }
}

/// The writer lock for a persisted trust root, shared by every updater in
/// the process that targets the same file
async fn path_lock(path: &Path) -> Result<Arc<Mutex<()>>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

    let dir = parent_dir(path);
    tokio::fs::create_dir_all(dir).await?;
    let key = match path.file_name() {
        Some(name) => tokio::fs::canonicalize(dir).await?.join(name),
        None => path.to_path_buf(),
    };

    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    Ok(locks.entry(key).or_default().clone())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Keeps the persisted trusted root current
pub struct TrustRootUpdater {
    source: Box<dyn TrustRootSource>,
    path: PathBuf,
}

impl std::fmt::Debug for TrustRootUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRootUpdater").field("path", &self.path).finish()
    }
}

impl TrustRootUpdater {
    pub fn new(source: impl TrustRootSource + 'static, path: impl Into<PathBuf>) -> Self {
        Self {
            source: Box::new(source),
            path: path.into(),
        }
    }

    /// Updater over the configured TUF repository and trust root path
    pub fn from_config(config: &VerifierConfig) -> Result<Self> {
        Ok(Self::new(TufHttpSource::new(config)?, config.trust_root_path.clone()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch, validate and persist a new trusted root
    ///
    /// On any failure the previously persisted file is left untouched.
    pub async fn update(&self) -> Result<TrustedRoot> {
        let lock = path_lock(&self.path).await?;
        let _guard = lock.lock().await;
        self.update_locked().await
    }

    async fn update_locked(&self) -> Result<TrustedRoot> {
        let raw = self.source.fetch().await.map_err(|e| match e {
            Error::TrustRootDistribution(_) => e,
            other => distribution(format!("Trust root source unreachable: {}", other)),
        })?;
        let root = TrustedRoot::from_json(&raw)
            .map_err(|e| distribution(format!("Fetched trust root is unusable: {}", e)))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || persist_atomically(&path, &raw))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        tracing::info!(path = %self.path.display(), "trust root updated");
        Ok(root)
    }

    /// The persisted root if present and fresh enough, otherwise a new one
    ///
    /// Concurrent callers that all find the root missing or stale fetch it
    /// once: the rest pick up the file the first one wrote.
    pub async fn load_or_update(&self, max_age: Option<Duration>) -> Result<TrustedRoot> {
        if let Some(root) = self.load_current(max_age)? {
            return Ok(root);
        }

        let lock = path_lock(&self.path).await?;
        let _guard = lock.lock().await;
        match self.load_current(max_age)? {
            Some(root) => Ok(root),
            None => self.update_locked().await,
        }
    }

    /// The persisted root, or `None` when it is missing or stale
    fn load_current(&self, max_age: Option<Duration>) -> Result<Option<TrustedRoot>> {
        match TrustedRoot::load(&self.path, max_age) {
            Ok(root) => Ok(Some(root)),
            Err(Error::StaleTrustRoot { .. }) => Ok(None),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Write `data` to a temp file next to `path`, fsync it, then rename it over
/// `path`
fn persist_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
