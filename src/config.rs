//! Verifier configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::attestation::FingerprintEncoding;
use crate::error::{Error, Result};

/// Well-known path of the attestation endpoint on an enclave host
pub const ATTESTATION_ENDPOINT: &str = "/.well-known/tinfoil-attestation";

/// Sigstore public-good TUF repository
pub const SIGSTORE_TUF_URL: &str = "https://tuf-repo-cdn.sigstore.dev";

pub const GITHUB_API_URL: &str = "https://api.github.com";
pub const GITHUB_DOWNLOAD_URL: &str = "https://github.com";

/// Default on-disk location of the persisted trust root
pub const TRUST_ROOT_FILE: &str = "trusted_root.json";

/// Settings shared by the fetch, provenance and update paths
///
/// Every field has a default, so a config file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct VerifierConfig {
    pub attestation_path: String,
    pub fetch_timeout_secs: u64,
    pub trust_root_path: PathBuf,
    /// Reject a persisted trust root older than this. `None` disables the check.
    pub trust_root_max_age_secs: Option<u64>,
    pub tuf_url: String,
    pub github_api_url: String,
    pub github_download_url: String,
    pub kds_url: String,
    pub fingerprint_encoding: FingerprintEncoding,
    pub sct_threshold: usize,
    pub tlog_threshold: usize,
    pub observer_threshold: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            attestation_path: ATTESTATION_ENDPOINT.to_string(),
            fetch_timeout_secs: 30,
            trust_root_path: PathBuf::from(TRUST_ROOT_FILE),
            trust_root_max_age_secs: None,
            tuf_url: SIGSTORE_TUF_URL.to_string(),
            github_api_url: GITHUB_API_URL.to_string(),
            github_download_url: GITHUB_DOWNLOAD_URL.to_string(),
            kds_url: crate::attestation::sev::DEFAULT_KDS_URL.to_string(),
            fingerprint_encoding: FingerprintEncoding::Legacy,
            sct_threshold: 1,
            tlog_threshold: 1,
            observer_threshold: 1,
        }
    }
}

impl VerifierConfig {
    /// Load a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Parse(format!("Config {}: {}", path.display(), e)))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn trust_root_max_age(&self) -> Option<Duration> {
        self.trust_root_max_age_secs.map(Duration::from_secs)
    }
}
