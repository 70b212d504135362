//! Release lookups on GitHub
//!
//! Resolves the latest release of a repository to the digest it published
//! and fetches the Sigstore bundle GitHub stores for that digest. Nothing
//! here is trusted: the bundle is checked by [`crate::sigstore`].

use std::time::Duration;

use serde::Deserialize;

use crate::config::VerifierConfig;
use crate::error::{Error, Result};

/// Release asset holding the hex digest of the enclave image
pub const DIGEST_ASSET: &str = "tinfoil.hash";

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    attestations: Vec<AttestationEntry>,
}

#[derive(Debug, Deserialize)]
struct AttestationEntry {
    bundle: serde_json::Value,
}

/// GitHub REST and release-download client
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    api_url: String,
    download_url: String,
    timeout: Duration,
}

impl GithubClient {
    pub fn new(config: &VerifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("enclave-verifier/", env!("CARGO_PKG_VERSION")))
            .timeout(config.fetch_timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.github_api_url.trim_end_matches('/').to_string(),
            download_url: config.github_download_url.trim_end_matches('/').to_string(),
            timeout: config.fetch_timeout(),
        })
    }

    /// Fetch the latest release tag
    pub async fn fetch_latest_tag(&self, repo: &str) -> Result<String> {
        let url = format!("{}/repos/{}/releases/latest", self.api_url, repo);

        let response: ReleaseResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| Error::Parse(format!("Failed to parse release: {}", e)))?;

        tracing::debug!(repo, tag = %response.tag_name, "latest release");
        Ok(response.tag_name)
    }

    /// Fetch the published digest for a release
    pub async fn fetch_digest(&self, repo: &str, tag: &str) -> Result<String> {
        let url = format!("{}/{}/releases/download/{}/{}", self.download_url, repo, tag, DIGEST_ASSET);

        let digest = self
            .get(&url)
            .await?
            .text()
            .await
            .map_err(|e| Error::Network(format!("Failed to read digest: {}", e)))?;

        Ok(digest.trim().to_string())
    }

    /// Fetch the first Sigstore bundle GitHub holds for `digest`
    pub async fn fetch_attestation_bundle(&self, repo: &str, digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/repos/{}/attestations/sha256:{}", self.api_url, repo, digest);

        let response: AttestationResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| Error::Parse(format!("Failed to parse bundle response: {}", e)))?;

        let bundle = response
            .attestations
            .into_iter()
            .next()
            .ok_or_else(|| Error::Verification(format!("No attestations found for sha256:{}", digest)))?;

        serde_json::to_vec(&bundle.bundle)
            .map_err(|e| Error::Parse(format!("Failed to serialize bundle: {}", e)))
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout)
            } else {
                Error::Network(format!("GET {}: {}", url, e))
            }
        })?;

        if !response.status().is_success() {
            return Err(Error::Network(format!("GET {}: HTTP {}", url, response.status())));
        }
        Ok(response)
    }
}
