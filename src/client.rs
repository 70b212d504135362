//! Secure client: the full trust decision for one enclave
//!
//! [`SecureClient::verify`] runs the four checks and returns
//! [`GroundTruth`] only when all of them pass:
//! 1. Fetch the attestation document and the TLS certificate that served it
//! 2. Verify the hardware attestation (AWS Nitro or AMD SEV-SNP)
//! 3. Verify the release provenance of the repository's latest release
//! 4. Compare the two measurements and check the report data binds the
//!    TLS certificate

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::attestation::{self, sev, FormatRegistry, GroundTruth, Measurement, PredicateType, Verification};
use crate::config::VerifierConfig;
use crate::error::{Error, Result};
use crate::github::GithubClient;
use crate::sigstore::{ProvenanceVerifier, TrustedRoot, VerifierOptions};
use crate::tls::{CertFingerprint, ChannelBinder};
use crate::updater::TrustRootUpdater;

/// Combine verified hardware and provenance results into a trust decision
///
/// Both successes are required but not sufficient: the measurements must
/// be identical and the report data must carry `cert_fp`.
pub fn establish_trust(
    cert_fp: &CertFingerprint,
    verification: Verification,
    expected: Measurement,
    release_tag: impl Into<String>,
) -> Result<GroundTruth> {
    expected
        .equals(&verification.measurement)
        .map_err(|e| Error::from_measurement(e, &expected, &verification.measurement))?;

    attestation::verify_channel_binding(&verification.report_data, cert_fp)?;

    Ok(GroundTruth {
        cert_fingerprint: cert_fp.to_hex(),
        expected_measurement: expected,
        enclave_measurement: verification.measurement,
        release_tag: release_tag.into(),
    })
}

/// Verifies enclaves against the releases of their source repositories
pub struct SecureClient {
    config: VerifierConfig,
    binder: ChannelBinder,
    github: GithubClient,
    provenance: ProvenanceVerifier,
    registry: FormatRegistry,
    /// Fixed root; when unset the persisted root is loaded (and refreshed)
    trust_root: Option<Arc<TrustedRoot>>,
    updater: Arc<TrustRootUpdater>,
    http: reqwest::Client,
}

impl SecureClient {
    pub fn new(config: VerifierConfig) -> Result<Self> {
        let binder = ChannelBinder::new(&config)?;
        let github = GithubClient::new(&config)?;
        let provenance = ProvenanceVerifier::new(VerifierOptions::from(&config));
        let updater = Arc::new(TrustRootUpdater::from_config(&config)?);

        Ok(Self {
            binder,
            github,
            provenance,
            registry: FormatRegistry::default(),
            trust_root: None,
            updater,
            http: reqwest::Client::new(),
            config,
        })
    }

    /// Use a binder with extra TLS roots
    pub fn with_binder(mut self, binder: ChannelBinder) -> Self {
        self.binder = binder;
        self
    }

    /// Verify against a fixed trusted root instead of the persisted one
    pub fn with_trust_root(mut self, root: Arc<TrustedRoot>) -> Self {
        self.trust_root = Some(root);
        self
    }

    /// Keep the persisted root current through `updater`
    pub fn with_updater(mut self, updater: Arc<TrustRootUpdater>) -> Self {
        self.updater = updater;
        self
    }

    /// Replace the attestation format registry
    pub fn with_registry(mut self, registry: FormatRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify the enclave at `host` runs the latest release of `repo`
    pub async fn verify(&self, host: &str, repo: &str) -> Result<GroundTruth> {
        self.verify_with_cancel(host, repo, &CancellationToken::new()).await
    }

    /// [`SecureClient::verify`], abandoned as soon as `cancel` fires
    pub async fn verify_with_cancel(
        &self,
        host: &str,
        repo: &str,
        cancel: &CancellationToken,
    ) -> Result<GroundTruth> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.run(host, repo) => res,
        }
    }

    async fn run(&self, host: &str, repo: &str) -> Result<GroundTruth> {
        // 1. Fetch attestation from enclave
        let (doc, cert_fp) = self.binder.fetch(host).await?;

        // 2. Verify hardware attestation
        let registry = self.registry_for(&doc).await?;
        let verification = doc.verify(&registry)?;

        // 3. Resolve the release and its provenance bundle
        let tag = self.github.fetch_latest_tag(repo).await?;
        let digest = self.github.fetch_digest(repo, &tag).await?;
        let bundle = self.github.fetch_attestation_bundle(repo, &digest).await?;

        // 4. Verify provenance offline against the trusted root
        let root = self.trusted_root().await?;
        let expected = self.provenance.verify_with_root(&root, &bundle, &digest, repo)?;

        // 5. Compare measurements and check the channel binding
        let encoding = self.config.fingerprint_encoding;
        tracing::debug!(
            expected = %expected.fingerprint_with(encoding),
            enclave = %verification.measurement.fingerprint_with(encoding),
            "comparing measurements"
        );
        let ground_truth = establish_trust(&cert_fp, verification, expected, tag).map_err(|e| {
            tracing::warn!(host, repo, error = %e, "enclave rejected");
            e
        })?;

        tracing::info!(host, repo, tag = %ground_truth.release_tag, "enclave verified");
        Ok(ground_truth)
    }

    /// The configured registry, plus an SEV-SNP verifier built from fetched
    /// collateral when the document needs one and none is registered
    async fn registry_for(&self, doc: &attestation::AttestationDocument) -> Result<FormatRegistry> {
        if doc.format != PredicateType::SEV_GUEST_V1 || self.registry.get(&doc.format).is_some() {
            return Ok(self.registry.clone());
        }

        let collateral =
            sev::fetch_collateral(&self.http, &self.config.kds_url, &doc.body, self.config.fetch_timeout())
                .await?;
        let mut registry = self.registry.clone();
        registry.register(sev::SevVerifier::new(&collateral)?);
        Ok(registry)
    }

    async fn trusted_root(&self) -> Result<Arc<TrustedRoot>> {
        if let Some(root) = &self.trust_root {
            return Ok(root.clone());
        }
        Ok(Arc::new(self.updater.load_or_update(self.config.trust_root_max_age()).await?))
    }
}

impl std::fmt::Debug for SecureClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureClient")
            .field("registry", &self.registry)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}
