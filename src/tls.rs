//! TLS channel binding
//!
//! [`ChannelBinder`] fetches the attestation document and, from the same
//! connection, the server's leaf certificate. The fingerprint always comes
//! from the TLS session itself, never from anything the server sends in the
//! response body: a relay that terminates TLS can replay a genuine document,
//! but the fingerprint it produces is of its own certificate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::attestation::AttestationDocument;
use crate::config::VerifierConfig;
use crate::error::{Error, Result};

/// SHA-256 of a DER-encoded X.509 certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertFingerprint([u8; 32]);

impl CertFingerprint {
    pub fn from_der(cert_der: &[u8]) -> Self {
        Self(Sha256::digest(cert_der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CertFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fetches attestation documents and captures the serving certificate
#[derive(Debug, Clone)]
pub struct ChannelBinder {
    client: reqwest::Client,
    attestation_path: String,
    timeout: Duration,
}

impl ChannelBinder {
    /// Binder trusting the webpki root set
    pub fn new(config: &VerifierConfig) -> Result<Self> {
        Self::with_roots(config, &[])
    }

    /// Binder trusting the webpki roots plus `extra_roots`
    pub fn with_roots(config: &VerifierConfig, extra_roots: &[CertificateDer<'static>]) -> Result<Self> {
        let mut root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for root in extra_roots {
            root_store
                .add(root.clone())
                .map_err(|e| Error::Network(format!("Invalid root certificate: {}", e)))?;
        }

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Network(format!("Failed to build TLS config: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        // Redirects are refused so the document and the fingerprint always
        // come from the host that was asked.
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .tls_info(true)
            .https_only(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            attestation_path: config.attestation_path.clone(),
            timeout: config.fetch_timeout(),
        })
    }

    /// Fetch the attestation document from `host` and the fingerprint of the
    /// certificate that served it
    pub async fn fetch(&self, host: &str) -> Result<(AttestationDocument, CertFingerprint)> {
        self.fetch_with_cancel(host, &CancellationToken::new()).await
    }

    /// [`ChannelBinder::fetch`], abandoned as soon as `cancel` fires
    pub async fn fetch_with_cancel(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<(AttestationDocument, CertFingerprint)> {
        let url = format!("https://{}{}", host, self.attestation_path);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, self.fetch_url(&url)) => {
                res.map_err(|_| Error::Timeout(self.timeout))?
            }
        }
    }

    async fn fetch_url(&self, url: &str) -> Result<(AttestationDocument, CertFingerprint)> {
        tracing::debug!(%url, "fetching attestation document");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Attestation request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "HTTP {}: {}",
                response.status(),
                response.status().canonical_reason().unwrap_or("Unknown error")
            )));
        }

        let fingerprint = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(CertFingerprint::from_der)
            .ok_or_else(|| Error::Network("No peer certificate on attestation connection".into()))?;

        let body = read_body_limited(response, MAX_ATTESTATION_BYTES, "attestation body").await?;

        let doc = AttestationDocument::from_json(&body)?;
        tracing::debug!(format = %doc.format, cert_fingerprint = %fingerprint, "attestation document fetched");

        Ok((doc, fingerprint))
    }
}

/// Largest attestation document accepted from an enclave
pub const MAX_ATTESTATION_BYTES: usize = 1 << 20;

/// Read a response body, refusing anything longer than `limit` bytes
pub(crate) async fn read_body_limited(
    mut response: reqwest::Response,
    limit: usize,
    what: &str,
) -> Result<Vec<u8>> {
    let too_large = || Error::Parse(format!("{} exceeds {} bytes", what, limit));
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::Network(format!("Failed to read {}: {}", what, e)))?
    {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
