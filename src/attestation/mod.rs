//! Attestation document verification
//!
//! An [`AttestationDocument`] names its format with a [`PredicateType`] and
//! carries an opaque body. [`AttestationDocument::verify`] looks the format
//! up in a [`FormatRegistry`] and hands the body to the registered
//! [`FormatVerifier`], which checks the hardware vendor's signature chain and
//! returns the measured registers plus the report-data region.
//!
//! ## TLS Binding
//! The report data commits to the enclave's TLS certificate. After fetching
//! a document over TLS, [`verify_channel_binding`] checks that the report
//! data carries the fingerprint of the certificate seen on that connection.

pub mod nitro;
pub mod sev;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

pub use types::{
    AttestationDocument, FingerprintEncoding, GroundTruth, Measurement, MeasurementError, PredicateType,
    Verification,
};

use crate::error::{Error, Result};
use crate::tls::CertFingerprint;

/// Decoder and signature-chain verifier for one attestation format
///
/// Implementations must be pure functions of the body and their own
/// construction-time trust anchors: no network I/O, no interior mutability.
pub trait FormatVerifier: Send + Sync {
    /// Format this verifier handles
    fn predicate_type(&self) -> PredicateType;

    /// Verify an encoded attestation body
    fn verify(&self, body: &str) -> Result<Verification>;
}

/// Dispatch table from [`PredicateType`] to [`FormatVerifier`]
#[derive(Clone)]
pub struct FormatRegistry {
    verifiers: HashMap<PredicateType, Arc<dyn FormatVerifier>>,
}

impl FormatRegistry {
    /// An empty registry; every document fails with `UnsupportedFormat`
    pub fn empty() -> Self {
        Self {
            verifiers: HashMap::new(),
        }
    }

    /// Register (or replace) the verifier for its predicate type
    pub fn register(&mut self, verifier: impl FormatVerifier + 'static) -> &mut Self {
        self.verifiers.insert(verifier.predicate_type(), Arc::new(verifier));
        self
    }

    pub fn get(&self, format: &PredicateType) -> Option<&Arc<dyn FormatVerifier>> {
        self.verifiers.get(format)
    }

    pub fn formats(&self) -> impl Iterator<Item = &PredicateType> {
        self.verifiers.keys()
    }
}

impl Default for FormatRegistry {
    /// Registers the formats whose trust anchors are compiled in (AWS Nitro).
    /// SEV-SNP needs per-chip collateral, see [`sev::SevVerifier::new`].
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(nitro::NitroVerifier::default());
        registry
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.verifiers.keys()).finish()
    }
}

impl AttestationDocument {
    /// Parse a JSON-encoded document
    pub fn from_json(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json).map_err(|e| Error::Parse(format!("Attestation document: {}", e)))
    }

    /// Verify the document with the verifier registered for its format
    pub fn verify(&self, registry: &FormatRegistry) -> Result<Verification> {
        let verifier = registry
            .get(&self.format)
            .ok_or_else(|| Error::UnsupportedFormat(self.format.to_string()))?;

        let verification = verifier.verify(&self.body)?;

        // A verifier must report the format it was dispatched for
        if verification.measurement.type_ != self.format {
            return Err(Error::FormatMismatch {
                expected: self.format.to_string(),
                actual: verification.measurement.type_.to_string(),
            });
        }

        tracing::info!(format = %self.format, "attestation document verified");
        Ok(verification)
    }
}

/// Guess the platform from the decoded body's leading bytes
///
/// gzip magic means an SEV-SNP report; a COSE_Sign1 tag or bare 4-array means
/// a Nitro document. Anything else is left to the verifier.
pub(crate) fn sniff_format(raw: &[u8]) -> Option<PredicateType> {
    match raw {
        [0x1f, 0x8b, ..] => Some(PredicateType::SEV_GUEST_V1),
        [0xd2, 0x84, ..] | [0x84, ..] => Some(PredicateType::AWS_NITRO_ENCLAVE_V1),
        _ => None,
    }
}

/// Check that attested report data is bound to the TLS certificate seen on
/// the connection the document was fetched over
///
/// The fingerprint must occupy the leading bytes of the report data.
pub fn verify_channel_binding(report_data: &[u8], fingerprint: &CertFingerprint) -> Result<()> {
    let expected = fingerprint.as_bytes();
    match report_data.get(..expected.len()) {
        Some(prefix) if prefix == expected => Ok(()),
        _ => Err(Error::ChannelBindingMismatch(fingerprint.to_hex())),
    }
}
