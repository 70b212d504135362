//! Core types for attestation verification

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Attestation format identifier (a URI)
///
/// The set is open: a new platform only needs a new value and a
/// [`FormatVerifier`](super::FormatVerifier) registered under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredicateType(Cow<'static, str>);

impl PredicateType {
    pub const AWS_NITRO_ENCLAVE_V1: PredicateType =
        PredicateType(Cow::Borrowed("https://tinfoil.sh/predicate/aws-nitro-enclave/v1"));

    pub const SEV_GUEST_V1: PredicateType =
        PredicateType(Cow::Borrowed("https://tinfoil.sh/predicate/snp-sev-guest/v1"));

    pub fn new(uri: impl Into<String>) -> Self {
        Self(Cow::Owned(uri.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PredicateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PredicateType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Attestation document served by the enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub format: PredicateType,
    /// Format-encoded attestation (base64 for both built-in formats)
    pub body: String,
}

/// Byte encoding fed to SHA-256 when fingerprinting a [`Measurement`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintEncoding {
    /// `type || r0 || r1 || ...` with no delimiter. Compatible with
    /// fingerprints stored by earlier deployments, but two different
    /// register splits can collide.
    #[default]
    Legacy,
    /// `"v2:"` then every field as an 8-byte big-endian length followed by
    /// its bytes.
    LengthPrefixed,
}

/// Measurement registers of an enclave
///
/// Register order is significant: each position is a specific hardware slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub type_: PredicateType,
    pub registers: Vec<String>,
}

impl Measurement {
    pub fn new(type_: PredicateType, registers: Vec<String>) -> Self {
        Self { type_, registers }
    }

    /// Compare measurements exactly: same format, same registers in the same
    /// positions.
    pub fn equals(&self, other: &Measurement) -> Result<(), MeasurementError> {
        if self.type_ != other.type_ {
            return Err(MeasurementError::FormatMismatch);
        }

        if self.registers.len() != other.registers.len() || self.registers != other.registers {
            return Err(MeasurementError::MeasurementMismatch);
        }

        Ok(())
    }

    /// Hex SHA-256 over the legacy encoding
    ///
    /// A display/storage convenience only; use [`Measurement::equals`] for any
    /// trust decision.
    pub fn fingerprint(&self) -> String {
        self.fingerprint_with(FingerprintEncoding::Legacy)
    }

    pub fn fingerprint_with(&self, encoding: FingerprintEncoding) -> String {
        let mut hasher = Sha256::new();
        match encoding {
            FingerprintEncoding::Legacy => {
                hasher.update(self.type_.as_str().as_bytes());
                for register in &self.registers {
                    hasher.update(register.as_bytes());
                }
            }
            FingerprintEncoding::LengthPrefixed => {
                hasher.update(b"v2:");
                let fields = std::iter::once(self.type_.as_str()).chain(self.registers.iter().map(String::as_str));
                for field in fields {
                    hasher.update((field.len() as u64).to_be_bytes());
                    hasher.update(field.as_bytes());
                }
            }
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasurementError {
    #[error("Attestation format mismatch")]
    FormatMismatch,

    #[error("Register values don't match")]
    MeasurementMismatch,
}

/// Result of successful attestation document verification
#[derive(Debug, Clone)]
pub struct Verification {
    /// Enclave measurement registers from the verified report
    pub measurement: Measurement,

    /// The report's user-data / report-data region, used for channel binding
    pub report_data: Vec<u8>,
}

/// Ground truth after full verification
#[derive(Debug, Clone)]
pub struct GroundTruth {
    /// SHA-256 of the enclave's TLS leaf certificate (hex)
    pub cert_fingerprint: String,

    /// Measurement derived from the signed release provenance
    pub expected_measurement: Measurement,

    /// Measurement reported by the hardware
    pub enclave_measurement: Measurement,

    /// Release tag the provenance was taken from
    pub release_tag: String,
}
