//! Error types for the verifier

use std::time::Duration;

use thiserror::Error;

use crate::attestation::types::MeasurementError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Attestation format mismatch: expected {expected}, got {actual}")]
    FormatMismatch { expected: String, actual: String },

    #[error("Unsupported attestation format: {0}")]
    UnsupportedFormat(String),

    #[error("Measurement mismatch: expected {expected}, got {actual}")]
    MeasurementMismatch { expected: String, actual: String },

    #[error("Unsupported predicate type: {0}")]
    UnsupportedPredicate(String),

    #[error("Provenance verification failed: {0}")]
    Verification(String),

    #[error("Attestation verification failed: {0}")]
    AttestationVerification(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Attested report data does not contain the TLS certificate fingerprint {0}")]
    ChannelBindingMismatch(String),

    #[error("Trust root distribution failed: {0}")]
    TrustRootDistribution(String),

    #[error("Trust root is stale: age {age:?} exceeds maximum {max_age:?}")]
    StaleTrustRoot { age: Duration, max_age: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Lift a [`MeasurementError`] into the crate error, attaching both
    /// measurements' fingerprints for context.
    pub fn from_measurement(
        err: MeasurementError,
        expected: &crate::attestation::Measurement,
        actual: &crate::attestation::Measurement,
    ) -> Self {
        match err {
            MeasurementError::FormatMismatch => Error::FormatMismatch {
                expected: expected.type_.to_string(),
                actual: actual.type_.to_string(),
            },
            MeasurementError::MeasurementMismatch => Error::MeasurementMismatch {
                expected: expected.fingerprint(),
                actual: actual.fingerprint(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
