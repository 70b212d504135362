//! Sigstore verification for code provenance
//!
//! This module verifies that a release digest was produced by the
//! repository's GitHub Actions release workflow and recovers the
//! measurement the workflow published for it:
//! 1. The signing certificate chains to a Fulcio CA in the trusted root
//! 2. The signature is recorded in a pinned Rekor log (SET and/or inclusion proof)
//! 3. Embedded SCTs verify against pinned CT logs
//! 4. The DSSE envelope is signed by the certificate key
//! 5. The certificate identity is the repository's release workflow
//! 6. The in-toto statement's subject is the release digest
//!
//! Every check runs offline against a [`TrustedRoot`]; fetching the bundle
//! and keeping the root current are the jobs of [`crate::github`] and
//! [`crate::updater`].

pub mod bundle;
pub mod dsse;
pub mod identity;
pub mod sct;
pub mod tlog;
pub mod trust_root;

use std::time::Duration;

use x509_cert::Certificate;

pub use bundle::Bundle;
pub use dsse::InTotoStatement;
pub use identity::CertificateIdentity;
pub use trust_root::TrustedRoot;

use crate::attestation::{Measurement, PredicateType};
use crate::cert;
use crate::config::VerifierConfig;
use crate::error::{Error, Result};

/// How many independent confirmations a bundle needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierOptions {
    /// Embedded SCTs from trusted CT logs
    pub sct_threshold: usize,
    /// Verified transparency log entries
    pub tlog_threshold: usize,
    /// Trusted signing-time observations (SET-backed integrated times)
    pub observer_threshold: usize,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            sct_threshold: 1,
            tlog_threshold: 1,
            observer_threshold: 1,
        }
    }
}

impl From<&VerifierConfig> for VerifierOptions {
    fn from(config: &VerifierConfig) -> Self {
        Self {
            sct_threshold: config.sct_threshold,
            tlog_threshold: config.tlog_threshold,
            observer_threshold: config.observer_threshold,
        }
    }
}

/// Offline verifier for Sigstore provenance bundles
#[derive(Debug, Clone, Default)]
pub struct ProvenanceVerifier {
    options: VerifierOptions,
}

/// A failed check, tagged with the stage that rejected it
fn reject(stage: &'static str, reason: impl std::fmt::Display) -> Error {
    tracing::debug!(stage, %reason, "provenance check failed");
    Error::Verification(format!("{}: {}", stage, reason))
}

impl ProvenanceVerifier {
    pub fn new(options: VerifierOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &VerifierOptions {
        &self.options
    }

    /// Verify `bundle_json` for the digest `hex_digest` of a `repo`
    /// (`owner/name`) release and return the measurement it attests to
    pub fn verify_attested_measurements(
        &self,
        trusted_root_json: &[u8],
        bundle_json: &[u8],
        hex_digest: &str,
        repo: &str,
    ) -> Result<Measurement> {
        let root = TrustedRoot::from_json(trusted_root_json)?;
        self.verify_with_root(&root, bundle_json, hex_digest, repo)
    }

    /// [`ProvenanceVerifier::verify_attested_measurements`] with an already
    /// parsed root
    pub fn verify_with_root(
        &self,
        root: &TrustedRoot,
        bundle_json: &[u8],
        hex_digest: &str,
        repo: &str,
    ) -> Result<Measurement> {
        // 1. Parse bundle
        let bundle = Bundle::from_json(bundle_json)?;

        // 2. Identity policy for the release workflow
        let identity = CertificateIdentity::github_release(repo)?;

        // 3. Decode the artifact digest
        let digest = hex::decode(hex_digest.trim())
            .map_err(|e| Error::Parse(format!("Invalid hex digest {:?}: {}", hex_digest, e)))?;
        if digest.len() != 32 {
            return Err(Error::Parse(format!("Digest is {} bytes, expected 32", digest.len())));
        }

        // 4. Cryptographic verification
        let statement = self.verify_bundle(root, &bundle, &identity, &digest)?;

        // 5. Extract measurement from the verified statement
        let measurement = measurement_from_statement(&statement)?;
        tracing::info!(repo, predicate = %measurement.type_, "provenance verified");
        Ok(measurement)
    }

    fn verify_bundle(
        &self,
        root: &TrustedRoot,
        bundle: &Bundle,
        identity: &CertificateIdentity,
        digest: &[u8],
    ) -> Result<InTotoStatement> {
        let envelope = bundle
            .dsse_envelope
            .as_ref()
            .ok_or_else(|| reject("bundle", "no DSSE envelope"))?;
        let leaf_der = bundle.leaf_certificate().map_err(|e| reject("bundle", e))?;
        let leaf = cert::parse(&leaf_der).map_err(|e| reject("certificate", e))?;

        // Transparency log entries
        let mut verified_entries = 0;
        let mut observed_times = Vec::new();
        for entry in &bundle.verification_material.tlog_entries {
            let verified = tlog::verify_entry(root, entry, envelope).map_err(|e| reject("tlog", e))?;
            verified_entries += 1;
            observed_times.extend(verified.signed_time);
        }
        if verified_entries < self.options.tlog_threshold {
            return Err(reject(
                "tlog",
                format!("{} verified entries, need {}", verified_entries, self.options.tlog_threshold),
            ));
        }
        if observed_times.len() < self.options.observer_threshold {
            return Err(reject(
                "timestamps",
                format!(
                    "{} trusted timestamps, need {}",
                    observed_times.len(),
                    self.options.observer_threshold
                ),
            ));
        }

        // The certificate must have been valid whenever the signature was observed
        let signing_times = if observed_times.is_empty() {
            vec![cert::validity(&leaf).0 as i64]
        } else {
            observed_times
        };
        for &t in &signing_times {
            let at = Duration::from_secs(u64::try_from(t).map_err(|_| reject("timestamps", "negative time"))?);
            cert::check_validity(&leaf, at).map_err(|e| reject("certificate", e))?;
        }
        if !cert::has_extended_key_usage(&leaf, &cert::ID_KP_CODE_SIGNING).map_err(|e| reject("certificate", e))? {
            return Err(reject("certificate", "leaf is not a code-signing certificate"));
        }

        // Chain to a Fulcio CA
        let issuer = verify_chain(root, &leaf, &signing_times).map_err(|e| reject("chain", e))?;

        // Certificate transparency
        if self.options.sct_threshold > 0 {
            let scts = sct::count_verified(root, &leaf, &issuer).map_err(|e| reject("sct", e))?;
            if scts < self.options.sct_threshold {
                return Err(reject(
                    "sct",
                    format!("{} verified SCTs, need {}", scts, self.options.sct_threshold),
                ));
            }
        }

        // Envelope signature and signer identity
        let payload = dsse::verify_envelope(envelope, &leaf).map_err(|e| reject("dsse", e))?;
        identity.verify(&leaf).map_err(|e| reject("identity", e))?;

        // Statement bound to the artifact
        if envelope.payload_type != dsse::IN_TOTO_PAYLOAD_TYPE {
            return Err(reject("statement", format!("payload type {}", envelope.payload_type)));
        }
        let statement: InTotoStatement =
            serde_json::from_slice(&payload).map_err(|e| reject("statement", e))?;
        if !statement.has_sha256_subject(digest) {
            return Err(reject(
                "statement",
                format!("no subject with sha256 {}", hex::encode(digest)),
            ));
        }

        Ok(statement)
    }
}

/// Find a CA in the trusted root, valid at every signing time, whose chain
/// issued `leaf`. Returns the immediate issuer.
fn verify_chain(
    root: &TrustedRoot,
    leaf: &Certificate,
    signing_times: &[i64],
) -> std::result::Result<Certificate, String> {
    let mut last_error = String::from("no certificate authority in the trusted root");

    for ca in &root.certificate_authorities {
        if !signing_times.iter().all(|&t| ca.valid_for.contains(t)) {
            continue;
        }
        let chain = ca.certificates()?;
        match check_chain(leaf, &chain, signing_times) {
            Ok(()) => return chain.into_iter().next().ok_or_else(|| "empty CA chain".to_string()),
            Err(e) => last_error = format!("{}: {}", ca.uri, e),
        }
    }
    Err(last_error)
}

/// Each certificate above the leaf must itself be valid at every signing time
fn check_chain(leaf: &Certificate, chain: &[Certificate], signing_times: &[i64]) -> std::result::Result<(), String> {
    let mut child = leaf;
    for issuer in chain {
        cert::verify_issued_by(child, issuer).map_err(|e| e.to_string())?;
        for &t in signing_times {
            let at = Duration::from_secs(u64::try_from(t).map_err(|_| "negative signing time".to_string())?);
            cert::check_validity(issuer, at).map_err(|e| format!("issuer certificate: {}", e))?;
        }
        child = issuer;
    }
    // The last certificate must be the self-signed anchor
    cert::verify_issued_by(child, child).map_err(|e| format!("chain anchor: {}", e))
}

/// Predicate fields holding each register, in register order
fn register_fields(predicate_type: &PredicateType) -> Option<&'static [&'static str]> {
    if *predicate_type == PredicateType::AWS_NITRO_ENCLAVE_V1 {
        Some(&["PCR0", "PCR1", "PCR2"])
    } else if *predicate_type == PredicateType::SEV_GUEST_V1 {
        Some(&["snp_measurement"])
    } else {
        None
    }
}

/// Extract measurement from a verified in-toto statement
pub fn measurement_from_statement(statement: &InTotoStatement) -> Result<Measurement> {
    let measurement_type = PredicateType::new(statement.predicate_type.clone());
    let fields = register_fields(&measurement_type)
        .ok_or_else(|| Error::UnsupportedPredicate(statement.predicate_type.clone()))?;

    let registers = fields
        .iter()
        .map(|field| {
            statement
                .predicate
                .get(*field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| Error::Parse(format!("Predicate is missing string field {}", field)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Measurement::new(measurement_type, registers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(predicate_type: &str, predicate: serde_json::Value) -> InTotoStatement {
        serde_json::from_value(serde_json::json!({
            "_type": "https://in-toto.io/Statement/v1",
            "subject": [{"name": "image", "digest": {"sha256": "00"}}],
            "predicateType": predicate_type,
            "predicate": predicate,
        }))
        .unwrap()
    }

    #[test]
    fn test_nitro_predicate_mapping() {
        let s = statement(
            PredicateType::AWS_NITRO_ENCLAVE_V1.as_str(),
            serde_json::json!({"PCR0": "aa", "PCR1": "bb", "PCR2": "cc", "PCR8": "dd"}),
        );
        let m = measurement_from_statement(&s).unwrap();
        assert_eq!(m.type_, PredicateType::AWS_NITRO_ENCLAVE_V1);
        assert_eq!(m.registers, vec!["aa", "bb", "cc"]);
    }

    #[test]
    fn test_sev_predicate_mapping() {
        let s = statement(
            PredicateType::SEV_GUEST_V1.as_str(),
            serde_json::json!({"snp_measurement": "abcd"}),
        );
        let m = measurement_from_statement(&s).unwrap();
        assert_eq!(m.type_, PredicateType::SEV_GUEST_V1);
        assert_eq!(m.registers, vec!["abcd"]);
    }

    #[test]
    fn test_unknown_predicate_rejected() {
        let s = statement("https://tinfoil.sh/predicate/tdx-guest/v2", serde_json::json!({}));
        assert!(matches!(measurement_from_statement(&s), Err(Error::UnsupportedPredicate(_))));
    }

    #[test]
    fn test_missing_or_non_string_field() {
        let s = statement(
            PredicateType::AWS_NITRO_ENCLAVE_V1.as_str(),
            serde_json::json!({"PCR0": "aa", "PCR1": "bb"}),
        );
        assert!(matches!(measurement_from_statement(&s), Err(Error::Parse(_))));

        let s = statement(
            PredicateType::SEV_GUEST_V1.as_str(),
            serde_json::json!({"snp_measurement": 5}),
        );
        assert!(matches!(measurement_from_statement(&s), Err(Error::Parse(_))));
    }

    #[test]
    fn test_options_from_config() {
        let config = VerifierConfig {
            sct_threshold: 0,
            ..VerifierConfig::default()
        };
        let options = VerifierOptions::from(&config);
        assert_eq!(options.sct_threshold, 0);
        assert_eq!(options.tlog_threshold, 1);
    }
}
