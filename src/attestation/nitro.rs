//! AWS Nitro Enclaves attestation verification
//!
//! The document body is a base64 COSE_Sign1 structure:
//! 1. Decode the CBOR envelope and attestation payload
//! 2. Verify the CA bundle starts at the pinned AWS Nitro root
//! 3. Verify each certificate link (ECDSA P-384 / SHA-384) and validity
//! 4. Verify the COSE signature against the leaf certificate
//! 5. Extract PCR0..PCR2 and the user data

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use ciborium::value::Value;
use p384::ecdsa::signature::Verifier;

use super::types::{Measurement, PredicateType, Verification};
use super::FormatVerifier;
use crate::cert;
use crate::error::{Error, Result};

/// SHA-256 of the DER encoding of the AWS Nitro Enclaves root certificate (G1)
///
/// Published at https://aws-nitro-enclaves.amazonaws.com/AWS_NitroEnclaves_Root-G1.zip
pub const AWS_NITRO_ROOT_FINGERPRINT: &str =
    "641a0321a3e244efe456463195d606317ed7cdcc3c1756e09893f3c68f79bb5b";

/// COSE algorithm identifier for ECDSA w/ SHA-384
const COSE_ALG_ES384: i128 = -35;
const COSE_TAG_SIGN1: u64 = 18;
const SIGNATURE_SIZE: usize = 96;

/// Registers mapped from PCR indices, in order
const MEASURED_PCRS: [i128; 3] = [0, 1, 2];

/// Verifier for [`PredicateType::AWS_NITRO_ENCLAVE_V1`]
#[derive(Debug, Clone)]
pub struct NitroVerifier {
    root_fingerprint: String,
}

impl Default for NitroVerifier {
    fn default() -> Self {
        Self {
            root_fingerprint: AWS_NITRO_ROOT_FINGERPRINT.to_string(),
        }
    }
}

impl NitroVerifier {
    /// Pin a different root (e.g. a private test PKI)
    pub fn with_root_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            root_fingerprint: fingerprint.into().to_lowercase(),
        }
    }
}

impl FormatVerifier for NitroVerifier {
    fn predicate_type(&self) -> PredicateType {
        PredicateType::AWS_NITRO_ENCLAVE_V1
    }

    fn verify(&self, body: &str) -> Result<Verification> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| Error::Parse(format!("Nitro attestation base64: {}", e)))?;

        if let Some(detected) = super::sniff_format(&raw) {
            if detected != PredicateType::AWS_NITRO_ENCLAVE_V1 {
                return Err(Error::FormatMismatch {
                    expected: PredicateType::AWS_NITRO_ENCLAVE_V1.to_string(),
                    actual: detected.to_string(),
                });
            }
        }

        let sign1 = CoseSign1::decode(&raw)?;
        let doc = NitroDocument::decode(&sign1.payload)?;

        let leaf = self.verify_chain(&doc)?;
        sign1.verify(&leaf)?;

        let registers = MEASURED_PCRS
            .iter()
            .map(|index| {
                doc.pcrs.get(index).map(hex::encode).ok_or_else(|| {
                    Error::AttestationVerification(format!("Missing PCR{}", index))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(module_id = %doc.module_id, "nitro attestation verified");

        Ok(Verification {
            measurement: Measurement::new(PredicateType::AWS_NITRO_ENCLAVE_V1, registers),
            report_data: doc.user_data.unwrap_or_default(),
        })
    }
}

impl NitroVerifier {
    /// Verify root pin and every link down to the leaf; returns the leaf
    fn verify_chain(&self, doc: &NitroDocument) -> Result<x509_cert::Certificate> {
        let attest_err = |e: cert::CertError| Error::AttestationVerification(e.to_string());

        let root_der = doc
            .cabundle
            .first()
            .ok_or_else(|| Error::AttestationVerification("Empty CA bundle".into()))?;

        let root_fp = cert::der_fingerprint(root_der);
        if root_fp != self.root_fingerprint {
            return Err(Error::AttestationVerification(format!(
                "Nitro root fingerprint mismatch: expected {}, got {}",
                self.root_fingerprint, root_fp
            )));
        }

        let at = Duration::from_millis(doc.timestamp);
        let mut issuer = cert::parse(root_der).map_err(attest_err)?;
        cert::check_validity(&issuer, at).map_err(attest_err)?;

        for der in doc.cabundle[1..].iter().chain(std::iter::once(&doc.certificate)) {
            let child = cert::parse(der).map_err(attest_err)?;
            cert::verify_issued_by(&child, &issuer).map_err(attest_err)?;
            cert::check_validity(&child, at).map_err(attest_err)?;
            issuer = child;
        }

        Ok(issuer)
    }
}

struct CoseSign1 {
    protected: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl CoseSign1 {
    fn decode(raw: &[u8]) -> Result<Self> {
        let value: Value = ciborium::de::from_reader(raw)
            .map_err(|e| Error::Parse(format!("COSE_Sign1 CBOR: {}", e)))?;

        let value = match value {
            Value::Tag(COSE_TAG_SIGN1, inner) => *inner,
            other => other,
        };

        let items = match value {
            Value::Array(items) if items.len() == 4 => items,
            _ => return Err(Error::Parse("COSE_Sign1 is not a 4-element array".into())),
        };

        let mut items = items.into_iter();
        let protected = take_bytes(items.next(), "protected header")?;
        let _unprotected = items.next();
        let payload = take_bytes(items.next(), "payload")?;
        let signature = take_bytes(items.next(), "signature")?;

        let header: Value = ciborium::de::from_reader(protected.as_slice())
            .map_err(|e| Error::Parse(format!("COSE protected header: {}", e)))?;
        let alg = map_get_int(&header, 1)
            .ok_or_else(|| Error::Parse("COSE protected header has no algorithm".into()))?;
        if alg != COSE_ALG_ES384 {
            return Err(Error::AttestationVerification(format!(
                "Unexpected COSE algorithm {}, expected ES384",
                alg
            )));
        }

        Ok(Self { protected, payload, signature })
    }

    /// Check the ES384 signature over the COSE Sig_structure
    fn verify(&self, leaf: &x509_cert::Certificate) -> Result<()> {
        if self.signature.len() != SIGNATURE_SIZE {
            return Err(Error::AttestationVerification(format!(
                "COSE signature must be {} bytes, got {}",
                SIGNATURE_SIZE,
                self.signature.len()
            )));
        }

        let to_be_signed = sig_structure(&self.protected, &self.payload)?;

        let pubkey = leaf.tbs_certificate.subject_public_key_info.subject_public_key.raw_bytes();
        let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(pubkey)
            .map_err(|e| Error::AttestationVerification(format!("Invalid leaf public key: {}", e)))?;
        let sig = p384::ecdsa::Signature::from_slice(&self.signature)
            .map_err(|e| Error::AttestationVerification(format!("Invalid COSE signature: {}", e)))?;

        key.verify(&to_be_signed, &sig)
            .map_err(|e| Error::AttestationVerification(format!("COSE signature verification failed: {}", e)))
    }
}

/// `["Signature1", protected, external_aad = h'', payload]`
fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let structure = Value::Array(vec![
        Value::Text("Signature1".into()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]);
    let mut out = Vec::new();
    ciborium::ser::into_writer(&structure, &mut out)
        .map_err(|e| Error::Parse(format!("Sig_structure encoding: {}", e)))?;
    Ok(out)
}

struct NitroDocument {
    module_id: String,
    timestamp: u64,
    pcrs: BTreeMap<i128, Vec<u8>>,
    certificate: Vec<u8>,
    cabundle: Vec<Vec<u8>>,
    user_data: Option<Vec<u8>>,
}

impl NitroDocument {
    fn decode(payload: &[u8]) -> Result<Self> {
        let value: Value = ciborium::de::from_reader(payload)
            .map_err(|e| Error::Parse(format!("Nitro attestation payload: {}", e)))?;
        let fields = match value {
            Value::Map(fields) => fields,
            _ => return Err(Error::Parse("Nitro attestation payload is not a map".into())),
        };

        let mut module_id = None;
        let mut digest = None;
        let mut timestamp = None;
        let mut pcrs = BTreeMap::new();
        let mut certificate = None;
        let mut cabundle = Vec::new();
        let mut user_data = None;

        for (key, value) in fields {
            let Value::Text(key) = key else { continue };
            match (key.as_str(), value) {
                ("module_id", Value::Text(v)) => module_id = Some(v),
                ("digest", Value::Text(v)) => digest = Some(v),
                ("timestamp", Value::Integer(v)) => {
                    timestamp = Some(u64::try_from(v).map_err(|_| Error::Parse("Negative timestamp".into()))?)
                }
                ("pcrs", Value::Map(entries)) => {
                    for (index, value) in entries {
                        if let (Value::Integer(index), Value::Bytes(value)) = (index, value) {
                            pcrs.insert(i128::from(index), value);
                        }
                    }
                }
                ("certificate", Value::Bytes(v)) => certificate = Some(v),
                ("cabundle", Value::Array(certs)) => {
                    for c in certs {
                        cabundle.push(take_bytes(Some(c), "cabundle entry")?);
                    }
                }
                ("user_data", Value::Bytes(v)) => user_data = Some(v),
                _ => {}
            }
        }

        match digest.as_deref() {
            Some("SHA384") => {}
            other => {
                return Err(Error::AttestationVerification(format!(
                    "Unexpected PCR digest {:?}, expected SHA384",
                    other
                )))
            }
        }

        Ok(Self {
            module_id: module_id.ok_or_else(|| Error::Parse("Missing module_id".into()))?,
            timestamp: timestamp.ok_or_else(|| Error::Parse("Missing timestamp".into()))?,
            pcrs,
            certificate: certificate.ok_or_else(|| Error::Parse("Missing certificate".into()))?,
            cabundle,
            user_data,
        })
    }
}

fn take_bytes(value: Option<Value>, what: &str) -> Result<Vec<u8>> {
    match value {
        Some(Value::Bytes(b)) => Ok(b),
        _ => Err(Error::Parse(format!("COSE {} must be a byte string", what))),
    }
}

fn map_get_int(map: &Value, key: i128) -> Option<i128> {
    let Value::Map(entries) = map else { return None };
    entries.iter().find_map(|(k, v)| match (k, v) {
        (Value::Integer(k), Value::Integer(v)) if i128::from(*k) == key => Some(i128::from(*v)),
        _ => None,
    })
}
