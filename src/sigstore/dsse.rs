//! DSSE envelopes and the in-toto statements they carry

use std::collections::HashMap;

use serde::Deserialize;
use x509_cert::Certificate;

use super::bundle::DsseEnvelope;
use super::trust_root::b64_decode;
use crate::cert::{EcdsaKey, HashAlg};

pub const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// Compute DSSE Pre-Authentication Encoding (PAE)
///
/// PAE(type, body) = "DSSEv1" + SP + LEN(type) + SP + type + SP + LEN(body) + SP + body
/// Where:
///   SP = ASCII space (0x20)
///   LEN(s) = ASCII decimal encoding of the byte length of s
pub fn compute_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let type_bytes = payload_type.as_bytes();
    let type_len = type_bytes.len().to_string();
    let body_len = payload.len().to_string();

    let mut pae = Vec::new();
    pae.extend_from_slice(b"DSSEv1");
    pae.push(0x20); // SP
    pae.extend_from_slice(type_len.as_bytes());
    pae.push(0x20); // SP
    pae.extend_from_slice(type_bytes);
    pae.push(0x20); // SP
    pae.extend_from_slice(body_len.as_bytes());
    pae.push(0x20); // SP
    pae.extend_from_slice(payload);

    pae
}

/// Verify the envelope's single signature with the leaf certificate key and
/// return the decoded payload
pub fn verify_envelope(envelope: &DsseEnvelope, leaf: &Certificate) -> Result<Vec<u8>, String> {
    let [signature] = envelope.signatures.as_slice() else {
        return Err(format!("expected one DSSE signature, found {}", envelope.signatures.len()));
    };

    let key = EcdsaKey::from_spki(&leaf.tbs_certificate.subject_public_key_info)
        .map_err(|e| format!("leaf key: {}", e))?;
    let hash = match key {
        EcdsaKey::P256(_) => HashAlg::Sha256,
        EcdsaKey::P384(_) => HashAlg::Sha384,
    };

    let payload = b64_decode("payload", &envelope.payload)?;
    let sig = b64_decode("signature", &signature.sig)?;
    let pae = compute_pae(&envelope.payload_type, &payload);

    key.verify(hash, &pae, &sig)
        .map_err(|e| format!("DSSE signature: {}", e))?;

    Ok(payload)
}

/// In-toto statement from the decoded payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InTotoStatement {
    #[serde(rename = "_type")]
    pub type_: String,
    pub subject: Vec<Subject>,
    pub predicate_type: String,
    #[serde(default)]
    pub predicate: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub name: String,
    pub digest: HashMap<String, String>,
}

impl InTotoStatement {
    /// True when some subject carries exactly this sha256 digest
    pub fn has_sha256_subject(&self, digest: &[u8]) -> bool {
        self.subject.iter().any(|subject| {
            subject
                .digest
                .get("sha256")
                .and_then(|hex_digest| hex::decode(hex_digest).ok())
                .map_or(false, |d| d == digest)
        })
    }
}
