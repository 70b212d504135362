//! Sigstore bundle model (media types v0.1 through v0.3)

use serde::{Deserialize, Deserializer, Serialize};

use super::trust_root::{b64_decode, CertChain, LogId, RawBytes};
use crate::error::{Error, Result};

const MEDIA_TYPE_PREFIX: &str = "application/vnd.dev.sigstore.bundle";

/// int64 fields are strings in proto3 JSON, but some producers emit numbers
fn int64<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Str(String),
        Num(i64),
    }

    match Int64::deserialize(de)? {
        Int64::Num(n) => Ok(n),
        Int64::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub media_type: String,
    pub verification_material: VerificationMaterial,
    #[serde(default)]
    pub dsse_envelope: Option<DsseEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMaterial {
    /// v0.3 single leaf certificate
    #[serde(default)]
    pub certificate: Option<RawBytes>,
    /// v0.1 / v0.2 chain, leaf first
    #[serde(default)]
    pub x509_certificate_chain: Option<CertChain>,
    #[serde(default)]
    pub tlog_entries: Vec<TlogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindVersion {
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionPromise {
    pub signed_entry_timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub envelope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    #[serde(deserialize_with = "int64")]
    pub log_index: i64,
    pub root_hash: String,
    #[serde(deserialize_with = "int64")]
    pub tree_size: i64,
    #[serde(default)]
    pub hashes: Vec<String>,
    pub checkpoint: CheckpointEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlogEntry {
    #[serde(deserialize_with = "int64")]
    pub log_index: i64,
    pub log_id: LogId,
    pub kind_version: KindVersion,
    #[serde(deserialize_with = "int64")]
    pub integrated_time: i64,
    #[serde(default)]
    pub inclusion_promise: Option<InclusionPromise>,
    #[serde(default)]
    pub inclusion_proof: Option<InclusionProof>,
    /// base64 of the canonicalized Rekor entry body
    pub canonicalized_body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsseSignature {
    pub sig: String,
    #[serde(default)]
    pub keyid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    pub payload: String,
    pub payload_type: String,
    pub signatures: Vec<DsseSignature>,
}

impl Bundle {
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let bundle: Bundle =
            serde_json::from_slice(json).map_err(|e| Error::Parse(format!("Sigstore bundle: {}", e)))?;

        if !bundle.media_type.starts_with(MEDIA_TYPE_PREFIX) {
            return Err(Error::Parse(format!("Unexpected bundle media type: {}", bundle.media_type)));
        }
        Ok(bundle)
    }

    /// DER of the signing certificate
    pub fn leaf_certificate(&self) -> std::result::Result<Vec<u8>, String> {
        let material = &self.verification_material;
        let raw = material
            .certificate
            .as_ref()
            .or_else(|| {
                material
                    .x509_certificate_chain
                    .as_ref()
                    .and_then(|chain| chain.certificates.first())
            })
            .ok_or("bundle has no signing certificate")?;
        b64_decode("certificate", &raw.raw_bytes)
    }
}
