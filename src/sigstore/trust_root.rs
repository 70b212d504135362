//! Sigstore trusted root (`trusted_root.json`)
//!
//! The trust anchors for provenance: Fulcio certificate authorities, Rekor
//! transparency log keys and CT log keys, each with the time range it may be
//! used for. Only the fields the verifier reads are modelled.

use std::path::Path;
use std::time::{Duration, SystemTime};

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use x509_cert::Certificate;

use crate::cert::{self, EcdsaKey};
use crate::error::{Error, Result};

const MEDIA_TYPE_PREFIX: &str = "application/vnd.dev.sigstore.trustedroot";

const KEY_DETAILS_P256: &str = "PKIX_ECDSA_P256_SHA_256";
const KEY_DETAILS_P384: &str = "PKIX_ECDSA_P384_SHA_384";

pub(crate) fn b64_decode(field: &str, value: &str) -> std::result::Result<Vec<u8>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| format!("invalid base64 in {}: {}", field, e))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBytes {
    pub raw_bytes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertChain {
    #[serde(default)]
    pub certificates: Vec<RawBytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogId {
    /// base64 of the SHA-256 of the log's DER public key
    pub key_id: String,
}

/// Half-open validity range; a missing end means "still valid"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, unix_secs: i64) -> bool {
        if unix_secs < self.start.timestamp() {
            return false;
        }
        match &self.end {
            Some(end) => unix_secs <= end.timestamp(),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    /// base64 DER SubjectPublicKeyInfo
    #[serde(default)]
    pub raw_bytes: Option<String>,
    #[serde(default)]
    pub key_details: String,
    #[serde(default)]
    pub valid_for: Option<TimeRange>,
}

impl PublicKey {
    /// Whether `keyDetails` names a key type the verifier can use; an empty
    /// value leaves the decision to the SPKI itself.
    pub fn is_supported(&self) -> bool {
        matches!(self.key_details.as_str(), "" | KEY_DETAILS_P256 | KEY_DETAILS_P384)
    }

    pub fn valid_at(&self, unix_secs: i64) -> bool {
        self.valid_for.as_ref().map_or(true, |range| range.contains(unix_secs))
    }
}

/// A Rekor or CT log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransparencyLogInstance {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub hash_algorithm: String,
    pub public_key: PublicKey,
    pub log_id: LogId,
}

impl TransparencyLogInstance {
    pub fn log_id_bytes(&self) -> std::result::Result<Vec<u8>, String> {
        b64_decode("logId.keyId", &self.log_id.key_id)
    }

    pub fn key(&self) -> std::result::Result<EcdsaKey, String> {
        if !self.public_key.is_supported() {
            return Err(format!(
                "log {} uses unsupported key type {}",
                self.base_url, self.public_key.key_details
            ));
        }
        let raw = self
            .public_key
            .raw_bytes
            .as_deref()
            .ok_or_else(|| format!("log {} has no public key", self.base_url))?;
        let der = b64_decode("publicKey.rawBytes", raw)?;
        let key = EcdsaKey::from_spki_der(&der).map_err(|e| format!("log {} key: {}", self.base_url, e))?;

        let expected = match self.public_key.key_details.as_str() {
            KEY_DETAILS_P256 => Some(cert::SECP256R1),
            KEY_DETAILS_P384 => Some(cert::SECP384R1),
            _ => None,
        };
        if expected.is_some_and(|curve| curve != key.curve()) {
            return Err(format!(
                "log {} key does not match keyDetails {}",
                self.base_url, self.public_key.key_details
            ));
        }
        Ok(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthority {
    #[serde(default)]
    pub uri: String,
    pub cert_chain: CertChain,
    pub valid_for: TimeRange,
}

impl CertificateAuthority {
    /// The chain, issuing certificate first
    pub fn certificates(&self) -> std::result::Result<Vec<Certificate>, String> {
        self.cert_chain
            .certificates
            .iter()
            .map(|c| {
                let der = b64_decode("certChain", &c.raw_bytes)?;
                cert::parse(&der).map_err(|e| format!("CA {}: {}", self.uri, e))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedRoot {
    pub media_type: String,
    #[serde(default)]
    pub tlogs: Vec<TransparencyLogInstance>,
    #[serde(default)]
    pub certificate_authorities: Vec<CertificateAuthority>,
    #[serde(default)]
    pub ctlogs: Vec<TransparencyLogInstance>,
}

impl TrustedRoot {
    /// Parse and sanity-check a trusted root
    ///
    /// Every certificate and every key of a supported type must decode. Logs
    /// with other key types (Ed25519 Rekor v2, for one) are kept but never
    /// match: verifying against one fails at that entry only.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let root: TrustedRoot = serde_json::from_slice(json)
            .map_err(|e| Error::Parse(format!("Trusted root: {}", e)))?;

        if !root.media_type.starts_with(MEDIA_TYPE_PREFIX) {
            return Err(Error::Parse(format!("Unexpected trusted root media type: {}", root.media_type)));
        }
        if root.certificate_authorities.is_empty() || root.tlogs.is_empty() {
            return Err(Error::Parse("Trusted root has no certificate authorities or logs".into()));
        }

        for ca in &root.certificate_authorities {
            if ca.certificates().map_err(Error::Parse)?.is_empty() {
                return Err(Error::Parse(format!("CA {} has an empty chain", ca.uri)));
            }
        }
        for log in root.tlogs.iter().chain(&root.ctlogs) {
            log.log_id_bytes().map_err(Error::Parse)?;
            if log.public_key.is_supported() {
                log.key().map_err(Error::Parse)?;
            } else {
                tracing::debug!(log = %log.base_url, key_details = %log.public_key.key_details, "skipping log with unsupported key type");
            }
        }

        Ok(root)
    }

    /// Read a persisted trusted root, rejecting it when the file is older
    /// than `max_age`
    pub fn load(path: impl AsRef<Path>, max_age: Option<Duration>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;

        if let Some(max_age) = max_age {
            let modified = std::fs::metadata(path)?.modified()?;
            // A clock behind the file's mtime counts as fresh
            let age = SystemTime::now().duration_since(modified).unwrap_or_default();
            if age > max_age {
                tracing::warn!(path = %path.display(), ?age, ?max_age, "persisted trust root is stale");
                return Err(Error::StaleTrustRoot { age, max_age });
            }
        }

        Self::from_json(&raw)
    }

    pub fn tlog(&self, log_id: &[u8]) -> Option<&TransparencyLogInstance> {
        find_log(&self.tlogs, log_id)
    }

    pub fn ctlog(&self, log_id: &[u8]) -> Option<&TransparencyLogInstance> {
        find_log(&self.ctlogs, log_id)
    }
}

fn find_log<'a>(logs: &'a [TransparencyLogInstance], log_id: &[u8]) -> Option<&'a TransparencyLogInstance> {
    logs.iter()
        .find(|log| log.log_id_bytes().map_or(false, |id| id == log_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &str, end: Option<&str>) -> TimeRange {
        TimeRange {
            start: start.parse().unwrap(),
            end: end.map(|e| e.parse().unwrap()),
        }
    }

    #[test]
    fn test_time_range() {
        let open = range("2021-03-07T03:20:29.000Z", None);
        assert!(open.contains(1_700_000_000));
        assert!(!open.contains(1_600_000_000));

        let closed = range("2021-03-07T03:20:29Z", Some("2022-04-13T20:06:15Z"));
        assert!(closed.contains(1_630_000_000));
        assert!(!closed.contains(1_700_000_000));
    }

    #[test]
    fn test_rejects_wrong_media_type() {
        let json = br#"{"mediaType":"application/json","tlogs":[],"certificateAuthorities":[]}"#;
        assert!(matches!(TrustedRoot::from_json(json), Err(Error::Parse(_))));
    }

    #[test]
    fn test_rejects_empty_anchors() {
        let json = br#"{"mediaType":"application/vnd.dev.sigstore.trustedroot+json;version=0.1"}"#;
        assert!(matches!(TrustedRoot::from_json(json), Err(Error::Parse(_))));
    }

    #[test]
    fn test_rejects_undecodable_key() {
        let json = br#"{
            "mediaType": "application/vnd.dev.sigstore.trustedroot+json;version=0.1",
            "tlogs": [{
                "baseUrl": "https://rekor.example",
                "hashAlgorithm": "SHA2_256",
                "publicKey": {"rawBytes": "bm90IGEga2V5", "keyDetails": "PKIX_ECDSA_P256_SHA_256"},
                "logId": {"keyId": "AAAA"}
            }],
            "certificateAuthorities": []
        }"#;
        assert!(matches!(TrustedRoot::from_json(json), Err(Error::Parse(_))));
    }

    fn root_with_logs(logs: &[serde_json::Value]) -> Vec<u8> {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = params.self_signed(&ca_key).unwrap();
        let b64 = base64::engine::general_purpose::STANDARD;

        serde_json::to_vec(&serde_json::json!({
            "mediaType": "application/vnd.dev.sigstore.trustedroot+json;version=0.1",
            "tlogs": logs,
            "certificateAuthorities": [{
                "certChain": {"certificates": [{"rawBytes": b64.encode(ca.der())}]},
                "validFor": {"start": "2021-03-07T03:20:29Z"}
            }]
        }))
        .unwrap()
    }

    fn log(base_url: &str, spki_der: &[u8], key_details: &str) -> serde_json::Value {
        let b64 = base64::engine::general_purpose::STANDARD;
        serde_json::json!({
            "baseUrl": base_url,
            "hashAlgorithm": "SHA2_256",
            "publicKey": {"rawBytes": b64.encode(spki_der), "keyDetails": key_details},
            "logId": {"keyId": b64.encode([7u8; 32])}
        })
    }

    fn ed25519_spki() -> Vec<u8> {
        let mut der = vec![0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00];
        der.extend_from_slice(&[0x42; 32]);
        der
    }

    #[test]
    fn test_mixed_key_types() {
        let ecdsa = rcgen::KeyPair::generate().unwrap();
        let json = root_with_logs(&[
            log("https://rekor.example", &ecdsa.public_key_der(), KEY_DETAILS_P256),
            log("https://log2025-1.rekor.example", &ed25519_spki(), "PKIX_ED25519"),
        ]);

        let root = TrustedRoot::from_json(&json).unwrap();
        assert!(root.tlogs[0].key().is_ok());
        let err = root.tlogs[1].key().unwrap_err();
        assert!(err.contains("unsupported key type"), "{}", err);
    }

    #[test]
    fn test_key_details_must_match_curve() {
        let p384 = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let json = root_with_logs(&[log("https://rekor.example", &p384.public_key_der(), KEY_DETAILS_P256)]);
        assert!(matches!(TrustedRoot::from_json(&json), Err(Error::Parse(_))));

        // Unlabelled Ed25519 key still has to decode
        let json = root_with_logs(&[log("https://rekor.example", &ed25519_spki(), "")]);
        assert!(matches!(TrustedRoot::from_json(&json), Err(Error::Parse(_))));
    }

    #[test]
    fn test_load_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trusted_root.json");
        std::fs::write(&path, "{}").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let err = TrustedRoot::load(&path, Some(Duration::from_millis(1))).unwrap_err();
        assert!(matches!(err, Error::StaleTrustRoot { .. }));

        // Fresh enough, so the content is what fails
        let err = TrustedRoot::load(&path, Some(Duration::from_secs(3600))).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        assert!(matches!(
            TrustedRoot::load(dir.path().join("missing.json"), None),
            Err(Error::Io(_))
        ));
    }
}
