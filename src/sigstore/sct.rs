//! Embedded signed certificate timestamps (RFC 6962 §3.3)

use der::asn1::OctetStringRef;
use der::oid::ObjectIdentifier;
use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use super::trust_root::TrustedRoot;
use crate::cert::{self, HashAlg};

const OID_SCT_LIST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.4.2");

/// TLS `HashAlgorithm.sha256` / `SignatureAlgorithm.ecdsa`
const HASH_SHA256: u8 = 4;
const SIG_ECDSA: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sct {
    pub log_id: [u8; 32],
    pub timestamp: u64,
    pub extensions: Vec<u8>,
    pub hash_algorithm: u8,
    pub signature_algorithm: u8,
    pub signature: Vec<u8>,
}

/// Big-endian reader over TLS-encoded structures
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.0.len() < n {
            return Err("truncated SCT".into());
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn uint(&mut self, width: usize) -> Result<u64, String> {
        Ok(self.take(width)?.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn vec16(&mut self) -> Result<&'a [u8], String> {
        let len = self.uint(2)? as usize;
        self.take(len)
    }
}

/// Decode the SCT list carried in the certificate extension value
pub fn parse_sct_list(extension_value: &[u8]) -> Result<Vec<Sct>, String> {
    let list = OctetStringRef::from_der(extension_value).map_err(|e| format!("SCT list: {}", e))?;
    let mut outer = Reader(list.as_bytes());
    let mut items = Reader(outer.vec16()?);

    let mut scts = Vec::new();
    while !items.0.is_empty() {
        let mut sct = Reader(items.vec16()?);
        let version = sct.uint(1)?;
        if version != 0 {
            return Err(format!("unsupported SCT version {}", version));
        }
        let mut log_id = [0u8; 32];
        log_id.copy_from_slice(sct.take(32)?);
        scts.push(Sct {
            log_id,
            timestamp: sct.uint(8)?,
            extensions: sct.vec16()?.to_vec(),
            hash_algorithm: sct.uint(1)? as u8,
            signature_algorithm: sct.uint(1)? as u8,
            signature: sct.vec16()?.to_vec(),
        });
    }
    Ok(scts)
}

/// DER of the TBS certificate with the SCT list extension removed, which is
/// what the log signed
pub fn precert_tbs(leaf: &Certificate) -> Result<Vec<u8>, String> {
    let mut tbs = leaf.tbs_certificate.clone();
    if let Some(extensions) = tbs.extensions.as_mut() {
        extensions.retain(|ext| ext.extn_id != OID_SCT_LIST);
    }
    tbs.to_der().map_err(|e| format!("precert TBS: {}", e))
}

/// RFC 6962 `digitally-signed` input for a precert entry
pub fn signed_data(sct: &Sct, issuer_key_hash: &[u8; 32], tbs: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(tbs.len() + sct.extensions.len() + 50);
    data.push(0); // v1
    data.push(0); // certificate_timestamp
    data.extend_from_slice(&sct.timestamp.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes()); // precert_entry
    data.extend_from_slice(issuer_key_hash);
    data.extend_from_slice(&(tbs.len() as u32).to_be_bytes()[1..]);
    data.extend_from_slice(tbs);
    data.extend_from_slice(&(sct.extensions.len() as u16).to_be_bytes());
    data.extend_from_slice(&sct.extensions);
    data
}

/// Number of embedded SCTs that verify against CT logs in the trusted root
///
/// SCTs from unknown logs are skipped, not counted.
pub fn count_verified(root: &TrustedRoot, leaf: &Certificate, issuer: &Certificate) -> Result<usize, String> {
    let Some(raw) = cert::extension(leaf, &OID_SCT_LIST) else {
        return Ok(0);
    };
    let scts = parse_sct_list(raw)?;
    let tbs = precert_tbs(leaf)?;

    let issuer_spki = issuer
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| format!("issuer SPKI: {}", e))?;
    let issuer_key_hash: [u8; 32] = Sha256::digest(&issuer_spki).into();

    let mut verified = 0;
    for sct in &scts {
        let Some(log) = root.ctlog(&sct.log_id) else {
            tracing::debug!(log_id = %hex::encode(sct.log_id), "SCT from unknown CT log");
            continue;
        };
        if sct.hash_algorithm != HASH_SHA256 || sct.signature_algorithm != SIG_ECDSA {
            tracing::debug!(log = %log.base_url, "SCT uses an unsupported algorithm");
            continue;
        }
        let timestamp_secs = (sct.timestamp / 1000) as i64;
        if !log.public_key.valid_at(timestamp_secs) {
            tracing::debug!(log = %log.base_url, timestamp_secs, "CT log key not valid at SCT time");
            continue;
        }

        let key = match log.key() {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "CT log key unusable");
                continue;
            }
        };
        match key.verify(HashAlg::Sha256, &signed_data(sct, &issuer_key_hash, &tbs), &sct.signature) {
            Ok(()) => verified += 1,
            Err(e) => tracing::debug!(log = %log.base_url, error = %e, "SCT signature rejected"),
        }
    }
    Ok(verified)
}
