//! Rekor transparency log checks
//!
//! An entry counts when its log key is pinned in the trusted root and either
//! its signed entry timestamp (SET) or its inclusion proof verifies. The SET
//! is what makes the integrated time a trusted observation; the proof alone
//! only shows the entry is in the tree.

use sha2::{Digest, Sha256};

use super::bundle::{DsseEnvelope, InclusionProof, TlogEntry};
use super::trust_root::{b64_decode, TrustedRoot};
use crate::cert::{EcdsaKey, HashAlg};

/// Outcome of one verified log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEntry {
    /// Integrated time, present only when backed by a verified SET
    pub signed_time: Option<i64>,
}

pub fn verify_entry(
    root: &TrustedRoot,
    entry: &TlogEntry,
    envelope: &DsseEnvelope,
) -> Result<VerifiedEntry, String> {
    let log_id = b64_decode("logId.keyId", &entry.log_id.key_id)?;
    let log = root
        .tlog(&log_id)
        .ok_or_else(|| format!("log {} is not in the trusted root", hex::encode(&log_id)))?;
    if !log.public_key.valid_at(entry.integrated_time) {
        return Err(format!(
            "log key {} not valid at integrated time {}",
            log.base_url, entry.integrated_time
        ));
    }
    let key = log.key()?;

    let body = b64_decode("canonicalizedBody", &entry.canonicalized_body)?;
    check_body(&body, &entry.kind_version.kind, envelope)?;

    let mut signed_time = None;
    if let Some(promise) = &entry.inclusion_promise {
        verify_set(entry, &log_id, &promise.signed_entry_timestamp, &key)?;
        signed_time = Some(entry.integrated_time);
    }
    if let Some(proof) = &entry.inclusion_proof {
        verify_inclusion_proof(proof, &body, &key)?;
    }
    if entry.inclusion_promise.is_none() && entry.inclusion_proof.is_none() {
        return Err("entry has neither an inclusion promise nor an inclusion proof".into());
    }

    tracing::debug!(log_index = entry.log_index, log = %log.base_url, "tlog entry verified");
    Ok(VerifiedEntry { signed_time })
}

/// The entry body must describe this envelope: same payload hash and the
/// same signature
fn check_body(body: &[u8], kind: &str, envelope: &DsseEnvelope) -> Result<(), String> {
    let body: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("entry body: {}", e))?;

    if body.get("kind").and_then(|k| k.as_str()) != Some(kind) {
        return Err(format!("entry body kind is not {}", kind));
    }

    let payload = b64_decode("payload", &envelope.payload)?;
    let payload_hash = hex::encode(Sha256::digest(&payload));

    let spec = &body["spec"];
    let (recorded_hash, signatures) = match kind {
        "dsse" => (
            spec["payloadHash"]["value"].as_str(),
            spec["signatures"]
                .as_array()
                .map(|sigs| sigs.iter().filter_map(|s| s["signature"].as_str()).collect::<Vec<_>>()),
        ),
        "intoto" => (
            spec["content"]["payloadHash"]["value"].as_str(),
            spec["content"]["envelope"]["signatures"]
                .as_array()
                .map(|sigs| sigs.iter().filter_map(|s| s["sig"].as_str()).collect::<Vec<_>>()),
        ),
        other => return Err(format!("unsupported entry kind {}", other)),
    };

    if recorded_hash != Some(payload_hash.as_str()) {
        return Err("entry payload hash does not match the envelope".into());
    }

    // intoto bodies store the signature base64 encoded a second time
    let signed = signatures.unwrap_or_default();
    let matches = envelope.signatures.iter().any(|sig| {
        signed.iter().any(|recorded| {
            *recorded == sig.sig
                || b64_decode("signature", recorded).map_or(false, |inner| inner == sig.sig.as_bytes())
        })
    });
    if !matches {
        return Err("entry signatures do not match the envelope".into());
    }
    Ok(())
}

/// Verify the signed entry timestamp over Rekor's canonical JSON
fn verify_set(entry: &TlogEntry, log_id: &[u8], set_b64: &str, key: &EcdsaKey) -> Result<(), String> {
    let payload = serde_json::json!({
        "body": entry.canonicalized_body,
        "integratedTime": entry.integrated_time,
        "logID": hex::encode(log_id),
        "logIndex": entry.log_index,
    });
    let message = serde_json::to_vec(&payload).map_err(|e| format!("SET payload: {}", e))?;
    let set = b64_decode("signedEntryTimestamp", set_b64)?;

    key.verify(HashAlg::Sha256, &message, &set)
        .map_err(|e| format!("signed entry timestamp: {}", e))
}

fn verify_inclusion_proof(proof: &InclusionProof, body: &[u8], key: &EcdsaKey) -> Result<(), String> {
    let index = u64::try_from(proof.log_index).map_err(|_| "negative log index")?;
    let size = u64::try_from(proof.tree_size).map_err(|_| "negative tree size")?;
    let root_hash = b64_decode("rootHash", &proof.root_hash)?;
    let hashes = proof
        .hashes
        .iter()
        .map(|h| b64_decode("hashes", h))
        .collect::<Result<Vec<_>, _>>()?;

    let computed = root_from_inclusion_proof(index, size, &leaf_hash(body), &hashes)?;
    if computed.as_slice() != root_hash.as_slice() {
        return Err("inclusion proof does not lead to the recorded root".into());
    }

    let checkpoint = Checkpoint::parse(&proof.checkpoint.envelope)?;
    if checkpoint.size != size || checkpoint.root_hash != root_hash {
        return Err("checkpoint does not commit to the proof's tree".into());
    }
    checkpoint.verify(key)
}

pub fn leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    hasher.finalize().into()
}

pub fn node_hash(left: &[u8], right: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root hash implied by an RFC 9162 inclusion proof for `leaf` at `index`
pub fn root_from_inclusion_proof(
    index: u64,
    size: u64,
    leaf: &[u8; 32],
    proof: &[Vec<u8>],
) -> Result<[u8; 32], String> {
    if index >= size {
        return Err(format!("leaf index {} outside tree of size {}", index, size));
    }

    let (mut fn_, mut sn) = (index, size - 1);
    let mut hash = *leaf;

    for node in proof {
        if node.len() != 32 {
            return Err("proof hash is not 32 bytes".into());
        }
        if sn == 0 {
            return Err("inclusion proof is too long".into());
        }
        if fn_ & 1 == 1 || fn_ == sn {
            hash = node_hash(node, &hash);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            hash = node_hash(&hash, node);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    if sn != 0 {
        return Err("inclusion proof is too short".into());
    }
    Ok(hash)
}

/// A signed tree head in signed-note form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    pub root_hash: Vec<u8>,
    /// The exact bytes the signatures cover
    note: String,
    /// Each signature as key hint (4 bytes) followed by the signature
    signatures: Vec<Vec<u8>>,
}

impl Checkpoint {
    pub fn parse(envelope: &str) -> Result<Self, String> {
        let (text, signature_block) = envelope
            .split_once("\n\n")
            .ok_or("checkpoint has no signature block")?;

        let mut lines = text.lines();
        let origin = lines.next().filter(|l| !l.is_empty()).ok_or("checkpoint has no origin")?;
        let size = lines
            .next()
            .and_then(|l| l.parse::<u64>().ok())
            .ok_or("checkpoint has no tree size")?;
        let root_hash = b64_decode("checkpoint root", lines.next().ok_or("checkpoint has no root hash")?)?;

        let signatures = signature_block
            .lines()
            .filter_map(|line| line.strip_prefix("\u{2014} "))
            .filter_map(|rest| rest.rsplit_once(' '))
            .filter_map(|(_name, sig)| b64_decode("checkpoint signature", sig).ok())
            .filter(|sig| sig.len() > 4)
            .collect::<Vec<_>>();
        if signatures.is_empty() {
            return Err("checkpoint carries no signatures".into());
        }

        Ok(Self {
            origin: origin.to_string(),
            size,
            root_hash,
            note: format!("{}\n", text),
            signatures,
        })
    }

    /// At least one signature must verify under the log key
    pub fn verify(&self, key: &EcdsaKey) -> Result<(), String> {
        let verified = self
            .signatures
            .iter()
            .any(|sig| key.verify(HashAlg::Sha256, self.note.as_bytes(), &sig[4..]).is_ok());
        if verified {
            Ok(())
        } else {
            Err(format!("no checkpoint signature from {} verifies", self.origin))
        }
    }
}
