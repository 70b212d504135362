//! X.509 helpers shared by the hardware and provenance verifiers
//!
//! Only what the verifiers need: ECDSA (P-256 / P-384) issuer checks,
//! validity windows, extension lookup and fingerprints.

use std::time::Duration;

use der::oid::ObjectIdentifier;
use der::{Decode, Encode};
use sha2::{Digest, Sha256, Sha384};
use x509_cert::ext::pkix::ExtendedKeyUsage;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::Certificate;

pub const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
pub const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

pub const ID_CE_EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
pub const ID_KP_CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");

pub const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
pub const SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
pub const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("malformed certificate: {0}")]
    Malformed(String),

    #[error("unsupported key or algorithm: {0}")]
    Unsupported(String),

    #[error("signature check failed: {0}")]
    Signature(String),

    #[error("certificate not valid at {at}s: window {not_before}s..{not_after}s")]
    Validity { at: u64, not_before: u64, not_after: u64 },
}

/// Digest used with an ECDSA signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
}

impl HashAlg {
    pub fn from_signature_oid(oid: &ObjectIdentifier) -> Result<Self, CertError> {
        if *oid == ECDSA_WITH_SHA256 {
            Ok(HashAlg::Sha256)
        } else if *oid == ECDSA_WITH_SHA384 {
            Ok(HashAlg::Sha384)
        } else {
            Err(CertError::Unsupported(format!("signature algorithm {}", oid)))
        }
    }

    pub fn digest(self, msg: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => Sha256::digest(msg).to_vec(),
            HashAlg::Sha384 => Sha384::digest(msg).to_vec(),
        }
    }
}

/// An ECDSA verifying key on one of the NIST curves used by Fulcio, Rekor,
/// CT logs and the AWS Nitro PKI
#[derive(Debug, Clone)]
pub enum EcdsaKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
}

impl EcdsaKey {
    /// Parse a SEC1-encoded point; the curve is inferred from its length.
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, CertError> {
        match bytes.len() {
            33 | 65 => p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(EcdsaKey::P256)
                .map_err(|e| CertError::Malformed(format!("P-256 key: {}", e))),
            49 | 97 => p384::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
                .map(EcdsaKey::P384)
                .map_err(|e| CertError::Malformed(format!("P-384 key: {}", e))),
            n => Err(CertError::Unsupported(format!("EC point of {} bytes", n))),
        }
    }

    /// Parse an `id-ecPublicKey` SPKI; the curve comes from its named-curve
    /// parameter and must agree with the point length.
    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self, CertError> {
        if spki.algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(CertError::Unsupported(format!("key algorithm {}", spki.algorithm.oid)));
        }
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| CertError::Malformed("EC key without curve parameter".into()))?
            .to_der()
            .and_then(|der| ObjectIdentifier::from_der(&der))
            .map_err(|e| CertError::Malformed(format!("EC curve parameter: {}", e)))?;

        let point = spki.subject_public_key.raw_bytes();
        if curve != SECP256R1 && curve != SECP384R1 {
            return Err(CertError::Unsupported(format!("EC curve {}", curve)));
        }
        let key = Self::from_sec1(point)?;
        if key.curve() != curve {
            return Err(CertError::Malformed(format!("EC point does not lie on curve {}", curve)));
        }
        Ok(key)
    }

    /// Named-curve OID of this key
    pub fn curve(&self) -> ObjectIdentifier {
        match self {
            EcdsaKey::P256(_) => SECP256R1,
            EcdsaKey::P384(_) => SECP384R1,
        }
    }

    /// Parse a DER SubjectPublicKeyInfo, as found in the trusted root
    pub fn from_spki_der(der: &[u8]) -> Result<Self, CertError> {
        let spki = SubjectPublicKeyInfoOwned::from_der(der)
            .map_err(|e| CertError::Malformed(format!("SPKI: {}", e)))?;
        Self::from_spki(&spki)
    }

    /// Verify a signature over `msg`; DER and fixed-width `r || s` are both accepted.
    pub fn verify(&self, hash: HashAlg, msg: &[u8], sig: &[u8]) -> Result<(), CertError> {
        self.verify_prehash(&hash.digest(msg), sig)
    }

    pub fn verify_prehash(&self, prehash: &[u8], sig: &[u8]) -> Result<(), CertError> {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;

        match self {
            EcdsaKey::P256(key) => {
                let sig = p256::ecdsa::Signature::from_der(sig)
                    .or_else(|_| p256::ecdsa::Signature::from_slice(sig))
                    .map_err(|e| CertError::Signature(format!("invalid signature encoding: {}", e)))?;
                key.verify_prehash(prehash, &sig)
                    .map_err(|e| CertError::Signature(e.to_string()))
            }
            EcdsaKey::P384(key) => {
                let sig = p384::ecdsa::Signature::from_der(sig)
                    .or_else(|_| p384::ecdsa::Signature::from_slice(sig))
                    .map_err(|e| CertError::Signature(format!("invalid signature encoding: {}", e)))?;
                key.verify_prehash(prehash, &sig)
                    .map_err(|e| CertError::Signature(e.to_string()))
            }
        }
    }
}

pub fn parse(der: &[u8]) -> Result<Certificate, CertError> {
    Certificate::from_der(der).map_err(|e| CertError::Malformed(e.to_string()))
}

/// Check that `child` names `issuer` and carries a valid ECDSA signature
/// from the issuer's key.
pub fn verify_issued_by(child: &Certificate, issuer: &Certificate) -> Result<(), CertError> {
    if child.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return Err(CertError::Signature("issuer name does not match".into()));
    }

    let hash = HashAlg::from_signature_oid(&child.signature_algorithm.oid)?;
    let tbs = child
        .tbs_certificate
        .to_der()
        .map_err(|e| CertError::Malformed(format!("TBS encoding: {}", e)))?;
    let key = EcdsaKey::from_spki(&issuer.tbs_certificate.subject_public_key_info)?;

    key.verify(hash, &tbs, child.signature.raw_bytes())
}

/// Validity window as seconds since the Unix epoch
pub fn validity(cert: &Certificate) -> (u64, u64) {
    let validity = &cert.tbs_certificate.validity;
    (
        validity.not_before.to_unix_duration().as_secs(),
        validity.not_after.to_unix_duration().as_secs(),
    )
}

pub fn check_validity(cert: &Certificate, at: Duration) -> Result<(), CertError> {
    let (not_before, not_after) = validity(cert);
    let at = at.as_secs();
    if at < not_before || at > not_after {
        return Err(CertError::Validity { at, not_before, not_after });
    }
    Ok(())
}

/// Raw value of the first extension with the given OID
pub fn extension<'a>(cert: &'a Certificate, oid: &ObjectIdentifier) -> Option<&'a [u8]> {
    cert.tbs_certificate
        .extensions
        .as_ref()?
        .iter()
        .find(|ext| ext.extn_id == *oid)
        .map(|ext| ext.extn_value.as_bytes())
}

/// Whether the certificate's extended key usage lists `purpose`; a
/// certificate without the extension lists nothing.
pub fn has_extended_key_usage(cert: &Certificate, purpose: &ObjectIdentifier) -> Result<bool, CertError> {
    let Some(raw) = extension(cert, &ID_CE_EXT_KEY_USAGE) else {
        return Ok(false);
    };
    let usages = ExtendedKeyUsage::from_der(raw)
        .map_err(|e| CertError::Malformed(format!("extended key usage: {}", e)))?;
    Ok(usages.0.contains(purpose))
}

/// Hex SHA-256 of a certificate's full DER encoding
pub fn der_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Hex SHA-256 of a certificate's DER SubjectPublicKeyInfo
pub fn spki_fingerprint(cert: &Certificate) -> Result<String, CertError> {
    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| CertError::Malformed(format!("SPKI encoding: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&spki_der)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, PKCS_ECDSA_P384_SHA384};

    fn ca(key: &KeyPair, cn: &str) -> rcgen::Certificate {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(rcgen::DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.self_signed(key).unwrap()
    }

    #[test]
    fn test_issued_by_p256_and_p384() {
        for alg in [&rcgen::PKCS_ECDSA_P256_SHA256, &PKCS_ECDSA_P384_SHA384] {
            let root_key = KeyPair::generate_for(alg).unwrap();
            let root = ca(&root_key, "root");

            let leaf_key = KeyPair::generate_for(alg).unwrap();
            let leaf = CertificateParams::new(vec!["leaf.example".to_string()])
                .unwrap()
                .signed_by(&leaf_key, &root, &root_key)
                .unwrap();

            let root_cert = parse(root.der()).unwrap();
            let leaf_cert = parse(leaf.der()).unwrap();
            verify_issued_by(&leaf_cert, &root_cert).unwrap();
            verify_issued_by(&root_cert, &root_cert).unwrap();
        }
    }

    #[test]
    fn test_issued_by_wrong_key() {
        let root_key = KeyPair::generate().unwrap();
        let root = ca(&root_key, "root");
        let other_key = KeyPair::generate().unwrap();
        let other = ca(&other_key, "root");

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["leaf.example".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &root, &root_key)
            .unwrap();

        // Same subject name, different key
        let err = verify_issued_by(&parse(leaf.der()).unwrap(), &parse(other.der()).unwrap());
        assert!(matches!(err, Err(CertError::Signature(_))));
    }

    #[test]
    fn test_validity_window() {
        let key = KeyPair::generate().unwrap();
        let cert = parse(ca(&key, "root").der()).unwrap();
        let (not_before, not_after) = validity(&cert);

        assert!(check_validity(&cert, Duration::from_secs(not_before + 1)).is_ok());
        assert!(check_validity(&cert, Duration::from_secs(not_after + 1)).is_err());
        assert!(check_validity(&cert, Duration::from_secs(not_before.saturating_sub(1))).is_err());
    }

    #[test]
    fn test_extended_key_usage() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["leaf.example".to_string()]).unwrap();
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::CodeSigning];
        let signing = parse(params.self_signed(&key).unwrap().der()).unwrap();
        assert!(has_extended_key_usage(&signing, &ID_KP_CODE_SIGNING).unwrap());

        let plain = parse(ca(&key, "root").der()).unwrap();
        assert!(!has_extended_key_usage(&plain, &ID_KP_CODE_SIGNING).unwrap());
    }

    #[test]
    fn test_spki_curve_from_parameters() {
        let p256 = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let p384 = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        assert_eq!(EcdsaKey::from_spki_der(&p256.public_key_der()).unwrap().curve(), SECP256R1);
        assert_eq!(EcdsaKey::from_spki_der(&p384.public_key_der()).unwrap().curve(), SECP384R1);
    }

    #[test]
    fn test_spki_rejects_non_ec_algorithm() {
        // Ed25519 SPKI: 32-byte key under id-Ed25519 (1.3.101.112)
        let mut der = vec![0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00];
        der.extend_from_slice(&[0x42; 32]);
        assert!(matches!(EcdsaKey::from_spki_der(&der), Err(CertError::Unsupported(_))));
    }

    #[test]
    fn test_spki_rejects_curve_length_disagreement() {
        // P-256 point labelled as secp384r1
        let p256 = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut spki = SubjectPublicKeyInfoOwned::from_der(&p256.public_key_der()).unwrap();
        spki.algorithm.parameters = Some(der::Any::encode_from(&SECP384R1).unwrap());
        assert!(matches!(EcdsaKey::from_spki(&spki), Err(CertError::Malformed(_))));
    }

    #[test]
    fn test_key_length_dispatch() {
        assert!(matches!(
            EcdsaKey::from_sec1(&[0u8; 40]),
            Err(CertError::Unsupported(_))
        ));
    }
}
