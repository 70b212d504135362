//! AMD SEV-SNP attestation verification
//!
//! This module verifies SEV-SNP attestation reports using the AMD certificate chain.
//! The verification flow:
//! 1. Verify ARK public key matches pinned value (root of trust)
//! 2. Verify ARK is self-signed (RSA-PSS SHA-384)
//! 3. Verify ASK is signed by ARK (RSA-PSS SHA-384)
//! 4. Verify VCEK is signed by ASK (RSA-PSS SHA-384)
//! 5. Parse the raw attestation report
//! 6. Verify report signature against VCEK (ECDSA P-384)
//! 7. Extract measurement and report data
//!
//! Steps 1-4 run once, when the verifier is built from AMD collateral.
//! [`fetch_collateral`] retrieves that collateral from the KDS; verification
//! itself never touches the network.

use base64::Engine;
use der::oid::ObjectIdentifier;
use der::{Decode, Encode};
use flate2::read::GzDecoder;
use sha2::Sha384;
use std::io::Read;
use std::time::Duration;

use super::types::{Measurement, PredicateType, Verification};
use super::FormatVerifier;
use crate::cert;
use crate::error::{Error, Result};

// SEV-SNP report offsets (v3 report structure)
const REPORT_DATA_OFFSET: usize = 80;
const REPORT_DATA_SIZE: usize = 64;
const MEASUREMENT_OFFSET: usize = 144;
const MEASUREMENT_SIZE: usize = 48;
const SIGNATURE_OFFSET: usize = 672;
const SIGNATURE_SIZE: usize = 512;
const REPORT_SIZE: usize = 1184;

/// Largest KDS certificate response accepted
const MAX_COLLATERAL_BYTES: usize = 64 * 1024;

// Chip ID and TCB for VCEK lookup
const CHIP_ID_OFFSET: usize = 416;
const CHIP_ID_SIZE: usize = 64;
const REPORTED_TCB_OFFSET: usize = 384;

// Signature component sizes (AMD SEV-SNP ECDSA P-384)
// Each component (R, S) is stored in 72 bytes (48 bytes value + 24 bytes padding)
// Values are in little-endian format
const SIG_COMPONENT_SIZE: usize = 72;
const SIG_VALUE_SIZE: usize = 48; // P-384 scalar size

/// VCEK extension carrying the chip's hardware ID
const OID_VCEK_HWID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.3704.1.4");

/// AMD ARK (AMD Root Key) for Genoa processors
/// This is the SPKI (SubjectPublicKeyInfo) SHA-256 fingerprint of the ARK public key.
/// Pinning this value ensures we only trust certificates signed by AMD's genuine root key.
///
/// To regenerate this value:
/// ```bash
/// curl -s 'https://kds.amd.com/vcek/v1/Genoa/cert_chain' | \
///   openssl x509 -pubkey -noout | \
///   openssl pkey -pubin -outform DER | sha256sum
/// ```
const AMD_ARK_GENOA_SPKI_FINGERPRINT: &str =
    "429a69c9422aa258ee4d8db5fcda9c6470ef15f8cd5a9cebd6cbc7d90b863831";

/// Default KDS endpoint
pub const DEFAULT_KDS_URL: &str = "https://kds-proxy.tinfoil.sh";

/// AMD certificates needed to verify reports from one chip at one TCB
#[derive(Debug, Clone)]
pub struct SevCollateral {
    /// DER-encoded VCEK
    pub vcek: Vec<u8>,
    /// PEM chain: ASK followed by ARK
    pub cert_chain: Vec<u8>,
}

/// Verifier for [`PredicateType::SEV_GUEST_V1`]
#[derive(Debug, Clone)]
pub struct SevVerifier {
    vcek: p384::ecdsa::VerifyingKey,
    chip_id: Option<Vec<u8>>,
}

impl SevVerifier {
    /// Build a verifier from collateral, validating the AMD chain up to the
    /// pinned ARK.
    pub fn new(collateral: &SevCollateral) -> Result<Self> {
        Self::with_ark_fingerprint(collateral, AMD_ARK_GENOA_SPKI_FINGERPRINT)
    }

    pub fn with_ark_fingerprint(collateral: &SevCollateral, ark_fingerprint: &str) -> Result<Self> {
        verify_cert_chain_crypto(&collateral.vcek, &collateral.cert_chain, ark_fingerprint)?;

        let vcek_cert = x509_cert::Certificate::from_der(&collateral.vcek)
            .map_err(|e| Error::AttestationVerification(format!("Failed to parse VCEK: {}", e)))?;
        let pubkey_bytes = vcek_cert
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes();
        let vcek = p384::ecdsa::VerifyingKey::from_sec1_bytes(pubkey_bytes)
            .map_err(|e| Error::AttestationVerification(format!("Invalid VCEK public key: {}", e)))?;

        Ok(Self {
            vcek,
            chip_id: vcek_hwid(&vcek_cert),
        })
    }
}

impl FormatVerifier for SevVerifier {
    fn predicate_type(&self) -> PredicateType {
        PredicateType::SEV_GUEST_V1
    }

    fn verify(&self, body: &str) -> Result<Verification> {
        // 1. Decode and decompress
        let report_bytes = decode_report(body)?;

        // 2. Basic structure validation
        validate_report_structure(&report_bytes)?;

        // 3. The VCEK must belong to the chip that produced this report
        if let Some(chip_id) = &self.chip_id {
            let reported = &report_bytes[CHIP_ID_OFFSET..CHIP_ID_OFFSET + CHIP_ID_SIZE];
            if chip_id.as_slice() != reported {
                return Err(Error::AttestationVerification(
                    "Report chip ID does not match VCEK hardware ID".into(),
                ));
            }
        }

        // 4. Verify report signature against VCEK
        verify_report_signature(&report_bytes, &self.vcek)?;

        // 5. Extract measurement (48 bytes at offset 144) and report data
        let measurement_bytes = &report_bytes[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + MEASUREMENT_SIZE];
        let report_data = &report_bytes[REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + REPORT_DATA_SIZE];

        Ok(Verification {
            measurement: Measurement::new(PredicateType::SEV_GUEST_V1, vec![hex::encode(measurement_bytes)]),
            report_data: report_data.to_vec(),
        })
    }
}

/// Fetch the VCEK and ASK/ARK chain for the chip that produced `body`
pub async fn fetch_collateral(
    client: &reqwest::Client,
    kds_url: &str,
    body: &str,
    timeout: Duration,
) -> Result<SevCollateral> {
    let report_bytes = decode_report(body)?;
    validate_report_structure(&report_bytes)?;

    let chip_id = &report_bytes[CHIP_ID_OFFSET..CHIP_ID_OFFSET + CHIP_ID_SIZE];
    let mut tcb = [0u8; 8];
    tcb.copy_from_slice(&report_bytes[REPORTED_TCB_OFFSET..REPORTED_TCB_OFFSET + 8]);

    let vcek = fetch_bytes(client, &vcek_url(kds_url, chip_id, tcb), timeout).await?;
    let cert_chain = fetch_bytes(client, &format!("{}/vcek/v1/Genoa/cert_chain", kds_url), timeout).await?;

    Ok(SevCollateral { vcek, cert_chain })
}

fn vcek_url(kds_url: &str, chip_id: &[u8], tcb: [u8; 8]) -> String {
    // Parse TCB components
    let tcb_val = u64::from_le_bytes(tcb);
    let bl_spl = (tcb_val & 0xFF) as u8;
    let tee_spl = ((tcb_val >> 8) & 0xFF) as u8;
    let snp_spl = ((tcb_val >> 48) & 0xFF) as u8;
    let ucode_spl = ((tcb_val >> 56) & 0xFF) as u8;

    format!(
        "{}/vcek/v1/Genoa/{}?blSPL={}&teeSPL={}&snpSPL={}&ucodeSPL={}",
        kds_url,
        hex::encode(chip_id),
        bl_spl,
        tee_spl,
        snp_spl,
        ucode_spl
    )
}

async fn fetch_bytes(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(timeout)
            } else {
                Error::Network(format!("Failed to fetch {}: {}", url, e))
            }
        })?;

    if !response.status().is_success() {
        return Err(Error::Network(format!("{}: HTTP {}", url, response.status())));
    }

    crate::tls::read_body_limited(response, MAX_COLLATERAL_BYTES, url).await
}

fn decode_report(body: &str) -> Result<Vec<u8>> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| Error::Parse(format!("SEV attestation base64: {}", e)))?;

    if let Some(detected) = super::sniff_format(&compressed) {
        if detected != PredicateType::SEV_GUEST_V1 {
            return Err(Error::FormatMismatch {
                expected: PredicateType::SEV_GUEST_V1.to_string(),
                actual: detected.to_string(),
            });
        }
    }

    // One byte past the report size is enough to tell it is too long
    let mut decoder = GzDecoder::new(&compressed[..]).take(REPORT_SIZE as u64 + 1);
    let mut report_bytes = Vec::new();
    decoder
        .read_to_end(&mut report_bytes)
        .map_err(|e| Error::Parse(format!("Gzip decompress failed: {}", e)))?;
    if report_bytes.len() > REPORT_SIZE {
        return Err(Error::Parse(format!("Decompressed report exceeds {} bytes", REPORT_SIZE)));
    }

    Ok(report_bytes)
}

fn validate_report_structure(report: &[u8]) -> Result<()> {
    if report.len() != REPORT_SIZE {
        return Err(Error::AttestationVerification(format!(
            "Invalid report size: expected {}, got {}",
            REPORT_SIZE,
            report.len()
        )));
    }

    let version = u32::from_le_bytes([report[0], report[1], report[2], report[3]]);
    if !(2..=3).contains(&version) {
        return Err(Error::AttestationVerification(format!(
            "Unexpected report version: {}",
            version
        )));
    }

    Ok(())
}

/// Parse R and S from the signature bytes
/// AMD SEV-SNP stores ECDSA P-384 signatures as:
/// - R: 72 bytes (48 bytes value in little-endian + 24 bytes padding)
/// - S: 72 bytes (48 bytes value in little-endian + 24 bytes padding)
/// - Reserved: 368 bytes
fn parse_signature_components(sig_bytes: &[u8]) -> Result<([u8; SIG_VALUE_SIZE], [u8; SIG_VALUE_SIZE])> {
    if sig_bytes.len() < SIG_COMPONENT_SIZE * 2 {
        return Err(Error::AttestationVerification("Signature too short".into()));
    }

    let mut r_be = [0u8; SIG_VALUE_SIZE];
    r_be.copy_from_slice(&sig_bytes[0..SIG_VALUE_SIZE]);
    r_be.reverse();

    let mut s_be = [0u8; SIG_VALUE_SIZE];
    s_be.copy_from_slice(&sig_bytes[SIG_COMPONENT_SIZE..SIG_COMPONENT_SIZE + SIG_VALUE_SIZE]);
    s_be.reverse();

    Ok((r_be, s_be))
}

/// Verify report signature against the VCEK public key
fn verify_report_signature(report: &[u8], vcek: &p384::ecdsa::VerifyingKey) -> Result<()> {
    use p384::ecdsa::{signature::Verifier, Signature};

    // Report body is bytes 0-672 (before signature)
    let report_body = &report[0..SIGNATURE_OFFSET];

    let sig_bytes = &report[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE];
    let (r_be, s_be) = parse_signature_components(sig_bytes)?;

    let mut rs = [0u8; SIG_VALUE_SIZE * 2];
    rs[..SIG_VALUE_SIZE].copy_from_slice(&r_be);
    rs[SIG_VALUE_SIZE..].copy_from_slice(&s_be);
    let signature = Signature::from_slice(&rs)
        .map_err(|e| Error::AttestationVerification(format!("Invalid signature format: {}", e)))?;

    // Verify (internally hashes with SHA-384)
    vcek.verify(report_body, &signature)
        .map_err(|e| Error::AttestationVerification(format!("Signature verification failed: {}", e)))
}

/// Hardware ID from the VCEK, if present
fn vcek_hwid(vcek: &x509_cert::Certificate) -> Option<Vec<u8>> {
    let raw = cert::extension(vcek, &OID_VCEK_HWID)?;
    if raw.len() == CHIP_ID_SIZE {
        return Some(raw.to_vec());
    }
    der::asn1::OctetString::from_der(raw)
        .ok()
        .map(|o| o.as_bytes().to_vec())
}

/// Parse PEM certificates from the chain
fn parse_pem_chain(chain_pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let pems = pem::parse_many(chain_pem)
        .map_err(|e| Error::AttestationVerification(format!("Failed to parse PEM chain: {}", e)))?;

    Ok(pems.into_iter().map(|p| p.contents().to_vec()).collect())
}

/// Verify the certificate chain with full cryptographic verification
///
/// This function:
/// 1. Verifies ARK public key matches pinned fingerprint (root of trust)
/// 2. Verifies ARK is self-signed (RSA-PSS SHA-384)
/// 3. Verifies ASK signature against ARK public key
/// 4. Verifies VCEK signature against ASK public key
fn verify_cert_chain_crypto(vcek_der: &[u8], cert_chain_pem: &[u8], ark_fingerprint: &str) -> Result<()> {
    use x509_cert::Certificate;

    let parse = |der: &[u8], what: &str| {
        Certificate::from_der(der)
            .map_err(|e| Error::AttestationVerification(format!("Failed to parse {}: {}", what, e)))
    };

    let vcek_cert = parse(vcek_der, "VCEK")?;

    let chain_certs = parse_pem_chain(cert_chain_pem)?;
    if chain_certs.len() < 2 {
        return Err(Error::AttestationVerification(
            "Certificate chain should contain ASK and ARK".into(),
        ));
    }

    let ask_cert = parse(&chain_certs[0], "ASK")?;
    let ark_cert = parse(&chain_certs[1], "ARK")?;

    // === STEP 1: Verify ARK public key matches pinned fingerprint ===
    let ark_spki_fp = cert::spki_fingerprint(&ark_cert)
        .map_err(|e| Error::AttestationVerification(e.to_string()))?;
    if ark_spki_fp != ark_fingerprint {
        return Err(Error::AttestationVerification(format!(
            "ARK public key fingerprint mismatch: expected {}, got {}",
            ark_fingerprint, ark_spki_fp
        )));
    }

    // === STEP 2: Verify issuer/subject chain structure ===
    if vcek_cert.tbs_certificate.issuer != ask_cert.tbs_certificate.subject {
        return Err(Error::AttestationVerification(
            "VCEK issuer does not match ASK subject".into(),
        ));
    }
    if ask_cert.tbs_certificate.issuer != ark_cert.tbs_certificate.subject {
        return Err(Error::AttestationVerification(
            "ASK issuer does not match ARK subject".into(),
        ));
    }
    if ark_cert.tbs_certificate.issuer != ark_cert.tbs_certificate.subject {
        return Err(Error::AttestationVerification("ARK is not self-signed".into()));
    }

    // === STEP 3-5: RSA-PSS signatures, ARK → ARK, ARK → ASK, ASK → VCEK ===
    verify_rsa_pss_signature(&ark_cert, &ark_cert, "ARK self-signature")?;
    verify_rsa_pss_signature(&ask_cert, &ark_cert, "ASK signature")?;
    verify_rsa_pss_signature(&vcek_cert, &ask_cert, "VCEK signature")?;

    Ok(())
}

/// Verify an RSA-PSS SHA-384 signature on `child` by `signer`
fn verify_rsa_pss_signature(
    child: &x509_cert::Certificate,
    signer: &x509_cert::Certificate,
    context: &str,
) -> Result<()> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::pss::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use rsa::RsaPublicKey;

    let attest_err = |what: &str, e: &dyn std::fmt::Display| {
        Error::AttestationVerification(format!("{} for {}: {}", what, context, e))
    };

    let signer_spki = signer
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| attest_err("Failed to encode SPKI", &e))?;
    let tbs = child
        .tbs_certificate
        .to_der()
        .map_err(|e| attest_err("Failed to encode TBS", &e))?;

    let rsa_pubkey = RsaPublicKey::from_public_key_der(&signer_spki)
        .map_err(|e| attest_err("Invalid RSA public key", &e))?;
    let verifying_key: VerifyingKey<Sha384> = VerifyingKey::new(rsa_pubkey);

    let sig = Signature::try_from(child.signature.raw_bytes())
        .map_err(|e| attest_err("Invalid signature format", &e))?;

    verifying_key
        .verify(&tbs, &sig)
        .map_err(|e| attest_err("Verification failed", &e))
}
