//! Signer identity policy for Fulcio certificates

use der::asn1::Utf8StringRef;
use der::oid::ObjectIdentifier;
use der::Decode;
use regex::Regex;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::Certificate;

use crate::cert;
use crate::error::{Error, Result};

/// OIDC issuer of GitHub Actions workflow tokens
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Fulcio OIDC issuer, raw string value (deprecated)
const OID_FULCIO_ISSUER_V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.1");
/// Fulcio OIDC issuer, DER UTF8String value
const OID_FULCIO_ISSUER_V2: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.8");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

/// Who must have signed: an exact OIDC issuer plus a pattern the certificate's
/// SAN URI has to match
#[derive(Debug, Clone)]
pub struct CertificateIdentity {
    issuer: String,
    san_pattern: Regex,
}

impl CertificateIdentity {
    pub fn new(issuer: impl Into<String>, san_pattern: &str) -> Result<Self> {
        let san_pattern =
            Regex::new(san_pattern).map_err(|e| Error::Parse(format!("Identity pattern: {}", e)))?;
        Ok(Self {
            issuer: issuer.into(),
            san_pattern,
        })
    }

    /// The release workflow of `repo` (`owner/name`), run for a tag
    pub fn github_release(repo: &str) -> Result<Self> {
        let pattern = format!(
            r"^https://github\.com/{}/\.github/workflows/release\.yml@refs/tags/.+$",
            regex::escape(repo)
        );
        Self::new(GITHUB_ACTIONS_ISSUER, &pattern)
    }

    pub fn verify(&self, leaf: &Certificate) -> std::result::Result<(), String> {
        let issuer = oidc_issuer(leaf).ok_or("certificate has no OIDC issuer extension")?;
        if issuer != self.issuer {
            return Err(format!("OIDC issuer {} is not {}", issuer, self.issuer));
        }

        let uris = san_uris(leaf)?;
        if !uris.iter().any(|uri| self.san_pattern.is_match(uri)) {
            return Err(format!(
                "no SAN URI matches {}: {:?}",
                self.san_pattern.as_str(),
                uris
            ));
        }
        Ok(())
    }
}

/// The OIDC issuer Fulcio recorded in the certificate
pub fn oidc_issuer(cert: &Certificate) -> Option<String> {
    if let Some(raw) = cert::extension(cert, &OID_FULCIO_ISSUER_V2) {
        return Utf8StringRef::from_der(raw).ok().map(|s| s.as_str().to_string());
    }
    cert::extension(cert, &OID_FULCIO_ISSUER_V1)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .map(str::to_string)
}

pub fn san_uris(cert: &Certificate) -> std::result::Result<Vec<String>, String> {
    let Some(raw) = cert::extension(cert, &OID_SUBJECT_ALT_NAME) else {
        return Ok(Vec::new());
    };
    let san = SubjectAltName::from_der(raw).map_err(|e| format!("subject alt name: {}", e))?;

    Ok(san
        .0
        .iter()
        .filter_map(|name| match name {
            GeneralName::UniformResourceIdentifier(uri) => Some(uri.as_str().to_string()),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, CustomExtension, KeyPair, SanType};

    const REPO: &str = "tinfoilsh/confidential-llama";

    fn utf8_der(s: &str) -> Vec<u8> {
        let mut out = vec![0x0c, s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn fulcio_cert(issuer_ext: CustomExtension, san: &str) -> Certificate {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.subject_alt_names = vec![SanType::URI(san.try_into().unwrap())];
        params.custom_extensions = vec![issuer_ext];
        crate::cert::parse(params.self_signed(&key).unwrap().der()).unwrap()
    }

    fn v2_issuer(issuer: &str) -> CustomExtension {
        CustomExtension::from_oid_content(&[1, 3, 6, 1, 4, 1, 57264, 1, 8], utf8_der(issuer))
    }

    fn release_san(repo: &str, reference: &str) -> String {
        format!("https://github.com/{}/.github/workflows/release.yml@{}", repo, reference)
    }

    #[test]
    fn test_release_workflow_accepted() {
        let identity = CertificateIdentity::github_release(REPO).unwrap();
        let cert = fulcio_cert(v2_issuer(GITHUB_ACTIONS_ISSUER), &release_san(REPO, "refs/tags/v0.1.2"));
        identity.verify(&cert).unwrap();
    }

    #[test]
    fn test_legacy_issuer_extension() {
        let ext = CustomExtension::from_oid_content(
            &[1, 3, 6, 1, 4, 1, 57264, 1, 1],
            GITHUB_ACTIONS_ISSUER.as_bytes().to_vec(),
        );
        let cert = fulcio_cert(ext, &release_san(REPO, "refs/tags/v1"));
        assert_eq!(oidc_issuer(&cert).as_deref(), Some(GITHUB_ACTIONS_ISSUER));
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let identity = CertificateIdentity::github_release(REPO).unwrap();
        let cert = fulcio_cert(v2_issuer("https://accounts.google.com"), &release_san(REPO, "refs/tags/v1"));
        assert!(identity.verify(&cert).is_err());
    }

    #[test]
    fn test_san_must_match_exactly() {
        let identity = CertificateIdentity::github_release(REPO).unwrap();

        for san in [
            release_san(REPO, "refs/heads/main"),
            release_san("tinfoilsh/confidential-llama-evil", "refs/tags/v1"),
            release_san("tinfoilsh/confidential_llama", "refs/tags/v1"),
            format!("https://github.com/{}/.github/workflows/other.yml@refs/tags/v1", REPO),
            release_san(REPO, "refs/tags/"),
        ] {
            let cert = fulcio_cert(v2_issuer(GITHUB_ACTIONS_ISSUER), &san);
            assert!(identity.verify(&cert).is_err(), "accepted {}", san);
        }
    }

    #[test]
    fn test_repo_metacharacters_escaped() {
        // `.` in the repo name must not match an arbitrary character
        let identity = CertificateIdentity::github_release("owner/a.b").unwrap();
        let cert = fulcio_cert(v2_issuer(GITHUB_ACTIONS_ISSUER), &release_san("owner/axb", "refs/tags/v1"));
        assert!(identity.verify(&cert).is_err());
    }
}
