//! # Enclave Verifier
//!
//! Establishes trust in a remote confidential-computing service before any
//! data is sent to it.
//!
//! ## Three Signals
//!
//! Trust is granted only when all of the following agree:
//!
//! ### Hardware Attestation
//! - Fetches the attestation document from the enclave over TLS
//! - Verifies the vendor signature chain (AWS Nitro COSE_Sign1 to the pinned
//!   AWS root, or AMD SEV-SNP report to VCEK → ASK → pinned ARK)
//! - Extracts the enclave measurement and report data
//!
//! ### Code Provenance (Sigstore)
//! - Looks up the repository's latest release and its published digest
//! - Verifies the Sigstore bundle offline against a [`TrustedRoot`]: Fulcio
//!   chain, Rekor log entries, SCTs, DSSE signature and the release
//!   workflow identity
//! - Extracts the expected measurement from the signed in-toto statement
//!
//! ### Channel Binding
//! - The report data must begin with the SHA-256 of the TLS certificate
//!   that served the attestation document, so the document can't be
//!   replayed by another endpoint
//!
//! The enclave measurement must then equal the expected one register by
//! register.
//!
//! ## Example
//!
//! ```rust,ignore
//! use enclave_verifier::{SecureClient, VerifierConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SecureClient::new(VerifierConfig::default())?;
//!     let truth = client
//!         .verify("inference.example.com", "owner/confidential-model")
//!         .await?;
//!
//!     println!("verified {} ({})", truth.release_tag, truth.cert_fingerprint);
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod cert;
pub mod client;
pub mod config;
pub mod error;
pub mod github;
pub mod sigstore;
pub mod tls;
pub mod updater;

pub use attestation::{AttestationDocument, FormatRegistry, FormatVerifier, GroundTruth, Measurement, PredicateType};
pub use client::{establish_trust, SecureClient};
pub use config::VerifierConfig;
pub use error::{Error, Result};
pub use sigstore::{ProvenanceVerifier, TrustedRoot, VerifierOptions};
pub use tls::{CertFingerprint, ChannelBinder};
pub use updater::{TrustRootSource, TrustRootUpdater, TufHttpSource};
