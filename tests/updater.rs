//! Trust root distribution from a local TUF repository

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use enclave_verifier::updater::{TrustRootSource, TrustRootUpdater, TufHttpSource};
use enclave_verifier::{Error, TrustedRoot, VerifierConfig};

const FUTURE: &str = "2099-01-01T00:00:00Z";
const PAST: &str = "2001-01-01T00:00:00Z";

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn trusted_root_json() -> Vec<u8> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca = params.self_signed(&ca_key).unwrap();
    let log_key = rcgen::KeyPair::generate().unwrap();

    serde_json::to_vec_pretty(&serde_json::json!({
        "mediaType": "application/vnd.dev.sigstore.trustedroot+json;version=0.1",
        "tlogs": [{
            "baseUrl": "https://rekor.example",
            "hashAlgorithm": "SHA2_256",
            "publicKey": {"rawBytes": b64.encode(log_key.public_key_der()), "keyDetails": "PKIX_ECDSA_P256_SHA_256"},
            "logId": {"keyId": b64.encode(Sha256::digest(log_key.public_key_der()))}
        }],
        "certificateAuthorities": [{
            "uri": "https://fulcio.example",
            "certChain": {"certificates": [{"rawBytes": b64.encode(ca.der())}]},
            "validFor": {"start": "2021-03-07T03:20:29.000Z"}
        }]
    }))
    .unwrap()
}

struct Repo {
    files: HashMap<String, Vec<u8>>,
}

impl Repo {
    /// A consistent repository publishing `root`
    fn new(root: &[u8], timestamp_expires: &str) -> Self {
        let root_hash = sha256_hex(root);

        let targets = serde_json::to_vec(&serde_json::json!({
            "signed": {
                "_type": "targets",
                "version": 3,
                "expires": FUTURE,
                "targets": {
                    "trusted_root.json": {"length": root.len(), "hashes": {"sha256": root_hash}},
                    "other.pem": {"length": 1, "hashes": {"sha256": "00"}}
                }
            },
            "signatures": []
        }))
        .unwrap();

        let snapshot = serde_json::to_vec(&serde_json::json!({
            "signed": {
                "_type": "snapshot",
                "version": 7,
                "expires": FUTURE,
                "meta": {"targets.json": {"version": 3, "length": targets.len(), "hashes": {"sha256": sha256_hex(&targets)}}}
            },
            "signatures": []
        }))
        .unwrap();

        let timestamp = serde_json::to_vec(&serde_json::json!({
            "signed": {
                "_type": "timestamp",
                "version": 9,
                "expires": timestamp_expires,
                "meta": {"snapshot.json": {"version": 7, "length": snapshot.len(), "hashes": {"sha256": sha256_hex(&snapshot)}}}
            },
            "signatures": []
        }))
        .unwrap();

        let mut files = HashMap::new();
        files.insert(format!("/targets/{}.trusted_root.json", root_hash), root.to_vec());
        files.insert("/3.targets.json".to_string(), targets);
        files.insert("/7.snapshot.json".to_string(), snapshot);
        files.insert("/timestamp.json".to_string(), timestamp);
        Self { files }
    }

    /// Serve over plain HTTP; returns the base URL
    async fn serve(self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let files = Arc::new(self.files);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                let files = files.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                    let (status, body) = match files.get(&path) {
                        Some(body) => ("200 OK", body.clone()),
                        None => ("404 Not Found", Vec::new()),
                    };
                    let head = format!(
                        "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                });
            }
        });
        base
    }
}

fn config(tuf_url: String, dir: &tempfile::TempDir) -> VerifierConfig {
    VerifierConfig {
        tuf_url,
        trust_root_path: dir.path().join("trusted_root.json"),
        fetch_timeout_secs: 5,
        ..VerifierConfig::default()
    }
}

#[tokio::test]
async fn test_tuf_walk_and_persist() {
    let root = trusted_root_json();
    let base = Repo::new(&root, FUTURE).serve().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(base, &dir);

    let fetched = TufHttpSource::new(&config).unwrap().fetch().await.unwrap();
    assert_eq!(fetched, root);

    let updater = TrustRootUpdater::from_config(&config).unwrap();
    let parsed = updater.update().await.unwrap();
    assert_eq!(std::fs::read(&config.trust_root_path).unwrap(), root);
    assert_eq!(TrustedRoot::load(&config.trust_root_path, None).unwrap(), parsed);
}

#[tokio::test]
async fn test_target_hash_mismatch_keeps_previous() {
    let root = trusted_root_json();
    let mut repo = Repo::new(&root, FUTURE);
    // Serve different bytes under the advertised hash
    let tampered: Vec<u8> = trusted_root_json();
    let key = format!("/targets/{}.trusted_root.json", sha256_hex(&root));
    repo.files.insert(key, tampered);
    let base = repo.serve().await;

    let dir = tempfile::tempdir().unwrap();
    let config = config(base, &dir);
    std::fs::write(&config.trust_root_path, b"previous root").unwrap();

    let err = TrustRootUpdater::from_config(&config).unwrap().update().await.unwrap_err();
    assert!(matches!(err, Error::TrustRootDistribution(_)), "{:?}", err);
    assert_eq!(std::fs::read(&config.trust_root_path).unwrap(), b"previous root");
}

#[tokio::test]
async fn test_expired_metadata_rejected() {
    let root = trusted_root_json();
    let base = Repo::new(&root, PAST).serve().await;
    let dir = tempfile::tempdir().unwrap();

    let err = TrustRootUpdater::from_config(&config(base, &dir))
        .unwrap()
        .update()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TrustRootDistribution(ref msg) if msg.contains("expired")), "{:?}", err);
}

#[tokio::test]
async fn test_unparseable_target_rejected() {
    let base = Repo::new(b"{\"mediaType\": \"nope\"}", FUTURE).serve().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(base, &dir);

    let err = TrustRootUpdater::from_config(&config).unwrap().update().await.unwrap_err();
    assert!(matches!(err, Error::TrustRootDistribution(_)));
    assert!(!config.trust_root_path.exists());
}

#[tokio::test]
async fn test_unreachable_repository() {
    // Bind then drop to get a port nothing listens on
    let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();

    let err = TrustRootUpdater::from_config(&config(format!("http://127.0.0.1:{}", port), &dir))
        .unwrap()
        .update()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TrustRootDistribution(_)), "{:?}", err);
}

#[tokio::test]
async fn test_silent_repository_times_out_as_distribution_error() {
    // Accepts connections, never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let config = VerifierConfig {
        fetch_timeout_secs: 1,
        ..config(base, &dir)
    };

    let source = TufHttpSource::new(&config).unwrap();
    assert!(matches!(source.fetch().await, Err(Error::Timeout(_))));

    let err = TrustRootUpdater::from_config(&config).unwrap().update().await.unwrap_err();
    assert!(
        matches!(err, Error::TrustRootDistribution(ref msg) if msg.contains("timed out")),
        "{:?}",
        err
    );
    assert!(!config.trust_root_path.exists());
}
