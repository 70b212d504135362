//! enclave-verifier CLI: verify enclaves, refresh the trust root, compute
//! measurement fingerprints.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use enclave_verifier::attestation::FingerprintEncoding;
use enclave_verifier::{Measurement, PredicateType, Result, SecureClient, TrustRootUpdater, VerifierConfig};

#[derive(Parser)]
#[command(name = "enclave-verifier", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; unset keys keep their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (repeat for more detail: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Verify that an enclave runs the latest release of a repository.
    Verify {
        /// Enclave hostname
        #[arg(long)]
        host: String,
        /// Source repository, `owner/name`
        #[arg(long)]
        repo: String,
    },
    /// Fetch a fresh trusted root and persist it.
    UpdateTrustRoot,
    /// Print the fingerprint of a measurement.
    Fingerprint {
        /// Predicate type URI
        #[arg(long = "type")]
        type_: String,
        #[arg(long, value_enum, default_value_t = Encoding::Legacy)]
        encoding: Encoding,
        /// Register values, in order
        registers: Vec<String>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Encoding {
    Legacy,
    LengthPrefixed,
}

impl From<Encoding> for FingerprintEncoding {
    fn from(e: Encoding) -> Self {
        match e {
            Encoding::Legacy => FingerprintEncoding::Legacy,
            Encoding::LengthPrefixed => FingerprintEncoding::LengthPrefixed,
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => VerifierConfig::from_json_file(path)?,
        None => VerifierConfig::default(),
    };

    match cli.command {
        Commands::Verify { host, repo } => {
            let truth = SecureClient::new(config.clone())?.verify(&host, &repo).await?;
            let encoding = config.fingerprint_encoding;
            println!("verified:     {} @ {}", repo, truth.release_tag);
            println!("certificate:  {}", truth.cert_fingerprint);
            println!("measurement:  {}", truth.enclave_measurement.fingerprint_with(encoding));
            println!("registers:    {}", truth.enclave_measurement.registers.join(" "));
        }
        Commands::UpdateTrustRoot => {
            let updater = TrustRootUpdater::from_config(&config)?;
            let root = updater.update().await?;
            println!(
                "wrote {} ({} CAs, {} tlogs, {} ctlogs)",
                updater.path().display(),
                root.certificate_authorities.len(),
                root.tlogs.len(),
                root.ctlogs.len()
            );
        }
        Commands::Fingerprint {
            type_,
            encoding,
            registers,
        } => {
            let measurement = Measurement::new(PredicateType::new(type_), registers);
            println!("{}", measurement.fingerprint_with(encoding.into()));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
