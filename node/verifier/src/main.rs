use anyhow::{Context, Result};
use clap::Parser;
use keeper_common::{contracts::EthersChainClient, ProofBundle, VerificationResult};
use keeper_verifier::ProofVerifier;
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Check a keeper's proof bundle.
#[derive(Parser, Debug)]
#[command(name = "verifier", version)]
struct Args {
    /// Proof bundle JSON as published by the keeper
    #[arg(long)]
    bundle: PathBuf,

    /// DER certificate the proof should be anchored to
    #[arg(long)]
    certificate: Option<PathBuf>,

    /// RPC endpoint used to check the claimed transaction
    #[arg(long = "rpc", env = "RPC_URL")]
    rpc_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("Starting keeper verifier");

    let raw = std::fs::read(&args.bundle)
        .with_context(|| format!("reading bundle {}", args.bundle.display()))?;
    let bundle: ProofBundle = serde_json::from_slice(&raw).context("parsing proof bundle")?;
    let certificate = match &args.certificate {
        Some(path) => Some(
            std::fs::read(path).with_context(|| format!("reading certificate {}", path.display()))?,
        ),
        None => None,
    };

    let verifier = match &args.rpc_url {
        Some(url) => ProofVerifier::new(Arc::new(EthersChainClient::new(url)?)),
        None => ProofVerifier::offline(),
    };

    let result = verifier.verify(&bundle, certificate.as_deref()).await?;
    println!("{:?}", result);
    match result {
        VerificationResult::Valid => {
            info!("Proof valid");
            Ok(ExitCode::SUCCESS)
        }
        VerificationResult::Fraud { claimed, computed } => {
            error!(claimed = ?claimed, computed = ?computed, "Fraud detected");
            Ok(ExitCode::from(2))
        }
        VerificationResult::Error(reason) => {
            error!(reason = %reason, "Verification failed");
            Ok(ExitCode::FAILURE)
        }
    }
}
