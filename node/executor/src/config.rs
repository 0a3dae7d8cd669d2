use crate::{
    error::{ExecutorError, Result},
    proof::TlsProofConfig,
};
use clap::Parser;
use ethers::{
    signers::{LocalWallet, Signer},
    types::Address,
};
use std::{path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_CHAIN_ID: u64 = 11155420;
pub const DEFAULT_GAS_LIMIT: u64 = 300_000;
pub const DEFAULT_SANDBOX_IMAGE: &str = "golang:latest";
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_IPFS_GATEWAY: &str = "https://ipfs.io";

/// Container settings for script runs.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    /// Hard deadline for one container, build included.
    pub timeout: Duration,
    /// Bytes.
    pub memory_limit: Option<i64>,
    pub nano_cpus: Option<i64>,
    /// How long to keep reading logs after the container has exited.
    pub log_drain_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SANDBOX_IMAGE.to_string(),
            timeout: DEFAULT_SANDBOX_TIMEOUT,
            memory_limit: Some(1024 * 1024 * 1024),
            nano_cpus: Some(1_000_000_000),
            log_drain_grace: Duration::from_secs(5),
        }
    }
}

/// Certificate material a proof is anchored to.
#[derive(Debug, Clone)]
pub enum ProofSource {
    /// Live TLS handshake with a configured host.
    Tls(TlsProofConfig),
    /// DER certificate supplied by the operator.
    Certificate(Vec<u8>),
}

/// Everything a keeper needs, passed in explicitly.
#[derive(Clone)]
pub struct KeeperConfig {
    pub rpc_url: String,
    pub private_key: String,
    pub execution_proxy: Address,
    pub chain_id: u64,
    pub gas_limit: u64,
    pub ipfs_gateway: String,
    pub sandbox: SandboxConfig,
    pub proof: ProofSource,
    pub aggregator_url: Option<String>,
}

impl KeeperConfig {
    pub fn new(rpc_url: &str, private_key: &str, execution_proxy: Address, proof: ProofSource) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            private_key: private_key.to_string(),
            execution_proxy,
            chain_id: DEFAULT_CHAIN_ID,
            gas_limit: DEFAULT_GAS_LIMIT,
            ipfs_gateway: DEFAULT_IPFS_GATEWAY.to_string(),
            sandbox: SandboxConfig::default(),
            proof,
            aggregator_url: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution_proxy.is_zero() {
            return Err(ExecutorError::Configuration(
                "execution proxy address is not set".into(),
            ));
        }
        if self.chain_id == 0 {
            return Err(ExecutorError::Configuration("chain id must be non-zero".into()));
        }
        if self.gas_limit == 0 {
            return Err(ExecutorError::Configuration("gas limit must be non-zero".into()));
        }
        if self.sandbox.timeout.is_zero() {
            return Err(ExecutorError::Configuration("sandbox timeout must be non-zero".into()));
        }
        self.wallet().map(|_| ())
    }

    /// Operator wallet bound to the configured chain.
    pub fn wallet(&self) -> Result<LocalWallet> {
        let key = self.private_key.trim_start_matches("0x");
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| ExecutorError::Configuration(format!("invalid signing key: {}", e)))?;
        Ok(wallet.with_chain_id(self.chain_id))
    }
}

impl std::fmt::Debug for KeeperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperConfig")
            .field("rpc_url", &self.rpc_url)
            .field("execution_proxy", &self.execution_proxy)
            .field("chain_id", &self.chain_id)
            .field("gas_limit", &self.gas_limit)
            .field("ipfs_gateway", &self.ipfs_gateway)
            .field("sandbox", &self.sandbox)
            .field("aggregator_url", &self.aggregator_url)
            .finish_non_exhaustive()
    }
}

/// Command line of the `keeper` binary.
#[derive(Debug, Parser)]
#[command(name = "keeper", about = "Execute one keeper job and print its proof bundle")]
pub struct Args {
    /// JSON file holding the job record
    #[arg(long)]
    pub job: PathBuf,

    /// JSON file holding the trigger context
    #[arg(long)]
    pub trigger: PathBuf,

    #[arg(long, env = "KEEPER_RPC_URL")]
    pub rpc_url: String,

    #[arg(long, env = "KEEPER_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    #[arg(long, env = "KEEPER_EXECUTION_PROXY")]
    pub execution_proxy: String,

    #[arg(long, env = "KEEPER_CHAIN_ID", default_value_t = DEFAULT_CHAIN_ID)]
    pub chain_id: u64,

    #[arg(long, default_value_t = DEFAULT_GAS_LIMIT)]
    pub gas_limit: u64,

    #[arg(long, env = "KEEPER_IPFS_GATEWAY", default_value = DEFAULT_IPFS_GATEWAY)]
    pub ipfs_gateway: String,

    #[arg(long, default_value = DEFAULT_SANDBOX_IMAGE)]
    pub sandbox_image: String,

    /// Seconds
    #[arg(long, default_value_t = 600)]
    pub sandbox_timeout: u64,

    /// Host whose TLS certificate anchors the proof
    #[arg(long, env = "KEEPER_PROOF_HOST", conflicts_with = "certificate")]
    pub proof_host: Option<String>,

    /// DER certificate used instead of a live TLS handshake
    #[arg(long)]
    pub certificate: Option<PathBuf>,

    #[arg(long, env = "KEEPER_AGGREGATOR_URL")]
    pub aggregator_url: Option<String>,
}

impl Args {
    pub fn into_config(self) -> Result<KeeperConfig> {
        let execution_proxy = Address::from_str(&self.execution_proxy).map_err(|e| {
            ExecutorError::Configuration(format!(
                "invalid execution proxy address {}: {}",
                self.execution_proxy, e
            ))
        })?;

        let proof = match (self.proof_host, self.certificate) {
            (Some(host), _) => ProofSource::Tls(TlsProofConfig::new(&host)),
            (None, Some(path)) => {
                let der = std::fs::read(&path).map_err(|e| {
                    ExecutorError::Configuration(format!(
                        "cannot read certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                ProofSource::Certificate(der)
            }
            (None, None) => {
                return Err(ExecutorError::Configuration(
                    "either --proof-host or --certificate is required".into(),
                ))
            }
        };

        let mut config = KeeperConfig::new(&self.rpc_url, &self.private_key, execution_proxy, proof);
        config.chain_id = self.chain_id;
        config.gas_limit = self.gas_limit;
        config.ipfs_gateway = self.ipfs_gateway;
        config.sandbox.image = self.sandbox_image;
        config.sandbox.timeout = Duration::from_secs(self.sandbox_timeout);
        config.aggregator_url = self.aggregator_url;
        config.validate()?;
        Ok(config)
    }
}
