use ethers::types::H256;
use thiserror::Error;

/// Failures talking to the execution chain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to read pending nonce: {0}")]
    Nonce(String),

    #[error("failed to suggest gas price: {0}")]
    GasPrice(String),

    #[error("failed to sign transaction: {0}")]
    Signing(String),

    #[error("failed to broadcast transaction: {0}")]
    Broadcast(String),

    #[error("failed waiting for receipt of {tx_hash:#x}: {reason}")]
    Receipt { tx_hash: H256, reason: String },

    #[error("transaction {0:#x} was dropped before it was mined")]
    Dropped(H256),

    #[error("rpc error: {0}")]
    Rpc(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported task definition id: {0}")]
pub struct UnsupportedTaskDefinition(pub i64);

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("proof already attached to bundle for task {0}")]
    ProofAlreadyAttached(i64),

    #[error("bundle serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
