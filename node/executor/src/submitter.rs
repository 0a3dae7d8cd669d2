use crate::{config::KeeperConfig, executor::Stage};
use ethers::{
    signers::{LocalWallet, Signer},
    types::{
        transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, H256, U256,
        U64,
    },
    utils::keccak256,
};
use keeper_common::{
    contracts::{execute_function_calldata, ChainClient},
    ChainError,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mined outcome of one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub tx_hash: H256,
    pub gas_used: U256,
    pub success: bool,
}

/// Signs and sends calls through the execution proxy.
pub struct ChainSubmitter {
    chain: Arc<dyn ChainClient>,
    wallet: LocalWallet,
    execution_proxy: Address,
    chain_id: u64,
    gas_limit: U256,
}

impl ChainSubmitter {
    pub fn new(chain: Arc<dyn ChainClient>, wallet: LocalWallet, config: &KeeperConfig) -> Self {
        Self {
            chain,
            wallet: wallet.with_chain_id(config.chain_id),
            execution_proxy: config.execution_proxy,
            chain_id: config.chain_id,
            gas_limit: U256::from(config.gas_limit),
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Wrap `call_data` in `executeFunction(target, call_data)`, sign it with
    /// the operator key and wait until it is mined. Exactly one broadcast.
    pub async fn submit(&self, target: Address, call_data: Bytes) -> Result<Submission, ChainError> {
        debug!(stage = %Stage::BuildTx, target = %format!("{:#x}", target));
        let from = self.wallet.address();
        let nonce = self.chain.pending_nonce(from).await?;
        let gas_price = self.chain.suggest_gas_price().await?;

        let tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(self.execution_proxy)
            .value(0u64)
            .gas(self.gas_limit)
            .gas_price(gas_price)
            .nonce(nonce)
            .data(execute_function_calldata(target, call_data))
            .chain_id(self.chain_id)
            .into();

        debug!(stage = %Stage::SignTx, nonce = %nonce, gas_price = %gas_price);
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let local_hash = H256::from(keccak256(&raw));

        debug!(stage = %Stage::Broadcast, tx_hash = %format!("{:#x}", local_hash));
        let tx_hash = self.chain.send_raw_transaction(raw).await?;
        if tx_hash != local_hash {
            warn!(
                expected = %format!("{:#x}", local_hash),
                reported = %format!("{:#x}", tx_hash),
                "Node reported a different transaction hash"
            );
        }

        // No deadline here: the wait lasts as long as the provider keeps polling.
        debug!(stage = %Stage::AwaitReceipt, tx_hash = %format!("{:#x}", tx_hash));
        let receipt = self.chain.wait_mined(tx_hash).await?;

        let submission = Submission {
            tx_hash,
            gas_used: receipt.gas_used.unwrap_or_default(),
            success: receipt.status == Some(U64::from(1)),
        };
        info!(
            tx_hash = %format!("{:#x}", submission.tx_hash),
            gas_used = %submission.gas_used,
            success = submission.success,
            "Transaction mined"
        );
        Ok(submission)
    }
}
