use crate::error::ChainError;
use async_trait::async_trait;
use ethers::{
    abi::AbiEncode,
    contract::abigen,
    providers::{Http, Middleware, PendingTransaction, Provider},
    types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256},
};

// Generate contract bindings
abigen!(
    ExecutionProxy,
    r#"[
        function executeFunction(address target, bytes data) external payable
    ]"#
);

/// Calldata for `executeFunction(target, data)` on the execution proxy.
pub fn execute_function_calldata(target: Address, data: Bytes) -> Bytes {
    ExecuteFunctionCall { target, data }.encode().into()
}

/// The chain operations the keeper relies on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn pending_nonce(&self, address: Address) -> Result<U256, ChainError>;

    async fn suggest_gas_price(&self) -> Result<U256, ChainError>;

    /// Broadcast a signed transaction and return its hash.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError>;

    /// Block until the transaction is mined.
    async fn wait_mined(&self, tx_hash: H256) -> Result<TransactionReceipt, ChainError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError>;

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError>;
}

/// [`ChainClient`] over a JSON-RPC HTTP provider.
#[derive(Clone)]
pub struct EthersChainClient {
    provider: Provider<Http>,
}

impl EthersChainClient {
    pub fn new(rpc_url: &str) -> Result<Self, ChainError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ChainError::Rpc(format!("invalid rpc url {}: {}", rpc_url, e)))?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn pending_nonce(&self, address: Address) -> Result<U256, ChainError> {
        self.provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| ChainError::Nonce(e.to_string()))
    }

    async fn suggest_gas_price(&self) -> Result<U256, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::GasPrice(e.to_string()))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ChainError::Broadcast(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn wait_mined(&self, tx_hash: H256) -> Result<TransactionReceipt, ChainError> {
        PendingTransaction::new(tx_hash, &self.provider)
            .await
            .map_err(|e| ChainError::Receipt {
                tx_hash,
                reason: e.to_string(),
            })?
            .ok_or(ChainError::Dropped(tx_hash))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.provider
            .get_code(address, None)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod mock;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockChainCalls, MockChainClient};

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::{abi::AbiDecode, utils::id};

    #[test]
    fn execute_function_calldata_uses_proxy_selector() -> anyhow::Result<()> {
        let target = Address::repeat_byte(0x42);
        let inner = Bytes::from(vec![1u8, 2, 3]);
        let calldata = execute_function_calldata(target, inner.clone());

        assert_eq!(&calldata[..4], &id("executeFunction(address,bytes)")[..]);

        let decoded = ExecuteFunctionCall::decode(calldata.as_ref())?;
        assert_eq!(decoded.target, target);
        assert_eq!(decoded.data, inner);
        Ok(())
    }
}
