//! In-memory [`ChainClient`] for tests.

use super::ChainClient;
use crate::error::ChainError;
use async_trait::async_trait;
use ethers::{
    types::{Address, Bytes, TransactionReceipt, H256, U256, U64},
    utils::keccak256,
};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

/// What a [`MockChainClient`] has been asked to do.
#[derive(Debug, Default, Clone)]
pub struct MockChainCalls {
    pub nonce_lookups: usize,
    pub gas_price_lookups: usize,
    pub sent: Vec<Bytes>,
    pub receipts: HashMap<H256, TransactionReceipt>,
}

/// In-memory chain that mines every broadcast transaction immediately.
pub struct MockChainClient {
    nonce: U256,
    gas_price: U256,
    code: Bytes,
    gas_used: U256,
    receipt_status: u64,
    fail_receipt: bool,
    calls: Mutex<MockChainCalls>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self {
            nonce: U256::from(7),
            gas_price: U256::from(1_000_000_000u64),
            code: Bytes::new(),
            gas_used: U256::from(43_000),
            receipt_status: 1,
            fail_receipt: false,
            calls: Mutex::new(MockChainCalls::default()),
        }
    }
}

impl MockChainClient {
    pub fn with_code(mut self, code: Vec<u8>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_receipt_status(mut self, status: u64) -> Self {
        self.receipt_status = status;
        self
    }

    pub fn with_gas_used(mut self, gas_used: u64) -> Self {
        self.gas_used = U256::from(gas_used);
        self
    }

    pub fn failing_receipt(mut self) -> Self {
        self.fail_receipt = true;
        self
    }

    pub fn calls(&self) -> MockChainCalls {
        self.lock().clone()
    }

    pub fn insert_receipt(&self, receipt: TransactionReceipt) {
        self.lock()
            .receipts
            .insert(receipt.transaction_hash, receipt);
    }

    fn lock(&self) -> MutexGuard<'_, MockChainCalls> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn pending_nonce(&self, _address: Address) -> Result<U256, ChainError> {
        self.lock().nonce_lookups += 1;
        Ok(self.nonce)
    }

    async fn suggest_gas_price(&self) -> Result<U256, ChainError> {
        self.lock().gas_price_lookups += 1;
        Ok(self.gas_price)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        let hash = H256::from(keccak256(&raw));
        self.lock().sent.push(raw);
        Ok(hash)
    }

    async fn wait_mined(&self, tx_hash: H256) -> Result<TransactionReceipt, ChainError> {
        if self.fail_receipt {
            return Err(ChainError::Receipt {
                tx_hash,
                reason: "connection reset".into(),
            });
        }
        let receipt = TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(1)),
            gas_used: Some(self.gas_used),
            status: Some(U64::from(self.receipt_status)),
            ..Default::default()
        };
        self.insert_receipt(receipt.clone());
        Ok(receipt)
    }

    async fn code_at(&self, _address: Address) -> Result<Bytes, ChainError> {
        Ok(self.code.clone())
    }

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        Ok(self.lock().receipts.get(&tx_hash).cloned())
    }
}
