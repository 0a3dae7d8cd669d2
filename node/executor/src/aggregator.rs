use crate::error::{ExecutorError, Result};
use ethers::{
    signers::{LocalWallet, Signer},
    types::Address,
};
use keeper_common::crypto::task_message_hash;
use serde_json::{json, Value};
use tracing::info;

/// Hands finished tasks to the attestation aggregator over JSON-RPC.
pub struct AggregatorClient {
    client: reqwest::Client,
    url: String,
    wallet: LocalWallet,
}

impl AggregatorClient {
    pub fn new(url: &str, wallet: LocalWallet) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            wallet,
        }
    }

    pub fn performer(&self) -> Address {
        self.wallet.address()
    }

    /// JSON-RPC `sendTask` request, signed by the performer.
    pub fn task_request(
        &self,
        proof_of_task: &str,
        content_id: &str,
        task_definition_id: i64,
    ) -> Result<Value> {
        let data = content_id.as_bytes();
        let performer = self.performer();
        let digest = task_message_hash(proof_of_task, data, performer, task_definition_id);
        let signature = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| ExecutorError::Aggregator(format!("failed to sign task: {}", e)))?;

        Ok(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTask",
            "params": [
                proof_of_task,
                format!("0x{}", hex::encode(data)),
                task_definition_id,
                format!("{:#x}", performer),
                format!("0x{}", hex::encode(signature.to_vec())),
            ],
        }))
    }

    pub async fn send_task(
        &self,
        proof_of_task: &str,
        content_id: &str,
        task_definition_id: i64,
    ) -> Result<()> {
        let request = self.task_request(proof_of_task, content_id, task_definition_id)?;

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutorError::Aggregator(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExecutorError::Aggregator(format!("status {}", response.status())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::Aggregator(format!("invalid response: {}", e)))?;
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(ExecutorError::Aggregator(error.to_string()));
        }

        info!(content_id = %content_id, task_definition_id, "Task sent to aggregator");
        Ok(())
    }
}
