use anyhow::Result;
use ethers::types::{H256, U64};
use keeper_common::{
    contracts::ChainClient,
    crypto::{is_tx_hash, sha256, sha256_hex},
    ProofBundle, VerificationResult,
};
use std::{str::FromStr, sync::Arc};
use tracing::{info, warn};

/// Checks a published proof bundle against its own contents and, when a
/// chain is available, against the transaction it claims.
pub struct ProofVerifier {
    chain: Option<Arc<dyn ChainClient>>,
}

impl ProofVerifier {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain: Some(chain) }
    }

    /// Verifier that only checks the bundle itself.
    pub fn offline() -> Self {
        Self { chain: None }
    }

    /// Verify `bundle`. `certificate` is the DER the performer claims to have seen.
    ///
    /// Only RPC failures are returned as errors; every finding about the
    /// bundle is a [`VerificationResult`].
    pub async fn verify(
        &self,
        bundle: &ProofBundle,
        certificate: Option<&[u8]>,
    ) -> Result<VerificationResult> {
        let Some(proof) = &bundle.proof_data else {
            return Ok(VerificationResult::Error("bundle carries no proof".into()));
        };
        info!(task_id = proof.task_id, job_id = bundle.job_data.job_id, "Verifying proof");

        if proof.task_id != bundle.trigger_data.task_id {
            return Ok(VerificationResult::Error(format!(
                "proof is for task {} but trigger is task {}",
                proof.task_id, bundle.trigger_data.task_id
            )));
        }

        let Ok(claimed) = H256::from_str(&proof.proof_of_task) else {
            return Ok(VerificationResult::Error(format!(
                "malformed proof of task {:?}",
                proof.proof_of_task
            )));
        };
        let computed = sha256(&bundle.response_bytes()?);
        if computed != claimed {
            warn!(task_id = proof.task_id, claimed = ?claimed, computed = ?computed, "Proof does not match result");
            return Ok(VerificationResult::Fraud { claimed, computed });
        }

        if let Some(der) = certificate {
            if sha256_hex(der) != proof.certificate_hash {
                return Ok(VerificationResult::Error("certificate hash mismatch".into()));
            }
        }

        let action = &bundle.action_data;
        if action.action_tx_hash == "0x" {
            if action.status || action.gas_used != "0" {
                return Ok(VerificationResult::Error(
                    "result claims execution without a transaction".into(),
                ));
            }
            return Ok(VerificationResult::Valid);
        }
        if !is_tx_hash(&action.action_tx_hash) {
            return Ok(VerificationResult::Error(format!(
                "malformed transaction hash {:?}",
                action.action_tx_hash
            )));
        }

        match &self.chain {
            Some(chain) => self.check_receipt(chain.as_ref(), bundle).await,
            None => Ok(VerificationResult::Valid),
        }
    }

    async fn check_receipt(
        &self,
        chain: &dyn ChainClient,
        bundle: &ProofBundle,
    ) -> Result<VerificationResult> {
        let action = &bundle.action_data;
        let tx_hash = H256::from_str(&action.action_tx_hash)?;

        let Some(receipt) = chain.transaction_receipt(tx_hash).await? else {
            return Ok(VerificationResult::Error(format!(
                "transaction {:#x} not found",
                tx_hash
            )));
        };
        let succeeded = receipt.status == Some(U64::from(1));
        if succeeded != action.status {
            return Ok(VerificationResult::Error(format!(
                "transaction {:#x} status disagrees with the result",
                tx_hash
            )));
        }

        let gas_used = receipt.gas_used.unwrap_or_default().to_string();
        if gas_used != action.gas_used {
            return Ok(VerificationResult::Error(format!(
                "gas used {} does not match receipt {}",
                action.gas_used, gas_used
            )));
        }

        info!(tx_hash = %action.action_tx_hash, "Proof valid");
        Ok(VerificationResult::Valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ethers::types::{TransactionReceipt, U256};
    use keeper_common::{
        contracts::MockChainClient, ActionData, Job, ProofData, TriggerData,
    };

    const CERT: &[u8] = &[0x30, 0x82, 0x01, 0x0a, 0x02];
    const TX: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn job() -> Result<Job> {
        Ok(serde_json::from_value(serde_json::json!({
            "job_id": 3,
            "task_definition_id": 1,
            "created_at": "2024-02-01T00:00:00Z",
            "target_contract_address": "0x00000000000000000000000000000000000000bb",
            "target_function": "setValue"
        }))?)
    }

    fn bundle(action: ActionData) -> Result<ProofBundle> {
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap();
        let bundle = ProofBundle::new(job()?, TriggerData { task_id: 9, timestamp: at }, action);
        let proof = ProofData {
            task_id: 9,
            proof_of_task: sha256_hex(&bundle.response_bytes()?),
            certificate_hash: sha256_hex(CERT),
            certificate_timestamp: at,
        };
        Ok(bundle.attach_proof(proof)?)
    }

    fn executed() -> ActionData {
        let mut action = ActionData::not_submitted(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap());
        action.status = true;
        action.action_tx_hash = TX.into();
        action.gas_used = "43000".into();
        action
    }

    fn receipt(status: u64, gas_used: u64) -> Result<TransactionReceipt> {
        Ok(TransactionReceipt {
            transaction_hash: H256::from_str(TX)?,
            status: Some(U64::from(status)),
            gas_used: Some(U256::from(gas_used)),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn consistent_bundle_is_valid() -> Result<()> {
        let chain = Arc::new(MockChainClient::default());
        chain.insert_receipt(receipt(1, 43000)?);

        let result = ProofVerifier::new(chain).verify(&bundle(executed())?, Some(CERT)).await?;
        assert_eq!(result, VerificationResult::Valid);
        Ok(())
    }

    #[tokio::test]
    async fn tampered_result_is_fraud() -> Result<()> {
        let mut bundle = bundle(executed())?;
        let claimed = H256::from_str(&bundle.proof_data.as_ref().unwrap().proof_of_task)?;
        bundle.action_data.total_fee = 99.0;

        let result = ProofVerifier::offline().verify(&bundle, None).await?;
        assert_eq!(
            result,
            VerificationResult::Fraud {
                claimed,
                computed: sha256(&bundle.response_bytes()?),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_proof_and_foreign_certificate_are_errors() -> Result<()> {
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap();
        let unproven = ProofBundle::new(job()?, TriggerData { task_id: 9, timestamp: at }, executed());
        let verifier = ProofVerifier::offline();

        assert!(matches!(
            verifier.verify(&unproven, None).await?,
            VerificationResult::Error(_)
        ));
        assert!(matches!(
            verifier.verify(&bundle(executed())?, Some(b"other")).await?,
            VerificationResult::Error(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn receipt_must_exist_and_agree() -> Result<()> {
        let bundle = bundle(executed())?;

        let empty = Arc::new(MockChainClient::default());
        assert!(matches!(
            ProofVerifier::new(empty).verify(&bundle, None).await?,
            VerificationResult::Error(_)
        ));

        let reverted = Arc::new(MockChainClient::default());
        reverted.insert_receipt(receipt(0, 43000)?);
        assert!(matches!(
            ProofVerifier::new(reverted).verify(&bundle, None).await?,
            VerificationResult::Error(_)
        ));

        let other_gas = Arc::new(MockChainClient::default());
        other_gas.insert_receipt(receipt(1, 21000)?);
        assert!(matches!(
            ProofVerifier::new(other_gas).verify(&bundle, None).await?,
            VerificationResult::Error(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn published_bundle_with_metered_fees_stays_valid() -> Result<()> {
        let static_complexity = 1234.0 / 1024.0;
        for ms in (1..=3000u64).step_by(7) {
            let computation = ms as f64 / 1000.0 * 2.0 + 32.0 / 128.0 + static_complexity / 1024.0;
            let total_tg = computation + 1.0 + 1.0;

            let mut action = executed();
            action.static_complexity = static_complexity;
            action.dynamic_complexity = computation;
            action.complexity_index = total_tg;
            action.total_fee = total_tg * 0.0001;
            action.cpu_percentage = 100.0 / 3.0;
            action.bandwidth_rate = 1536.0 / (ms as f64 / 1000.0);

            let published = serde_json::to_vec(&bundle(action)?)?;
            let received: ProofBundle = serde_json::from_slice(&published)?;
            assert_eq!(
                ProofVerifier::offline().verify(&received, Some(CERT)).await?,
                VerificationResult::Valid,
                "fees metered over {}ms",
                ms
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn reverted_transaction_is_valid_when_receipt_agrees() -> Result<()> {
        let mut action = executed();
        action.status = false;
        let bundle = bundle(action)?;

        let chain = Arc::new(MockChainClient::default());
        chain.insert_receipt(receipt(0, 43000)?);
        assert_eq!(
            ProofVerifier::new(chain).verify(&bundle, None).await?,
            VerificationResult::Valid
        );

        let mined = Arc::new(MockChainClient::default());
        mined.insert_receipt(receipt(1, 43000)?);
        assert!(matches!(
            ProofVerifier::new(mined).verify(&bundle, None).await?,
            VerificationResult::Error(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn execution_claimed_without_transaction_is_an_error() -> Result<()> {
        let mut action = executed();
        action.action_tx_hash = "0x".into();
        let result = ProofVerifier::offline().verify(&bundle(action)?, None).await?;
        assert!(matches!(result, VerificationResult::Error(_)));
        Ok(())
    }

    #[tokio::test]
    async fn skipped_job_needs_no_chain() -> Result<()> {
        let skipped = ActionData::not_submitted(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap());
        let chain = Arc::new(MockChainClient::default());

        let result = ProofVerifier::new(chain.clone()).verify(&bundle(skipped)?, None).await?;
        assert_eq!(result, VerificationResult::Valid);
        assert!(chain.calls().receipts.is_empty());
        Ok(())
    }
}
