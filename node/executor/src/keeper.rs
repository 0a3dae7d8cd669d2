use crate::{
    aggregator::AggregatorClient,
    config::{KeeperConfig, ProofSource},
    error::{ProofError, Result},
    executor::JobExecutor,
    proof::{certificate_state, generate_proof},
    sandbox::{DockerRuntime, GatewayFetcher, SandboxRunner},
};
use keeper_common::{
    contracts::{ChainClient, EthersChainClient},
    Job, ProofBundle, TriggerData,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Published record of one handled trigger.
#[derive(Debug, Clone, Serialize)]
pub struct PerformedTask {
    pub content_id: String,
    pub bundle: ProofBundle,
    /// Whether the aggregator accepted the task.
    pub submitted: bool,
}

/// Keeper node: executes a job, proves the result and hands it on.
pub struct Keeper {
    executor: JobExecutor,
    proof: ProofSource,
    aggregator: Option<AggregatorClient>,
}

impl Keeper {
    pub fn new(
        config: &KeeperConfig,
        chain: Arc<dyn ChainClient>,
        sandbox: Arc<SandboxRunner>,
    ) -> Result<Self> {
        let executor = JobExecutor::new(config, chain, sandbox)?;
        let aggregator = match &config.aggregator_url {
            Some(url) => Some(AggregatorClient::new(url, config.wallet()?)),
            None => None,
        };
        Ok(Self {
            executor,
            proof: config.proof.clone(),
            aggregator,
        })
    }

    /// Wire up the production collaborators: JSON-RPC chain, local Docker, gateway fetch.
    pub fn from_config(config: &KeeperConfig) -> Result<Self> {
        let chain = Arc::new(EthersChainClient::new(&config.rpc_url)?);
        let sandbox = Arc::new(SandboxRunner::new(
            Arc::new(DockerRuntime::connect()?),
            Arc::new(GatewayFetcher::new(&config.ipfs_gateway)),
            config.sandbox.clone(),
        ));
        Self::new(config, chain, sandbox)
    }

    pub async fn perform(&self, job: Job, trigger: TriggerData) -> Result<PerformedTask> {
        info!(keeper = %format!("{:#x}", self.executor.keeper_address()), job_id = job.job_id, "Handling trigger");
        let action = self.executor.execute(&job, &trigger).await?;
        let task_definition_id = job.task_definition_id;

        let bundle = ProofBundle::new(job, trigger, action);
        let state = certificate_state(&self.proof).await?;
        let proof = generate_proof(&bundle, &state)?;
        let proof_of_task = proof.proof_of_task.clone();

        let bundle = bundle.attach_proof(proof).map_err(ProofError::from)?;
        let content_id = bundle.content_id().map_err(ProofError::from)?;
        info!(content_id = %content_id, proof_of_task = %proof_of_task, "Proof generated");

        let mut submitted = false;
        match &self.aggregator {
            Some(aggregator) if bundle.action_data.status => {
                match aggregator
                    .send_task(&proof_of_task, &content_id, task_definition_id)
                    .await
                {
                    Ok(()) => submitted = true,
                    Err(e) => warn!(content_id = %content_id, error = %e, "Failed to send task"),
                }
            }
            Some(_) => info!(content_id = %content_id, "Nothing executed, task not sent"),
            None => {}
        }

        Ok(PerformedTask {
            content_id,
            bundle,
            submitted,
        })
    }
}
