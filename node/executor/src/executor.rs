use crate::{
    arguments::{parse_script_output, process_arguments, resolve_function, static_arguments},
    config::KeeperConfig,
    error::{ExecutorError, Result, SandboxError},
    sandbox::{ResourceStats, SandboxRunner},
    submitter::ChainSubmitter,
    validation::{parse_address, JobValidator, Preflight},
};
use async_trait::async_trait;
use chrono::Utc;
use ethers::{
    abi::{Function, Token},
    types::Address,
};
use keeper_common::{
    contracts::ChainClient, ActionData, ArgumentMode, Job, TaskDefinition, TriggerData, TriggerKind,
};
use std::{fmt, sync::Arc};
use tracing::{debug, info};

/// Pipeline position of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    ConditionCheck,
    ResolveArguments,
    PackCallData,
    BuildTx,
    SignTx,
    Broadcast,
    AwaitReceipt,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runs jobs end to end: validate, gate, resolve arguments, submit.
pub struct JobExecutor {
    validator: JobValidator,
    sandbox: Arc<SandboxRunner>,
    submitter: ChainSubmitter,
}

impl JobExecutor {
    pub fn new(
        config: &KeeperConfig,
        chain: Arc<dyn ChainClient>,
        sandbox: Arc<SandboxRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let wallet = config.wallet()?;
        Ok(Self {
            validator: JobValidator::new(chain.clone()),
            sandbox,
            submitter: ChainSubmitter::new(chain, wallet, config),
        })
    }

    pub fn keeper_address(&self) -> Address {
        self.submitter.address()
    }

    /// Execute `job` for `trigger`.
    ///
    /// A skipped job (not due, expired, or condition not met) is `Ok` with
    /// `status == false`; callers must look at the result, not only the error.
    pub async fn execute(&self, job: &Job, trigger: &TriggerData) -> Result<ActionData> {
        let mut action = ActionData::not_submitted(Utc::now());
        let task = TaskDefinition::try_from(job.task_definition_id)?;
        info!(job_id = job.job_id, task_id = trigger.task_id, task = %task, "Executing job");

        enter(job, Stage::Validate);
        if let Preflight::Skip(reason) = self.validator.validate(job, task, trigger).await? {
            info!(job_id = job.job_id, reason = %reason, "Job skipped");
            return Ok(action);
        }
        let target = parse_address("target contract address", &job.target_contract_address)?;
        let function = resolve_function(&job.abi, &job.target_function)?;

        if task.trigger == TriggerKind::Condition {
            enter(job, Stage::ConditionCheck);
            let stats = self.sandbox.run(&job.script_trigger_function).await?;
            if !stats.condition_satisfied {
                info!(job_id = job.job_id, "Condition not satisfied, job skipped");
                return Ok(ActionData::not_submitted(action.timestamp));
            }
            absorb(&mut action, &stats);
        }

        enter(job, Stage::ResolveArguments);
        let tokens = task
            .arguments
            .resolve_arguments(&self.sandbox, job, &function, &mut action)
            .await?;

        enter(job, Stage::PackCallData);
        let call_data = function
            .encode_input(&tokens)
            .map_err(|e| ExecutorError::Arguments(format!("failed to pack call data: {}", e)))?;

        let submission = self.submitter.submit(target, call_data.into()).await?;
        action.status = submission.success;
        action.action_tx_hash = format!("{:#x}", submission.tx_hash);
        action.gas_used = submission.gas_used.to_string();

        enter(job, Stage::Done);
        info!(
            job_id = job.job_id,
            status = action.status,
            tx_hash = %action.action_tx_hash,
            total_fee = action.total_fee,
            "Job executed"
        );
        Ok(action)
    }
}

fn enter(job: &Job, stage: Stage) {
    debug!(job_id = job.job_id, stage = %stage, "Entering stage");
}

/// Produces the call arguments of a job.
#[async_trait]
pub trait ResolveArguments {
    async fn resolve_arguments(
        &self,
        sandbox: &SandboxRunner,
        job: &Job,
        function: &Function,
        action: &mut ActionData,
    ) -> Result<Vec<Token>>;
}

#[async_trait]
impl ResolveArguments for ArgumentMode {
    async fn resolve_arguments(
        &self,
        sandbox: &SandboxRunner,
        job: &Job,
        function: &Function,
        action: &mut ActionData,
    ) -> Result<Vec<Token>> {
        match self {
            ArgumentMode::Static => static_arguments(function, &job.arguments),
            ArgumentMode::Dynamic => dynamic_arguments(sandbox, job, function, action).await,
        }
    }
}

async fn dynamic_arguments(
    sandbox: &SandboxRunner,
    job: &Job,
    function: &Function,
    action: &mut ActionData,
) -> Result<Vec<Token>> {
    let value = if !job.script_ipfs_url.trim().is_empty() {
        let stats = sandbox.run(&job.script_ipfs_url).await?;
        absorb(action, &stats);
        if stats.output.trim().is_empty() {
            return Err(SandboxError::EmptyOutput.into());
        }
        parse_script_output(&stats.output)
    } else if let Some(first) = job.arguments.first() {
        serde_json::from_str(first).map_err(|e| {
            ExecutorError::Arguments(format!("first argument is not valid JSON: {}", e))
        })?
    } else {
        return Err(ExecutorError::Arguments(
            "no script URL or arguments provided".into(),
        ));
    };

    process_arguments(function, &value)
}

/// Fold one sandbox run into the execution result.
fn absorb(action: &mut ActionData, stats: &ResourceStats) {
    action.memory_usage = action.memory_usage.max(stats.memory_usage);
    action.cpu_percentage = action.cpu_percentage.max(stats.cpu_percentage);
    action.bandwidth_rate = action.bandwidth_rate.max(stats.bandwidth_rate);
    action.network_rx += stats.rx_bytes;
    action.network_tx += stats.tx_bytes;
    action.block_read += stats.block_read;
    action.block_write += stats.block_write;
    action.total_fee += stats.fee.total_fee;
    action.static_complexity += stats.fee.static_complexity;
    action.dynamic_complexity += stats.fee.computation_cost;
    action.complexity_index += stats.fee.total_tg;
}
