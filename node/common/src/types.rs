use crate::{
    crypto::sha256_hex,
    error::{BundleError, UnsupportedTaskDefinition},
};
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Keeper job as handed over by the scheduler. Read-only for the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: i64,
    pub task_definition_id: i64,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub security: i64,
    #[serde(default)]
    pub recurring: bool,
    /// Seconds after `created_at` during which the job may run. Zero means unbounded.
    #[serde(default)]
    pub time_frame: i64,
    /// Seconds between runs of a time-based job.
    #[serde(default)]
    pub time_interval: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_chain_id: String,
    #[serde(default)]
    pub trigger_contract_address: String,
    #[serde(default)]
    pub trigger_event: String,
    /// Source of the condition script for condition-based jobs.
    #[serde(default)]
    pub script_trigger_function: String,
    /// Source of the argument script for dynamic jobs.
    #[serde(default)]
    pub script_ipfs_url: String,
    #[serde(default)]
    pub target_chain_id: String,
    pub target_contract_address: String,
    pub target_function: String,
    /// JSON ABI of the target contract.
    #[serde(default)]
    pub abi: String,
    #[serde(default)]
    pub arg_type: i64,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Context of the trigger that fired the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerData {
    pub task_id: i64,
    pub timestamp: DateTime<Utc>,
}

/// What happens before argument resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    Time,
    Event,
    Condition,
}

/// Where call arguments come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgumentMode {
    /// Taken verbatim from the job.
    Static,
    /// Produced by running a user script in the sandbox.
    Dynamic,
}

/// Closed set of job categories, addressed on the wire by ids 1 through 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskDefinition {
    pub trigger: TriggerKind,
    pub arguments: ArgumentMode,
}

impl TaskDefinition {
    pub fn id(&self) -> i64 {
        let base = match self.trigger {
            TriggerKind::Time => 1,
            TriggerKind::Event => 3,
            TriggerKind::Condition => 5,
        };
        match self.arguments {
            ArgumentMode::Static => base,
            ArgumentMode::Dynamic => base + 1,
        }
    }
}

impl TryFrom<i64> for TaskDefinition {
    type Error = UnsupportedTaskDefinition;

    fn try_from(id: i64) -> Result<Self, Self::Error> {
        let trigger = match id {
            1 | 2 => TriggerKind::Time,
            3 | 4 => TriggerKind::Event,
            5 | 6 => TriggerKind::Condition,
            other => return Err(UnsupportedTaskDefinition(other)),
        };
        let arguments = if id % 2 == 1 {
            ArgumentMode::Static
        } else {
            ArgumentMode::Dynamic
        };
        Ok(Self { trigger, arguments })
    }
}

impl fmt::Display for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?} ({})", self.trigger, self.arguments, self.id())
    }
}

/// Outcome of one execution, filled in stage by stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionData {
    pub status: bool,
    pub action_tx_hash: String,
    pub gas_used: String,
    pub memory_usage: u64,
    pub cpu_percentage: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub bandwidth_rate: f64,
    pub total_fee: f64,
    pub static_complexity: f64,
    pub dynamic_complexity: f64,
    pub complexity_index: f64,
    pub timestamp: DateTime<Utc>,
}

impl ActionData {
    /// Result carried by a run that never reached the chain.
    pub fn not_submitted(timestamp: DateTime<Utc>) -> Self {
        Self {
            status: false,
            action_tx_hash: "0x".to_string(),
            gas_used: "0".to_string(),
            memory_usage: 0,
            cpu_percentage: 0.0,
            network_rx: 0,
            network_tx: 0,
            block_read: 0,
            block_write: 0,
            bandwidth_rate: 0.0,
            total_fee: 0.0,
            static_complexity: 0.0,
            dynamic_complexity: 0.0,
            complexity_index: 0.0,
            timestamp,
        }
    }
}

/// Attestation over an [`ActionData`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProofData {
    pub task_id: i64,
    pub proof_of_task: String,
    pub certificate_hash: String,
    pub certificate_timestamp: DateTime<Utc>,
}

/// Everything published about one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProofBundle {
    pub job_data: Job,
    pub trigger_data: TriggerData,
    pub action_data: ActionData,
    #[serde(default)]
    pub proof_data: Option<ProofData>,
}

impl ProofBundle {
    pub fn new(job_data: Job, trigger_data: TriggerData, action_data: ActionData) -> Self {
        Self {
            job_data,
            trigger_data,
            action_data,
            proof_data: None,
        }
    }

    /// Attach the proof. A bundle takes exactly one.
    pub fn attach_proof(mut self, proof: ProofData) -> Result<Self, BundleError> {
        if self.proof_data.is_some() {
            return Err(BundleError::ProofAlreadyAttached(self.trigger_data.task_id));
        }
        self.proof_data = Some(proof);
        Ok(self)
    }

    /// Bytes the proof of task is computed over.
    pub fn response_bytes(&self) -> Result<Vec<u8>, BundleError> {
        Ok(serde_json::to_vec(&self.action_data)?)
    }

    /// Content identifier under which the bundle is published.
    pub fn content_id(&self) -> Result<String, BundleError> {
        Ok(sha256_hex(&serde_json::to_vec(self)?))
    }
}

/// Verification result
#[derive(Debug, PartialEq)]
pub enum VerificationResult {
    Valid,
    Fraud {
        claimed: H256,
        computed: H256,
    },
    Error(String),
}
