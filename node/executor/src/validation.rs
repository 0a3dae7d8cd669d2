//! Pre-flight checks deciding whether a job runs now, is skipped, or is rejected.

use crate::error::{ExecutorError, Result};
use chrono::{DateTime, Duration, Utc};
use ethers::types::Address;
use keeper_common::{contracts::ChainClient, Job, TaskDefinition, TriggerData, TriggerKind};
use std::{str::FromStr, sync::Arc};

/// Slack allowed around schedule boundaries, in milliseconds.
pub const SCHEDULE_TOLERANCE_MS: i64 = 1500;

fn tolerance() -> Duration {
    Duration::milliseconds(SCHEDULE_TOLERANCE_MS)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Proceed,
    Skip(String),
}

/// Parse a `0x`-prefixed 20-byte hex address.
pub fn parse_address(field: &str, value: &str) -> Result<Address> {
    let digits = value
        .strip_prefix("0x")
        .filter(|d| d.len() == 40)
        .ok_or_else(|| ExecutorError::Validation(format!("{} {:?} is not a valid address", field, value)))?;
    Address::from_str(digits)
        .map_err(|e| ExecutorError::Validation(format!("{} {:?} is not a valid address: {}", field, value, e)))
}

pub struct JobValidator {
    chain: Arc<dyn ChainClient>,
}

impl JobValidator {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }

    /// The trigger timestamp is taken as the current time.
    pub async fn validate(
        &self,
        job: &Job,
        task: TaskDefinition,
        trigger: &TriggerData,
    ) -> Result<Preflight> {
        let now = trigger.timestamp;

        parse_address("target contract address", &job.target_contract_address)?;
        if job.target_function.trim().is_empty() {
            return Err(ExecutorError::Validation("target function is empty".into()));
        }

        if !job.recurring && job.last_executed_at.is_some() {
            return Ok(Preflight::Skip("non-recurring job already executed".into()));
        }
        if let Some(deadline) = time_frame_end(job)? {
            let expired = deadline
                .checked_add_signed(tolerance())
                .is_some_and(|limit| now > limit);
            if expired {
                return Ok(Preflight::Skip(format!("time frame ended at {}", deadline)));
            }
        }

        match task.trigger {
            TriggerKind::Time => check_schedule(job, now),
            TriggerKind::Event => self.check_event_source(job).await,
            TriggerKind::Condition => {
                if job.script_trigger_function.trim().is_empty() {
                    return Err(ExecutorError::Validation(
                        "condition job has no condition script".into(),
                    ));
                }
                Ok(Preflight::Proceed)
            }
        }
    }

    async fn check_event_source(&self, job: &Job) -> Result<Preflight> {
        let address = parse_address("trigger contract address", &job.trigger_contract_address)?;
        if job.trigger_event.trim().is_empty() {
            return Err(ExecutorError::Validation("event job has no trigger event".into()));
        }

        let code = self.chain.code_at(address).await?;
        if code.is_empty() {
            return Err(ExecutorError::Validation(format!(
                "no contract code at trigger address {:#x}",
                address
            )));
        }
        Ok(Preflight::Proceed)
    }
}

/// `base` moved forward by `seconds`, if that is a representable instant.
fn offset(base: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(seconds).and_then(|delta| base.checked_add_signed(delta))
}

fn time_frame_end(job: &Job) -> Result<Option<DateTime<Utc>>> {
    if job.time_frame <= 0 {
        return Ok(None);
    }
    offset(job.created_at, job.time_frame).map(Some).ok_or_else(|| {
        ExecutorError::Validation(format!("time frame {}s is out of range", job.time_frame))
    })
}

fn check_schedule(job: &Job, now: DateTime<Utc>) -> Result<Preflight> {
    if job.time_interval <= 0 {
        return Err(ExecutorError::Validation(format!(
            "time interval must be positive, got {}",
            job.time_interval
        )));
    }

    let Some(last) = job.last_executed_at else {
        return Ok(Preflight::Proceed);
    };
    let due = offset(last, job.time_interval)
        .and_then(|next| next.checked_sub_signed(tolerance()))
        .ok_or_else(|| {
            ExecutorError::Validation(format!(
                "time interval {}s is out of range",
                job.time_interval
            ))
        })?;
    if now < due {
        return Ok(Preflight::Skip(format!("next run due at {}", due)));
    }
    Ok(Preflight::Proceed)
}
