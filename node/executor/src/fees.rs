//! Task-gas (TG) fee model.
//!
//! A keeper's claimed fee has to be reproducible by anyone holding the same
//! counters, so everything here is a pure function of its inputs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TG charged per second of program runtime.
pub const TG_PER_SECOND: f64 = 2.0;
/// Megabytes of memory that cost one TG.
pub const MEMORY_MB_PER_TG: f64 = 128.0;
/// Static complexity units that cost one TG.
pub const STATIC_COMPLEXITY_PER_TG: f64 = 1024.0;
pub const FIXED_COST_TG: f64 = 1.0;
pub const SIMULATION_WEIGHT_TG: f64 = 1.0;
/// Price of one TG in ETH.
pub const PRICE_PER_TG: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeInputs {
    pub source_size_bytes: usize,
    pub execution_time: Duration,
    pub memory_used_bytes: u64,
    pub number_of_attesters: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub static_complexity: f64,
    pub computation_cost: f64,
    pub network_scaling_factor: f64,
    pub total_tg: f64,
    pub total_fee: f64,
}

pub fn compute_fee(inputs: &FeeInputs) -> FeeBreakdown {
    let static_complexity = inputs.source_size_bytes as f64 / 1024.0;
    let memory_mb = inputs.memory_used_bytes as f64 / (1024.0 * 1024.0);

    let computation_cost = inputs.execution_time.as_secs_f64() * TG_PER_SECOND
        + (memory_mb / MEMORY_MB_PER_TG) * 1.0
        + (static_complexity / STATIC_COMPLEXITY_PER_TG) * 1.0;

    let network_scaling_factor = 1.0 + inputs.number_of_attesters as f64;
    let total_tg = computation_cost * network_scaling_factor + FIXED_COST_TG + SIMULATION_WEIGHT_TG;

    FeeBreakdown {
        static_complexity,
        computation_cost,
        network_scaling_factor,
        total_tg,
        total_fee: total_tg * PRICE_PER_TG,
    }
}
