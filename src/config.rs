//! Tuning parameters.
//!
//! Every struct here is plain data and deserialisable, so a benchmark or an embedding
//! application can keep its tuning in a JSON file.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// The default ceiling of a single account balance.
pub const DEFAULT_MAX_AMOUNT: i64 = 1_000_000_000_000_000;

/// Elimination array tuning for [`Stack`](crate::structures::Stack).
///
/// A larger array or more probes avoid collisions better under contention, and cost
/// more latency when the stack is uncontended. `spin_wait` bounds how long a pusher
/// waits in a cell for a popper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EliminationConfig {
    pub array_size: usize,
    pub probes: usize,
    pub spin_wait: usize,
}

impl EliminationConfig {
    /// Every operation goes straight to the list.
    pub fn disabled() -> Self {
        EliminationConfig {
            array_size: 0,
            probes: 0,
            spin_wait: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.array_size > 0 && self.probes > 0
    }
}

impl Default for EliminationConfig {
    fn default() -> Self {
        EliminationConfig {
            array_size: 5,
            probes: 3,
            spin_wait: 20,
        }
    }
}

/// Segment tuning for [`FaaQueue`](crate::structures::FaaQueue).
///
/// There is no default capacity: larger segments mean fewer segment-allocation races
/// and more wasted slots under low load, and the right trade-off depends on the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaaQueueConfig {
    pub segment_capacity: usize,
}

impl FaaQueueConfig {
    pub fn validate(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.segment_capacity).ok_or(ConfigError::InvalidSegmentCapacity)
    }
}

/// Shape of a [`Bank`](crate::structures::Bank).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankConfig {
    pub accounts: usize,
    #[serde(default = "default_max_amount")]
    pub max_amount: i64,
}

fn default_max_amount() -> i64 {
    DEFAULT_MAX_AMOUNT
}

impl BankConfig {
    pub fn new(accounts: usize) -> Self {
        BankConfig {
            accounts,
            max_amount: DEFAULT_MAX_AMOUNT,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_amount <= 0 {
            debug!(max_amount = self.max_amount, "rejecting bank configuration");
            return Err(ConfigError::InvalidMaxAmount(self.max_amount));
        }
        Ok(())
    }
}
