//! Error types.
//!
//! Only the bank reports failures. Emptiness of a queue or stack is an ordinary
//! `None`, and CAS failures inside the lock-free structures are retried internally.

use thiserror::Error;

/// Result of a bank operation.
pub type Result<T, E = BankError> = std::result::Result<T, E>;

/// A rejected bank operation. Balances are untouched and no account lock is held
/// when one of these is returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankError {
    /// Amounts must be strictly positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Underflow: account {index} holds {balance}, cannot take {amount}")]
    Underflow { index: usize, balance: i64, amount: i64 },

    #[error("Overflow: account {index} holds {balance}, adding {amount} exceeds {max}")]
    Overflow {
        index: usize,
        balance: i64,
        amount: i64,
        max: i64,
    },

    #[error("Cannot transfer from account {0} to itself")]
    SameAccount(usize),

    #[error("No such account: {index} (bank has {accounts})")]
    NoSuchAccount { index: usize, accounts: usize },
}

/// Invalid tuning parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Maximum amount must be positive, got {0}")]
    InvalidMaxAmount(i64),

    #[error("Segment capacity must be at least 1")]
    InvalidSegmentCapacity,
}
