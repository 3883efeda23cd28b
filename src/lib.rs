//! Linearizable concurrent collections for Rust.
//!
//! The crate provides two lock-free FIFO queues (a Michael-Scott queue and a segmented
//! fetch-and-add queue), a Treiber stack with an elimination layer, a lock-free sorted set,
//! and a bank of accounts with fine-grained locking. The lock-free structures free memory
//! through hazard pointers, in the `memory` module.
//!
//! The `testing` module holds the linearizability checker the structures are tested with.

pub mod config;
pub mod error;
pub mod memory;
pub mod structures;
pub mod testing;
