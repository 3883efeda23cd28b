//! The concurrent collections.
//!
//! Everything except [`Bank`] is lock-free and reclaims its nodes through
//! [`HPBRManager`](crate::memory::HPBRManager).

pub use self::bank::Bank;
pub use self::faa_queue::FaaQueue;
pub use self::queue::Queue;
pub use self::sorted_set::SortedSet;
pub use self::stack::Stack;

mod bank;
mod faa_queue;
mod queue;
mod sorted_set;
mod stack;
mod utils;
