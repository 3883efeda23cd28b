//! Utilities for testing linearizability of concurrent data structures, following the
//! just-in-time linearization search described by Lowe in
//! [Testing for Linearizability](http://www.cs.ox.ac.uk/people/gavin.lowe/LinearizabiltyTesting/paper.pdf).
//!
//! Each worker thread records its operations in a `ThreadLog`, pairing every call on the
//! concurrent object with the matching operation on a sequential model. The tester then
//! searches for an order of the recorded operations that respects real time and that the
//! sequential model reproduces result for result.
//!
//! # Example
//! Checking the stack against a persistent vector:
//! ```
//! use concurrent_primitives::structures::Stack;
//! use concurrent_primitives::testing::{LinearizabilityResult, LinearizabilityTester, ThreadLog};
//! use im::Vector;
//! use rand::{thread_rng, Rng};
//!
//! fn sequential_pop(stack: &Vector<usize>) -> (Vector<usize>, Option<usize>) {
//!     let mut next = stack.clone();
//!     let res = next.pop_back();
//!     (next, res)
//! }
//!
//! fn sequential_push(stack: &Vector<usize>, val: usize) -> (Vector<usize>, Option<usize>) {
//!     let mut next = stack.clone();
//!     next.push_back(val);
//!     (next, None)
//! }
//!
//! fn worker(_id: usize, log: &mut ThreadLog<Stack<usize>, Vector<usize>, Option<usize>>) {
//!     for _ in 0..50 {
//!         if thread_rng().gen_range(0..100) < 50 {
//!             let val = thread_rng().gen_range(0..1000);
//!             let push = |s: &Stack<usize>, v| {
//!                 s.push(v);
//!                 None
//!             };
//!             log.log_val(format!("push: {}", val), push, val, sequential_push);
//!         } else {
//!             log.log("pop".to_owned(), Stack::pop, sequential_pop);
//!         }
//!     }
//! }
//!
//! let stack: Stack<usize> = Stack::new();
//! let mut linearizer: LinearizabilityTester<Stack<usize>, Vector<usize>, Option<usize>> =
//!     LinearizabilityTester::new(4, 1_000_000, stack, Vector::new());
//!
//! assert_eq!(linearizer.run(worker), LinearizabilityResult::Success);
//! ```

pub use self::linearizability_tester::{LinearizabilityResult, LinearizabilityTester, ThreadLog};

mod automaton;
mod linearizability_tester;
mod time_stamped;
