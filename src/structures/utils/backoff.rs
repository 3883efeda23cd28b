use rand::Rng;
use std::cmp;
use std::hint;

const MAX_BACKOFF: u32 = 1024;

/// Randomised exponential backoff for CAS retry loops.
///
/// Only ever spins: the lock-free structures must never park a thread.
#[derive(Debug)]
pub struct Backoff {
    limit: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { limit: 1 }
    }

    pub fn spin(&mut self) {
        let spins = rand::thread_rng().gen_range(0..self.limit);
        for _ in 0..spins {
            hint::spin_loop();
        }
        self.limit = cmp::min(self.limit * 2, MAX_BACKOFF);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}
