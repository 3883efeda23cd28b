use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicU64};

/// A logical clock shared by every thread of a test run.
///
/// Tickets are handed out by a sequentially consistent counter, so an operation that
/// returned before another was invoked always holds the smaller ticket, and no two
/// events ever share one.
#[derive(Debug, Default)]
pub struct Clock {
    next: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Clock::default()
    }

    pub fn tick(&self) -> u64 {
        self.next.fetch_add(1, atomic::Ordering::SeqCst)
    }
}

/// An event in a recorded history, tagged with when it happened.
#[derive(Debug, Clone, Copy)]
pub struct TimeStamped {
    pub stamp: u64,
    pub event: Event,
}

/// The operation index is a position in the tester's operation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Invoke(usize),
    Return(usize),
}

impl TimeStamped {
    pub fn invoke(stamp: u64, op: usize) -> Self {
        TimeStamped {
            stamp,
            event: Event::Invoke(op),
        }
    }

    pub fn ret(stamp: u64, op: usize) -> Self {
        TimeStamped {
            stamp,
            event: Event::Return(op),
        }
    }
}

impl Ord for TimeStamped {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stamp.cmp(&other.stamp)
    }
}

impl PartialOrd for TimeStamped {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimeStamped {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp
    }
}

impl Eq for TimeStamped {}
