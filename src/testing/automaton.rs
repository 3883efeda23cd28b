use std::hash::Hash;

/// What the search knows about one thread at some point of the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Between operations
    Idle,
    /// Invoked and not yet given a place in the sequential order
    Called(usize),
    /// Given a place in the sequential order, its return not reached yet
    Linearized(usize),
}

/// A node of the search: how far through the history we are, the state of the
/// sequential model, and each thread's progress.
///
/// Two paths reaching an equal configuration have identical futures, so the search
/// memoises configurations rather than paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Configuration<S: Hash + Eq> {
    pub event: usize,
    pub sequential: S,
    pub states: Vec<ThreadState>,
}

impl<S: Hash + Eq + Clone> Configuration<S> {
    pub fn new(sequential: S, num_threads: usize) -> Self {
        Configuration {
            event: 0,
            sequential,
            states: vec![ThreadState::Idle; num_threads],
        }
    }

    /// The configuration after `thread` moves to `state`, staying at the same event.
    pub fn with_state(&self, thread: usize, state: ThreadState) -> Self {
        let mut next = self.clone();
        next.states[thread] = state;
        next
    }

    /// Threads whose pending operation may take effect now.
    pub fn pending(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(thread, state)| match state {
                ThreadState::Called(op) => Some((thread, *op)),
                _ => None,
            })
    }
}
