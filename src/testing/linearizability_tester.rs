use rayon::ThreadPoolBuilder;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::debug;

use super::automaton::{Configuration, ThreadState};
use super::time_stamped::{Clock, Event, TimeStamped};

type SequentialOp<S, R> = Box<dyn Fn(&S) -> (S, R) + Send + Sync>;

/// The verdict on a recorded history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinearizabilityResult {
    Success,
    /// No sequential order explains the history. The message names the operation the
    /// search could not get past.
    Failure(String),
    /// The search gave up after visiting the configured number of configurations.
    Timeout,
}

/// Runs a worker on every thread of a pool against one concurrent object, then searches
/// for a sequential order of the recorded operations that respects real-time order and
/// that the sequential model agrees with.
pub struct LinearizabilityTester<C, S, R> {
    num_threads: usize,
    max_configs: usize,
    concurrent: C,
    sequential: S,
    ops: Vec<LoggedOp<S, R>>,
}

/// One completed operation.
struct LoggedOp<S, R> {
    thread: usize,
    message: String,
    invoked: u64,
    returned: u64,
    sequential: SequentialOp<S, R>,
    result: R,
}

/// Records the operations of a single worker thread.
pub struct ThreadLog<'a, C, S, R> {
    id: usize,
    concurrent: &'a C,
    clock: &'a Clock,
    ops: Vec<LoggedOp<S, R>>,
}

impl<'a, C, S: 'static, R: 'static> ThreadLog<'a, C, S, R> {
    fn new(id: usize, concurrent: &'a C, clock: &'a Clock) -> Self {
        ThreadLog {
            id,
            concurrent,
            clock,
            ops: Vec::new(),
        }
    }

    /// Run `op` on the concurrent object and record it against its sequential counterpart.
    pub fn log<F>(&mut self, message: String, op: F, sequential: fn(&S) -> (S, R))
    where
        F: FnOnce(&C) -> R,
    {
        let invoked = self.clock.tick();
        let result = op(self.concurrent);
        let returned = self.clock.tick();
        self.ops.push(LoggedOp {
            thread: self.id,
            message,
            invoked,
            returned,
            sequential: Box::new(sequential),
            result,
        });
    }

    /// As [`log`](ThreadLog::log), for operations taking an argument.
    pub fn log_val<F, V>(&mut self, message: String, op: F, val: V, sequential: fn(&S, V) -> (S, R))
    where
        F: FnOnce(&C, V) -> R,
        V: Clone + Send + Sync + 'static,
    {
        let replay = val.clone();
        let invoked = self.clock.tick();
        let result = op(self.concurrent, val);
        let returned = self.clock.tick();
        self.ops.push(LoggedOp {
            thread: self.id,
            message,
            invoked,
            returned,
            sequential: Box::new(move |state: &S| sequential(state, replay.clone())),
            result,
        });
    }
}

impl<C, S, R> LinearizabilityTester<C, S, R>
where
    C: Sync,
    S: Clone + Eq + Hash + Send + 'static,
    R: Eq + Debug + Send + 'static,
{
    pub fn new(num_threads: usize, max_configs: usize, concurrent: C, sequential: S) -> Self {
        LinearizabilityTester {
            num_threads,
            max_configs,
            concurrent,
            sequential,
            ops: Vec::new(),
        }
    }

    /// Run `worker` once on each of the threads, then check the combined history.
    pub fn run(&mut self, worker: fn(usize, &mut ThreadLog<C, S, R>)) -> LinearizabilityResult {
        let pool = match ThreadPoolBuilder::new().num_threads(self.num_threads).build() {
            Ok(pool) => pool,
            Err(e) => return LinearizabilityResult::Failure(format!("no worker pool: {}", e)),
        };

        let concurrent = &self.concurrent;
        let clock = Clock::new();
        let logs = pool.broadcast(|context| {
            let mut log = ThreadLog::new(context.index(), concurrent, &clock);
            worker(context.index(), &mut log);
            log.ops
        });
        self.ops = logs.into_iter().flatten().collect();

        let result = self.check();
        debug!(operations = self.ops.len(), result = ?result, "linearizability check finished");
        result
    }

    fn history(&self) -> Vec<TimeStamped> {
        let mut events: Vec<TimeStamped> = self
            .ops
            .iter()
            .enumerate()
            .flat_map(|(index, op)| {
                vec![
                    TimeStamped::invoke(op.invoked, index),
                    TimeStamped::ret(op.returned, index),
                ]
            })
            .collect();
        events.sort();
        events
    }

    /// Depth-first search that linearizes an operation only when it must: at its own
    /// return, optionally preceded by any of the other pending operations.
    fn check(&self) -> LinearizabilityResult {
        let history = self.history();
        let mut seen: HashSet<Configuration<S>> = HashSet::new();
        let mut stack = vec![Configuration::new(self.sequential.clone(), self.num_threads)];
        let mut furthest = 0;

        while let Some(config) = stack.pop() {
            if config.event == history.len() {
                return LinearizabilityResult::Success;
            }
            if !seen.insert(config.clone()) {
                continue;
            }
            if seen.len() > self.max_configs {
                return LinearizabilityResult::Timeout;
            }
            furthest = furthest.max(config.event);

            match history[config.event].event {
                Event::Invoke(op) => {
                    let mut next = config.with_state(self.ops[op].thread, ThreadState::Called(op));
                    next.event += 1;
                    stack.push(next);
                }
                Event::Return(op) => {
                    let thread = self.ops[op].thread;
                    if config.states[thread] == ThreadState::Linearized(op) {
                        let mut next = config.with_state(thread, ThreadState::Idle);
                        next.event += 1;
                        stack.push(next);
                        continue;
                    }
                    for (pending_thread, pending_op) in config.pending() {
                        let logged = &self.ops[pending_op];
                        let (sequential, result) = (logged.sequential)(&config.sequential);
                        if result == logged.result {
                            let mut next =
                                config.with_state(pending_thread, ThreadState::Linearized(pending_op));
                            next.sequential = sequential;
                            stack.push(next);
                        }
                    }
                }
            }
        }

        let stuck = match history.get(furthest).map(|e| e.event) {
            Some(Event::Return(op)) | Some(Event::Invoke(op)) => &self.ops[op],
            None => return LinearizabilityResult::Failure("empty search".to_owned()),
        };
        LinearizabilityResult::Failure(format!(
            "thread {} could not linearize \"{}\" returning {:?}",
            stuck.thread, stuck.message, stuck.result
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{LinearizabilityResult, LinearizabilityTester, ThreadLog};
    use im::Vector;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn sequential_enqueue(queue: &Vector<usize>, val: usize) -> (Vector<usize>, Option<usize>) {
        let mut next = queue.clone();
        next.push_back(val);
        (next, None)
    }

    fn sequential_dequeue(queue: &Vector<usize>) -> (Vector<usize>, Option<usize>) {
        let mut next = queue.clone();
        let res = next.pop_front();
        (next, res)
    }

    #[test]
    fn test_locked_queue_passes() {
        let queue: Mutex<VecDeque<usize>> = Mutex::new(VecDeque::new());
        let mut linearizer: LinearizabilityTester<Mutex<VecDeque<usize>>, Vector<usize>, Option<usize>> =
            LinearizabilityTester::new(4, 1_000_000, queue, Vector::new());

        fn worker(id: usize, log: &mut ThreadLog<Mutex<VecDeque<usize>>, Vector<usize>, Option<usize>>) {
            for i in 0..50 {
                if i % 2 == 0 {
                    let val = id * 1000 + i;
                    log.log_val(
                        format!("enqueue: {}", val),
                        |q: &Mutex<VecDeque<usize>>, v| {
                            q.lock().push_back(v);
                            None
                        },
                        val,
                        sequential_enqueue,
                    );
                } else {
                    log.log("dequeue".to_owned(), |q: &Mutex<VecDeque<usize>>| q.lock().pop_front(), sequential_dequeue);
                }
            }
        }

        assert_eq!(linearizer.run(worker), LinearizabilityResult::Success);
    }

    #[test]
    fn test_lifo_impostor_fails() {
        // A stack posing as a queue is caught even by a single thread
        let stack: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        let mut linearizer: LinearizabilityTester<Mutex<Vec<usize>>, Vector<usize>, Option<usize>> =
            LinearizabilityTester::new(1, 1_000_000, stack, Vector::new());

        fn worker(_id: usize, log: &mut ThreadLog<Mutex<Vec<usize>>, Vector<usize>, Option<usize>>) {
            for val in 1..3 {
                log.log_val(
                    format!("enqueue: {}", val),
                    |s: &Mutex<Vec<usize>>, v| {
                        s.lock().push(v);
                        None
                    },
                    val,
                    sequential_enqueue,
                );
            }
            log.log("dequeue".to_owned(), |s: &Mutex<Vec<usize>>| s.lock().pop(), sequential_dequeue);
        }

        match linearizer.run(worker) {
            LinearizabilityResult::Failure(message) => assert!(message.contains("dequeue")),
            other => panic!("expected a failure, got {:?}", other),
        }
    }

    #[test]
    fn test_search_budget() {
        let queue: Mutex<VecDeque<usize>> = Mutex::new(VecDeque::new());
        let mut linearizer: LinearizabilityTester<Mutex<VecDeque<usize>>, Vector<usize>, Option<usize>> =
            LinearizabilityTester::new(2, 0, queue, Vector::new());

        fn worker(_id: usize, log: &mut ThreadLog<Mutex<VecDeque<usize>>, Vector<usize>, Option<usize>>) {
            log.log("dequeue".to_owned(), |q: &Mutex<VecDeque<usize>>| q.lock().pop_front(), sequential_dequeue);
        }

        assert_eq!(linearizer.run(worker), LinearizabilityResult::Timeout);
    }
}
