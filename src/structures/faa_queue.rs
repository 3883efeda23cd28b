use crate::config::FaaQueueConfig;
use crate::error::ConfigError;
use crate::memory::HPBRManager;
use std::cmp;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use tracing::debug;

use super::utils::backoff::Backoff;
use super::utils::sentinel;

const MAX_RETIRED: usize = 64;

/// A lock-free FIFO queue made of fixed-size segments.
///
/// Enqueuers and dequeuers reserve slots with a fetch-and-add on the segment's
/// counters instead of all competing for one CAS target, so contention is mostly
/// confined to the moment a segment fills up and a new one is linked. A slot goes
/// through `EMPTY -> value -> CONSUMED` at most once and is never reused.
pub struct FaaQueue<T: Send> {
    head: AtomicPtr<Segment<T>>,
    tail: AtomicPtr<Segment<T>>,
    manager: HPBRManager<Segment<T>>,
    capacity: usize,
}

struct Segment<T> {
    // null is EMPTY, `sentinel()` is CONSUMED, anything else a boxed payload
    slots: Box<[AtomicPtr<T>]>,
    enq_idx: AtomicUsize,
    deq_idx: AtomicUsize,
    next: AtomicPtr<Segment<T>>,
}

impl<T: Send> FaaQueue<T> {
    /// Create a queue whose segments hold `segment_capacity` elements each.
    /// # Examples
    /// ```
    /// use std::num::NonZeroUsize;
    /// use concurrent_primitives::structures::FaaQueue;
    /// let queue: FaaQueue<u32> = FaaQueue::new(NonZeroUsize::new(32).unwrap());
    /// queue.enqueue(1);
    /// assert_eq!(queue.dequeue(), Some(1));
    /// ```
    pub fn new(segment_capacity: NonZeroUsize) -> Self {
        let capacity = segment_capacity.get();
        let init_segment = Box::into_raw(Box::new(Segment::new(capacity)));
        FaaQueue {
            head: AtomicPtr::new(init_segment),
            tail: AtomicPtr::new(init_segment),
            manager: HPBRManager::new(MAX_RETIRED, 1),
            capacity,
        }
    }

    pub fn with_config(config: FaaQueueConfig) -> Result<Self, ConfigError> {
        let capacity = config.validate()?;
        debug!(segment_capacity = capacity.get(), "creating FAA queue");
        Ok(FaaQueue::new(capacity))
    }

    pub fn segment_capacity(&self) -> usize {
        self.capacity
    }

    pub fn enqueue(&self, data: T) {
        let item = Box::into_raw(Box::new(data));
        let mut backoff = Backoff::new();
        loop {
            let tail = match self.protect(&self.tail) {
                Some(tail) => tail,
                None => continue,
            };
            let idx = unsafe { (*tail).enq_idx.fetch_add(1, Ordering::AcqRel) };

            if idx < self.capacity {
                let slot = unsafe { &(*tail).slots[idx] };
                if slot
                    .compare_exchange(ptr::null_mut(), item, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                // A dequeuer outran us and burnt the slot, reserve another one
            } else if self.try_append(tail, item) {
                break;
            }
            backoff.spin();
        }
        self.manager.unprotect(0);
    }

    /// Link a fresh segment pre-seeded with `item` after `tail`, or help a stale tail along.
    fn try_append(&self, tail: *mut Segment<T>, item: *mut T) -> bool {
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if !next.is_null() {
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            return false;
        }

        let segment = Box::into_raw(Box::new(Segment::seeded(self.capacity, item)));
        match unsafe {
            (*tail)
                .next
                .compare_exchange(ptr::null_mut(), segment, Ordering::AcqRel, Ordering::Acquire)
        } {
            Ok(_) => {
                let _ = self
                    .tail
                    .compare_exchange(tail, segment, Ordering::Release, Ordering::Relaxed);
                true
            }
            Err(next) => {
                unsafe {
                    // The item is still ours, keep it out of the segment's drop
                    (*segment).slots[0].store(ptr::null_mut(), Ordering::Relaxed);
                    drop(Box::from_raw(segment));
                }
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dequeue(&self) -> Option<T> {
        let result = loop {
            let head = match self.protect(&self.head) {
                Some(head) => head,
                None => continue,
            };
            let segment = unsafe { &*head };

            if segment.is_empty(self.capacity) {
                match self.advance_head(head) {
                    Some(()) => continue,
                    None => break None,
                }
            }

            let idx = segment.deq_idx.fetch_add(1, Ordering::AcqRel);
            if idx >= self.capacity {
                continue;
            }
            let item = segment.slots[idx].swap(sentinel(), Ordering::AcqRel);
            if item.is_null() {
                // The writer that reserved this slot has not stored yet, it will retry
                continue;
            }
            break Some(unsafe { *Box::from_raw(item) });
        };
        self.manager.unprotect(0);
        result
    }

    /// Whether the queue held no elements at some point during the call.
    pub fn is_empty(&self) -> bool {
        let empty = loop {
            let head = match self.protect(&self.head) {
                Some(head) => head,
                None => continue,
            };
            if !unsafe { (*head).is_empty(self.capacity) } {
                break false;
            }
            if self.advance_head(head).is_none() {
                break true;
            }
        };
        self.manager.unprotect(0);
        empty
    }

    /// Move past an exhausted, protected head segment. Returns `None` when it is the last one.
    fn advance_head(&self, head: *mut Segment<T>) -> Option<()> {
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // A successor exists, so the enqueue index has passed the capacity and the
        // emptiness check can no longer be fooled by a slow reader
        if !unsafe { (*head).is_empty(self.capacity) } {
            return Some(());
        }

        let tail = self.tail.load(Ordering::Acquire);
        if ptr::eq(tail, head) {
            // The tail must never be left on a retired segment
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
        }
        if self
            .head
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.manager.retire(head, 0);
        }
        Some(())
    }

    fn protect(&self, source: &AtomicPtr<Segment<T>>) -> Option<*mut Segment<T>> {
        let segment = source.load(Ordering::Acquire);
        self.manager.protect(segment, 0);
        if ptr::eq(segment, source.load(Ordering::Acquire)) {
            Some(segment)
        } else {
            None
        }
    }
}

impl<T: Send> fmt::Debug for FaaQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FaaQueue")
            .field("capacity", &self.capacity)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

impl<T: Send> Drop for FaaQueue<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let mut segment = unsafe { Box::from_raw(current) };
            current = *segment.next.get_mut();
        }
    }
}

impl<T> Segment<T> {
    fn new(capacity: usize) -> Self {
        Segment {
            slots: (0..capacity).map(|_| AtomicPtr::default()).collect(),
            enq_idx: AtomicUsize::new(0),
            deq_idx: AtomicUsize::new(0),
            next: AtomicPtr::default(),
        }
    }

    fn seeded(capacity: usize, item: *mut T) -> Self {
        let segment = Segment::new(capacity);
        segment.slots[0].store(item, Ordering::Relaxed);
        segment.enq_idx.store(1, Ordering::Relaxed);
        segment
    }

    fn is_empty(&self, capacity: usize) -> bool {
        let deq = self.deq_idx.load(Ordering::Acquire);
        let enq = self.enq_idx.load(Ordering::Acquire);
        deq >= cmp::min(enq, capacity)
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            let item = *slot.get_mut();
            if !item.is_null() && item != sentinel() {
                unsafe { drop(Box::from_raw(item)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FaaQueue;
    use crate::config::FaaQueueConfig;
    use crate::error::ConfigError;
    use crate::testing::{LinearizabilityResult, LinearizabilityTester, ThreadLog};
    use im::Vector;
    use rand::{thread_rng, Rng};
    use std::collections::HashSet;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn queue<T: Send>(k: usize) -> FaaQueue<T> {
        FaaQueue::new(NonZeroUsize::new(k).unwrap())
    }

    #[test]
    fn test_enqueue_across_segments() {
        let queue: FaaQueue<u8> = queue(4);

        for i in 3..8 {
            queue.enqueue(i);
        }
        for i in 3..8 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());

        queue.enqueue(9);
        assert!(!queue.is_empty());
        assert_eq!(queue.dequeue(), Some(9));
    }

    #[test]
    fn test_capacity_one() {
        let queue: FaaQueue<String> = queue(1);
        for i in 0..50 {
            queue.enqueue(i.to_string());
        }
        for i in 0..50 {
            assert_eq!(queue.dequeue(), Some(i.to_string()));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_interleaved_fifo() {
        let queue: FaaQueue<u32> = queue(3);
        let mut expected = std::collections::VecDeque::new();
        for round in 0..200u32 {
            queue.enqueue(round);
            expected.push_back(round);
            if round % 3 == 0 {
                assert_eq!(queue.dequeue(), expected.pop_front());
            }
        }
        while let Some(val) = expected.pop_front() {
            assert_eq!(queue.dequeue(), Some(val));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_with_config() {
        let queue: FaaQueue<u8> = FaaQueue::with_config(FaaQueueConfig { segment_capacity: 8 }).unwrap();
        assert_eq!(queue.segment_capacity(), 8);
        let err = FaaQueue::<u8>::with_config(FaaQueueConfig { segment_capacity: 0 }).unwrap_err();
        assert_eq!(err, ConfigError::InvalidSegmentCapacity);
    }

    #[test]
    fn test_drop_releases_remaining_values() {
        #[derive(Debug)]
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = queue(2);
            for _ in 0..9 {
                queue.enqueue(Counted(drops.clone()));
            }
            for _ in 0..5 {
                drop(queue.dequeue());
            }
            assert_eq!(drops.load(Ordering::SeqCst), 5);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_with_contention() {
        let queue: Arc<FaaQueue<u16>> = Arc::new(queue(20));
        let mut waitvec: Vec<thread::JoinHandle<()>> = Vec::new();

        for _ in 0..8 {
            let queue_copy = queue.clone();
            waitvec.push(thread::spawn(move || {
                for i in 0..10000 {
                    queue_copy.enqueue(i);
                }
            }));
            let queue_copy = queue.clone();
            waitvec.push(thread::spawn(move || {
                for _ in 0..10000 {
                    while queue_copy.dequeue().is_none() {}
                }
            }));
        }

        for handle in waitvec {
            handle.join().unwrap();
        }
        assert_eq!(None, queue.dequeue());
    }

    #[test]
    fn test_every_value_dequeued_once() {
        let producers = 4;
        let per_producer = 4000;
        let queue: Arc<FaaQueue<usize>> = Arc::new(queue(2));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let consumed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for id in 0..producers {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    queue.enqueue(id * per_producer + i);
                }
            }));
        }
        for _ in 0..producers {
            let queue = queue.clone();
            let seen = seen.clone();
            let consumed = consumed.clone();
            handles.push(thread::spawn(move || {
                let mut local = Vec::new();
                while consumed.load(Ordering::SeqCst) < producers * per_producer {
                    if let Some(val) = queue.dequeue() {
                        consumed.fetch_add(1, Ordering::SeqCst);
                        local.push(val);
                    }
                }
                let mut seen = seen.lock().unwrap();
                for val in local {
                    assert!(seen.insert(val), "{} dequeued twice", val);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), producers * per_producer);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_linearizable() {
        let queue: FaaQueue<usize> = queue(2);
        let sequential: Vector<usize> = Vector::new();
        let mut linearizer: LinearizabilityTester<FaaQueue<usize>, Vector<usize>, Option<usize>> =
            LinearizabilityTester::new(4, 1_000_000, queue, sequential);

        fn sequential_dequeue(queue: &Vector<usize>) -> (Vector<usize>, Option<usize>) {
            let mut next = queue.clone();
            let res = next.pop_front();
            (next, res)
        }

        fn sequential_enqueue(queue: &Vector<usize>, val: usize) -> (Vector<usize>, Option<usize>) {
            let mut next = queue.clone();
            next.push_back(val);
            (next, None)
        }

        fn worker(_id: usize, log: &mut ThreadLog<FaaQueue<usize>, Vector<usize>, Option<usize>>) {
            for _ in 0..60 {
                if thread_rng().gen_range(0..100) < 50 {
                    let val = thread_rng().gen_range(0..1000);
                    log.log_val(
                        format!("enqueue: {}", val),
                        |q: &FaaQueue<usize>, v| {
                            q.enqueue(v);
                            None
                        },
                        val,
                        sequential_enqueue,
                    );
                } else {
                    log.log("dequeue".to_owned(), FaaQueue::dequeue, sequential_dequeue);
                }
            }
        }

        match linearizer.run(worker) {
            LinearizabilityResult::Success => {}
            other => panic!("faa queue history not linearizable: {:?}", other),
        }
    }
}
