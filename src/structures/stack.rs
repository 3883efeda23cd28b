use crate::config::EliminationConfig;
use crate::memory::HPBRManager;
use rand::Rng;
use std::fmt;
use std::hint;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use tracing::debug;

use super::utils::backoff::Backoff;
use super::utils::sentinel;

const MAX_RETIRED: usize = 100;

/// A lock-free Treiber stack with an elimination layer.
///
/// Before touching the list, a push offers its value in a randomly chosen cell of a
/// small elimination array and a pop looks for such an offer. A matched pair behaves
/// exactly like a push immediately followed by a pop, without ever contending on the head.
pub struct Stack<T: Send> {
    head: AtomicPtr<Node<T>>,
    elimination: EliminationLayer<T>,
    manager: HPBRManager<Node<T>>,
}

struct Node<T> {
    // Moved out by the popper that unlinks the node
    data: ManuallyDrop<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T: Send> Stack<T> {
    pub fn new() -> Stack<T> {
        Stack::with_config(EliminationConfig::default())
    }

    /// A plain Treiber stack: every operation goes to the list.
    pub fn without_elimination() -> Stack<T> {
        Stack::with_config(EliminationConfig::disabled())
    }

    pub fn with_config(config: EliminationConfig) -> Stack<T> {
        debug!(?config, "creating stack");
        Stack {
            head: AtomicPtr::default(),
            elimination: EliminationLayer::new(config),
            manager: HPBRManager::new(MAX_RETIRED, 1),
        }
    }

    /// # Examples
    /// ```
    /// use concurrent_primitives::structures::Stack;
    /// let stack: Stack<u8> = Stack::new();
    /// stack.push(1);
    /// stack.push(2);
    /// assert_eq!(stack.pop(), Some(2));
    /// ```
    pub fn push(&self, val: T) {
        let val = match self.elimination.try_push(val) {
            Ok(()) => return,
            Err(val) => val,
        };

        let node = Box::into_raw(Box::new(Node::new(val)));
        let mut backoff = Backoff::new();
        while !self.try_push(node) {
            backoff.spin();
        }
    }

    fn try_push(&self, node: *mut Node<T>) -> bool {
        let old_head = self.head.load(Ordering::Acquire);
        unsafe {
            (*node).next.store(old_head, Ordering::Relaxed);
        }
        self.head
            .compare_exchange_weak(old_head, node, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn pop(&self) -> Option<T> {
        if let Some(val) = self.elimination.try_pop() {
            return Some(val);
        }

        let mut backoff = Backoff::new();
        loop {
            if let Ok(val) = self.try_pop() {
                self.manager.unprotect(0);
                return val;
            }
            backoff.spin();
        }
    }

    fn try_pop(&self) -> Result<Option<T>, ()> {
        let old_head = self.head.load(Ordering::Acquire);
        if old_head.is_null() {
            return Ok(None);
        }
        // If the head is freed under us, reading its next is a use after free
        self.manager.protect(old_head, 0);
        if !ptr::eq(old_head, self.head.load(Ordering::Acquire)) {
            return Err(());
        }

        unsafe {
            let new_head = (*old_head).next.load(Ordering::Acquire);
            // Protected nodes are never recycled, so an equal pointer is the same node (no ABA)
            match self.head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let data = ptr::read(&*(*old_head).data);
                    self.manager.retire(old_head, 0);
                    Ok(Some(data))
                }
                Err(_) => Err(()),
            }
        }
    }

    /// Whether the list was empty at some point during the call. Values parked in the
    /// elimination array belong to pushes that have not completed yet and do not count.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T: Send> Default for Stack<T> {
    fn default() -> Self {
        Stack::new()
    }
}

impl<T: Send> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stack")
            .field("head", &self.head)
            .field("elimination", &self.elimination)
            .field("manager", &self.manager)
            .finish()
    }
}

impl<T: Send> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            unsafe {
                let mut node = Box::from_raw(current);
                ManuallyDrop::drop(&mut node.data);
                current = *node.next.get_mut();
            }
        }
    }
}

impl<T> Node<T> {
    fn new(val: T) -> Self {
        Node {
            data: ManuallyDrop::new(val),
            next: AtomicPtr::default(),
        }
    }
}

/// The elimination array. Each cell is null when free, holds a boxed value offered by a
/// waiting pusher, or `sentinel()` once a popper has taken that value.
struct EliminationLayer<T> {
    collisions: Box<[AtomicPtr<T>]>,
    probes: usize,
    spin_wait: usize,
}

impl<T: Send> EliminationLayer<T> {
    fn new(config: EliminationConfig) -> Self {
        let size = if config.is_enabled() { config.array_size } else { 0 };
        EliminationLayer {
            collisions: (0..size).map(|_| AtomicPtr::default()).collect(),
            probes: config.probes,
            spin_wait: config.spin_wait,
        }
    }

    fn choose_position(&self) -> usize {
        rand::thread_rng().gen_range(0..self.collisions.len())
    }

    /// Offer `val` to a concurrent popper. Hands the value back if nobody took it.
    fn try_push(&self, val: T) -> Result<(), T> {
        if self.collisions.is_empty() {
            return Err(val);
        }
        let item = Box::into_raw(Box::new(val));
        let size = self.collisions.len();
        let mut position = self.choose_position();

        for _ in 0..self.probes {
            position = (position + 1) % size;
            let cell = &self.collisions[position];
            if cell
                .compare_exchange(ptr::null_mut(), item, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            for _ in 0..self.spin_wait {
                if self.try_complete(cell) {
                    return Ok(());
                }
                hint::spin_loop();
            }

            // Take the offer back, unless a popper got it in the meantime
            return match cell.compare_exchange(
                item,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => Err(unsafe { *Box::from_raw(item) }),
                Err(_) => {
                    let completed = self.try_complete(cell);
                    debug_assert!(completed);
                    Ok(())
                }
            };
        }

        Err(unsafe { *Box::from_raw(item) })
    }

    /// The pusher owning `cell` frees it once a popper has marked it done.
    fn try_complete(&self, cell: &AtomicPtr<T>) -> bool {
        let done = sentinel();
        cell.load(Ordering::Acquire) == done
            && cell
                .compare_exchange(done, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn try_pop(&self) -> Option<T> {
        if self.collisions.is_empty() {
            return None;
        }
        let size = self.collisions.len();
        let done = sentinel();
        let mut position = self.choose_position();

        for _ in 0..self.probes {
            position = (position + 1) % size;
            let cell = &self.collisions[position];
            let item = cell.load(Ordering::Acquire);
            if !item.is_null() && item != done {
                // The CAS transfers ownership of the box, we never read it before winning
                return match cell.compare_exchange(item, done, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => Some(unsafe { *Box::from_raw(item) }),
                    Err(_) => None,
                };
            }
        }
        None
    }
}

impl<T> fmt::Debug for EliminationLayer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EliminationLayer")
            .field("size", &self.collisions.len())
            .field("probes", &self.probes)
            .field("spin_wait", &self.spin_wait)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{EliminationLayer, Stack};
    use crate::config::EliminationConfig;
    use crate::testing::{LinearizabilityResult, LinearizabilityTester, ThreadLog};
    use im::Vector;
    use rand::{thread_rng, Rng};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Foo {
        data: u8,
    }

    #[test]
    fn test_pop_single_threaded() {
        let stack: Stack<Foo> = Stack::new();

        stack.push(Foo { data: 1 });
        stack.push(Foo { data: 2 });
        stack.push(Foo { data: 4 });

        assert_eq!(stack.pop(), Some(Foo { data: 4 }));
        assert_eq!(stack.pop(), Some(Foo { data: 2 }));
        assert_eq!(stack.pop(), Some(Foo { data: 1 }));
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_push_single_threaded() {
        let stack: Stack<u8> = Stack::without_elimination();

        stack.push(4u8);
        stack.push(3);
        stack.push(1);
        unsafe {
            let head = stack.head.load(Ordering::Relaxed);
            assert_eq!(*(*head).data, 1);
            let next = (*head).next.load(Ordering::Relaxed);
            assert_eq!(*(*next).data, 3);
        }
    }

    #[test]
    fn test_lifo_without_elimination() {
        let stack: Stack<u32> = Stack::without_elimination();
        for i in 0..1000 {
            stack.push(i);
        }
        for i in (500..1000).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        stack.push(7);
        assert_eq!(stack.pop(), Some(7));
        for i in (0..500).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_elimination_handoff() {
        let layer: EliminationLayer<u32> = EliminationLayer::new(EliminationConfig {
            array_size: 1,
            probes: 1,
            spin_wait: 0,
        });
        // Nobody is popping, so the offer comes back
        assert_eq!(layer.try_push(5), Err(5));
        assert_eq!(layer.try_pop(), None);

        // A value parked in the cell is taken by the popper and the cell is marked done
        let item = Box::into_raw(Box::new(9u32));
        layer.collisions[0].store(item, Ordering::Release);
        assert_eq!(layer.try_pop(), Some(9));
        assert!(layer.try_complete(&layer.collisions[0]));
        assert!(layer.collisions[0].load(Ordering::Acquire).is_null());
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
            let stack = Stack::new();
            for _ in 0..6 {
                stack.push(Counted(drops.clone()));
            }
            drop(stack.pop());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_elimination_no_lost_values() {
        let stack: Arc<Stack<usize>> = Arc::new(Stack::with_config(EliminationConfig {
            array_size: 2,
            probes: 2,
            spin_wait: 100,
        }));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let threads = 8;
        let per_thread = 10000;
        let mut waitvec: Vec<thread::JoinHandle<()>> = Vec::new();

        for id in 0..threads {
            let stack_copy = stack.clone();
            waitvec.push(thread::spawn(move || {
                for i in 0..per_thread {
                    stack_copy.push(id * per_thread + i);
                }
            }));
        }
        for _ in 0..threads {
            let stack_copy = stack.clone();
            let seen = seen.clone();
            waitvec.push(thread::spawn(move || {
                let mut local = Vec::with_capacity(per_thread);
                for _ in 0..per_thread {
                    loop {
                        if let Some(val) = stack_copy.pop() {
                            local.push(val);
                            break;
                        }
                    }
                }
                let mut seen = seen.lock().unwrap();
                for val in local {
                    assert!(seen.insert(val), "{} popped twice", val);
                }
            }));
        }
        for handle in waitvec {
            handle.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), threads * per_thread);
        assert_eq!(None, stack.pop());
    }

    #[test]
    fn test_linearizable() {
        let stack: Stack<usize> = Stack::with_config(EliminationConfig {
            array_size: 2,
            probes: 2,
            spin_wait: 50,
        });
        let sequential: Vector<usize> = Vector::new();
        let mut linearizer: LinearizabilityTester<Stack<usize>, Vector<usize>, Option<usize>> =
            LinearizabilityTester::new(4, 1_000_000, stack, sequential);

        fn sequential_pop(stack: &Vector<usize>) -> (Vector<usize>, Option<usize>) {
            let mut next = stack.clone();
            let res = next.pop_back();
            (next, res)
        }

        fn sequential_push(stack: &Vector<usize>, val: usize) -> (Vector<usize>, Option<usize>) {
            let mut next = stack.clone();
            next.push_back(val);
            (next, None)
        }

        fn worker(_id: usize, log: &mut ThreadLog<Stack<usize>, Vector<usize>, Option<usize>>) {
            for _ in 0..60 {
                if thread_rng().gen_range(0..100) < 50 {
                    let val = thread_rng().gen_range(0..122222);
                    log.log_val(
                        format!("push: {}", val),
                        |s: &Stack<usize>, v| {
                            s.push(v);
                            None
                        },
                        val,
                        sequential_push,
                    );
                } else {
                    log.log("pop".to_owned(), Stack::pop, sequential_pop);
                }
            }
        }

        match linearizer.run(worker) {
            LinearizabilityResult::Success => {}
            other => panic!("stack history not linearizable: {:?}", other),
        }
    }
}
