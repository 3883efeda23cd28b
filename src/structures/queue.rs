use crate::memory::HPBRManager;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::utils::backoff::Backoff;

const MAX_RETIRED: usize = 100;

/// A lock-free Michael-Scott queue.
///
/// This queue is an implementation of that described in [Simple, Fast, and Practical
/// Non-blocking and Blocking Concurrent Queue Algorithms](https://dl.acm.org/citation.cfm?id=248106).
/// It is implemented as a linked-list of nodes behind a dummy head, with unlinked nodes
/// reclaimed through hazard pointers.
pub struct Queue<T: Send> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    manager: HPBRManager<Node<T>>,
}

struct Node<T> {
    // Uninitialised in the dummy, and moved out once a node becomes the dummy
    value: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T: Send> Queue<T> {
    /// Create a new Queue.
    /// # Examples
    /// ```
    /// use concurrent_primitives::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// ```
    pub fn new() -> Self {
        let dummy_node = Box::into_raw(Box::new(Node::new_dummy_node()));
        Queue {
            head: AtomicPtr::new(dummy_node),
            tail: AtomicPtr::new(dummy_node),
            manager: HPBRManager::new(MAX_RETIRED, 2),
        }
    }

    /// Add a new element to the back of the queue.
    /// # Examples
    /// ```
    /// use concurrent_primitives::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// ```
    pub fn enqueue(&self, val: T) {
        let mut backoff = Backoff::new();
        let node = Box::into_raw(Box::new(Node::new(val)));
        while !self.try_enqueue(node) {
            backoff.spin();
        }
        self.manager.unprotect(0);
    }

    fn try_enqueue(&self, node: *mut Node<T>) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        self.manager.protect(tail, 0);
        // Is the tail still consistent? Required for the hazard pointer to work
        if !ptr::eq(tail, self.tail.load(Ordering::Acquire)) {
            return false;
        }
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };

        // Is the tail actually the end of the queue?
        if !next.is_null() {
            // If it isn't, help make next the end of the queue
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            return false;
        }

        // Linearization point: the node is in the queue once this succeeds
        match unsafe {
            (*tail)
                .next
                .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
        } {
            Ok(_) => {
                // Somebody may have already swung the tail for us
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::Release, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Take an element from the front of the queue, or return None if the queue is empty.
    /// # Examples
    /// ```
    /// use concurrent_primitives::structures::Queue;
    /// let queue: Queue<String> = Queue::new();
    /// queue.enqueue("hello".to_owned());
    /// assert_eq!(queue.dequeue(), Some("hello".to_owned()));
    /// assert_eq!(queue.dequeue(), None);
    /// ```
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            if let Ok(val) = self.try_dequeue() {
                self.manager.unprotect_all();
                return val;
            }
            backoff.spin();
        }
    }

    fn try_dequeue(&self) -> Result<Option<T>, ()> {
        let head = self.protect_head()?;
        let tail = self.tail.load(Ordering::Acquire);

        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        self.manager.protect(next, 1);
        if !ptr::eq(head, self.head.load(Ordering::Acquire)) {
            return Err(());
        }

        if next.is_null() {
            return Ok(None);
        }

        if ptr::eq(head, tail) {
            // The tail is lagging: help it along before the head overtakes it
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            return Err(());
        }

        match self
            .head
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // We won the node, so the value is ours. It stays bitwise in place for
                // concurrent peeks and is never dropped from there
                let data = unsafe { ptr::read((*next).value.as_ptr()) };
                self.manager.retire(head, 0);
                Ok(Some(data))
            }
            Err(_) => Err(()),
        }
    }

    /// Whether the queue held no elements at some point during the call.
    pub fn is_empty(&self) -> bool {
        loop {
            if let Ok(head) = self.protect_head() {
                let empty = unsafe { (*head).next.load(Ordering::Acquire).is_null() };
                self.manager.unprotect(0);
                return empty;
            }
        }
    }

    fn protect_head(&self) -> Result<*mut Node<T>, ()> {
        let head = self.head.load(Ordering::Acquire);
        self.manager.protect(head, 0);
        if !ptr::eq(head, self.head.load(Ordering::Acquire)) {
            return Err(());
        }
        Ok(head)
    }
}

impl<T: Send + Copy + Sync> Queue<T> {
    /// Read the front of the queue without removing it.
    /// # Examples
    /// ```
    /// use concurrent_primitives::structures::Queue;
    /// let queue: Queue<u32> = Queue::new();
    /// assert_eq!(queue.peek(), None);
    /// queue.enqueue(4);
    /// assert_eq!(queue.peek(), Some(4));
    /// assert_eq!(queue.dequeue(), Some(4));
    /// ```
    pub fn peek(&self) -> Option<T> {
        loop {
            let head = match self.protect_head() {
                Ok(head) => head,
                Err(()) => continue,
            };
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                self.manager.unprotect(0);
                return None;
            }
            self.manager.protect(next, 1);
            if !ptr::eq(head, self.head.load(Ordering::Acquire)) {
                continue;
            }
            // Payloads are never written after publication, and T is Copy
            let value = unsafe { ptr::read((*next).value.as_ptr()) };
            self.manager.unprotect_all();
            return Some(value);
        }
    }
}

impl<T: Send> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T: Send> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("manager", &self.manager)
            .finish()
    }
}

impl<T: Send> Drop for Queue<T> {
    fn drop(&mut self) {
        // The dummy holds no value; every node after it still owns one
        let dummy = unsafe { Box::from_raw(*self.head.get_mut()) };
        let mut current = dummy.next.load(Ordering::Relaxed);
        while !current.is_null() {
            unsafe {
                let mut node = Box::from_raw(current);
                node.value.assume_init_drop();
                current = *node.next.get_mut();
            }
        }
    }
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Node {
            value: MaybeUninit::new(value),
            next: AtomicPtr::default(),
        }
    }

    fn new_dummy_node() -> Self {
        Node {
            value: MaybeUninit::uninit(),
            next: AtomicPtr::default(),
        }
    }
}
