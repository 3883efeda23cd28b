use crate::memory::HPBRManager;
use std::cmp::Ordering;
use std::fmt;
use std::ptr;

use super::utils::atomic_markable::{AtomicMarkablePtr, Link};

const MAX_RETIRED: usize = 100;

// Hazard slots of a traversal: the two ends of the window
const PREV: usize = 0;
const CURR: usize = 1;

/// A lock-free ordered set backed by a sorted linked list (Harris and Michael).
///
/// Removal first marks the victim's own link as `Removed` (the logical deletion, which is
/// the linearization point) and then unlinks it from its predecessor. Any traversal that
/// runs into a removed node unlinks it itself before going on, so deletions always
/// complete even if the remover stalls.
pub struct SortedSet<K: Ord + Send + Sync> {
    head: *mut Node<K>,
    manager: HPBRManager<Node<K>>,
}

unsafe impl<K: Ord + Send + Sync> Send for SortedSet<K> {}
unsafe impl<K: Ord + Send + Sync> Sync for SortedSet<K> {}

/// Keys extended with the two boundary values held by the sentinel nodes.
/// Variant order makes `Min` sort below and `Max` above every key.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Bound<K> {
    Min,
    Key(K),
    Max,
}

impl<K: Ord> Bound<K> {
    fn cmp_key(&self, key: &K) -> Ordering {
        match self {
            Bound::Min => Ordering::Less,
            Bound::Key(own) => own.cmp(key),
            Bound::Max => Ordering::Greater,
        }
    }
}

struct Node<K> {
    key: Bound<K>,
    next: AtomicMarkablePtr<Node<K>>,
}

impl<K> Node<K> {
    fn new(key: Bound<K>, next: *mut Node<K>) -> Self {
        Node {
            key,
            next: AtomicMarkablePtr::new(Link::Live(next)),
        }
    }
}

/// Adjacent protected nodes with `prev.key < key <= curr.key`, `curr` live when observed.
struct Window<K> {
    prev: *mut Node<K>,
    curr: *mut Node<K>,
}

impl<K: Ord + Send + Sync> SortedSet<K> {
    pub fn new() -> Self {
        let tail = Box::into_raw(Box::new(Node::new(Bound::Max, ptr::null_mut())));
        let head = Box::into_raw(Box::new(Node::new(Bound::Min, tail)));
        SortedSet {
            head,
            manager: HPBRManager::new(MAX_RETIRED, 2),
        }
    }

    /// Insert `key`, returning false if it was already present.
    /// # Examples
    /// ```
    /// use concurrent_primitives::structures::SortedSet;
    /// let set = SortedSet::new();
    /// assert!(set.add(5));
    /// assert!(!set.add(5));
    /// assert!(set.remove(&5));
    /// assert!(!set.contains(&5));
    /// assert!(!set.remove(&5));
    /// ```
    pub fn add(&self, key: K) -> bool {
        // The node is private until the CAS publishes it, so it can be relinked on retries
        let node = Box::into_raw(Box::new(Node::new(Bound::Key(key), ptr::null_mut())));
        let new_key = unsafe { &(*node).key };

        let added = loop {
            let window = self.find_window(|bound| bound.cmp(new_key));
            if unsafe { &(*window.curr).key } == new_key {
                unsafe { drop(Box::from_raw(node)) };
                break false;
            }

            unsafe { (*node).next.store(Link::Live(window.curr)) };
            // Fails if prev was removed or something was inserted between the two
            if unsafe { &*window.prev }
                .next
                .compare_exchange(Link::Live(window.curr), Link::Live(node))
                .is_ok()
            {
                break true;
            }
        };
        self.manager.unprotect_all();
        added
    }

    /// Remove `key`, returning false if it was not present.
    pub fn remove(&self, key: &K) -> bool {
        let removed = loop {
            let window = self.find_window(|bound| bound.cmp_key(key));
            let curr = unsafe { &*window.curr };
            if curr.key.cmp_key(key) != Ordering::Equal {
                break false;
            }

            let succ = match curr.next.load() {
                // Someone else is removing it, the next search unlinks it
                Link::Removed(_) => continue,
                Link::Live(succ) => succ,
            };
            // Linearization point: the key is gone once the node is marked
            if curr.next.compare_and_mark(succ).is_err() {
                continue;
            }

            // Physical deletion, left to later traversals if it fails
            if unsafe { &*window.prev }
                .next
                .compare_exchange(Link::Live(window.curr), Link::Live(succ))
                .is_ok()
            {
                self.manager.retire(window.curr, CURR);
            }
            break true;
        };
        self.manager.unprotect_all();
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        let window = self.find_window(|bound| bound.cmp_key(key));
        let found = unsafe { (*window.curr).key.cmp_key(key) } == Ordering::Equal;
        self.manager.unprotect_all();
        found
    }

    /// Locate the window where `towards` stops returning `Less`, unlinking every removed
    /// node on the way.
    ///
    /// Both ends of the returned window stay protected until the caller releases them.
    fn find_window<F>(&self, towards: F) -> Window<K>
    where
        F: Fn(&Bound<K>) -> Ordering,
    {
        'retry: loop {
            // The head sentinel is never retired and needs no protection
            let mut prev = self.head;
            let mut curr = unsafe { &*prev }.next.load().node();
            self.manager.protect(curr, CURR);
            if unsafe { &*prev }.next.load() != Link::Live(curr) {
                continue 'retry;
            }

            loop {
                let curr_node = unsafe { &*curr };
                if let Bound::Max = curr_node.key {
                    return Window { prev, curr };
                }

                match curr_node.next.load() {
                    Link::Removed(succ) => {
                        // Help: unlink the removed node before stepping past it
                        if unsafe { &*prev }
                            .next
                            .compare_exchange(Link::Live(curr), Link::Live(succ))
                            .is_err()
                        {
                            continue 'retry;
                        }
                        self.manager.retire(curr, CURR);
                        curr = succ;
                    }
                    Link::Live(succ) => {
                        if towards(&curr_node.key) != Ordering::Less {
                            return Window { prev, curr };
                        }
                        // Still covered by CURR while PREV takes it over
                        self.manager.protect(curr, PREV);
                        prev = curr;
                        curr = succ;
                    }
                }

                // curr came from prev's link and is only safe if that link still holds it
                self.manager.protect(curr, CURR);
                if unsafe { &*prev }.next.load() != Link::Live(curr) {
                    continue 'retry;
                }
            }
        }
    }
}

impl<K: Ord + Send + Sync> Default for SortedSet<K> {
    fn default() -> Self {
        SortedSet::new()
    }
}

impl<K: Ord + Send + Sync> fmt::Debug for SortedSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SortedSet")
            .field("head", &self.head)
            .field("manager", &self.manager)
            .finish()
    }
}

impl<K: Ord + Send + Sync> Drop for SortedSet<K> {
    fn drop(&mut self) {
        // Marked but still linked nodes are freed here, unlinked ones by the manager
        let mut current = self.head;
        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            current = node.next.load().node();
        }
    }
}
