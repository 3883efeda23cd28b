use std::fmt;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};

pub fn is_marked<T>(ptr: *mut T) -> bool {
    ptr as usize & 0x1 == 1
}

pub fn unmark<T>(ptr: *mut T) -> *mut T {
    (ptr as usize & !0x1) as *mut T
}

pub fn mark<T>(ptr: *mut T) -> *mut T {
    (ptr as usize | 0x1) as *mut T
}

/// The two states of a successor link.
///
/// `Removed` is the tombstone: the node owning the link has been logically deleted,
/// and the wrapped pointer is the successor it had at that moment.
pub enum Link<T> {
    Live(*mut T),
    Removed(*mut T),
}

// Derives would demand the bounds of `T` rather than of the pointer
impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Link<T> {}

impl<T> PartialEq for Link<T> {
    fn eq(&self, other: &Self) -> bool {
        self.into_raw() == other.into_raw()
    }
}

impl<T> Eq for Link<T> {}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Link::Live(ptr) => write!(f, "Live({:?})", ptr),
            Link::Removed(ptr) => write!(f, "Removed({:?})", ptr),
        }
    }
}

impl<T> Link<T> {
    /// The successor, whatever the state of the owning node.
    pub fn node(self) -> *mut T {
        match self {
            Link::Live(ptr) | Link::Removed(ptr) => ptr,
        }
    }

    fn into_raw(self) -> *mut T {
        match self {
            Link::Live(ptr) => ptr,
            Link::Removed(ptr) => mark(ptr),
        }
    }

    fn from_raw(ptr: *mut T) -> Self {
        if is_marked(ptr) {
            Link::Removed(unmark(ptr))
        } else {
            Link::Live(ptr)
        }
    }
}

/// An atomic pointer whose lowest bit records whether the owning node is removed.
///
/// `T` must be aligned to at least two bytes.
pub struct AtomicMarkablePtr<T> {
    ptr: AtomicPtr<T>,
}

impl<T> AtomicMarkablePtr<T> {
    pub fn new(link: Link<T>) -> Self {
        debug_assert!(std::mem::align_of::<T>() >= 2);
        AtomicMarkablePtr {
            ptr: AtomicPtr::new(link.into_raw()),
        }
    }

    pub fn load(&self) -> Link<T> {
        Link::from_raw(self.ptr.load(Acquire))
    }

    pub fn store(&self, link: Link<T>) {
        self.ptr.store(link.into_raw(), Release)
    }

    /// Marks the link as removed if it still points, unmarked, at `old`.
    pub fn compare_and_mark(&self, old: *mut T) -> Result<(), Link<T>> {
        self.compare_exchange(Link::Live(old), Link::Removed(old))
    }

    pub fn compare_exchange(&self, current: Link<T>, new: Link<T>) -> Result<(), Link<T>> {
        self.ptr
            .compare_exchange(current.into_raw(), new.into_raw(), AcqRel, Acquire)
            .map(|_| ())
            .map_err(Link::from_raw)
    }
}

impl<T> fmt::Debug for AtomicMarkablePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AtomicMarkablePtr({:?})", self.load())
    }
}
