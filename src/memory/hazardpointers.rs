use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::sync::atomic::{self, AtomicPtr, Ordering};

use thread_local::ThreadLocal;
use tracing::trace;

/// Hazard pointer based reclamation, as described by Michael in
/// [Hazard Pointers: Safe Memory Reclamation for Lock-Free Objects](https://ieeexplore.ieee.org/document/1291819).
///
/// Every thread owns `num_hp_per_thread` hazard slots, kept in a global append-only list.
/// A record is freed by its retiring thread once no hazard slot holds it.
pub struct HPBRManager<T: Send> {
    thread_info: ThreadLocal<UnsafeCell<ThreadLocalInfo<T>>>,
    head: AtomicPtr<HazardPointer<T>>,
    max_retired: usize,
    num_hp_per_thread: usize,
}

impl<T: Send> fmt::Debug for HPBRManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut hazards = 0;
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            hazards += 1;
            current = unsafe { (*current).next.load(Ordering::Acquire) };
        }
        f.debug_struct("HPBRManager")
            .field("hazard_pointers", &hazards)
            .field("max_retired", &self.max_retired)
            .field("num_hp_per_thread", &self.num_hp_per_thread)
            .finish()
    }
}

impl<T: Send> HPBRManager<T> {
    pub fn new(max_retired: usize, num_hp_per_thread: usize) -> Self {
        HPBRManager {
            thread_info: ThreadLocal::new(),
            head: AtomicPtr::default(),
            max_retired,
            num_hp_per_thread,
        }
    }

    fn allocate_hp(&self) -> *mut HazardPointer<T> {
        let new_hp_ptr = Box::into_raw(Box::new(HazardPointer::new()));

        // CAS push the new hazard pointer onto the global list
        // Hazard pointers are only freed when the manager is dropped
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            unsafe {
                (*new_hp_ptr).next.store(old_head, Ordering::Relaxed);
            }
            if self
                .head
                .compare_exchange_weak(old_head, new_hp_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return new_hp_ptr;
            }
        }
    }

    /// Publish `record` in this thread's hazard slot `hazard_num`.
    ///
    /// The caller must re-read the location `record` was loaded from afterwards: the record
    /// is only safe to dereference if it was still reachable after this call.
    pub fn protect(&self, record: *mut T, hazard_num: usize) {
        unsafe {
            self.get_mut_thread_info()
                .get_hazard_pointer(hazard_num)
                .protect(record);
        }
        atomic::fence(Ordering::SeqCst);
    }

    pub fn unprotect(&self, hazard_num: usize) {
        unsafe {
            self.get_mut_thread_info()
                .get_hazard_pointer(hazard_num)
                .unprotect();
        }
    }

    pub fn unprotect_all(&self) {
        unsafe {
            for hp in &self.get_mut_thread_info().local_hazards {
                (**hp).unprotect();
            }
        }
    }

    /// Hand an unlinked record over for deferred freeing, dropping this thread's
    /// `hazard_num` protection on the way.
    ///
    /// The record must already be unreachable from the shared structure and must be
    /// retired exactly once.
    pub fn retire(&self, record: *mut T, hazard_num: usize) {
        let over_limit = unsafe {
            let thread_info = self.get_mut_thread_info();
            thread_info.get_hazard_pointer(hazard_num).unprotect();
            thread_info.retired_list.push(record);
            thread_info.retired_list.len() > self.max_retired
        };

        if over_limit {
            self.scan();
        }
    }

    /// Frees every retired record of this thread which is not protected by a hazard pointer.
    fn scan(&self) {
        atomic::fence(Ordering::SeqCst);
        let mut hazard_set: HashSet<*mut T> = HashSet::new();
        let mut current = self.head.load(Ordering::Acquire);

        while !current.is_null() {
            unsafe {
                let hazard_pointer = &*current;
                let protected = hazard_pointer.protected.load(Ordering::SeqCst);
                if !protected.is_null() {
                    hazard_set.insert(protected);
                }
                current = hazard_pointer.next.load(Ordering::Acquire);
            }
        }

        let thread_info = unsafe { self.get_mut_thread_info() };
        let before = thread_info.retired_list.len();
        thread_info.retired_list.retain(|&record| {
            if hazard_set.contains(&record) {
                true
            } else {
                unsafe { free(record) };
                false
            }
        });
        trace!(
            freed = before - thread_info.retired_list.len(),
            kept = thread_info.retired_list.len(),
            "hazard pointer scan"
        );
    }

    #[cfg(test)]
    fn retired_count(&self) -> usize {
        unsafe { self.get_mut_thread_info().retired_list.len() }
    }

    /// On first access from a thread, creates its hazard pointers and links them
    /// into the central list.
    #[allow(clippy::mut_from_ref)]
    unsafe fn get_mut_thread_info(&self) -> &mut ThreadLocalInfo<T> {
        let thread_info_ptr = self
            .thread_info
            .get_or(|| {
                let starting_hp = (0..self.num_hp_per_thread)
                    .map(|_| self.allocate_hp())
                    .collect();
                UnsafeCell::new(ThreadLocalInfo::new(starting_hp))
            })
            .get();

        &mut *thread_info_ptr
    }
}

impl<T: Send> Drop for HPBRManager<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let hazard_pointer = unsafe { Box::from_raw(current) };
            current = hazard_pointer.next.load(Ordering::Relaxed);
        }
        // Retired records are freed by ThreadLocalInfo's drop when thread_info goes
    }
}

unsafe fn free<T>(garbage: *mut T) {
    drop(Box::from_raw(garbage));
}

struct HazardPointer<T> {
    protected: AtomicPtr<T>,
    next: AtomicPtr<HazardPointer<T>>,
}

impl<T> HazardPointer<T> {
    fn new() -> Self {
        HazardPointer {
            protected: AtomicPtr::default(),
            next: AtomicPtr::default(),
        }
    }

    fn protect(&self, record: *mut T) {
        self.protected.store(record, Ordering::SeqCst);
    }

    fn unprotect(&self) {
        self.protected.store(ptr::null_mut(), Ordering::Release);
    }
}

struct ThreadLocalInfo<T> {
    local_hazards: Vec<*mut HazardPointer<T>>,
    retired_list: Vec<*mut T>,
}

// The raw pointers are only dereferenced by the owning thread, or by the manager's drop
unsafe impl<T: Send> Send for ThreadLocalInfo<T> {}

impl<T> ThreadLocalInfo<T> {
    fn new(starting_hazards: Vec<*mut HazardPointer<T>>) -> Self {
        ThreadLocalInfo {
            local_hazards: starting_hazards,
            retired_list: Vec::new(),
        }
    }

    unsafe fn get_hazard_pointer(&self, hazard_index: usize) -> &HazardPointer<T> {
        &*self.local_hazards[hazard_index]
    }
}

impl<T> Drop for ThreadLocalInfo<T> {
    fn drop(&mut self) {
        for record in self.retired_list.drain(..) {
            unsafe { free(record) };
        }
    }
}
