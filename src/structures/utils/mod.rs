pub mod atomic_markable;
pub mod backoff;

/// An address no allocation can ever return, used as an in-band marker in slot cells.
///
/// Distinct from null and from every boxed payload (including dangling zero-sized boxes,
/// whose address is their alignment). Never dereferenced.
pub fn sentinel<T>() -> *mut T {
    static SENTINEL: u64 = 0;
    &SENTINEL as *const u64 as *mut T
}
