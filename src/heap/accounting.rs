//! Allocation accountant (`spec.md` §4.9, C9): tracks native bytes handed out
//! through the `xmalloc` family since the last GC and decides when that
//! volume alone should trigger a cycle, independent of slot exhaustion.
//!
//! Grounded on `original_source/gc_alloc.c` (`vm_malloc_prepare`,
//! `vm_xrealloc`, `xmalloc2_size`) for the allocation wrappers themselves,
//! and on `gc_ms.c`'s `after_gc_sweep` for the post-cycle `malloc_limit`
//! update: it only ever grows (an EWMA-style relaxation weighted by the live
//! fraction of the heap) and is clamped to never fall below
//! `initial_malloc_limit`, so the accountant gets strictly more patient as
//! the heap proves it can absorb allocation, never more trigger-happy.

use std::alloc::{self, Layout};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{GcError, GcResult};
use crate::options::Options;

pub struct Accounting {
    malloc_increase: AtomicUsize,
    malloc_limit: AtomicUsize,
    initial_malloc_limit: usize,
    pub allocated_size: AtomicUsize,
    pub allocations: AtomicUsize,
}

impl Accounting {
    pub fn new(options: &Options) -> Self {
        Accounting {
            malloc_increase: AtomicUsize::new(0),
            malloc_limit: AtomicUsize::new(options.initial_malloc_limit),
            initial_malloc_limit: options.initial_malloc_limit,
            allocated_size: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Should a GC run before we hand out `additional` more bytes? Mirrors
    /// `vm_malloc_prepare`'s `(malloc_increase + size) > malloc_limit` check;
    /// stress mode is handled by the caller, since it applies to slot
    /// allocation too and doesn't belong to the malloc accountant alone.
    pub fn over_limit(&self, additional: usize) -> bool {
        self.malloc_increase.load(Ordering::Relaxed) + additional
            > self.malloc_limit.load(Ordering::Relaxed)
    }

    pub fn record_alloc(&self, size: usize) {
        self.malloc_increase.fetch_add(size, Ordering::Relaxed);
        self.allocated_size.fetch_add(size, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, size: usize) {
        self.allocated_size.fetch_sub(size, Ordering::Relaxed);
        self.allocations.fetch_sub(1, Ordering::Relaxed);
    }

    /// `after_gc_sweep`'s `malloc_limit` relaxation, run once per cycle after
    /// sweep finishes. `live_slots`/`total_slots` describe the heap's
    /// occupancy at that point.
    pub fn relax_limit_after_sweep(&self, live_slots: usize, total_slots: usize) {
        let inc = self.malloc_increase.swap(0, Ordering::AcqRel);
        let limit = self.malloc_limit.load(Ordering::Relaxed);
        if inc > limit && total_slots > 0 {
            let delta = (inc - limit) as f64 * (live_slots as f64 / total_slots as f64);
            let mut new_limit = limit + delta as usize;
            if new_limit < self.initial_malloc_limit {
                new_limit = self.initial_malloc_limit;
            }
            self.malloc_limit.store(new_limit, Ordering::Relaxed);
        }
    }

    pub fn malloc_limit(&self) -> usize {
        self.malloc_limit.load(Ordering::Relaxed)
    }

    pub fn malloc_increase(&self) -> usize {
        self.malloc_increase.load(Ordering::Relaxed)
    }
}

/// `xmalloc2_size`: `count * elsize`, rejecting overflow rather than
/// wrapping, matching the C original's explicit overflow check.
pub fn checked_mul_size(count: usize, elsize: usize) -> GcResult<usize> {
    count.checked_mul(elsize).ok_or(GcError::IntegerOverflow)
}

/// Validate a requested allocation size the way `vm_malloc_prepare` does:
/// reject sizes that, reinterpreted as signed, would be negative, and treat
/// a zero-byte request as a one-byte request (every xmalloc pointer must be
/// distinct and freeable).
pub fn prepare_size(size: usize) -> GcResult<usize> {
    if (size as isize) < 0 {
        return Err(GcError::NegativeSize);
    }
    Ok(if size == 0 { 1 } else { size })
}

/// `ruby_xmalloc`: allocate `size` bytes, retrying once after `on_pressure`
/// (expected to run a GC cycle) if the system allocator fails.
pub fn xmalloc(
    accounting: &Accounting,
    size: usize,
    on_pressure: impl FnOnce(),
) -> GcResult<*mut u8> {
    let size = prepare_size(size)?;
    let layout = Layout::from_size_align(size, std::mem::align_of::<usize>())
        .map_err(|_| GcError::IntegerOverflow)?;
    let mut ptr = unsafe { alloc::alloc(layout) };
    if ptr.is_null() {
        on_pressure();
        ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(GcError::OutOfMemory);
        }
    }
    accounting.record_alloc(size);
    Ok(ptr)
}

/// `ruby_xcalloc`: zeroed allocation of `count * elsize` bytes.
pub fn xcalloc(
    accounting: &Accounting,
    count: usize,
    elsize: usize,
    on_pressure: impl FnOnce(),
) -> GcResult<*mut u8> {
    let size = checked_mul_size(count, elsize)?;
    let ptr = xmalloc(accounting, size, on_pressure)?;
    unsafe { ptr::write_bytes(ptr, 0, size) };
    Ok(ptr)
}

/// `ruby_xrealloc`: resize a block previously returned by [`xmalloc`]/
/// [`xcalloc`] from `old_size` to `new_size` bytes, retrying once after
/// `on_pressure` if the system allocator can't grow it in place
/// (`original_source/gc_alloc.c`'s `vm_xrealloc`). A null `ptr` forwards to
/// [`xmalloc`]; a `new_size` of zero frees the block and returns null.
///
/// # Safety
/// `ptr` must be null or have been allocated by this module with exactly
/// `old_size` bytes and not already freed.
pub unsafe fn xrealloc(
    accounting: &Accounting,
    ptr: *mut u8,
    old_size: usize,
    new_size: usize,
    on_pressure: impl FnOnce(),
) -> GcResult<*mut u8> {
    if ptr.is_null() {
        return xmalloc(accounting, new_size, on_pressure);
    }
    if (new_size as isize) < 0 {
        return Err(GcError::NegativeSize);
    }
    if new_size == 0 {
        xfree(accounting, ptr, old_size);
        return Ok(ptr::null_mut());
    }

    let old_layout = Layout::from_size_align(old_size.max(1), std::mem::align_of::<usize>())
        .map_err(|_| GcError::IntegerOverflow)?;
    let mut mem = alloc::realloc(ptr, old_layout, new_size);
    if mem.is_null() {
        on_pressure();
        mem = alloc::realloc(ptr, old_layout, new_size);
        if mem.is_null() {
            return Err(GcError::OutOfMemory);
        }
    }

    // `vm_xrealloc` always adds the full new size to `malloc_increase`, even
    // on shrink; only `allocated_size` tracks the signed delta.
    accounting.malloc_increase.fetch_add(new_size, Ordering::Relaxed);
    if new_size >= old_size {
        accounting
            .allocated_size
            .fetch_add(new_size - old_size, Ordering::Relaxed);
    } else {
        accounting
            .allocated_size
            .fetch_sub(old_size - new_size, Ordering::Relaxed);
    }

    Ok(mem)
}

/// `ruby_xfree`: release a block previously returned by [`xmalloc`]/[`xcalloc`].
///
/// # Safety
/// `ptr` must have been allocated by this module with exactly `size` bytes
/// and not already freed.
pub unsafe fn xfree(accounting: &Accounting, ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    let layout = Layout::from_size_align(size.max(1), std::mem::align_of::<usize>())
        .expect("layout recomputation must match the original allocation");
    alloc::dealloc(ptr, layout);
    accounting.record_free(size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xmalloc_round_trip() {
        let accounting = Accounting::new(&Options::default());
        let ptr = xmalloc(&accounting, 128, || {}).unwrap();
        assert_eq!(accounting.malloc_increase(), 128);
        unsafe { xfree(&accounting, ptr, 128) };
        assert_eq!(accounting.allocated_size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn realloc_grows_and_updates_accounting() {
        let accounting = Accounting::new(&Options::default());
        let ptr = xmalloc(&accounting, 64, || {}).unwrap();
        let grown = unsafe { xrealloc(&accounting, ptr, 64, 256, || {}).unwrap() };
        assert_eq!(accounting.allocated_size.load(Ordering::Relaxed), 256);
        unsafe { xfree(&accounting, grown, 256) };
        assert_eq!(accounting.allocated_size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_null() {
        let accounting = Accounting::new(&Options::default());
        let ptr = xmalloc(&accounting, 64, || {}).unwrap();
        let result = unsafe { xrealloc(&accounting, ptr, 64, 0, || {}).unwrap() };
        assert!(result.is_null());
        assert_eq!(accounting.allocated_size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn calloc_rejects_overflow() {
        let accounting = Accounting::new(&Options::default());
        let err = xcalloc(&accounting, usize::MAX, 2, || {}).unwrap_err();
        assert_eq!(err, GcError::IntegerOverflow);
    }

    #[test]
    fn limit_never_drops_below_initial() {
        let options = Options {
            initial_malloc_limit: 1000,
            ..Options::default()
        };
        let accounting = Accounting::new(&options);
        accounting.record_alloc(5000);
        accounting.relax_limit_after_sweep(10, 100);
        assert!(accounting.malloc_limit() >= 1000);
    }
}
