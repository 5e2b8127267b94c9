//! The fixed-size cell every managed object occupies (`spec.md` §3 "Slot").
//!
//! A slot is a small header the collector owns, followed by a payload area
//! the host's object model owns. This mirrors the `MarkWord`-then-value
//! layout in `pythonesque-cell-gc/src/pages.rs`, except the header here is a
//! flags word (mark state lives in the page's side bitmap, per `spec.md`
//! §4.4 and the `DESIGN.md` decision to always use the bitmap) plus one
//! link word reused for three purposes depending on state: free-list chain,
//! deferred-finalization chain, or (while free) nothing at all.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use super::address::{Address, ObjectRef};

/// Bits of `SlotHeader::flags` the collector itself reads and writes.
/// Bits 8 and above are left for the host's own per-type "embedding/sharing"
/// flags (`spec.md` §3 "per-type embedding/sharing flags whose semantics are
/// opaque to the collector").
pub mod flag_bits {
    /// The slot currently holds a live object (as opposed to being on a
    /// free-list). `spec.md` §4.5 item 3c ("flags are non-zero") relies on
    /// this bit (among others a host may set) being part of "non-zero".
    pub const ALLOCATED: u32 = 1 << 0;
    /// A finalizer is registered for this object (`spec.md` §4.7).
    pub const HAS_FINALIZER: u32 = 1 << 1;
    /// The object has an out-of-line instance-variable table the host must
    /// free on reclaim (`spec.md` §3).
    pub const HAS_EXTERNAL_IVARS: u32 = 1 << 2;
    /// The object is unreachable but its finalizer has not yet run
    /// (`spec.md` §3 invariant I6).
    pub const IS_ZOMBIE: u32 = 1 << 3;
    /// The zombie's page has been logically removed from the live list and
    /// is waiting for every zombie on it to finalize (`spec.md` §4.6, I7).
    pub const FREEING_PAGE: u32 = 1 << 4;

    /// First bit available to the host for its own per-type flags.
    pub const HOST_FLAGS_SHIFT: u32 = 8;
}

/// The header prefixed to every slot's payload.
#[repr(C)]
pub struct SlotHeader {
    flags: AtomicU32,
    /// Reused as: free-list next-slot address (slot free), deferred-chain
    /// next-zombie address (slot zombie), or left `0` (slot live & non-zombie).
    link: UnsafeCell<usize>,
}

unsafe impl Sync for SlotHeader {}

impl SlotHeader {
    pub const fn payload_offset() -> usize {
        std::mem::size_of::<SlotHeader>()
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Release);
    }

    #[inline]
    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags() & bit != 0
    }

    #[inline]
    pub fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.has_flag(flag_bits::ALLOCATED)
    }

    #[inline]
    pub fn link(&self) -> usize {
        unsafe { *self.link.get() }
    }

    #[inline]
    pub fn set_link(&self, v: usize) {
        unsafe { *self.link.get() = v };
    }
}

/// Given the address of a slot's payload (what hosts and `ObjectRef`s see),
/// find the header that precedes it.
///
/// # Safety
/// `payload` must be the address returned for some slot by the page
/// allocator (i.e. `SlotHeader::payload_offset()` bytes after a valid
/// `SlotHeader`).
#[inline]
pub unsafe fn header_of(payload: Address) -> &'static SlotHeader {
    let header_addr = payload - SlotHeader::payload_offset();
    &*(header_addr.to_ptr::<SlotHeader>())
}

#[inline]
pub unsafe fn header_of_ref(obj: ObjectRef) -> &'static SlotHeader {
    header_of(obj.addr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_round_trip() {
        let h = SlotHeader {
            flags: AtomicU32::new(0),
            link: UnsafeCell::new(0),
        };
        assert!(!h.is_allocated());
        h.set_flag(flag_bits::ALLOCATED);
        h.set_flag(flag_bits::HAS_FINALIZER);
        assert!(h.is_allocated());
        assert!(h.has_flag(flag_bits::HAS_FINALIZER));
        h.clear_flag(flag_bits::HAS_FINALIZER);
        assert!(!h.has_flag(flag_bits::HAS_FINALIZER));
        assert!(h.is_allocated());
    }

    #[test]
    fn link_round_trip() {
        let h = SlotHeader {
            flags: AtomicU32::new(0),
            link: UnsafeCell::new(0),
        };
        h.set_link(0xdead_beef);
        assert_eq!(h.link(), 0xdead_beef);
    }
}
