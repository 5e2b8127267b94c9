//! Page & slot pool (`spec.md` §4.1, C1).
//!
//! A page is `2^K` bytes (default K = 14, 16 KiB) obtained by aligned OS
//! allocation. Its first bytes hold a tiny header carrying a back-pointer to
//! a separately heap-allocated `PageDescriptor`, so that
//! `descriptor_of(ptr) = page_header(ptr & ~align_mask)->descriptor` as
//! `spec.md` specifies. The aligned-allocation technique is grounded in
//! `pythonesque-cell-gc/src/pages.rs` (`PageHeader::find` via address
//! masking); we use `libc::posix_memalign` rather than a `Vec<u8>` trick
//! since we need the memory to outlive any particular allocation and be
//! freed explicitly on page release.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::AtomicUsize;

use super::address::Address;
use super::bitmap::MarkBitmap;
use super::slot::SlotHeader;

/// Raw header written at offset 0 of every page's backing allocation.
#[repr(C)]
struct PageHeader {
    descriptor: *mut PageDescriptor,
}

/// One per page, heap-allocated (boxed) and leaked into a raw pointer for
/// the lifetime of the page; reclaimed explicitly in [`free_page`].
pub struct PageDescriptor {
    pub base: Address,
    pub slots_start: Address,
    pub slot_count: usize,
    pub slot_size: usize,
    pub bitmap: MarkBitmap,
    /// Head of this page's local free-list (a slot address, or 0).
    pub local_free_head: Cell<usize>,
    /// Intrusive doubly-linked list pointers for the live-pages list.
    pub prev: Cell<*mut PageDescriptor>,
    pub next: Cell<*mut PageDescriptor>,
    /// Singly-linked pointer used for both the free-pages list (§4.3) and
    /// the sweep cursor's traversal order.
    pub free_list_next: Cell<*mut PageDescriptor>,
    /// Number of zombies still outstanding on a page tagged `FREEING_PAGE`
    /// (`spec.md` §4.6, I7). Zero unless `is_freeing_page`.
    pub outstanding_zombies: AtomicUsize,
    pub is_freeing_page: Cell<bool>,
}

unsafe impl Sync for PageDescriptor {}
unsafe impl Send for PageDescriptor {}

impl PageDescriptor {
    #[inline]
    pub fn slot_header(&self, index: usize) -> &SlotHeader {
        debug_assert!(index < self.slot_count);
        let addr = self.slots_start + index * self.slot_size;
        unsafe { &*addr.to_ptr::<SlotHeader>() }
    }

    #[inline]
    pub fn payload_of(&self, index: usize) -> Address {
        self.slots_start + index * self.slot_size + SlotHeader::payload_offset()
    }

    #[inline]
    pub fn index_of_payload(&self, payload: Address) -> usize {
        let header_addr = payload - SlotHeader::payload_offset();
        (header_addr - self.slots_start) / self.slot_size
    }

    pub fn end(&self) -> Address {
        self.slots_start + self.slot_count * self.slot_size
    }

    /// Push a slot (by payload address) onto this page's local free-list.
    pub fn push_free(&self, payload: Address) {
        let header = unsafe { &*(payload - SlotHeader::payload_offset()).to_ptr::<SlotHeader>() };
        header.set_flags(0);
        header.set_link(self.local_free_head.get());
        self.local_free_head.set(payload.as_usize());
    }

    /// Pop a free slot's payload address, or `None` if the page is full.
    pub fn pop_free(&self) -> Option<Address> {
        let head = self.local_free_head.get();
        if head == 0 {
            return None;
        }
        let header = unsafe { &*(Address::from_usize(head) - SlotHeader::payload_offset()).to_ptr::<SlotHeader>() };
        self.local_free_head.set(header.link());
        header.set_link(0);
        Some(Address::from_usize(head))
    }

    pub fn has_free_slots(&self) -> bool {
        self.local_free_head.get() != 0
    }
}

/// Compute the page base (`ptr & ~align_mask`) and fetch its descriptor.
///
/// # Safety
/// `ptr` must be an address somewhere inside a page this allocator created.
#[inline]
pub unsafe fn descriptor_of(ptr: Address, page_size: usize) -> *mut PageDescriptor {
    let base = ptr.align_down(page_size);
    (*base.to_ptr::<PageHeader>()).descriptor
}

/// Allocate one aligned page of `page_size` bytes and its descriptor.
/// `slot_size` and `page_size` together determine `slot_count`.
pub fn alloc_page(page_size: usize, slot_size: usize) -> Box<PageDescriptor> {
    let header_size = std::mem::size_of::<PageHeader>();
    let aligned_header_size = header_size.div_ceil(slot_size.max(1)) * slot_size.max(1);
    let usable = page_size - aligned_header_size;
    let slot_count = usable / slot_size;
    assert!(slot_count > 0, "slot_size too large for page_size");

    let mut raw: *mut libc::c_void = ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut raw, page_size, page_size) };
    assert_eq!(rc, 0, "posix_memalign failed for page allocation");
    unsafe { ptr::write_bytes(raw as *mut u8, 0, page_size) };

    let base = unsafe { Address::from_ptr(raw) };
    let slots_start = base + aligned_header_size;

    let descriptor = Box::new(PageDescriptor {
        base,
        slots_start,
        slot_count,
        slot_size,
        bitmap: MarkBitmap::new(slot_count),
        local_free_head: Cell::new(0),
        prev: Cell::new(ptr::null_mut()),
        next: Cell::new(ptr::null_mut()),
        free_list_next: Cell::new(ptr::null_mut()),
        outstanding_zombies: AtomicUsize::new(0),
        is_freeing_page: Cell::new(false),
    });
    let descriptor_ptr = Box::into_raw(descriptor);

    unsafe {
        (*base.to_ptr::<PageHeader>().cast_mut()) = PageHeader {
            descriptor: descriptor_ptr,
        };
    }

    // Thread every slot onto the local free-list in address order, as
    // `original_source/gc_ms_heap.c`'s `assign_heap_slot` does.
    let descriptor_ref = unsafe { &*descriptor_ptr };
    for i in (0..slot_count).rev() {
        descriptor_ref.push_free(descriptor_ref.payload_of(i));
    }

    unsafe { Box::from_raw(descriptor_ptr) }
}

/// Free a page's backing storage. The caller must first ensure no live or
/// zombie object remains on it (`spec.md` invariant I7).
///
/// # Safety
/// `descriptor` must have been produced by [`alloc_page`] and must not be
/// referenced again afterwards.
pub unsafe fn free_page(descriptor: Box<PageDescriptor>) {
    let base = descriptor.base;
    drop(descriptor);
    libc::free(base.to_mut_ptr());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_threads_free_list() {
        let page = alloc_page(1 << 14, 64);
        assert!(page.slot_count > 0);
        let mut seen = 0;
        while page.pop_free().is_some() {
            seen += 1;
        }
        assert_eq!(seen, page.slot_count);
        unsafe { free_page(page) };
    }

    #[test]
    fn descriptor_of_roundtrips() {
        let page = alloc_page(1 << 14, 64);
        let base = page.base;
        let slot0 = page.payload_of(0);
        let d = unsafe { descriptor_of(slot0, 1 << 14) };
        assert_eq!(unsafe { (*d).base }, base);
        unsafe { free_page(Box::from_raw(d)) };
    }
}
