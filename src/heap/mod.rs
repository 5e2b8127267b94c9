//! The object heap: page pool, page index, free-list allocator and
//! allocation accountant wired together (`spec.md` §2, C1/C2/C3/C9).
//!
//! Grounded on `original_source/gc_ms_heap.c`'s `objspace->heap` fields
//! (`sorted`, `free_slots`, `free_bitmap`, `increment`) and on MMTk's
//! `policy::space::Space` for the idea of a single struct owning page
//! storage, a membership index, and its own allocation bookkeeping.

pub mod accounting;
pub mod freelist;

use crate::error::{GcError, GcResult};
use crate::options::Options;
use crate::util::address::{Address, ObjectRef};
use crate::util::page::{self, PageDescriptor};
use crate::util::page_index::PageIndex;
use crate::util::slot::{flag_bits, header_of, header_of_ref, SlotHeader};
use crate::vm::Host;

use accounting::Accounting;
use freelist::FreeList;

/// Owns every page this collector has allocated, plus the indexes and
/// counters needed to allocate from them and answer membership queries.
pub struct ObjectSpace<H: Host> {
    options: Options,
    slot_size: usize,
    pages: Vec<Box<PageDescriptor>>,
    index: PageIndex,
    freelist: FreeList,
    pub accounting: Accounting,
    live_slots: usize,
    _host: std::marker::PhantomData<H>,
}

/// Safe to share across the parallel mark worker group: every field that
/// isn't append-only-under-atomics (`accounting`, each `PageDescriptor`'s
/// bitmap) is read-only for the duration of a mark phase, which the
/// collector orchestrator (`crate::gc`) guarantees never overlaps with
/// mutator or sweep access to the same `ObjectSpace`.
unsafe impl<H: Host> Sync for ObjectSpace<H> {}

impl<H: Host> ObjectSpace<H> {
    pub fn new(options: Options) -> Self {
        let slot_size = SlotHeader::payload_offset() + H::SLOT_PAYLOAD_SIZE;
        let accounting = Accounting::new(&options);
        let mut space = ObjectSpace {
            slot_size,
            pages: Vec::new(),
            index: PageIndex::new(options.page_size()),
            freelist: FreeList::new(),
            accounting,
            live_slots: 0,
            options,
            _host: std::marker::PhantomData,
        };
        space.initial_expand();
        space
    }

    fn slots_per_page(&self) -> usize {
        self.pages
            .first()
            .map(|p| p.slot_count)
            .unwrap_or_else(|| page::alloc_page(self.options.page_size(), self.slot_size).slot_count)
    }

    pub fn total_slots(&self) -> usize {
        self.pages.iter().map(|p| p.slot_count).sum()
    }

    pub fn live_slots(&self) -> usize {
        self.live_slots
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Storage capacity of the page list, distinct from `page_count` the
    /// way `original_source/gc_ms_heap.c`'s `heap_length` differs from
    /// `heap_used` (`gc_stat`'s reported array capacity vs. pages in use).
    pub fn page_capacity(&self) -> usize {
        self.pages.capacity()
    }

    pub fn pending_growth(&self) -> usize {
        self.freelist.pending_growth
    }

    fn initial_expand(&mut self) {
        let per_page = self.slots_per_page().max(1);
        let min_pages = self.options.initial_heap_min_slots.div_ceil(per_page);
        while self.pages.len() < min_pages.max(1) {
            self.push_new_page();
        }
        self.rebuild_index();
        self.freelist.rebuild(self.pages.iter().map(|p| &**p));
        self.freelist
            .recompute_thresholds(self.total_slots(), &self.options);
    }

    fn push_new_page(&mut self) {
        let page = freelist::alloc_fresh_page(&self.options, self.slot_size);
        self.pages.push(page);
    }

    /// Grow the heap by exactly one page outside the normal scheduled-growth
    /// path, and fold it into the free-pages list and index. Used by the
    /// collector when the growth budget is exhausted and a cycle alone did
    /// not free enough slots to satisfy an allocation (`spec.md` §4.9 "retry
    /// once" path, extended one step further to growth rather than giving up
    /// immediately).
    pub fn force_grow(&mut self) {
        self.push_new_page();
        self.rebuild_index();
        self.freelist.rebuild(self.pages.iter().map(|p| &**p));
    }

    pub fn rebuild_index(&mut self) {
        self.index.rebuild(self.pages.iter().map(|p| &**p));
    }

    #[inline]
    pub fn is_pointer_to_heap(&self, addr: Address) -> bool {
        self.index.is_pointer_to_heap(addr)
    }

    /// `spec.md` §4.5 item 3: is `addr` a slot-aligned, page-resident
    /// address whose header currently looks allocated? Does not consult the
    /// host; callers combine this with [`Host::looks_like_live_object`].
    pub fn is_candidate_object(&self, addr: Address) -> Option<ObjectRef> {
        let base = self.index.page_base_containing(addr)?;
        let offset = addr - base;
        if offset < page::PageDescriptor::header_reserved_for(self.slot_size) {
            return None;
        }
        let page = unsafe { &*page::descriptor_of(addr, self.options.page_size()) };
        let rel = offset - page::PageDescriptor::header_reserved_for(self.slot_size);
        if rel % self.slot_size != 0 {
            return None;
        }
        let index = rel / self.slot_size;
        if index >= page.slot_count {
            return None;
        }
        let payload = page.payload_of(index);
        let header = unsafe { header_of(payload) };
        if header.flags() == 0 {
            return None;
        }
        Some(unsafe { ObjectRef::from_address(payload) })
    }

    /// Allocate one slot, growing the heap or triggering GC pressure through
    /// `on_exhausted` if none is free. `on_exhausted` is expected to run a
    /// collection cycle; this module has no scheduling opinion of its own.
    pub fn allocate(&mut self, on_exhausted: impl FnOnce(&mut Self)) -> GcResult<ObjectRef> {
        if self.freelist.is_empty() {
            if self.freelist.take_growth_page() {
                self.push_new_page();
                self.rebuild_index();
                self.freelist.rebuild(self.pages.iter().map(|p| &**p));
            } else {
                on_exhausted(self);
            }
        }
        let page_ptr = self
            .freelist
            .pop_with_free_slot()
            .ok_or(GcError::OutOfMemory)?;
        let page = unsafe { &*page_ptr };
        let payload = page.pop_free().ok_or(GcError::OutOfMemory)?;
        let header = unsafe { header_of(payload) };
        header.set_flags(flag_bits::ALLOCATED);
        self.live_slots += 1;
        Ok(unsafe { ObjectRef::from_address(payload) })
    }

    #[inline]
    pub fn is_live_object(&self, obj: ObjectRef) -> bool {
        let header = unsafe { header_of_ref(obj) };
        header.is_allocated() && !header.has_flag(flag_bits::IS_ZOMBIE)
    }

    pub fn mark(&self, obj: ObjectRef) -> bool {
        let page = unsafe { &*page::descriptor_of(obj.addr(), self.options.page_size()) };
        let index = page.index_of_payload(obj.addr());
        page.bitmap.test_and_set(index)
    }

    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        let page = unsafe { &*page::descriptor_of(obj.addr(), self.options.page_size()) };
        let index = page.index_of_payload(obj.addr());
        page.bitmap.is_marked(index)
    }

    pub fn pages(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages.iter().map(|p| &**p)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn set_live_slots(&mut self, n: usize) {
        self.live_slots = n;
    }

    pub fn freelist_mut(&mut self) -> &mut FreeList {
        &mut self.freelist
    }

    /// Resync the free-pages list against every page's current free-slot
    /// state (`spec.md` §4.3 "A page re-joins the list when sweeping
    /// produces new free slots on it"). Called once at the end of a sweep
    /// pass so a cycle that only freed scattered slots on surviving pages
    /// (no page released, no growth scheduled) doesn't leave the free-list
    /// stale.
    pub fn rebuild_freelist(&mut self) {
        self.freelist.rebuild(self.pages.iter().map(|p| &**p));
    }

    /// Drop pages that swept fully empty and are not mid-finalization
    /// (`spec.md` §4.6 "free_unused_heaps"). Caller passes the set of page
    /// base addresses to release; storage is freed and the index rebuilt.
    pub fn release_pages(&mut self, bases: &[Address]) {
        if bases.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.pages.len());
        for page in self.pages.drain(..) {
            if bases.contains(&page.base) {
                unsafe { page::free_page(page) };
            } else {
                kept.push(page);
            }
        }
        self.pages = kept;
        self.rebuild_index();
        self.freelist.rebuild(self.pages.iter().map(|p| &**p));
    }
}

/// Release every remaining page's `posix_memalign`'d backing store.
/// `release_pages` only frees pages the sweeper already emptied; any page
/// still holding objects when the space itself goes away (process exit,
/// an embedder dropping a `Collector` early) would otherwise leak its OS
/// allocation even though the `Box<PageDescriptor>` itself is reclaimed.
impl<H: Host> Drop for ObjectSpace<H> {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            unsafe { page::free_page(page) };
        }
    }
}

impl page::PageDescriptor {
    /// Bytes at the start of each page reserved for the raw page header,
    /// rounded up to a slot boundary (mirrors the `aligned_header_size`
    /// computed in [`page::alloc_page`]).
    pub fn header_reserved_for(slot_size: usize) -> usize {
        let header_size = std::mem::size_of::<usize>();
        header_size.div_ceil(slot_size.max(1)) * slot_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Host, ReleaseAction, Tracer};

    struct TestHost;
    impl Host for TestHost {
        const SLOT_PAYLOAD_SIZE: usize = 32;
        fn enumerate_extra_roots(&self, _push: &mut dyn FnMut(ObjectRef)) {}
        fn trace_children(&self, _obj: ObjectRef, _tracer: &mut dyn Tracer) {}
        fn looks_like_live_object(&self, _obj: ObjectRef) -> bool {
            true
        }
        fn free_object(&self, _obj: ObjectRef) -> ReleaseAction {
            ReleaseAction::Freed
        }
        fn invoke_finalizer(&self, _callable: ObjectRef, _safe_level: u8, _dead_object_id: usize) {}
    }

    #[test]
    fn allocate_marks_slot_allocated() {
        let options = Options {
            initial_heap_min_slots: 10,
            ..Options::default()
        };
        let mut space: ObjectSpace<TestHost> = ObjectSpace::new(options);
        let obj = space.allocate(|_| {}).unwrap();
        assert!(space.is_live_object(obj));
        assert!(space.is_pointer_to_heap(obj.addr()));
    }

    #[test]
    fn candidate_object_requires_nonzero_flags() {
        let options = Options {
            initial_heap_min_slots: 10,
            ..Options::default()
        };
        let mut space: ObjectSpace<TestHost> = ObjectSpace::new(options);
        let obj = space.allocate(|_| {}).unwrap();
        assert!(space.is_candidate_object(obj.addr()).is_some());
        assert!(space
            .is_candidate_object(Address::from_usize(obj.addr().as_usize() + 1))
            .is_none());
    }
}
