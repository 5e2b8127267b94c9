//! Sweep engine (`spec.md` §4.6, C6): reclaims every slot that came out of
//! mark unmarked, turns slots with teardown work into zombies, and decides
//! when a fully-empty page becomes a freeing-page or is released outright.
//!
//! Grounded on `original_source/gc_ms.c`'s `slot_sweep`/`lazy_sweep` pair:
//! sweeping one page is synchronous and total, but pages are visited lazily,
//! one per call, so a mutator blocked on allocation only waits for as much
//! sweeping as it takes to find a single free slot (`spec.md` §4.6 "Lazy
//! sweep", P8).

use crate::heap::freelist::FreeList;
use crate::heap::ObjectSpace;
use crate::util::address::{Address, ObjectRef};
use crate::util::page::PageDescriptor;
use crate::util::slot::{flag_bits, header_of};
use crate::vm::{Host, ReleaseAction};

/// What a zombie transition looks like to whatever owns the deferred
/// finalization chain (`crate::finalize`). Sweep itself has no opinion on
/// chain storage; it just reports the event.
pub struct ZombieEvent {
    pub obj: ObjectRef,
    pub page_base: Address,
    pub has_finalizer: bool,
}

/// Per-page sweep result, rolled up by the caller into heap-wide counters.
pub struct PageSweepResult {
    pub free_count: usize,
    pub final_count: usize,
    pub became_freeing_page: bool,
}

/// Sweep a single page: reclaim dead slots to its local free-list, zombie
/// anything that needs teardown, and clear its mark bitmap.
///
/// `do_heap_free` is the free-slot threshold above which a fully-reclaimable
/// page is retired as a freeing-page rather than kept live (`spec.md` §4.6:
/// "If final + free == slot_count and heap.free_num > do_heap_free").
/// `free_num_so_far` is the running free-slot tally across pages already
/// swept this cycle, used for that same check.
pub fn slot_sweep<H: Host>(
    page: &PageDescriptor,
    host: &H,
    free_num_so_far: usize,
    do_heap_free: usize,
    mut on_zombie: impl FnMut(ZombieEvent),
) -> PageSweepResult {
    let mut free_count = 0usize;
    let mut final_count = 0usize;

    for i in 0..page.slot_count {
        let payload = page.payload_of(i);
        let header = unsafe { header_of(payload) };
        let marked = page.bitmap.is_marked(i);
        let flags = header.flags();

        if marked || header.has_flag(flag_bits::IS_ZOMBIE) {
            continue;
        }
        if flags != 0 {
            let obj = unsafe { ObjectRef::from_address(payload) };
            let action = host.free_object(obj);
            let has_finalizer = header.has_flag(flag_bits::HAS_FINALIZER);
            if matches!(action, ReleaseAction::Deferred) || has_finalizer {
                header.set_flag(flag_bits::IS_ZOMBIE);
                on_zombie(ZombieEvent {
                    obj,
                    page_base: page.base,
                    has_finalizer,
                });
                final_count += 1;
            } else {
                page.push_free(payload);
                free_count += 1;
            }
        } else {
            free_count += 1;
        }
    }

    page.bitmap.clear();

    let became_freeing_page = final_count + free_count == page.slot_count
        && free_num_so_far + free_count > do_heap_free;

    PageSweepResult {
        free_count,
        final_count,
        became_freeing_page,
    }
}

/// Collector state machine (`spec.md` §4.6 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Mark,
    Sweep,
}

/// Drives lazy, one-page-at-a-time sweeping across a full heap pass.
pub struct LazySweeper {
    cursor: usize,
    pub free_num: usize,
    pub final_num: usize,
    pub do_heap_free: usize,
    pub freed_page_bases: Vec<Address>,
}

impl LazySweeper {
    pub fn begin(do_heap_free: usize) -> Self {
        LazySweeper {
            cursor: 0,
            free_num: 0,
            final_num: 0,
            do_heap_free,
            freed_page_bases: Vec::new(),
        }
    }

    pub fn is_done(&self, page_count: usize) -> bool {
        self.cursor >= page_count
    }

    /// Sweep exactly one page and advance the cursor. Returns whether that
    /// page yielded at least one free slot, which per `spec.md` §4.6 "Lazy
    /// sweep" is the mutator's cue that it may stop waiting and allocate.
    ///
    /// A page that keeps some live slots but also gained free ones rejoins
    /// `freelist` immediately (`spec.md` §4.3 "a page re-joins the list when
    /// sweeping produces new free slots on it"), so the mutator can allocate
    /// from it without waiting for the rest of the pass. A page swept wholly
    /// free is left out of `freelist` and recorded in `freed_page_bases`
    /// instead, since its fate (release vs. keep) isn't decided until the
    /// whole pass finishes; a page retired as a freeing-page stays out too.
    pub fn step<H: Host>(
        &mut self,
        pages: &[&PageDescriptor],
        host: &H,
        freelist: &mut FreeList,
        mut on_zombie: impl FnMut(ZombieEvent),
    ) -> bool {
        if self.cursor >= pages.len() {
            return false;
        }
        let page = pages[self.cursor];
        self.cursor += 1;

        if page.is_freeing_page.get() {
            // Already retired; its storage is owned by the finalize module
            // until the last outstanding zombie clears.
            return false;
        }

        let result = slot_sweep(page, host, self.free_num, self.do_heap_free, &mut on_zombie);
        self.free_num += result.free_count;
        self.final_num += result.final_count;

        if result.became_freeing_page {
            page.is_freeing_page.set(true);
            page.outstanding_zombies
                .store(result.final_count, std::sync::atomic::Ordering::Release);
        } else if result.free_count == page.slot_count {
            self.freed_page_bases.push(page.base);
        } else if result.free_count > 0 {
            freelist.push(page);
        }

        result.free_count > 0
    }

    /// Run to completion, ignoring the lazy early-exit (used by a full
    /// synchronous `gc_start`, and by `each_object`'s `dont_lazy_sweep`).
    pub fn run_to_completion<H: Host>(
        &mut self,
        pages: &[&PageDescriptor],
        host: &H,
        freelist: &mut FreeList,
        mut on_zombie: impl FnMut(ZombieEvent),
    ) {
        while !self.is_done(pages.len()) {
            self.step(pages, host, freelist, &mut on_zombie);
        }
    }
}

pub fn release_unused_pages<H: Host>(space: &mut ObjectSpace<H>, bases: &[Address]) {
    space.release_pages(bases);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::vm::Tracer;

    struct FreeingHost;
    impl Host for FreeingHost {
        const SLOT_PAYLOAD_SIZE: usize = 16;
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
    fn unmarked_unflagged_slots_count_as_free_without_calling_host() {
        let options = Options {
            initial_heap_min_slots: 10,
            ..Options::default()
        };
        let mut space: ObjectSpace<FreeingHost> = ObjectSpace::new(options);
        let host = FreeingHost;
        let pages: Vec<_> = space.pages().collect();
        let result = slot_sweep(pages[0], &host, 0, usize::MAX, |_| panic!("no zombies expected"));
        assert_eq!(result.free_count, pages[0].slot_count);
        assert_eq!(result.final_count, 0);
    }

    #[test]
    fn unmarked_allocated_slot_is_freed_when_host_accepts() {
        let options = Options {
            initial_heap_min_slots: 10,
            ..Options::default()
        };
        let mut space: ObjectSpace<FreeingHost> = ObjectSpace::new(options);
        let host = FreeingHost;
        let obj = space.allocate(|_| {}).unwrap();
        // not marked => sweep reclaims it
        let pages: Vec<_> = space.pages().collect();
        let before_free = pages[0].local_free_head.get();
        let _ = before_free;
        let result = slot_sweep(pages[0], &host, 0, usize::MAX, |_| panic!("no zombies expected"));
        assert!(result.free_count >= 1);
        assert_eq!(result.final_count, 0);
        let _ = obj;
    }
}
