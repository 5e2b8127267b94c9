//! Free-list allocator & page growth policy (`spec.md` §4.3, C3).
//!
//! Tracks the subset of pages that currently have at least one free slot
//! (the "free-pages list" in `spec.md`'s terms) and decides when the heap
//! needs more pages, following `original_source/gc_ms.c`'s
//! `set_free_min`/`heaps_increment` pair: growth targets are computed once,
//! right after a sweep, then paid for incrementally (one page per
//! allocation that would otherwise fail) rather than all at once.

use std::ptr;

use crate::options::Options;
use crate::util::page::{self, PageDescriptor};

/// Pages with at least one free slot, plus the pending growth budget.
pub struct FreeList {
    /// Head of the singly-linked free-pages list (`PageDescriptor::free_list_next`).
    head: *mut PageDescriptor,
    /// Pages still owed to the heap after the last `schedule_growth` call.
    pub pending_growth: usize,
    pub free_min: usize,
    pub do_heap_free: usize,
}

unsafe impl Send for FreeList {}

impl FreeList {
    pub fn new() -> Self {
        FreeList {
            head: ptr::null_mut(),
            pending_growth: 0,
            free_min: 0,
            do_heap_free: 0,
        }
    }

    pub fn push(&mut self, descriptor: &PageDescriptor) {
        let ptr = descriptor as *const PageDescriptor as *mut PageDescriptor;
        descriptor.free_list_next.set(self.head);
        self.head = ptr;
    }

    /// Pop a page known to have a free slot, or `None` if the list is empty.
    pub fn pop_with_free_slot(&mut self) -> Option<*mut PageDescriptor> {
        loop {
            if self.head.is_null() {
                return None;
            }
            let page = unsafe { &*self.head };
            if page.has_free_slots() {
                return Some(self.head);
            }
            // Page was fully consumed since it was linked in; drop it.
            self.head = page.free_list_next.get();
        }
    }

    /// Rebuild the free-pages list from scratch (cheaper than incremental
    /// maintenance after a full sweep touches every page).
    pub fn rebuild<'a>(&mut self, pages: impl Iterator<Item = &'a PageDescriptor>) {
        self.head = ptr::null_mut();
        for p in pages {
            if p.has_free_slots() {
                self.push(p);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Recompute `free_min`/`do_heap_free` after a sweep, following
    /// `original_source/gc_ms.c`'s `after_gc_sweep`: both are fractions of
    /// total slot capacity, with `free_min` floored at a fixed minimum and
    /// `do_heap_free` disabled (set to the full capacity, i.e. never release
    /// pages) whenever that floor kicks in.
    pub fn recompute_thresholds(&mut self, total_slots: usize, options: &Options) {
        let initial_free_min = options.initial_heap_min_slots.min(total_slots.max(1));
        self.do_heap_free = (total_slots as f64 * options.do_heap_free_ratio) as usize;
        self.free_min = (total_slots as f64 * options.free_min_ratio) as usize;
        if self.free_min < initial_free_min {
            self.do_heap_free = total_slots;
            self.free_min = initial_free_min;
        }
    }

    /// `original_source/gc_ms_heap.c`'s `set_heaps_increment`: schedule
    /// enough new pages that the heap grows by `heap_growth_factor`, paid for
    /// one page at a time as `take_growth_page` is called.
    pub fn schedule_growth(&mut self, current_pages: usize, options: &Options) {
        let target = ((current_pages as f64) * options.heap_growth_factor) as usize;
        let target = target.max(current_pages + 1);
        self.pending_growth = target - current_pages;
    }

    pub fn take_growth_page(&mut self) -> bool {
        if self.pending_growth > 0 {
            self.pending_growth -= 1;
            true
        } else {
            false
        }
    }

    /// Whether the live set leaves fewer free slots than `free_min`, meaning
    /// growth must be scheduled before the next sweep finishes
    /// (`original_source/gc_ms.c` line ~569).
    pub fn needs_growth(&self, total_slots: usize, live_slots: usize) -> bool {
        self.free_min > total_slots.saturating_sub(live_slots)
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

pub fn alloc_fresh_page(options: &Options, slot_size: usize) -> Box<PageDescriptor> {
    page::alloc_page(options.page_size(), slot_size)
}
