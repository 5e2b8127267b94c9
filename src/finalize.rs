//! Finalizer table & zombie runner (`spec.md` §4.7, C7).
//!
//! Three pieces, matching `original_source/gc.c`'s finalizer machinery:
//! the table itself (`define_finalizer`/`undefine_finalizer`/`copy_finalizer`,
//! keyed by the object's stable id since the slot may be zeroed before the
//! callable runs), the deferred-finalization chain sweep threads zombies
//! onto (reusing the slot's link word, per the `DESIGN.md` decision, rather
//! than a separate owning-page field), and the post-sweep runner plus the
//! at-exit fixed point from `rb_objspace_call_finalizer`.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::heap::ObjectSpace;
use crate::util::address::{Address, ObjectRef};
use crate::util::page::{self, PageDescriptor};
use crate::util::slot::{flag_bits, header_of_ref};
use crate::vm::Host;

#[derive(Clone, Copy)]
pub struct FinalizerEntry {
    pub safe_level: u8,
    pub callable: ObjectRef,
}

/// `obj id -> registered (safe_level, callable) list` (`spec.md` §6
/// "define_finalizer/undefine_finalizer/copy_finalizer"). Mutated only by
/// the mutator thread, never during a GC cycle (`spec.md` §5).
pub struct FinalizerTable {
    table: Mutex<HashMap<usize, Vec<FinalizerEntry>>>,
}

impl FinalizerTable {
    pub fn new() -> Self {
        FinalizerTable {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn define(&self, obj: ObjectRef, callable: ObjectRef, safe_level: u8) -> ObjectRef {
        unsafe { header_of_ref(obj) }.set_flag(flag_bits::HAS_FINALIZER);
        self.table
            .lock()
            .unwrap()
            .entry(obj.addr().as_usize())
            .or_default()
            .push(FinalizerEntry { safe_level, callable });
        callable
    }

    pub fn undefine(&self, obj: ObjectRef) -> ObjectRef {
        unsafe { header_of_ref(obj) }.clear_flag(flag_bits::HAS_FINALIZER);
        self.table.lock().unwrap().remove(&obj.addr().as_usize());
        obj
    }

    /// Bind `src`'s finalizer list (if any) to `dst` too; callables are
    /// shared, not cloned (`spec.md` §4.7 "Copy: ... bind the same list").
    pub fn copy(&self, dst: ObjectRef, src: ObjectRef) {
        let mut table = self.table.lock().unwrap();
        if let Some(list) = table.get(&src.addr().as_usize()).cloned() {
            if !list.is_empty() {
                unsafe { header_of_ref(dst) }.set_flag(flag_bits::HAS_FINALIZER);
                table.insert(dst.addr().as_usize(), list);
            }
        }
    }

    /// Remove and return `obj`'s finalizer list, if any. Called once per
    /// zombie when the post-sweep runner finally invokes it.
    pub fn take(&self, obj: ObjectRef) -> Vec<FinalizerEntry> {
        self.table
            .lock()
            .unwrap()
            .remove(&obj.addr().as_usize())
            .unwrap_or_default()
    }

    pub fn registered_ids(&self) -> Vec<usize> {
        self.table.lock().unwrap().keys().copied().collect()
    }

    pub fn all_callables(&self) -> Vec<ObjectRef> {
        self.table
            .lock()
            .unwrap()
            .values()
            .flatten()
            .map(|e| e.callable)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().unwrap().is_empty()
    }
}

impl Default for FinalizerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Deferred-finalization chain (`spec.md` §3 "zombie", §4.6): a singly
/// linked list of zombie slots threaded through their own link word, most
/// recently zombied first.
pub struct DeferredChain {
    head: AtomicUsize,
}

impl DeferredChain {
    pub fn new() -> Self {
        DeferredChain {
            head: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, obj: ObjectRef) {
        let header = unsafe { header_of_ref(obj) };
        let old_head = self.head.load(Ordering::Relaxed);
        header.set_link(old_head);
        self.head.store(obj.addr().as_usize(), Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<ObjectRef> {
        let head = self.head.load(Ordering::Relaxed);
        if head == 0 {
            return None;
        }
        let obj = unsafe { ObjectRef::from_address(Address::from_usize(head)) };
        let header = unsafe { header_of_ref(obj) };
        self.head.store(header.link(), Ordering::Relaxed);
        header.set_link(0);
        Some(obj)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == 0
    }
}

impl Default for DeferredChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one finalizer callable behind a `catch_unwind`, the way
/// `original_source/gc.c`'s `run_finalizer` wraps each call in `rb_protect`:
/// one misbehaving finalizer must not abort the rest of the table walk.
fn invoke_protected<H: Host>(host: &H, entry: FinalizerEntry, dead_id: usize) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        host.invoke_finalizer(entry.callable, entry.safe_level, dead_id)
    }));
    if result.is_err() {
        log::warn!("finalizer for object {dead_id} panicked; continuing with the next one");
    }
}

/// Drain the deferred chain once, running every zombie's registered
/// finalizers and either releasing its slot or decrementing its page's
/// outstanding-zombie counter (`spec.md` §4.7 "Invocation").
pub fn run_post_sweep<H: Host>(
    chain: &DeferredChain,
    table: &FinalizerTable,
    host: &H,
    page_size: usize,
) {
    while let Some(obj) = chain.pop() {
        let dead_id = obj.addr().as_usize();
        for entry in table.take(obj) {
            invoke_protected(host, entry, dead_id);
        }
        finish_zombie(obj, page_size);
    }
}

fn finish_zombie(obj: ObjectRef, page_size: usize) {
    let page = unsafe { &*page::descriptor_of(obj.addr(), page_size) };
    let header = unsafe { header_of_ref(obj) };
    header.clear_flag(flag_bits::IS_ZOMBIE);

    if page.is_freeing_page.get() {
        let remaining = page.outstanding_zombies.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            // Caller (the collector orchestrator) owns removing this page
            // from `ObjectSpace`'s page list and freeing its storage; it
            // polls `PageDescriptor::outstanding_zombies` after each
            // `run_post_sweep` call to find pages that just hit zero.
        }
    } else {
        page.push_free(obj.addr());
    }
}

/// Pages tagged `FREEING_PAGE` whose outstanding-zombie count has reached
/// zero and can now be physically released.
pub fn pages_ready_to_free<'a>(
    pages: impl Iterator<Item = &'a PageDescriptor>,
) -> Vec<Address> {
    pages
        .filter(|p| p.is_freeing_page.get() && p.outstanding_zombies.load(Ordering::Acquire) == 0)
        .map(|p| p.base)
        .collect()
}

/// `rb_objspace_call_finalizer`'s at-exit fixed point (`spec.md` §4.7
/// "At-exit"): repeatedly drain the chain until invoking one finalizer stops
/// producing new zombie work, then force-run every remaining registered
/// finalizer regardless of reachability, and finally let the host tear down
/// anything left that isn't exempted by `Host::survives_shutdown`. A
/// finalizer's callable is never reclaimed before its own invocation: the
/// registered-id loop below takes and runs every remaining entry before the
/// general teardown loop frees anything, so no ordering hazard exists for
/// the collector to guard against here.
pub fn run_at_exit<H: Host>(
    space: &ObjectSpace<H>,
    chain: &DeferredChain,
    table: &FinalizerTable,
    host: &H,
) {
    loop {
        run_post_sweep(chain, table, host, space.options().page_size());
        if table.is_empty() || chain.is_empty() {
            break;
        }
    }

    for id in table.registered_ids() {
        let obj = unsafe { ObjectRef::from_address(Address::from_usize(id)) };
        let dead_id = obj.addr().as_usize();
        for entry in table.take(obj) {
            invoke_protected(host, entry, dead_id);
        }
    }

    for page in space.pages() {
        for i in 0..page.slot_count {
            let payload = page.payload_of(i);
            let header = unsafe { crate::util::slot::header_of(payload) };
            if header.is_allocated() && !header.has_flag(flag_bits::IS_ZOMBIE) {
                let obj = unsafe { ObjectRef::from_address(payload) };
                if !host.survives_shutdown(obj) {
                    host.free_object(obj);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::vm::{ReleaseAction, Tracer};

    struct NullHost;
    impl Host for NullHost {
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
    fn finalizer_runs_exactly_once() {
        let options = Options {
            initial_heap_min_slots: 10,
            ..Options::default()
        };
        let space: ObjectSpace<NullHost> = ObjectSpace::new(options);
        let host = NullHost;
        let mut space = space;
        let obj = space.allocate(|_| {}).unwrap();
        let callable = space.allocate(|_| {}).unwrap();

        let table = FinalizerTable::new();
        table.define(obj, callable, 0);

        let chain = DeferredChain::new();
        chain.push(obj);

        let calls = std::cell::Cell::new(0);
        struct CountingHost<'a>(&'a std::cell::Cell<i32>);
        impl<'a> Host for CountingHost<'a> {
            const SLOT_PAYLOAD_SIZE: usize = 16;
            fn enumerate_extra_roots(&self, _push: &mut dyn FnMut(ObjectRef)) {}
            fn trace_children(&self, _obj: ObjectRef, _tracer: &mut dyn Tracer) {}
            fn looks_like_live_object(&self, _obj: ObjectRef) -> bool {
                true
            }
            fn free_object(&self, _obj: ObjectRef) -> ReleaseAction {
                ReleaseAction::Freed
            }
            fn invoke_finalizer(&self, _callable: ObjectRef, _safe_level: u8, _dead_object_id: usize) {
                self.0.set(self.0.get() + 1);
            }
        }
        let counting = CountingHost(&calls);
        run_post_sweep(&chain, &table, &counting, space.options().page_size());
        assert_eq!(calls.get(), 1);
        assert!(table.is_empty());
        let _ = host;
    }
}
