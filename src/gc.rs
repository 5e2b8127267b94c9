//! The collector itself (`spec.md` §6): wires the heap, root list, mark
//! driver, sweep engine, finalizer pipeline, accountant, and profiler
//! together behind the public surface a host actually calls.
//!
//! Grounded on `mmtk-mmtk-core/src/mmtk.rs`'s `MMTK<VM>`: one top-level
//! struct generic over the embedding binding, owning every subsystem, with
//! state-machine transitions driven by a handful of entry points rather than
//! each subsystem managing its own lifecycle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{GcError, GcResult};
use crate::finalize::{self, DeferredChain, FinalizerTable};
use crate::heap::ObjectSpace;
use crate::options::Options;
use crate::roots::{self, RootList};
use crate::scheduler::{self, WorkerGroup};
use crate::stats::{CycleRecord, Profiler, SystemClock};
use crate::sweep::{LazySweeper, Phase};
use crate::util::address::{Address, ObjectRef};
use crate::util::page::PageDescriptor;
use crate::util::slot::{flag_bits, header_of};
use crate::vm::Host;

/// `spec.md` §6 "gc_stat" result. Mirrors `original_source/gc_ms_heap.c`'s
/// `gc_stat` field set (`heap_length` being the page-storage capacity, a
/// distinct number from `heap_used`, the page count currently live).
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStat {
    pub count: usize,
    pub heap_used: usize,
    pub heap_length: usize,
    pub heap_increment: usize,
    pub heap_live_num: usize,
    pub heap_free_num: usize,
    pub heap_final_num: usize,
}

/// Ties every subsystem together behind the state machine of `spec.md`
/// §4.6: `Idle -> Mark -> Sweep -> Idle`, with sweep steppable one page at a
/// time so mutator pauses stay bounded (`spec.md` §4.6 "Lazy sweep", P8).
pub struct Collector<H: Host> {
    options: Options,
    space: ObjectSpace<H>,
    host: H,
    roots: RootList,
    finalizer_table: FinalizerTable,
    deferred_chain: DeferredChain,
    group: WorkerGroup,

    phase: Phase,
    sweeper: Option<LazySweeper>,
    sweep_start: Option<Instant>,

    dont_gc: bool,
    stress: bool,
    gc_count: usize,

    last_mark_time: Duration,
    last_marked: usize,
    last_free_num: usize,
    last_final_num: usize,

    profiler: Profiler,
    clock: SystemClock,
}

impl<H: Host + Sync> Collector<H> {
    pub fn new(options: Options, host: H) -> Self {
        crate::util::logger::try_init();
        let clock = SystemClock;
        let profiler = Profiler::new(&clock);
        let group = WorkerGroup::new(options.resolved_num_workers());
        let dont_gc = options.dont_gc;
        let stress = options.stress_mode;
        let space = ObjectSpace::new(options.clone());
        log::info!(
            "collector initialized: page_size={} workers={}",
            options.page_size(),
            group.num_workers()
        );
        Collector {
            options,
            space,
            host,
            roots: RootList::new(),
            finalizer_table: FinalizerTable::new(),
            deferred_chain: DeferredChain::new(),
            group,
            phase: Phase::Idle,
            sweeper: None,
            sweep_start: None,
            dont_gc,
            stress,
            gc_count: 0,
            last_mark_time: Duration::ZERO,
            last_marked: 0,
            last_free_num: 0,
            last_final_num: 0,
            profiler,
            clock,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    // ---- Allocation (`spec.md` §6 "new_obj") ----------------------------

    /// Return a zeroed slot. Fatal if called while a mark phase is in
    /// progress (`spec.md` §4.6 "Allocation during MARK is forbidden
    /// (fatal; rb_bug)").
    pub fn new_obj(&mut self) -> GcResult<ObjectRef> {
        assert_ne!(
            self.phase,
            Phase::Mark,
            "allocation during mark phase is forbidden"
        );

        if self.stress {
            // Stress mode overrides the malloc threshold and requests GC on
            // every allocation (`spec.md` §5, §9, scenario 4).
            self.gc_start();
        } else if self.phase == Phase::Idle
            && !self.dont_gc
            && self.space.accounting.over_limit(self.space.slot_size())
        {
            self.begin_cycle();
        }

        if self.phase == Phase::Sweep {
            self.step_sweep();
        }

        match self.space.allocate(|_space| {}) {
            Ok(obj) => {
                self.space.accounting.record_alloc(self.space.slot_size());
                Ok(obj)
            }
            Err(GcError::OutOfMemory) => {
                if !self.dont_gc {
                    self.gc_start();
                }
                let obj = self.space.allocate(|space| space.force_grow())?;
                self.space.accounting.record_alloc(self.space.slot_size());
                Ok(obj)
            }
            Err(e) => Err(e),
        }
    }

    // ---- Roots (`spec.md` §6 "Registration") -----------------------------

    /// # Safety
    /// See [`roots::RootList::register_root`].
    pub unsafe fn register_root(&self, slot: *const usize) {
        self.roots.register_root(slot);
    }

    pub fn unregister_root(&self, slot: *const usize) {
        self.roots.unregister_root(slot);
    }

    pub fn register_mark_object(&self, obj: ObjectRef) {
        self.roots.register_mark_object(obj);
    }

    // ---- Finalizer API (`spec.md` §6 "Finalizer API") ---------------------

    pub fn define_finalizer(&self, obj: ObjectRef, callable: ObjectRef, safe_level: u8) -> ObjectRef {
        self.finalizer_table.define(obj, callable, safe_level)
    }

    pub fn undefine_finalizer(&self, obj: ObjectRef) -> ObjectRef {
        self.finalizer_table.undefine(obj)
    }

    pub fn copy_finalizer(&self, dst: ObjectRef, src: ObjectRef) {
        self.finalizer_table.copy(dst, src)
    }

    // ---- Control (`spec.md` §6 "Control") ---------------------------------

    /// Run one full collection cycle synchronously: mark, then sweep every
    /// page to completion (no lazy early-exit), then run post-sweep
    /// finalizers and growth accounting.
    pub fn gc_start(&mut self) {
        if self.phase != Phase::Idle {
            // I3: no page may be mid-sweep when a new mark begins.
            self.run_sweep_to_completion();
        }
        self.begin_cycle();
        self.run_sweep_to_completion();
    }

    /// `GC.enable`. Returns the previous `dont_gc` state, inverted to match
    /// "previous enabled-ness" the way `spec.md` documents it.
    pub fn gc_enable(&mut self) -> bool {
        let previous_enabled = !self.dont_gc;
        self.dont_gc = false;
        previous_enabled
    }

    /// `GC.disable`. Returns whether GC was already disabled.
    pub fn gc_disable(&mut self) -> bool {
        let previous_disabled = self.dont_gc;
        self.dont_gc = true;
        previous_disabled
    }

    pub fn gc_stress_get(&self) -> bool {
        self.stress
    }

    pub fn gc_stress_set(&mut self, value: bool) {
        self.stress = value;
    }

    // ---- Introspection (`spec.md` §6 "Introspection") ---------------------

    /// `count_objects`: `{TOTAL, FREE, <type tag>...}`, keyed by
    /// [`Host::type_tag`] rather than a fixed enum since the object model is
    /// an external collaborator (`spec.md` §1).
    pub fn count_objects(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        let mut total = 0usize;
        let mut free = 0usize;
        for page in self.space.pages() {
            for i in 0..page.slot_count {
                let payload = page.payload_of(i);
                let header = unsafe { header_of(payload) };
                total += 1;
                if header.is_allocated() {
                    let obj = unsafe { ObjectRef::from_address(payload) };
                    *counts.entry(self.host.type_tag(obj)).or_insert(0) += 1;
                } else {
                    free += 1;
                }
            }
        }
        counts.insert("TOTAL", total);
        counts.insert("FREE", free);
        counts
    }

    pub fn gc_stat(&self) -> GcStat {
        GcStat {
            count: self.gc_count,
            heap_used: self.space.page_count(),
            heap_length: self.space.page_capacity(),
            heap_increment: self.space.pending_growth(),
            heap_live_num: self.space.live_slots(),
            heap_free_num: self.last_free_num,
            heap_final_num: self.last_final_num,
        }
    }

    /// `each_object([type]) { |o| ... }`. Pauses lazy sweep for the
    /// duration by forcing any in-progress sweep to completion first, so
    /// every slot's liveness reflects one consistent post-sweep snapshot;
    /// since the sweep is already finished by the time iteration starts,
    /// there is no partial lazy state left to restore on exit.
    ///
    /// **Open question resolved** (`spec.md` §9): unlike the historical
    /// implementation, every yielded slot here is liveness-checked
    /// (`ALLOCATED` and not `IS_ZOMBIE`) before `f` is called.
    pub fn each_object(&mut self, type_filter: Option<&str>, mut f: impl FnMut(ObjectRef)) -> usize {
        if self.phase == Phase::Sweep {
            self.run_sweep_to_completion();
        }
        let mut count = 0;
        for page in self.space.pages() {
            for i in 0..page.slot_count {
                let payload = page.payload_of(i);
                let header = unsafe { header_of(payload) };
                if !header.is_allocated() || header.has_flag(flag_bits::IS_ZOMBIE) {
                    continue;
                }
                let obj = unsafe { ObjectRef::from_address(payload) };
                if let Some(filter) = type_filter {
                    if self.host.type_tag(obj) != filter {
                        continue;
                    }
                }
                f(obj);
                count += 1;
            }
        }
        count
    }

    // ---- Object id (`spec.md` §6 "Object id") ------------------------------

    /// For heap objects, the id is the numeric slot address (`spec.md` §6).
    /// Immediate/symbol encodings belong to the host's own value
    /// representation and are out of scope here.
    pub fn object_id(&self, obj: ObjectRef) -> usize {
        obj.addr().as_usize()
    }

    pub fn id2ref(&self, id: usize) -> GcResult<ObjectRef> {
        let addr = Address::from_usize(id);
        self.space
            .is_candidate_object(addr)
            .filter(|&obj| self.space.is_live_object(obj))
            .ok_or(GcError::DeadReference)
    }

    // ---- Profiler (`spec.md` §6 "Profiler") --------------------------------

    pub fn profiler_enable(&mut self) {
        self.profiler.enable();
    }

    pub fn profiler_disable(&mut self) {
        self.profiler.disable();
    }

    pub fn profiler_enabled(&self) -> bool {
        self.profiler.enabled()
    }

    pub fn profiler_clear(&mut self) {
        self.profiler.clear();
    }

    pub fn profiler_raw_data(&self) -> &[CycleRecord] {
        self.profiler.raw_data()
    }

    /// `Profiler.result`: the same records `raw_data` exposes, since there is
    /// no separate aggregate representation here (Rust callers consume the
    /// record slice directly rather than a formatted hash array).
    pub fn profiler_result(&self) -> &[CycleRecord] {
        self.profiler.raw_data()
    }

    pub fn profiler_report(&self) -> String {
        self.profiler.report()
    }

    pub fn profiler_total_time(&self) -> Duration {
        self.profiler.total_time()
    }

    // ---- Shutdown -----------------------------------------------------------

    /// `rb_objspace_call_finalizer`'s at-exit fixed point (`spec.md` §4.7
    /// "At-exit"). Call once, at VM teardown.
    pub fn shutdown(&mut self) {
        log::info!("collector shutdown: running at-exit finalization");
        finalize::run_at_exit(&self.space, &self.deferred_chain, &self.finalizer_table, &self.host);
    }

    // ---- Internal cycle machinery -------------------------------------------

    fn run_mark_phase(&mut self) -> usize {
        let mut roots = Vec::new();
        self.roots.for_each(|o| roots.push(o));
        self.host.enumerate_extra_roots(&mut |o| roots.push(o));
        if let Some((lo, hi)) = self.host.conservative_stack_range() {
            unsafe {
                roots::scan_conservative_range(lo, hi, &self.space, &self.host, |o| {
                    roots.push(o)
                });
            }
        }
        scheduler::parallel_mark(&self.space, &self.host, &self.group, roots)
    }

    /// `IDLE -> MARK -> SWEEP` (`spec.md` §4.6): mark every reachable
    /// object, then open a fresh lazy-sweep pass over the whole page list.
    fn begin_cycle(&mut self) {
        debug_assert_eq!(self.phase, Phase::Idle, "begin_cycle entered outside idle state");
        log::debug!("gc cycle {} starting", self.gc_count + 1);

        self.phase = Phase::Mark;
        let mark_start = Instant::now();
        let marked = self.run_mark_phase();
        self.last_mark_time = mark_start.elapsed();
        self.last_marked = marked;
        log::debug!(
            "gc cycle {}: marked {marked} objects in {:?}",
            self.gc_count + 1,
            self.last_mark_time
        );

        let total_slots = self.space.total_slots();
        let options = self.options.clone();
        self.space.freelist_mut().recompute_thresholds(total_slots, &options);
        let do_heap_free = self.space.freelist_mut().do_heap_free;

        self.phase = Phase::Sweep;
        self.sweeper = Some(LazySweeper::begin(do_heap_free));
        self.sweep_start = Some(Instant::now());
    }

    /// Sweep exactly one page. Returns whether it yielded a free slot
    /// (`spec.md` §4.6 "Lazy sweep" progress signal, P8).
    fn step_sweep(&mut self) -> bool {
        let Some(mut sweeper) = self.sweeper.take() else {
            return false;
        };
        let produced_free = {
            // Collected as raw pointers so the borrow of `self.space` ends
            // before `freelist_mut()` needs its own mutable borrow below;
            // page storage is boxed and stable for the scope of this call.
            let page_ptrs: Vec<*const PageDescriptor> =
                self.space.pages().map(|p| p as *const PageDescriptor).collect();
            let pages: Vec<&PageDescriptor> = page_ptrs.iter().map(|&p| unsafe { &*p }).collect();
            let chain = &self.deferred_chain;
            let freelist = self.space.freelist_mut();
            sweeper.step(&pages, &self.host, freelist, |event| chain.push(event.obj))
        };
        if sweeper.is_done(self.space.page_count()) {
            self.finish_sweep(sweeper);
        } else {
            self.sweeper = Some(sweeper);
        }
        produced_free
    }

    /// Drive the current sweep to completion without the lazy early exit
    /// (used by `gc_start` and by `each_object`'s `dont_lazy_sweep`).
    fn run_sweep_to_completion(&mut self) {
        while self.sweeper.is_some() {
            self.step_sweep();
        }
    }

    /// `SWEEP -> IDLE`: release pages this pass fully emptied, run
    /// finalizers for anything that zombied, release pages that just hit
    /// zero outstanding zombies, recompute growth/malloc-limit, and record
    /// one profiler entry.
    fn finish_sweep(&mut self, sweeper: LazySweeper) {
        self.space.release_pages(&sweeper.freed_page_bases);

        finalize::run_post_sweep(
            &self.deferred_chain,
            &self.finalizer_table,
            &self.host,
            self.options.page_size(),
        );
        let ready: Vec<Address> = finalize::pages_ready_to_free(self.space.pages());
        self.space.release_pages(&ready);

        // Resync the free-pages list unconditionally: `step_sweep` already
        // relinks each surviving page as it's swept, but a page released
        // above, or one whose state changed between sweeping and release,
        // must not leave the list stale for the next allocation.
        self.space.rebuild_freelist();

        self.space.set_live_slots(self.last_marked);
        let total_slots = self.space.total_slots();
        if self.space.freelist_mut().needs_growth(total_slots, self.last_marked) {
            let page_count = self.space.page_count();
            let options = self.options.clone();
            self.space.freelist_mut().schedule_growth(page_count, &options);
        }
        self.space
            .accounting
            .relax_limit_after_sweep(self.last_marked, total_slots);

        self.last_free_num = sweeper.free_num;
        self.last_final_num = sweeper.final_num;

        let sweep_time = self.sweep_start.take().map(|t| t.elapsed()).unwrap_or_default();
        self.phase = Phase::Idle;
        self.gc_count += 1;

        let slot_size = self.space.slot_size();
        let record = CycleRecord {
            gc_time: self.last_mark_time + sweep_time,
            mark_time: self.last_mark_time,
            sweep_time,
            invoke_time_since_start: self.profiler.time_since_start(&self.clock),
            slots_used: total_slots,
            live: self.last_marked,
            free: self.last_free_num,
            total_objects: total_slots,
            use_bytes: self.last_marked * slot_size,
            total_bytes: total_slots * slot_size,
            malloc_increase: self.space.accounting.malloc_increase(),
            malloc_limit: self.space.accounting.malloc_limit(),
            had_finalize: self.last_final_num > 0,
            is_marked: true,
        };
        self.profiler.record(record);
        log::info!(
            "gc cycle {} finished: live={} free={} final={} gc_time={:?}",
            self.gc_count,
            self.last_marked,
            self.last_free_num,
            self.last_final_num,
            record.gc_time
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ReleaseAction, Tracer};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Graph {
        edges: StdHashMap<usize, Vec<usize>>,
        finalized: Vec<usize>,
    }

    struct ScenarioHost {
        graph: Mutex<Graph>,
    }

    impl Host for ScenarioHost {
        const SLOT_PAYLOAD_SIZE: usize = 16;
        fn enumerate_extra_roots(&self, _push: &mut dyn FnMut(ObjectRef)) {}
        fn trace_children(&self, obj: ObjectRef, tracer: &mut dyn Tracer) {
            if let Some(children) = self.graph.lock().unwrap().edges.get(&obj.addr().as_usize()) {
                for &c in children {
                    tracer.trace_edge(unsafe { ObjectRef::from_address(Address::from_usize(c)) });
                }
            }
        }
        fn looks_like_live_object(&self, _obj: ObjectRef) -> bool {
            true
        }
        fn free_object(&self, _obj: ObjectRef) -> ReleaseAction {
            ReleaseAction::Freed
        }
        fn invoke_finalizer(&self, _callable: ObjectRef, _safe_level: u8, dead_object_id: usize) {
            self.graph.lock().unwrap().finalized.push(dead_object_id);
        }
    }

    fn new_collector(min_slots: usize) -> Collector<ScenarioHost> {
        let options = Options {
            initial_heap_min_slots: min_slots,
            num_workers: Some(2),
            ..Options::default()
        };
        let host = ScenarioHost {
            graph: Mutex::new(Graph::default()),
        };
        Collector::new(options, host)
    }

    #[test]
    fn basic_cycle_reclaims_unrooted_allocations() {
        let mut gc = new_collector(11_000);
        for _ in 0..10_000 {
            gc.new_obj().unwrap();
        }
        let before = gc.gc_stat().heap_live_num;
        assert!(before > 0);
        gc.gc_start();
        let stat = gc.gc_stat();
        assert!(
            stat.heap_live_num == 0,
            "no roots were registered, so nothing should survive a full cycle"
        );
        assert_eq!(stat.count, 1);
    }

    #[test]
    fn conservative_root_keeps_rooted_object_alive() {
        let mut gc = new_collector(1_000);
        let obj = gc.new_obj().unwrap();
        let slot_value: usize = obj.addr().as_usize();
        unsafe { gc.register_root(&slot_value as *const usize) };

        gc.gc_start();

        assert!(gc.space.is_live_object(obj));
        gc.unregister_root(&slot_value as *const usize);
    }

    #[test]
    fn cyclic_garbage_without_roots_is_reclaimed() {
        let mut gc = new_collector(2_000);
        let n = 1000;
        let objs: Vec<_> = (0..n).map(|_| gc.new_obj().unwrap()).collect();
        {
            let mut graph = gc.host.graph.lock().unwrap();
            for i in 0..n {
                graph
                    .edges
                    .insert(objs[i].addr().as_usize(), vec![objs[(i + 1) % n].addr().as_usize()]);
            }
        }
        gc.gc_start();
        for obj in &objs {
            assert!(!gc.space.is_live_object(*obj));
        }
    }

    #[test]
    fn finalizer_runs_once_per_registered_object() {
        let mut gc = new_collector(1_000);
        let a = gc.new_obj().unwrap();
        let callable1 = gc.new_obj().unwrap();
        let callable2 = gc.new_obj().unwrap();
        gc.define_finalizer(a, callable1, 0);
        gc.define_finalizer(a, callable2, 0);

        gc.gc_start();

        assert_eq!(gc.host.graph.lock().unwrap().finalized.len(), 2);
    }

    #[test]
    fn stress_mode_collects_before_every_allocation() {
        let mut gc = new_collector(200);
        gc.gc_stress_set(true);
        for _ in 0..50 {
            gc.new_obj().unwrap();
        }
        assert!(gc.gc_stat().count >= 50);
    }

    #[test]
    fn object_id_round_trips_while_alive() {
        let mut gc = new_collector(200);
        let obj = gc.new_obj().unwrap();
        let id = gc.object_id(obj);
        assert_eq!(gc.id2ref(id).unwrap(), obj);
    }

    #[test]
    fn gc_disable_prevents_automatic_collection() {
        let mut gc = new_collector(200);
        let previous = gc.gc_disable();
        assert!(!previous);
        assert!(gc.gc_disable());
    }
}
