//! The generic mark driver (`spec.md` §4.5 "Tail-recursion discipline", C5).
//!
//! Child enumeration itself is entirely the host's problem
//! (`Host::trace_children`); this module only provides the traversal
//! discipline the spec requires around that callback: recurse through
//! `trace_children` directly as long as depth stays under the bound, and
//! once it's exceeded, defer the object onto an overflow mark stack that a
//! post-pass drains at depth zero. This keeps a pathological `NODE_SCOPE`-
//! style child chain from blowing the native stack, without requiring the
//! host to know anything about mark-stack bookkeeping.

use crate::heap::ObjectSpace;
use crate::util::address::ObjectRef;
use crate::vm::{Host, Tracer};

/// Recursion bound before an object is deferred to the overflow mark stack
/// (`spec.md` §4.5 "When recursion depth exceeds a bound (256)...").
pub const MAX_TRACE_DEPTH: usize = 256;

pub struct MarkDriver<'a, H: Host> {
    space: &'a ObjectSpace<H>,
    host: &'a H,
    depth: usize,
    overflow: Vec<ObjectRef>,
    pub marked_count: usize,
}

impl<'a, H: Host> MarkDriver<'a, H> {
    pub fn new(space: &'a ObjectSpace<H>, host: &'a H) -> Self {
        MarkDriver {
            space,
            host,
            depth: 0,
            overflow: Vec::new(),
            marked_count: 0,
        }
    }

    /// Mark and recurse into a root reference.
    pub fn trace_root(&mut self, obj: ObjectRef) {
        self.trace_edge(obj);
    }

    /// Drain the overflow mark stack built up by depth-bounded deferrals.
    /// Each popped object resumes tracing at depth zero.
    pub fn drain(&mut self) {
        while let Some(obj) = self.overflow.pop() {
            self.depth = 0;
            self.host.trace_children(obj, self);
        }
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }
}

impl<'a, H: Host> Tracer for MarkDriver<'a, H> {
    fn trace_edge(&mut self, child: ObjectRef) {
        if !self.space.is_live_object(child) {
            // A conservative or stale edge pointing at a freed/never-allocated
            // slot; the original implementation treats this as impossible for
            // precise edges and fatal for roots, but tail-called child edges
            // from a host can't always be pre-validated, so we just drop it.
            return;
        }
        if !self.space.mark(child) {
            return;
        }
        self.marked_count += 1;
        if self.depth >= MAX_TRACE_DEPTH {
            self.overflow.push(child);
            return;
        }
        self.depth += 1;
        self.host.trace_children(child, self);
        self.depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::vm::ReleaseAction;
    use std::cell::RefCell;

    struct ChainHost {
        // child[i] is the one child of object i, if any.
        next: RefCell<std::collections::HashMap<usize, usize>>,
    }

    impl Host for ChainHost {
        const SLOT_PAYLOAD_SIZE: usize = 16;
        fn enumerate_extra_roots(&self, _push: &mut dyn FnMut(ObjectRef)) {}
        fn trace_children(&self, obj: ObjectRef, tracer: &mut dyn Tracer) {
            if let Some(&next) = self.next.borrow().get(&obj.addr().as_usize()) {
                tracer.trace_edge(unsafe {
                    ObjectRef::from_address(crate::util::address::Address::from_usize(next))
                });
            }
        }
        fn looks_like_live_object(&self, _obj: ObjectRef) -> bool {
            true
        }
        fn free_object(&self, _obj: ObjectRef) -> ReleaseAction {
            ReleaseAction::Freed
        }
        fn invoke_finalizer(&self, _callable: ObjectRef, _safe_level: u8, _dead_object_id: usize) {}
    }

    #[test]
    fn long_chain_overflows_then_drains() {
        let options = Options {
            initial_heap_min_slots: 2000,
            ..Options::default()
        };
        let mut space: ObjectSpace<ChainHost> = ObjectSpace::new(options);
        let host = ChainHost {
            next: RefCell::new(std::collections::HashMap::new()),
        };

        let mut objs = Vec::new();
        for _ in 0..600 {
            objs.push(space.allocate(|_| {}).unwrap());
        }
        for w in objs.windows(2) {
            host.next
                .borrow_mut()
                .insert(w[0].addr().as_usize(), w[1].addr().as_usize());
        }

        let mut driver = MarkDriver::new(&space, &host);
        driver.trace_root(objs[0]);
        driver.drain();

        assert_eq!(driver.marked_count, 600);
        for obj in &objs {
            assert!(space.is_marked(*obj));
        }
    }
}
