//! The embedding interface: everything the collector needs from the host
//! language's object model, but nothing more (`spec.md` §1 "Non-goals: ...
//! the host language's object model beyond what the tracer needs").
//!
//! `Host` is this collector's analogue of MMTk's `VMBinding` trait bundle
//! (`vm::VMBinding` composing `ObjectModel`/`Scanning`/`Collection`): a
//! single trait an embedder implements once, parameterizing the generic
//! `Collector<H>` over it. Where `spec.md` §4.5 lists the type-directed
//! child-enumeration rules for a specific host language's primitive kinds
//! (Object, Class, Array, Hash, ...), that switch is the host's problem to
//! implement inside [`Host::trace_children`]; the collector itself only
//! ever drives the generic traversal discipline (tail-recursion, the
//! depth-256 overflow bound, mark-stack draining).

use crate::util::address::{Address, ObjectRef};

/// What happened when the collector asked the host to release a slot whose
/// object turned out to be unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// The slot can be zeroed and linked onto the free-list immediately.
    Freed,
    /// The host needs to run more teardown later (a registered finalizer, or
    /// a C-level `dfree` callback that was deferred); the collector turns
    /// the slot into a zombie instead of freeing it.
    Deferred,
}

/// Sink a child edge is reported to. Implemented by the collector's mark
/// driver; hosts only ever see `&mut dyn Tracer`.
pub trait Tracer {
    fn trace_edge(&mut self, child: ObjectRef);
}

/// Everything the collector needs from the embedding host.
///
/// All methods that inspect or mutate a specific object take an
/// [`ObjectRef`], which the host must treat as opaque beyond using it to
/// recover its own object layout (typically `ObjectRef::addr()` cast back to
/// the host's representation, since the collector guarantees the payload
/// bytes immediately follow the slot header it owns).
pub trait Host: Sized {
    /// Bytes of payload every slot reserves for this host's largest object
    /// variant (`spec.md` §3 "fixed-size slot", a union-of-all-variants
    /// size in the host language this collector embeds into).
    const SLOT_PAYLOAD_SIZE: usize;

    /// Called once per cycle before conservative stack scanning, for any
    /// root the host tracks outside the collector's own global root list
    /// (`spec.md` §4.5 roots 1, 4, 6, 7, 8, 9: VM self object, symbol/encoding
    /// registries, end-of-process procs and global bindings, class/ivar
    /// tables, parser state, unlinked method entries).
    fn enumerate_extra_roots(&self, push: &mut dyn FnMut(ObjectRef));

    /// Type-directed child enumeration for one object (`spec.md` §4.5
    /// "Child enumeration"). The host calls `tracer.trace_edge(child)` for
    /// every managed reference `obj` holds. The collector handles the
    /// tail-recursion/depth-bound/mark-stack-overflow discipline around this
    /// call; the host just needs to enumerate, in whatever order is
    /// convenient.
    fn trace_children(&self, obj: ObjectRef, tracer: &mut dyn Tracer);

    /// Conservative-root validation predicate (`spec.md` §4.5 item 3c): does
    /// this slot currently look like it holds a live object, i.e. is its
    /// type/class information non-null? Called only after the collector has
    /// already verified the address is page-resident and slot-aligned.
    fn looks_like_live_object(&self, obj: ObjectRef) -> bool;

    /// Run any C-level free callback the object's type registers
    /// (`spec.md` §4.6 `obj_free`). Return [`ReleaseAction::Deferred`] if the
    /// object needs to become a zombie (its own callback deferred teardown,
    /// independent of whether a Ruby-level finalizer is also registered,
    /// since the collector checks `HAS_FINALIZER` itself).
    fn free_object(&self, obj: ObjectRef) -> ReleaseAction;

    /// Invoke a registered finalizer callable after its object has become
    /// fully unreachable (`spec.md` §4.7). `dead_object_id` is the stable id
    /// the finalizer receives in place of the now-freed object.
    fn invoke_finalizer(&self, callable: ObjectRef, safe_level: u8, dead_object_id: usize);

    /// Whether this particular object is exempt from the at-exit finalization
    /// fixed point (`spec.md` §4.7 "Threads, Mutexes, and certain internal
    /// objects are skipped even at exit"). Defaults to `false`.
    fn survives_shutdown(&self, _obj: ObjectRef) -> bool {
        false
    }

    /// Large-array support for the parallel mark scheduler's array-continue
    /// work-stealing (`spec.md` §4.8 "Array-continue deque"). Returning
    /// `Some(len)` tells the scheduler `obj` is a `len`-element array it may
    /// slice across workers via [`Host::trace_array_element`] instead of
    /// enumerating it as a single `trace_children` unit. Default: no host
    /// type opts in, and every object is traced as one indivisible unit.
    fn array_len(&self, _obj: ObjectRef) -> Option<usize> {
        None
    }

    /// Trace the reference stored at `index` of the array `obj` (only called
    /// for objects [`Host::array_len`] returned `Some` for).
    fn trace_array_element(&self, _obj: ObjectRef, _index: usize, _tracer: &mut dyn Tracer) {}

    /// Offer one machine word found during conservative stack/register
    /// scanning. The collector has already validated it as a page-resident,
    /// slot-aligned, live-looking address before calling this; it exists so
    /// hosts can apply any final type-specific sanity check before accepting
    /// the value as a root. Default accepts unconditionally.
    fn accept_conservative_root(&self, _candidate: Address) -> bool {
        true
    }

    /// The current mutator's machine-stack bounds (`spec.md` §4.5 item 3,
    /// §1 "Thread/VM integration: ... stack scanning ... invoked through
    /// named hooks"). Returns `None` if the host has nothing to offer, in
    /// which case the cycle runs without a conservative scan (acceptable
    /// only if the host supplies precise roots some other way, e.g. through
    /// [`Host::enumerate_extra_roots`]). Default: no stack to scan.
    fn conservative_stack_range(&self) -> Option<(*const usize, *const usize)> {
        None
    }

    /// A short, stable label for `obj`'s primitive kind, used only for the
    /// per-type breakdown in `count_objects` (`spec.md` §6). The collector
    /// never branches on this value. Default: every object reports the same
    /// label, which collapses `count_objects` to a single bucket.
    fn type_tag(&self, _obj: ObjectRef) -> &'static str {
        "object"
    }
}
