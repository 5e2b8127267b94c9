//! A tracing, non-moving, non-generational, stop-the-world mark-and-sweep
//! collector, parameterized over an embedding host's object model.
//!
//! Logically, this crate has three layers:
//! * [Heap](heap/struct.ObjectSpace.html): the page pool, sorted page index,
//!   free-list allocator and growth policy, and allocation accountant a
//!   mutator thread allocates from directly.
//! * GC components: [roots](roots/index.html), the
//!   [mark driver](trace/struct.MarkDriver.html), the
//!   [parallel mark scheduler](scheduler/index.html), the
//!   [sweep engine](sweep/index.html), and the
//!   [finalizer pipeline](finalize/index.html), each independently testable
//!   and composed by [`gc::Collector`].
//! * [The embedding interface](vm/trait.Host.html): everything a host
//!   language implementation supplies about its own object model, kept to
//!   exactly what the collector needs and nothing more.
//!
//! [`gc::Collector`] is the type embedders actually hold: one instance per
//! heap, generic over a [`vm::Host`] implementation.

pub mod error;
pub mod finalize;
pub mod gc;
pub mod heap;
pub mod options;
pub mod roots;
pub mod scheduler;
pub mod stats;
pub mod sweep;
pub mod trace;
pub mod util;
pub mod vm;

pub use crate::error::{GcError, GcResult};
pub use crate::gc::{Collector, GcStat};
pub use crate::options::Options;
pub use crate::stats::CycleRecord;
pub use crate::util::address::{Address, ObjectRef};
pub use crate::vm::{Host, ReleaseAction, Tracer};
