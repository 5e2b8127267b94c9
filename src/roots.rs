//! Global root list & conservative stack scanning (`spec.md` §4.5 roots 3, 5).
//!
//! The ordered root list itself (VM self object, finalizer table, symbol
//! registries, ...) is produced by [`crate::vm::Host::enumerate_extra_roots`];
//! this module owns only the two roots the collector manages itself: the
//! `register_root`/`unregister_root` global list (`spec.md` §6) and the
//! conservative machine-stack scan (`spec.md` §4.5 item 3, §9 "Conservative
//! stack scanning").

use std::sync::Mutex;

use crate::heap::ObjectSpace;
use crate::util::address::{Address, ObjectRef};
use crate::vm::Host;

/// A raw pointer to a mutator-owned slot variable registered via
/// `register_root`. The collector dereferences it only during a stop-the-
/// world cycle, when the mutator thread that owns it is blocked.
struct RootSlot(*const usize);

unsafe impl Send for RootSlot {}

/// The conservative global root list (`spec.md` §4.5 item 5, §6
/// "register_root/unregister_root").
pub struct RootList {
    entries: Mutex<Vec<RootSlot>>,
    /// Objects pinned by `register_mark_object` (`spec.md` §6): a VM-owned
    /// array that is itself scanned as a root.
    pinned: Mutex<Vec<ObjectRef>>,
}

impl RootList {
    pub fn new() -> Self {
        RootList {
            entries: Mutex::new(Vec::new()),
            pinned: Mutex::new(Vec::new()),
        }
    }

    /// # Safety
    /// `slot` must remain valid (point at a `usize`-sized slot-ref variable
    /// the caller owns) until a matching `unregister_root` call.
    pub unsafe fn register_root(&self, slot: *const usize) {
        self.entries.lock().unwrap().push(RootSlot(slot));
    }

    pub fn unregister_root(&self, slot: *const usize) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(pos) = entries.iter().position(|r| r.0 == slot) {
            entries.swap_remove(pos);
        }
    }

    pub fn register_mark_object(&self, obj: ObjectRef) {
        self.pinned.lock().unwrap().push(obj);
    }

    /// Enumerate every currently live value stored in registered root
    /// variables plus every pinned object, in that order.
    pub fn for_each(&self, mut push: impl FnMut(ObjectRef)) {
        for slot in self.entries.lock().unwrap().iter() {
            let value = unsafe { *slot.0 };
            if value != 0 {
                push(unsafe { ObjectRef::from_address(Address::from_usize(value)) });
            }
        }
        for obj in self.pinned.lock().unwrap().iter() {
            push(*obj);
        }
    }
}

impl Default for RootList {
    fn default() -> Self {
        Self::new()
    }
}

/// Conservatively scan `[lo, hi)` (a machine-stack range, word-aligned) for
/// values that look like live object references, offering each candidate to
/// `push`. `spec.md` §4.5 item 3: a word is accepted as a root iff it (a)
/// passes `is_pointer_to_heap`, (b) lands on a slot-aligned address, and
/// (c) the slot it names has non-zero flags and the host agrees it looks
/// like a live object.
///
/// # Safety
/// `[lo, hi)` must be readable memory containing `usize`-aligned words (a
/// captured machine stack/register-save area).
pub unsafe fn scan_conservative_range<H: Host>(
    lo: *const usize,
    hi: *const usize,
    space: &ObjectSpace<H>,
    host: &H,
    mut push: impl FnMut(ObjectRef),
) {
    debug_assert!((lo as usize) <= (hi as usize));
    let mut cursor = lo;
    while cursor < hi {
        let word = *cursor;
        let candidate = Address::from_usize(word);
        if let Some(obj) = space.is_candidate_object(candidate) {
            if host.looks_like_live_object(obj) && host.accept_conservative_root(candidate) {
                push(obj);
            }
        }
        cursor = cursor.add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_round_trip() {
        let list = RootList::new();
        let value: usize = 0;
        unsafe { list.register_root(&value as *const usize) };
        let mut seen = 0;
        list.for_each(|_| seen += 1);
        assert_eq!(seen, 0, "a zeroed slot contributes no root");
        list.unregister_root(&value as *const usize);
        let mut again = 0;
        list.for_each(|_| again += 1);
        assert_eq!(again, 0);
    }

    #[test]
    fn pinned_objects_are_enumerated() {
        let list = RootList::new();
        let obj = unsafe { ObjectRef::from_address(Address::from_usize(0x1000)) };
        list.register_mark_object(obj);
        let mut seen = Vec::new();
        list.for_each(|o| seen.push(o));
        assert_eq!(seen, vec![obj]);
    }
}
