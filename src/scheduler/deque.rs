//! A bounded Chase–Lev work-stealing deque (`spec.md` §4.8 "Deque layout",
//! C8), hand-rolled per the spec's own description of `push_bottom`/
//! `pop_bottom`/`pop_top` rather than taken from `crossbeam-deque`, since the
//! spec requires the exact packed `(tag:half_word, top:half_word)` ABA
//! defense (`spec.md` §9 "ABA on deques... do not compress tag away") that
//! `crossbeam-deque`'s public API doesn't expose. `crossbeam-utils`'s
//! `CachePadded` is still used to keep `bottom` and the packed word on
//! separate cache lines, matching how MMTk lays out its own hot
//! scheduler-adjacent atomics (`scheduler::worker::WorkerGroup`).

use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

#[cfg(target_pointer_width = "64")]
const LOG_CAPACITY: u32 = 17;
#[cfg(not(target_pointer_width = "64"))]
const LOG_CAPACITY: u32 = 14;

const CAPACITY: usize = 1 << LOG_CAPACITY;

#[inline]
fn pack(tag: u32, top: u32) -> u64 {
    ((tag as u64) << 32) | top as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// A single producer (the owning worker), multi-consumer (stealers) bounded
/// deque of raw `usize` words; callers cast their own pointer-sized payload
/// (a mark-chunk pointer, a boxed array-continue entry) to and from `usize`.
pub struct Deque {
    buffer: Box<[AtomicUsize]>,
    bottom: CachePadded<AtomicUsize>,
    tag_top: CachePadded<AtomicU64>,
}

impl Deque {
    pub fn new() -> Self {
        let buffer = (0..CAPACITY).map(|_| AtomicUsize::new(0)).collect();
        Deque {
            buffer,
            bottom: CachePadded::new(AtomicUsize::new(0)),
            tag_top: CachePadded::new(AtomicU64::new(pack(0, 0))),
        }
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicUsize {
        &self.buffer[index & (CAPACITY - 1)]
    }

    /// Push onto the bottom. Returns `false` if the deque is full, in which
    /// case the caller spills to its overflow stack (`spec.md` §4.8
    /// "Overflow stack").
    pub fn push_bottom(&self, data: usize) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let (_, t) = unpack(self.tag_top.load(Ordering::Acquire));
        if b.wrapping_sub(t as usize) >= CAPACITY {
            return false;
        }
        self.slot(b).store(data, Ordering::Relaxed);
        fence(Ordering::Release);
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        true
    }

    /// Pop from the bottom (owner only). `spec.md` §4.8 `pop_bottom`.
    pub fn pop_bottom(&self) -> Option<usize> {
        let b = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let old = self.tag_top.load(Ordering::Relaxed);
        let (tag, t) = unpack(old);
        let size = (b.wrapping_sub(t as usize)) as isize;

        if size < 0 {
            // Already empty; resync bottom to top.
            self.bottom.store(t as usize, Ordering::Relaxed);
            return None;
        }

        let data = self.slot(b).load(Ordering::Relaxed);
        if size > 0 {
            return Some(data);
        }

        // Exactly one element left: race a stealer for it.
        let new = pack(tag.wrapping_add(1), b as u32);
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        if self
            .tag_top
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(data)
        } else {
            None
        }
    }

    /// Steal from the top. A single CAS attempt; loss reports empty rather
    /// than retrying (`spec.md` §4.8 `pop_top`: "Loss ⇒ empty return").
    pub fn pop_top(&self) -> Option<usize> {
        let old = self.tag_top.load(Ordering::Acquire);
        let (tag, t) = unpack(old);
        let b = self.bottom.load(Ordering::Acquire);
        if (t as usize) >= b {
            return None;
        }
        let data = self.slot(t as usize).load(Ordering::Relaxed);
        let new = pack(tag, t.wrapping_add(1));
        if self
            .tag_top
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(data)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let (_, t) = unpack(self.tag_top.load(Ordering::Acquire));
        b.wrapping_sub(t as usize).min(CAPACITY)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Deque {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_thread_push_pop_is_lifo() {
        let d = Deque::new();
        assert!(d.push_bottom(1));
        assert!(d.push_bottom(2));
        assert!(d.push_bottom(3));
        assert_eq!(d.pop_bottom(), Some(3));
        assert_eq!(d.pop_bottom(), Some(2));
        assert_eq!(d.pop_bottom(), Some(1));
        assert_eq!(d.pop_bottom(), None);
    }

    #[test]
    fn steal_from_top_is_fifo_relative_to_owner() {
        let d = Deque::new();
        d.push_bottom(10);
        d.push_bottom(20);
        d.push_bottom(30);
        assert_eq!(d.pop_top(), Some(10));
        assert_eq!(d.pop_top(), Some(20));
        assert_eq!(d.pop_bottom(), Some(30));
        assert_eq!(d.pop_top(), None);
    }

    #[test]
    fn concurrent_steal_and_pop_never_duplicate() {
        use std::sync::Arc;
        use std::thread;

        let d = Arc::new(Deque::new());
        let n = 5000usize;
        for i in 0..n {
            assert!(d.push_bottom(i + 1));
        }

        let stealer_d = Arc::clone(&d);
        let stolen = thread::spawn(move || {
            let mut v = Vec::new();
            while let Some(x) = stealer_d.pop_top() {
                v.push(x);
            }
            v
        });

        let mut owned = Vec::new();
        while let Some(x) = d.pop_bottom() {
            owned.push(x);
        }
        let mut stolen = stolen.join().unwrap();

        let mut all: Vec<usize> = Vec::new();
        all.append(&mut owned);
        all.append(&mut stolen);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), n, "no value lost or duplicated across owner/stealer");
    }
}
