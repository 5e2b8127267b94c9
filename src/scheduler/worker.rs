//! Per-worker mark state (`spec.md` §4.8 "Per-worker state", "Chunked mark
//! stacks", "Array-continue deque", "Stealing").

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use spin::Mutex;

use crate::util::address::ObjectRef;

use super::deque::Deque;
use super::overflow::OverflowStack;

/// Objects discovered by a worker are appended here; 63 refs per chunk plus
/// one `len` field keeps a chunk at a tidy 512 bytes on 64-bit
/// (`spec.md` §4.8 "Chunked mark stacks").
pub const CHUNK_CAPACITY: usize = 63;

pub struct MarkChunk {
    refs: [usize; CHUNK_CAPACITY],
    len: usize,
}

impl MarkChunk {
    pub fn new() -> Box<Self> {
        Box::new(MarkChunk {
            refs: [0; CHUNK_CAPACITY],
            len: 0,
        })
    }

    pub fn is_full(&self) -> bool {
        self.len == CHUNK_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, obj: ObjectRef) {
        debug_assert!(!self.is_full());
        self.refs[self.len] = obj.addr().as_usize();
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<ObjectRef> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        let addr = self.refs[self.len];
        Some(unsafe { ObjectRef::from_address(crate::util::address::Address::from_usize(addr)) })
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Box pointers for chunks going onto a [`Deque`] are round-tripped through
/// raw pointers, since the deque only knows how to carry `usize`s.
pub fn chunk_to_word(chunk: Box<MarkChunk>) -> usize {
    Box::into_raw(chunk) as usize
}

/// # Safety
/// `word` must have been produced by [`chunk_to_word`] and not already
/// reclaimed.
pub unsafe fn chunk_from_word(word: usize) -> Box<MarkChunk> {
    Box::from_raw(word as *mut MarkChunk)
}

/// `(array_object, start_index)` entry for sliced array marking
/// (`spec.md` §4.8 "Array-continue deque"). Array marking proceeds in
/// `ARRAY_CONTINUE_STRIDE`-element slices; when a slice finishes short of
/// the array's end, the remainder is offered to stealers as one of these.
pub const ARRAY_CONTINUE_STRIDE: usize = 512;

pub struct ArrayContinueEntry {
    pub array: ObjectRef,
    pub start: usize,
}

pub fn array_entry_to_word(entry: Box<ArrayContinueEntry>) -> usize {
    Box::into_raw(entry) as usize
}

/// # Safety
/// `word` must have been produced by [`array_entry_to_word`] and not already
/// reclaimed.
pub unsafe fn array_entry_from_word(word: usize) -> Box<ArrayContinueEntry> {
    Box::from_raw(word as *mut ArrayContinueEntry)
}

/// Collector-global pool of unused mark chunks, refilled from and drained
/// into by every worker's local cache. Guarded by one mutex, per `spec.md`
/// §4.8 "global free list guarded by the worker-group lock".
pub struct GlobalChunkPool {
    free: Mutex<Vec<Box<MarkChunk>>>,
}

impl GlobalChunkPool {
    pub fn new() -> Self {
        GlobalChunkPool {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Box<MarkChunk> {
        self.free.lock().pop().unwrap_or_else(MarkChunk::new)
    }

    pub fn give_back(&self, chunks: impl IntoIterator<Item = Box<MarkChunk>>) {
        self.free.lock().extend(chunks);
    }
}

impl Default for GlobalChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker's private chunk cache; over-accumulation (`spec.md` §4.8
/// "over-accumulation (> 80%) returns chunks to the global pool") is
/// resolved by shrinking the local cache by half back into the global pool.
pub struct LocalChunkCache {
    chunks: Vec<Box<MarkChunk>>,
    target_capacity: usize,
}

impl LocalChunkCache {
    pub fn new(target_capacity: usize) -> Self {
        LocalChunkCache {
            chunks: Vec::new(),
            target_capacity: target_capacity.max(1),
        }
    }

    pub fn take(&mut self, global: &GlobalChunkPool) -> Box<MarkChunk> {
        self.chunks.pop().unwrap_or_else(|| global.take())
    }

    pub fn give_back(&mut self, chunk: Box<MarkChunk>, global: &GlobalChunkPool) {
        self.chunks.push(chunk);
        let threshold = (self.target_capacity * 4) / 5; // 80%
        if self.chunks.len() > threshold {
            let keep = self.chunks.len() / 2;
            let overflow = self.chunks.split_off(keep);
            global.give_back(overflow);
        }
    }
}

/// Per-worker scheduling state (`spec.md` §4.8 "Per-worker state").
pub struct Worker {
    pub index: usize,
    pub chunk_deque: Deque,
    pub array_deque: Deque,
    pub chunk_overflow: Mutex<OverflowStack>,
    pub array_overflow: Mutex<OverflowStack>,
    idle: AtomicUsize,
}

impl Worker {
    pub fn new(index: usize) -> Self {
        Worker {
            index,
            chunk_deque: Deque::new(),
            array_deque: Deque::new(),
            chunk_overflow: Mutex::new(OverflowStack::new()),
            array_overflow: Mutex::new(OverflowStack::new()),
            idle: AtomicUsize::new(0),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle as usize, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire) != 0
    }

    pub fn local_work_len(&self) -> usize {
        self.chunk_deque.len() + self.array_deque.len()
    }
}

/// Pick a steal victim by index (`spec.md` §4.8 "Stealing"): with at least
/// three workers, sample two *other* workers uniformly at random and steal
/// from whichever reports more local work; with exactly two, always target
/// the other one.
pub fn pick_steal_victim(workers: &[Worker], own_index: usize, rng: &mut impl Rng) -> Option<usize> {
    let n = workers.len();
    if n < 2 {
        return None;
    }
    if n == 2 {
        return Some(1 - own_index);
    }
    let mut a = own_index;
    while a == own_index {
        a = rng.random_range(0..n);
    }
    let mut b = own_index;
    while b == own_index || b == a {
        b = rng.random_range(0..n);
    }
    if workers[a].local_work_len() >= workers[b].local_work_len() {
        Some(a)
    } else {
        Some(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_push_pop_is_lifo_and_bounded() {
        let mut chunk = MarkChunk::new();
        for i in 0..CHUNK_CAPACITY {
            chunk.push(unsafe {
                ObjectRef::from_address(crate::util::address::Address::from_usize(i + 1))
            });
        }
        assert!(chunk.is_full());
        for i in (0..CHUNK_CAPACITY).rev() {
            assert_eq!(chunk.pop().unwrap().addr().as_usize(), i + 1);
        }
        assert!(chunk.pop().is_none());
    }

    #[test]
    fn local_cache_shrinks_past_80_percent() {
        let global = GlobalChunkPool::new();
        let mut local = LocalChunkCache::new(10);
        for _ in 0..9 {
            local.give_back(MarkChunk::new(), &global);
        }
        assert!(local.chunks.len() <= 5);
    }

    #[test]
    fn two_worker_steal_always_targets_peer() {
        let workers = vec![Worker::new(0), Worker::new(1)];
        let mut rng = rand::rng();
        assert_eq!(pick_steal_victim(&workers, 0, &mut rng), Some(1));
        assert_eq!(pick_steal_victim(&workers, 1, &mut rng), Some(0));
    }
}
