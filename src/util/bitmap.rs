//! Per-page mark bitmap (`spec.md` §4.4, C4).
//!
//! One bit per slot, addressed as `(index / word_bits, index % word_bits)`.
//! Kept as its own buffer rather than a header bit so clearing a page's mark
//! state at the end of sweep is a single bulk zero, and so the buffer can be
//! recycled through the free-bitmap pool (`spec.md` §4.1) instead of
//! malloc/free churn.

use std::sync::atomic::{AtomicUsize, Ordering};

const WORD_BITS: usize = usize::BITS as usize;

/// A bitmap with one bit per slot index, backed by a boxed slice of atomic
/// words so concurrent mark workers can set distinct bits without a lock
/// (distinct workers never race on the *same* bit for the same object,
/// since each object is marked at most once along any single worker's
/// traversal, but two workers may set bits in the same word concurrently).
pub struct MarkBitmap {
    words: Box<[AtomicUsize]>,
}

impl MarkBitmap {
    pub fn words_for(slot_count: usize) -> usize {
        slot_count.div_ceil(WORD_BITS)
    }

    pub fn new(slot_count: usize) -> Self {
        let n = Self::words_for(slot_count);
        let words = (0..n).map(|_| AtomicUsize::new(0)).collect();
        MarkBitmap { words }
    }

    #[inline]
    fn locate(index: usize) -> (usize, usize) {
        (index / WORD_BITS, index % WORD_BITS)
    }

    /// Returns `true` if this call set the bit (i.e. it was the first marker
    /// to find the object white); `false` if it was already marked.
    #[inline]
    pub fn test_and_set(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        let mask = 1usize << bit;
        let prev = self.words[word].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    #[inline]
    pub fn is_marked(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.words[word].load(Ordering::Acquire) & (1usize << bit) != 0
    }

    /// Clear every bit. Called once per page at the end of sweep (`spec.md`
    /// §4.6 "Clear the page's mark bitmap").
    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Release);
        }
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_bits() {
        let bm = MarkBitmap::new(200);
        assert!(!bm.is_marked(5));
        assert!(bm.test_and_set(5));
        assert!(bm.is_marked(5));
        // Second mark of the same object reports "already marked".
        assert!(!bm.test_and_set(5));
        assert!(!bm.is_marked(130));
        bm.test_and_set(130);
        assert!(bm.is_marked(130));
        assert!(bm.is_marked(5));
    }

    #[test]
    fn clear_resets_all() {
        let bm = MarkBitmap::new(64);
        bm.test_and_set(0);
        bm.test_and_set(63);
        bm.clear();
        assert!(!bm.is_marked(0));
        assert!(!bm.is_marked(63));
    }

    #[test]
    fn words_for_rounds_up() {
        assert_eq!(MarkBitmap::words_for(1), 1);
        assert_eq!(MarkBitmap::words_for(WORD_BITS), 1);
        assert_eq!(MarkBitmap::words_for(WORD_BITS + 1), 2);
    }
}
