//! Per-worker overflow stack (`spec.md` §4.8 "Overflow stack"): when a
//! worker's deque is full, further pushes spill here instead of blocking.
//! Backed by a linked list of 4 KiB pages, since a single worker's overflow
//! is rare and bursty, and paying for a full dynamic array up front would
//! waste memory on the common case where it's never touched.

const PAGE_BYTES: usize = 4096;
const ENTRIES_PER_PAGE: usize = PAGE_BYTES / std::mem::size_of::<usize>();
/// Pages beyond this count are freed instead of cached on pop
/// (`spec.md` §4.8 "Overflow pages beyond OVERFLOW_STACK_PAGE_CACHE_LIMIT (4)
/// are cached rather than freed", i.e. up to 4 are kept for reuse).
const OVERFLOW_STACK_PAGE_CACHE_LIMIT: usize = 4;

struct OverflowPage {
    entries: Vec<usize>,
}

impl OverflowPage {
    fn new() -> Self {
        OverflowPage {
            entries: Vec::with_capacity(ENTRIES_PER_PAGE),
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= ENTRIES_PER_PAGE
    }
}

/// A single worker's overflow stack: a stack of pages, each a stack of
/// `usize` entries.
pub struct OverflowStack {
    pages: Vec<OverflowPage>,
    cache: Vec<OverflowPage>,
}

impl OverflowStack {
    pub fn new() -> Self {
        OverflowStack {
            pages: vec![OverflowPage::new()],
            cache: Vec::new(),
        }
    }

    pub fn push(&mut self, data: usize) {
        if self.pages.last().unwrap().is_full() {
            let page = self.cache.pop().unwrap_or_else(OverflowPage::new);
            self.pages.push(page);
        }
        self.pages.last_mut().unwrap().entries.push(data);
    }

    pub fn pop(&mut self) -> Option<usize> {
        loop {
            let top = self.pages.last_mut()?;
            if let Some(v) = top.entries.pop() {
                return Some(v);
            }
            if self.pages.len() == 1 {
                return None;
            }
            let mut drained = self.pages.pop().unwrap();
            drained.entries.clear();
            if self.cache.len() < OVERFLOW_STACK_PAGE_CACHE_LIMIT {
                self.cache.push(drained);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.len() == 1 && self.pages[0].entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.entries.len()).sum()
    }
}

impl Default for OverflowStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_multiple_pages_in_lifo_order() {
        let mut stack = OverflowStack::new();
        let n = ENTRIES_PER_PAGE * 3 + 5;
        for i in 0..n {
            stack.push(i);
        }
        for i in (0..n).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn drained_pages_are_cached_up_to_the_limit() {
        let mut stack = OverflowStack::new();
        let n = ENTRIES_PER_PAGE * 6;
        for i in 0..n {
            stack.push(i);
        }
        for _ in 0..n {
            stack.pop();
        }
        assert!(stack.cache.len() <= OVERFLOW_STACK_PAGE_CACHE_LIMIT);
    }
}
