use std::collections::VecDeque;

/// Ordered buffer of chunks with a running total size.
///
/// Each entry's size is computed once, at enqueue time, and never recomputed;
/// `total_size` is maintained incrementally on push/pop. Invariant:
/// `total_size == sum(entry.size)` after every operation.
pub(crate) struct SizedQueue<T> {
    entries: VecDeque<SizedEntry<T>>,
    total_size: usize,
}

pub(crate) struct SizedEntry<T> {
    pub value: T,
    pub size: usize,
}

impl<T> SizedQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0,
        }
    }

    pub fn push(&mut self, value: T, size: usize) {
        self.entries.push_back(SizedEntry { value, size });
        self.total_size += size;
    }

    pub fn pop(&mut self) -> Option<SizedEntry<T>> {
        let entry = self.entries.pop_front()?;
        self.total_size -= entry.size;
        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Drop all entries, returning them for rejection handling.
    pub fn reset(&mut self) -> VecDeque<SizedEntry<T>> {
        self.total_size = 0;
        std::mem::take(&mut self.entries)
    }
}
