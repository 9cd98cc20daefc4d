use super::{significant, TableFull};

/// Deduplicating table of zero-terminated call stacks.
///
/// Stacks are packed end to end into one preallocated frame array, each
/// followed by a `0`. A stack is identified by the offset of its first
/// frame. Lookups are a linear scan that skips from terminator to
/// terminator, which is fine for the few hundred stacks an epoch holds.
pub struct StackTraceTable {
    frames: Box<[u64]>,
    len: usize,
    stored: usize,
}

impl StackTraceTable {
    pub fn with_capacity(capacity: usize) -> Self {
        StackTraceTable {
            frames: vec![0; capacity.max(1)].into_boxed_slice(),
            len: 0,
            stored: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Slots in use, terminators included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct stacks stored.
    pub fn sequences(&self) -> usize {
        self.stored
    }

    /// The packed frames as they go on the wire.
    pub fn as_slice(&self) -> &[u64] {
        &self.frames[..self.len]
    }

    /// Slots a stack will take once stored.
    pub fn slots_for(&self, stack: &[u64]) -> usize {
        self.clamp(stack).len() + 1
    }

    /// Returns the offset of `stack`, appending it when it is new.
    ///
    /// Frames after a zero are ignored. A stack longer than the whole table
    /// is truncated so that it always fits an empty table. Returns
    /// [`TableFull`] without modifying the table when the stack is new and
    /// does not fit; the owner flushes, resets, and retries.
    pub fn intern_if_new(&mut self, stack: &[u64]) -> Result<usize, TableFull> {
        let stack = self.clamp(stack);

        if let Some(offset) = self.find(stack) {
            return Ok(offset);
        }

        let needed = stack.len() + 1;
        let available = self.capacity() - self.len;
        if needed > available {
            return Err(TableFull { needed, available });
        }

        let offset = self.len;
        self.frames[offset..offset + stack.len()].copy_from_slice(stack);
        self.frames[offset + stack.len()] = 0;
        self.len += needed;
        self.stored += 1;
        Ok(offset)
    }

    /// Offset of an identical, already stored stack.
    pub fn find(&self, stack: &[u64]) -> Option<usize> {
        segments(self.as_slice())
            .find(|(_, stored)| *stored == stack)
            .map(|(offset, _)| offset)
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.stored = 0;
    }

    fn clamp<'a>(&self, stack: &'a [u64]) -> &'a [u64] {
        let stack = significant(stack);
        &stack[..stack.len().min(self.capacity() - 1)]
    }
}

/// Iterates `(offset, frames)` over zero-terminated stacks. A trailing stack
/// without terminator is still yielded.
pub fn segments(frames: &[u64]) -> impl Iterator<Item = (usize, &[u64])> + '_ {
    let mut start = 0;
    std::iter::from_fn(move || {
        if start >= frames.len() {
            return None;
        }
        let end = frames[start..]
            .iter()
            .position(|frame| *frame == 0)
            .map_or(frames.len(), |length| start + length);
        let segment = (start, &frames[start..end]);
        start = end + 1;
        Some(segment)
    })
}
