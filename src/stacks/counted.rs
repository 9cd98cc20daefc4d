use super::{significant, TableFull};

/// Highest repeat count a stored stack can carry. The next repeat of the same
/// stack starts a fresh segment.
pub const COUNT_LIMIT: u8 = 255;

/// Outcome of [`CountedStackTable::record_or_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Incremented(usize),
    Appended(usize),
    /// Nothing to record for a stack without frames.
    Empty,
}

/// A stored stack as it appears in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountedSegment<'a> {
    pub offset: usize,
    pub frames: &'a [u64],
    pub count: u8,
    pub weight: u64,
}

/// Stack table where each slot holds one frame and a parallel count array
/// marks the innermost frame of each stack with its repeat count.
///
/// Slots that are not the top of a stack have a count of zero, so a segment
/// runs from one nonzero count to the next.
pub struct CountedStackTable {
    frames: Box<[u64]>,
    counts: Box<[u8]>,
    weights: Box<[u64]>,
    len: usize,
}

impl CountedStackTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        CountedStackTable {
            frames: vec![0; capacity].into_boxed_slice(),
            counts: vec![0; capacity].into_boxed_slice(),
            weights: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn frames(&self) -> &[u64] {
        &self.frames[..self.len]
    }

    pub fn counts(&self) -> &[u8] {
        &self.counts[..self.len]
    }

    pub fn weights(&self) -> &[u64] {
        &self.weights[..self.len]
    }

    /// Bumps the count of an identical stored stack that is below
    /// [`COUNT_LIMIT`] and adds `weight` to it, or appends the stack as a new
    /// segment with a count of one.
    ///
    /// Stacks longer than the table are truncated. Returns [`TableFull`]
    /// without modifying the table when a new segment does not fit.
    pub fn record_or_increment(&mut self, stack: &[u64], weight: u64) -> Result<Recorded, TableFull> {
        let stack = significant(stack);
        let stack = &stack[..stack.len().min(self.capacity())];
        if stack.is_empty() {
            return Ok(Recorded::Empty);
        }

        let found = self
            .segments()
            .find(|segment| segment.count < COUNT_LIMIT && segment.frames == stack)
            .map(|segment| segment.offset);
        if let Some(offset) = found {
            self.counts[offset] += 1;
            self.weights[offset] = self.weights[offset].wrapping_add(weight);
            return Ok(Recorded::Incremented(offset));
        }

        let available = self.capacity() - self.len;
        if stack.len() > available {
            return Err(TableFull {
                needed: stack.len(),
                available,
            });
        }

        let offset = self.len;
        let end = offset + stack.len();
        self.frames[offset..end].copy_from_slice(stack);
        self.counts[offset..end].fill(0);
        self.weights[offset..end].fill(0);
        self.counts[offset] = 1;
        self.weights[offset] = weight;
        self.len = end;
        Ok(Recorded::Appended(offset))
    }

    pub fn segments(&self) -> impl Iterator<Item = CountedSegment<'_>> + '_ {
        let mut start = 0;
        std::iter::from_fn(move || {
            if start >= self.len {
                return None;
            }
            let end = self.counts[start + 1..self.len]
                .iter()
                .position(|count| *count != 0)
                .map_or(self.len, |length| start + 1 + length);
            let segment = CountedSegment {
                offset: start,
                frames: &self.frames[start..end],
                count: self.counts[start],
                weight: self.weights[start],
            };
            start = end;
            Some(segment)
        })
    }

    pub fn reset(&mut self) {
        self.counts[..self.len].fill(0);
        self.weights[..self.len].fill(0);
        self.len = 0;
    }
}
