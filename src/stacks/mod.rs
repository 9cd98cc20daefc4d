//! Call stacks and the per-epoch tables that deduplicate them.

mod counted;
mod terminated;

pub use counted::{CountedSegment, CountedStackTable, Recorded, COUNT_LIMIT};
pub use terminated::{segments, StackTraceTable};

use thiserror::Error;

/// Deepest stack any collector records.
pub const MAX_FRAMES: usize = 48;

/// The table cannot take a stack until its owner flushes and resets it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("stack of {needed} slots does not fit, {available} slots left")]
pub struct TableFull {
    pub needed: usize,
    pub available: usize,
}

/// Fixed-size call stack, innermost frame first. Lives on the stack so it
/// can be filled inside a signal handler.
#[derive(Clone, Copy)]
pub struct CallStack {
    frames: [u64; MAX_FRAMES],
    len: usize,
}

impl CallStack {
    pub const fn new() -> Self {
        CallStack {
            frames: [0; MAX_FRAMES],
            len: 0,
        }
    }

    /// Copies up to [`MAX_FRAMES`] frames.
    pub fn from_frames(frames: &[u64]) -> Self {
        let mut stack = Self::new();
        for frame in frames {
            if !stack.push(*frame) {
                break;
            }
        }
        stack
    }

    /// Returns false once the stack is full.
    pub fn push(&mut self, frame: u64) -> bool {
        if self.len == MAX_FRAMES {
            return false;
        }
        self.frames[self.len] = frame;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.frames[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Replaces the innermost frame, e.g. with the address of a wrapped
    /// function instead of the wrapper's call site.
    pub fn set_top(&mut self, frame: u64) {
        if self.len == 0 {
            self.push(frame);
        } else {
            self.frames[0] = frame;
        }
    }

    /// Drops the frames above `pc`, which belong to the signal handler and
    /// the unwinder. When `pc` is not on the stack it is pushed in front.
    pub fn anchor_at(&mut self, pc: u64) {
        match self.as_slice().iter().position(|frame| *frame == pc) {
            Some(0) => {}
            Some(position) => {
                self.frames.copy_within(position..self.len, 0);
                self.len -= position;
            }
            None => {
                let len = self.len.min(MAX_FRAMES - 1);
                self.frames.copy_within(0..len, 1);
                self.frames[0] = pc;
                self.len = len + 1;
            }
        }
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|frame| format!("{:#x}", frame)))
            .finish()
    }
}

/// Frames up to the first zero, which would otherwise read as a terminator.
fn significant(stack: &[u64]) -> &[u64] {
    match stack.iter().position(|frame| *frame == 0) {
        Some(end) => &stack[..end],
        None => stack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_stack_is_bounded() {
        let frames: Vec<u64> = (1..=100).collect();
        let stack = CallStack::from_frames(&frames);
        assert_eq!(stack.len(), MAX_FRAMES);
        assert_eq!(stack.as_slice()[0], 1);
    }

    #[test]
    fn test_set_top() {
        let mut stack = CallStack::new();
        stack.set_top(0xa);
        assert_eq!(stack.as_slice(), &[0xa]);

        let mut stack = CallStack::from_frames(&[1, 2, 3]);
        stack.set_top(0xf);
        assert_eq!(stack.as_slice(), &[0xf, 2, 3]);
    }

    #[test]
    fn test_anchor_at() {
        let mut stack = CallStack::from_frames(&[0x1, 0x2, 0x500, 0x600]);
        stack.anchor_at(0x500);
        assert_eq!(stack.as_slice(), &[0x500, 0x600]);

        let mut stack = CallStack::from_frames(&[0x1, 0x2]);
        stack.anchor_at(0x900);
        assert_eq!(stack.as_slice(), &[0x900, 0x1, 0x2]);
    }

    #[test]
    fn test_significant_frames() {
        assert_eq!(significant(&[1, 2, 0, 3]), &[1, 2]);
        assert_eq!(significant(&[1, 2]), &[1, 2]);
        assert!(significant(&[0]).is_empty());
    }
}
