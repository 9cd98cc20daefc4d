use crate::stacks::CallStack;

/// Produces the call stack of the calling thread.
pub trait Unwinder {
    /// Fills `stack` with return addresses, innermost first, leaving out the
    /// `skip` innermost frames that belong to the collector itself.
    fn stack_trace(&self, skip: usize, stack: &mut CallStack);
}

/// Unwinds with the `backtrace` crate. Does not allocate and can be used from
/// a signal handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceUnwinder;

impl Unwinder for BacktraceUnwinder {
    fn stack_trace(&self, skip: usize, stack: &mut CallStack) {
        let mut skipped = 0;
        // SAFETY: the unwinder backing `backtrace` on Linux is thread safe; the
        // caller owns `stack` exclusively.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if skipped < skip {
                    skipped += 1;
                    return true;
                }
                stack.push(frame.ip() as u64)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture(skip: usize) -> CallStack {
        let mut stack = CallStack::new();
        BacktraceUnwinder.stack_trace(skip, &mut stack);
        stack
    }

    #[test]
    fn test_stack_trace() {
        let full = capture(0);
        assert!(full.len() > 2);

        let skipped = capture(1);
        assert!(!skipped.is_empty());
        assert!(skipped.len() <= full.len());
    }
}
