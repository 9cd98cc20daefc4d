use super::{CollectorKind, ThreadLocalStore};
use crate::buffer::{TraceBuffer, TraceObservation, TraceRecord};
use crate::source::{BacktraceUnwinder, CallSource, Unwinder};
use crate::stacks::CallStack;
use crate::util::now;

use std::cell::Cell;
use std::thread::LocalKey;

/// A wrapped call that is being traced, from [`TraceKind::start_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a started event has to be recorded to leave the wrapper"]
pub struct TracedCall {
    pub start_time: u64,
}

fn add_depth(nesting: &'static LocalKey<Cell<u32>>, delta: i32) -> u32 {
    nesting
        .try_with(|depth| {
            let updated = depth.get().saturating_add_signed(delta);
            depth.set(updated);
            updated
        })
        .unwrap_or(0)
}

/// Collectors recording wrapped library calls as events of type `E`.
///
/// A wrapper calls [`TraceKind::start_event`] before the real function and
/// [`TraceKind::record_event`] after it. Calls made while another traced
/// call is in progress on the same thread, including the ones made by the
/// collector itself, are not recorded.
pub trait TraceKind<E: TraceRecord>:
    CollectorKind<Buffer = TraceBuffer<E>, Source = CallSource>
{
    /// Wrapper nesting depth of the calling thread.
    fn nesting() -> &'static LocalKey<Cell<u32>>;

    /// Begins tracing a call to `function`, unless the function is not
    /// traced or collection is paused.
    fn start_event(function: &str) -> Option<TracedCall> {
        let traced = Self::slot()
            .with_installed(|collector| {
                !collector.is_paused() && collector.source().is_traced(function)
            })
            .unwrap_or(false);
        if !traced {
            return None;
        }
        add_depth(Self::nesting(), 1);
        Some(TracedCall { start_time: now() })
    }

    /// Records the event of a finished call. `function` is the address of
    /// the wrapped function and replaces the wrapper in the call stack.
    fn record_event(call: TracedCall, event: E, function: u64) -> bool {
        Self::record_event_with(&BacktraceUnwinder, call, event, function)
    }

    fn record_event_with(
        unwinder: &impl Unwinder,
        call: TracedCall,
        mut event: E,
        function: u64,
    ) -> bool {
        let nesting = Self::nesting();
        if add_depth(nesting, -1) > 0 {
            return false;
        }
        let stop_time = now();

        add_depth(nesting, 1);
        let mut stack = CallStack::new();
        unwinder.stack_trace(1, &mut stack);
        add_depth(nesting, -1);

        stack.set_top(function);
        event.set_times(call.start_time, stop_time);
        Self::slot()
            .with_installed(|collector| collector.observe(&TraceObservation { event, stack }))
            .unwrap_or(false)
    }
}
