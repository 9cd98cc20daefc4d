//! Call stack sampling: every tick of a thread CPU time timer unwinds the
//! interrupted thread and counts the stack.

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::ThreadLocalStore;
use crate::buffer::{StackSample, StackSampleBuffer};
use crate::config::CollectorConfig;
use crate::flush::EpochStart;
use crate::source::{BacktraceUnwinder, TimerSource, Unwinder};
use crate::stacks::CallStack;
use crate::util::program_counter;

use std::cell::RefCell;

/// Stack table slots per blob.
pub const STACK_BUFFER_SLOTS: usize = 1024;
/// Frames kept per sampled stack.
pub const MAX_SAMPLED_FRAMES: usize = 32;

pub struct Usertime;

thread_local! {
    static USERTIME: RefCell<Option<LocalCollector<Usertime>>> = const { RefCell::new(None) };
}

impl CollectorKind for Usertime {
    const NAME: &'static str = "usertime";

    type Buffer = StackSampleBuffer;
    type Source = TimerSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &USERTIME
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(StackSampleBuffer, TimerSource, CollectorOptions), StartError> {
        let interval = TimerSource::interval_for_rate(config.usertime_rate);
        let buffer = StackSampleBuffer::new(STACK_BUFFER_SLOTS, interval.as_nanos() as u64);
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Contiguous),
            trigger: config.flush_trigger(),
            flush_on_pause: false,
        };
        Ok((buffer, TimerSource::new(interval, on_tick), options))
    }
}

/// Unwinds from the signal handler and keeps the frames from the
/// interrupted address outwards.
pub fn sample_stack(unwinder: &impl Unwinder, pc: u64) -> CallStack {
    let mut stack = CallStack::new();
    unwinder.stack_trace(0, &mut stack);
    if pc != 0 {
        stack.anchor_at(pc);
    }
    stack.truncate(MAX_SAMPLED_FRAMES);
    stack
}

fn on_tick(context: *const libc::c_void) {
    // SAFETY: the timer source passes the `ucontext_t` of the interrupted
    // thread.
    let pc = unsafe { program_counter(context) };
    let stack = sample_stack(&BacktraceUnwinder, pc);
    USERTIME.with_installed(|collector| {
        let weight = collector.buffer().interval();
        collector.observe(&StackSample { stack, weight })
    });
}

pub fn runtime(config: CollectorConfig) -> Runtime<Usertime> {
    Runtime::from_config(config)
}
