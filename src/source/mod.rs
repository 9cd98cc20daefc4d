//! Producers of observations.
//!
//! An event source arms whatever makes the profiled thread call back into its
//! collector: a timer signal, hardware counters read on that signal, counter
//! overflow signals, or wrapped library calls. Sources that need process-wide state set it up
//! through their [`ProcessRegistry`] so it happens once, however many threads
//! collect.

mod calls;
mod counters;
mod timer;
mod unwind;

pub use calls::{CallSource, TracedFunctions};
pub use counters::{counter_config, CounterSource, OverflowSource};
pub use timer::{TickHandler, TimerSource};
pub use unwind::{BacktraceUnwinder, Unwinder};

use crate::lifecycle::ProcessRegistry;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to install the {signal} handler: {errno}")]
    Sigaction { signal: &'static str, errno: Errno },
    #[error("timer_create failed with errno {0}")]
    TimerCreate(Errno),
    #[error("timer_settime failed with errno {0}")]
    TimerSettime(Errno),
    #[error("none of the requested hardware counters ({0}) could be opened")]
    NoCounters(String),
    #[error("could not route counter overflows to the thread: {0}")]
    OverflowDelivery(Errno),
}

pub trait EventSource {
    /// Registry shared by every thread collecting through this kind of source.
    fn registry(&self) -> &'static ProcessRegistry;

    /// Runs once, on the first thread that starts collecting.
    fn setup_process(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Runs once, on the last thread that stops collecting.
    fn teardown_process(&self) {}

    /// Starts delivering observations to the calling thread.
    fn attach(&mut self) -> Result<(), SourceError>;

    fn detach(&mut self);

    /// Holds off delivery while the collector is paused.
    fn suspend(&mut self) {}

    fn unsuspend(&mut self) {}
}
