//! Tracing of I/O calls. Wrappers around the traced functions report each
//! call with [`start_event`] and [`record_event`].

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::{TraceKind, TracedCall};
use crate::buffer::TraceBuffer;
use crate::config::CollectorConfig;
use crate::flush::{EpochStart, FlushTrigger};
use crate::source::{CallSource, TracedFunctions};
use crate::util::blob_size_factor;

use perfcollect_proto::IoEvent;
use std::cell::{Cell, RefCell};
use std::thread::LocalKey;

/// Events per blob, before scaling by the platform's blob size factor.
pub const IO_EVENT_SLOTS: usize = 415;
/// Stack table slots per blob, before scaling.
pub const IO_STACK_SLOTS: usize = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IoCall {
    Close,
    Creat,
    Creat64,
    Dup,
    Dup2,
    Lseek,
    Lseek64,
    Open,
    Open64,
    Pipe,
    Pread,
    Pread64,
    Pwrite,
    Pwrite64,
    Read,
    Readv,
    Write,
    Writev,
}

/// Names of the functions the I/O collector can trace.
pub const TRACEABLE: &[&str] = &[
    "close", "creat", "creat64", "dup", "dup2", "lseek", "lseek64", "open", "open64", "pipe",
    "pread", "pread64", "pwrite", "pwrite64", "read", "readv", "write", "writev",
];

impl IoCall {
    pub fn name(self) -> &'static str {
        TRACEABLE[self as usize]
    }
}

pub struct Io;

thread_local! {
    static IO: RefCell<Option<LocalCollector<Io>>> = const { RefCell::new(None) };
    static NESTING: Cell<u32> = const { Cell::new(0) };
}

impl CollectorKind for Io {
    const NAME: &'static str = "io";

    type Buffer = TraceBuffer<IoEvent>;
    type Source = CallSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &IO
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(TraceBuffer<IoEvent>, CallSource, CollectorOptions), StartError> {
        let factor = blob_size_factor();
        let buffer = TraceBuffer::new(IO_EVENT_SLOTS * factor, IO_STACK_SLOTS * factor);
        let traced = TracedFunctions::parse(config.io_traced.as_deref(), TRACEABLE);
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Now),
            trigger: FlushTrigger::Full,
            flush_on_pause: false,
        };
        Ok((buffer, CallSource::new(traced), options))
    }
}

impl TraceKind<IoEvent> for Io {
    fn nesting() -> &'static LocalKey<Cell<u32>> {
        &NESTING
    }
}

pub fn start_event(call: IoCall) -> Option<TracedCall> {
    <Io as TraceKind<IoEvent>>::start_event(call.name())
}

/// Records a finished call of `function`, the address of the real function.
pub fn record_event(traced: TracedCall, call: IoCall, retval: i64, nbytes: u64, function: u64) -> bool {
    let event = IoEvent {
        call: call as u32,
        retval,
        nbytes,
        ..Default::default()
    };
    <Io as TraceKind<IoEvent>>::record_event(traced, event, function)
}

pub fn runtime(config: CollectorConfig) -> Runtime<Io> {
    Runtime::from_config(config)
}
