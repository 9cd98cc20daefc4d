//! Tracing of memory allocation calls.

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::{TraceKind, TracedCall};
use crate::buffer::TraceBuffer;
use crate::config::CollectorConfig;
use crate::flush::{EpochStart, FlushTrigger};
use crate::source::{CallSource, TracedFunctions};
use crate::util::blob_size_factor;

use perfcollect_proto::MemEvent;
use std::cell::{Cell, RefCell};
use std::thread::LocalKey;

pub const MEM_EVENT_SLOTS: usize = 415;
pub const MEM_STACK_SLOTS: usize = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemCall {
    Malloc,
    Free,
    Memalign,
    PosixMemalign,
    Calloc,
    Realloc,
}

pub const TRACEABLE: &[&str] = &["malloc", "free", "memalign", "posix_memalign", "calloc", "realloc"];

impl MemCall {
    pub fn name(self) -> &'static str {
        TRACEABLE[self as usize]
    }
}

/// Arguments and result of one allocation call. Unused fields stay zero,
/// e.g. `size2` is only set by `calloc`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    pub retval: u64,
    pub ptr: u64,
    pub size1: u64,
    pub size2: u64,
}

pub struct Mem;

thread_local! {
    static MEM: RefCell<Option<LocalCollector<Mem>>> = const { RefCell::new(None) };
    static NESTING: Cell<u32> = const { Cell::new(0) };
}

impl CollectorKind for Mem {
    const NAME: &'static str = "mem";

    type Buffer = TraceBuffer<MemEvent>;
    type Source = CallSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &MEM
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(TraceBuffer<MemEvent>, CallSource, CollectorOptions), StartError> {
        let factor = blob_size_factor();
        let buffer = TraceBuffer::new(MEM_EVENT_SLOTS * factor, MEM_STACK_SLOTS * factor);
        let traced = TracedFunctions::parse(config.mem_traced.as_deref(), TRACEABLE);
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Now),
            trigger: FlushTrigger::Full,
            flush_on_pause: false,
        };
        Ok((buffer, CallSource::new(traced), options))
    }
}

impl TraceKind<MemEvent> for Mem {
    fn nesting() -> &'static LocalKey<Cell<u32>> {
        &NESTING
    }
}

pub fn start_event(call: MemCall) -> Option<TracedCall> {
    <Mem as TraceKind<MemEvent>>::start_event(call.name())
}

pub fn record_event(traced: TracedCall, call: MemCall, allocation: Allocation, function: u64) -> bool {
    let event = MemEvent {
        call: call as u32,
        retval: allocation.retval,
        ptr: allocation.ptr,
        size1: allocation.size1,
        size2: allocation.size2,
        ..Default::default()
    };
    <Mem as TraceKind<MemEvent>>::record_event(traced, event, function)
}

pub fn runtime(config: CollectorConfig) -> Runtime<Mem> {
    Runtime::from_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleBuffer;
    use crate::collector::trace::tests::FixedUnwinder;
    use crate::collector::CollectorControl;
    use crate::sink::{sink_factory, DynSink, NullSink};

    #[test]
    fn test_call_names() {
        assert_eq!(MemCall::PosixMemalign.name(), "posix_memalign");
        assert_eq!(MemCall::Realloc.name(), "realloc");
    }

    #[test]
    fn test_full_event_array_is_flushed() {
        let runtime: Runtime<Mem> = Runtime::new(
            CollectorConfig {
                mem_traced: Some("malloc".to_string()),
                ..Default::default()
            },
            sink_factory(|_| Ok(Box::new(NullSink::default()) as DynSink)),
        );
        std::thread::spawn(move || {
            runtime.start().unwrap();
            let capacity = runtime
                .with_collector(|collector| collector.buffer().capacity())
                .unwrap();
            let unwinder = FixedUnwinder(vec![0x1, 0x10, 0x20]);
            for i in 0..capacity as u64 {
                let call = start_event(MemCall::Malloc).unwrap();
                let event = MemEvent {
                    call: MemCall::Malloc as u32,
                    retval: 0x7f00 + i,
                    size1: 16,
                    ..Default::default()
                };
                assert!(Mem::record_event_with(&unwinder, call, event, 0x9000));
            }
            assert!(start_event(MemCall::Free).is_none());

            runtime
                .with_collector(|collector| {
                    assert!(collector.buffer().is_empty());
                    assert_eq!(collector.stats().blobs, 1);
                })
                .unwrap();
            let stats = runtime.stop().unwrap();
            assert_eq!(stats.blobs, 1);
        })
        .join()
        .unwrap();
    }
}
