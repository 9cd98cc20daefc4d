//! Tracing of POSIX threads calls.

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::{TraceKind, TracedCall};
use crate::buffer::TraceBuffer;
use crate::config::CollectorConfig;
use crate::flush::{EpochStart, FlushTrigger};
use crate::source::{CallSource, TracedFunctions};
use crate::util::blob_size_factor;

use perfcollect_proto::PthreadsEvent;
use std::cell::{Cell, RefCell};
use std::thread::LocalKey;

pub const PTHREADS_EVENT_SLOTS: usize = 415;
pub const PTHREADS_STACK_SLOTS: usize = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PthreadsCall {
    Create,
    MutexInit,
    MutexDestroy,
    MutexLock,
    MutexTrylock,
    MutexUnlock,
    CondInit,
    CondDestroy,
    CondSignal,
    CondBroadcast,
    CondWait,
    CondTimedwait,
}

pub const TRACEABLE: &[&str] = &[
    "pthread_create",
    "pthread_mutex_init",
    "pthread_mutex_destroy",
    "pthread_mutex_lock",
    "pthread_mutex_trylock",
    "pthread_mutex_unlock",
    "pthread_cond_init",
    "pthread_cond_destroy",
    "pthread_cond_signal",
    "pthread_cond_broadcast",
    "pthread_cond_wait",
    "pthread_cond_timedwait",
];

impl PthreadsCall {
    pub fn name(self) -> &'static str {
        TRACEABLE[self as usize]
    }
}

/// Result and pointer arguments of one call, in argument order. Unused
/// pointers stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadCall {
    pub retval: u64,
    pub ptr1: u64,
    pub ptr2: u64,
    pub ptr3: u64,
}

pub struct Pthreads;

thread_local! {
    static PTHREADS: RefCell<Option<LocalCollector<Pthreads>>> = const { RefCell::new(None) };
    static NESTING: Cell<u32> = const { Cell::new(0) };
}

impl CollectorKind for Pthreads {
    const NAME: &'static str = "pthreads";

    type Buffer = TraceBuffer<PthreadsEvent>;
    type Source = CallSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &PTHREADS
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(TraceBuffer<PthreadsEvent>, CallSource, CollectorOptions), StartError> {
        let factor = blob_size_factor();
        let buffer = TraceBuffer::new(
            PTHREADS_EVENT_SLOTS * factor,
            PTHREADS_STACK_SLOTS * factor,
        );
        let traced = TracedFunctions::parse(config.pthreads_traced.as_deref(), TRACEABLE);
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Now),
            trigger: FlushTrigger::Full,
            flush_on_pause: false,
        };
        Ok((buffer, CallSource::new(traced), options))
    }
}

impl TraceKind<PthreadsEvent> for Pthreads {
    fn nesting() -> &'static LocalKey<Cell<u32>> {
        &NESTING
    }
}

pub fn start_event(call: PthreadsCall) -> Option<TracedCall> {
    <Pthreads as TraceKind<PthreadsEvent>>::start_event(call.name())
}

pub fn record_event(traced: TracedCall, call: PthreadsCall, args: ThreadCall, function: u64) -> bool {
    let event = PthreadsEvent {
        call: call as u32,
        retval: args.retval,
        ptr1: args.ptr1,
        ptr2: args.ptr2,
        ptr3: args.ptr3,
        ..Default::default()
    };
    <Pthreads as TraceKind<PthreadsEvent>>::record_event(traced, event, function)
}

pub fn runtime(config: CollectorConfig) -> Runtime<Pthreads> {
    Runtime::from_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::trace::tests::FixedUnwinder;
    use crate::collector::CollectorControl;
    use crate::sink::{sink_factory, DynSink, MemorySink};
    use perfcollect_proto::Payload;
    use std::sync::Mutex;

    #[test]
    fn test_call_names() {
        assert_eq!(TRACEABLE.len(), PthreadsCall::CondTimedwait as usize + 1);
        assert_eq!(PthreadsCall::Create.name(), "pthread_create");
        assert_eq!(PthreadsCall::MutexTrylock.name(), "pthread_mutex_trylock");
        assert_eq!(PthreadsCall::CondTimedwait.name(), "pthread_cond_timedwait");
    }

    #[test]
    fn test_lock_calls_are_recorded() {
        let (sink, log) = MemorySink::new();
        let sink = Mutex::new(Some(sink));
        let runtime: Runtime<Pthreads> = Runtime::new(
            CollectorConfig {
                pthreads_traced: Some("pthread_mutex_lock:pthread_mutex_unlock".to_string()),
                ..Default::default()
            },
            sink_factory(move |_| Ok(Box::new(sink.lock().unwrap().take().unwrap()) as DynSink)),
        );

        std::thread::spawn(move || {
            runtime.start().unwrap();
            let unwinder = FixedUnwinder(vec![0x1, 0x300, 0x400]);
            for call in [PthreadsCall::MutexLock, PthreadsCall::MutexUnlock] {
                let traced = start_event(call).unwrap();
                let event = PthreadsEvent {
                    call: call as u32,
                    ptr1: 0x5000,
                    ..Default::default()
                };
                assert!(Pthreads::record_event_with(&unwinder, traced, event, 0x100));
            }
            assert!(start_event(PthreadsCall::Create).is_none());
            runtime.stop().unwrap();
        })
        .join()
        .unwrap();

        let blobs = log.blobs();
        let Some(Payload::Pthreads(data)) = &blobs[0].payload else {
            panic!("unexpected payload");
        };
        let calls: Vec<u32> = data.events.iter().map(|event| event.call).collect();
        assert_eq!(calls, vec![PthreadsCall::MutexLock as u32, PthreadsCall::MutexUnlock as u32]);
        assert!(data.events.iter().all(|event| event.ptr1 == 0x5000));
        // Both calls share one stack.
        assert_eq!(data.stacktraces, vec![0x100, 0x400, 0]);
    }
}
