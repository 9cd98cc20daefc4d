//! Call stack sampling on hardware counter overflows. Each sampled stack is
//! weighted by the overflow threshold.

use super::usertime::{sample_stack, STACK_BUFFER_SLOTS};
use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::ThreadLocalStore;
use crate::buffer::{StackSample, StackSampleBuffer};
use crate::config::CollectorConfig;
use crate::flush::EpochStart;
use crate::source::{BacktraceUnwinder, OverflowSource};
use crate::util::program_counter;

use std::cell::RefCell;

pub struct HwcTime;

thread_local! {
    static HWCTIME: RefCell<Option<LocalCollector<HwcTime>>> = const { RefCell::new(None) };
}

impl CollectorKind for HwcTime {
    const NAME: &'static str = "hwctime";

    type Buffer = StackSampleBuffer;
    type Source = OverflowSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &HWCTIME
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(StackSampleBuffer, OverflowSource, CollectorOptions), StartError> {
        let source = OverflowSource::open(
            &config.hwctime_event,
            config.hwctime_threshold,
            on_overflow,
        )?;
        let buffer = StackSampleBuffer::new(STACK_BUFFER_SLOTS, source.threshold());
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Now),
            trigger: config.flush_trigger(),
            flush_on_pause: false,
        };
        Ok((buffer, source, options))
    }
}

fn on_overflow(context: *const libc::c_void) {
    // SAFETY: the overflow source passes the `ucontext_t` of the interrupted
    // thread.
    let pc = unsafe { program_counter(context) };
    let stack = sample_stack(&BacktraceUnwinder, pc);
    HWCTIME.with_installed(|collector| {
        let weight = collector.buffer().interval();
        collector.observe(&StackSample { stack, weight })
    });
}

pub fn runtime(config: CollectorConfig) -> Runtime<HwcTime> {
    Runtime::from_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorControl;
    use crate::sink::{sink_factory, DynSink, MemorySink};
    use crate::source::SourceError;
    use perfcollect_proto::Payload;
    use std::sync::Mutex;

    #[test]
    fn test_unknown_event_fails_to_build() {
        let config = CollectorConfig {
            hwctime_event: "nonsense".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HwcTime::build(&config),
            Err(StartError::Source(SourceError::NoCounters(_)))
        ));
    }

    #[test]
    fn test_stacks_are_weighted_by_threshold() {
        let (sink, log) = MemorySink::new();
        let sink = Mutex::new(Some(sink));
        let runtime: Runtime<HwcTime> = Runtime::new(
            CollectorConfig {
                hwctime_event: "task-clock".to_string(),
                hwctime_threshold: 1_000_000,
                ..Default::default()
            },
            sink_factory(move |_| Ok(Box::new(sink.lock().unwrap().take().unwrap()) as DynSink)),
        );

        std::thread::spawn(move || {
            // Counters may be forbidden by perf_event_paranoid.
            if runtime.start().is_err() {
                return;
            }
            let mut acc = 0u64;
            for i in 0..100_000_000u64 {
                acc = acc.rotate_left(7) ^ i;
            }
            std::hint::black_box(acc);
            runtime.stop().unwrap();
        })
        .join()
        .unwrap();

        for blob in log.blobs() {
            assert_eq!(blob.header.unwrap().collector, "hwctime");
            let Some(Payload::Usertime(data)) = blob.payload else {
                panic!("unexpected payload");
            };
            assert_eq!(data.interval, 1_000_000);
            for (count, weight) in data.count.iter().zip(&data.weight) {
                assert_eq!(*weight, *count as u64 * 1_000_000);
            }
        }
    }
}
