//! Hardware counter overflow sampling: every `threshold` events of one
//! counter, the interrupted address is recorded.

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::ThreadLocalStore;
use crate::buffer::{PcBuffer, PcObservation};
use crate::config::CollectorConfig;
use crate::flush::EpochStart;
use crate::source::OverflowSource;
use crate::util::{blob_size_factor, program_counter};

use std::cell::RefCell;

/// Addresses per blob, before scaling by the platform's blob size factor.
pub const HWC_OVERFLOW_SLOTS: usize = 1024;

pub struct Hwc;

thread_local! {
    static HWC: RefCell<Option<LocalCollector<Hwc>>> = const { RefCell::new(None) };
}

impl CollectorKind for Hwc {
    const NAME: &'static str = "hwc";

    type Buffer = PcBuffer;
    type Source = OverflowSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &HWC
    }

    /// The payload interval is the overflow threshold, in counter events.
    fn build(
        config: &CollectorConfig,
    ) -> Result<(PcBuffer, OverflowSource, CollectorOptions), StartError> {
        let source = OverflowSource::open(&config.hwc_event, config.hwc_threshold, on_overflow)?;
        let buffer = PcBuffer::new(
            HWC_OVERFLOW_SLOTS * blob_size_factor(),
            source.threshold(),
        );
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
    if pc == 0 {
        return;
    }
    HWC.with_installed(|collector| collector.observe(&PcObservation::new(pc)));
}

pub fn runtime(config: CollectorConfig) -> Runtime<Hwc> {
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
            hwc_event: "PAPI_BOGUS".to_string(),
            ..Default::default()
        };
        let result = Hwc::build(&config);
        assert!(matches!(
            result,
            Err(StartError::Source(SourceError::NoCounters(name))) if name == "PAPI_BOGUS"
        ));
    }

    #[test]
    fn test_overflow_samples() {
        let (sink, log) = MemorySink::new();
        let sink = Mutex::new(Some(sink));
        let runtime: Runtime<Hwc> = Runtime::new(
            CollectorConfig {
                hwc_event: "task-clock".to_string(),
                hwc_threshold: 500_000,
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
                acc = acc.rotate_left(5) ^ i;
            }
            std::hint::black_box(acc);
            runtime.stop().unwrap();
        })
        .join()
        .unwrap();

        for blob in log.blobs() {
            let header = blob.header.unwrap();
            assert_eq!(header.collector, "hwc");
            let Some(Payload::Pcsamp(data)) = blob.payload else {
                panic!("unexpected payload");
            };
            assert_eq!(data.interval, 500_000);
            assert!(data.pc.iter().all(|pc| (header.addr_begin..header.addr_end).contains(pc)));
        }
    }
}
