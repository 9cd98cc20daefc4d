//! Program counter sampling: every tick of a thread CPU time timer records
//! the interrupted address.

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::ThreadLocalStore;
use crate::buffer::{PcBuffer, PcObservation};
use crate::config::CollectorConfig;
use crate::flush::EpochStart;
use crate::source::TimerSource;
use crate::util::{blob_size_factor, program_counter};

use std::cell::RefCell;

/// Addresses per blob, before scaling by the platform's blob size factor.
pub const PC_BUFFER_SLOTS: usize = 1024;

pub struct PcSamp;

thread_local! {
    static PCSAMP: RefCell<Option<LocalCollector<PcSamp>>> = const { RefCell::new(None) };
}

impl CollectorKind for PcSamp {
    const NAME: &'static str = "pcsamp";

    type Buffer = PcBuffer;
    type Source = TimerSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &PCSAMP
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(PcBuffer, TimerSource, CollectorOptions), StartError> {
        let interval = TimerSource::interval_for_rate(config.pcsamp_rate);
        let buffer = PcBuffer::new(
            PC_BUFFER_SLOTS * blob_size_factor(),
            interval.as_nanos() as u64,
        );
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Contiguous),
            trigger: config.flush_trigger(),
            flush_on_pause: false,
        };
        Ok((buffer, TimerSource::new(interval, on_tick), options))
    }
}

fn on_tick(context: *const libc::c_void) {
    // SAFETY: the timer source passes the `ucontext_t` of the interrupted
    // thread.
    let pc = unsafe { program_counter(context) };
    if pc == 0 {
        return;
    }
    PCSAMP.with_installed(|collector| collector.observe(&PcObservation::new(pc)));
}

pub fn runtime(config: CollectorConfig) -> Runtime<PcSamp> {
    Runtime::from_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorControl;
    use crate::lifecycle::CollectionStatus;
    use crate::sink::{sink_factory, DynSink, MemorySink};
    use perfcollect_proto::Payload;
    use std::sync::Mutex;

    #[test]
    fn test_pcsamp_thread() {
        let (sink, log) = MemorySink::new();
        let sink = Mutex::new(Some(sink));
        let runtime: Runtime<PcSamp> = Runtime::new(
            CollectorConfig {
                pcsamp_rate: 1000,
                ..Default::default()
            },
            sink_factory(move |_| Ok(Box::new(sink.lock().unwrap().take().unwrap()) as DynSink)),
        );

        std::thread::spawn(move || {
            runtime.start().unwrap();
            assert_eq!(runtime.status(), Some(CollectionStatus::Started));
            // Starting again on the same thread keeps the running collector.
            runtime.start().unwrap();

            let mut acc = 0u64;
            for i in 0..50_000_000u64 {
                acc = acc.wrapping_mul(31).wrapping_add(i);
            }
            std::hint::black_box(acc);

            runtime.stop().unwrap();
            assert_eq!(runtime.status(), None);
        })
        .join()
        .unwrap();

        for blob in log.blobs() {
            let header = blob.header.unwrap();
            assert_eq!(header.collector, "pcsamp");
            assert!(header.time_begin <= header.time_end);
            let Some(Payload::Pcsamp(data)) = blob.payload else {
                panic!("unexpected payload");
            };
            assert_eq!(data.interval, 1_000_000);
            assert_eq!(data.pc.len(), data.count.len());
            assert!(data.pc.iter().all(|pc| (header.addr_begin..header.addr_end).contains(pc)));
        }
    }
}
