//! Hardware counter sampling: every tick records the interrupted address
//! together with how far each counter advanced since the previous tick.

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::ThreadLocalStore;
use crate::buffer::{HwcBuffer, PcObservation};
use crate::config::CollectorConfig;
use crate::flush::EpochStart;
use crate::source::{CounterSource, TimerSource};
use crate::util::{blob_size_factor, program_counter};

use std::cell::RefCell;

/// Addresses per blob, before scaling by the platform's blob size factor.
pub const HWC_BUFFER_SLOTS: usize = 128;

pub struct HwcSamp;

thread_local! {
    static HWCSAMP: RefCell<Option<LocalCollector<HwcSamp>>> = const { RefCell::new(None) };
}

impl CollectorKind for HwcSamp {
    const NAME: &'static str = "hwcsamp";

    type Buffer = HwcBuffer;
    type Source = CounterSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &HWCSAMP
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(HwcBuffer, CounterSource, CollectorOptions), StartError> {
        let interval = TimerSource::interval_for_rate(config.hwcsamp_rate);
        let source = CounterSource::open(
            TimerSource::new(interval, on_tick),
            &config.hwcsamp_events,
        )?;
        let buffer = HwcBuffer::new(
            HWC_BUFFER_SLOTS * blob_size_factor(),
            interval.as_nanos() as u64,
            source.events().to_vec(),
        );
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Now),
            trigger: config.flush_trigger(),
            flush_on_pause: false,
        };
        Ok((buffer, source, options))
    }
}

fn on_tick(context: *const libc::c_void) {
    // SAFETY: the timer source passes the `ucontext_t` of the interrupted
    // thread.
    let pc = unsafe { program_counter(context) };
    HWCSAMP.with_installed(|collector| {
        // Counters are read even for unusable ticks so the next delta does
        // not include them.
        let weight = collector.source_mut().read_deltas();
        if pc != 0 {
            collector.observe(&PcObservation { pc, weight });
        }
    });
}

pub fn runtime(config: CollectorConfig) -> Runtime<HwcSamp> {
    Runtime::from_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;

    #[test]
    fn test_unknown_events_fail_to_build() {
        let config = CollectorConfig {
            hwcsamp_events: vec!["PAPI_NOT_A_COUNTER".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            HwcSamp::build(&config),
            Err(StartError::Source(SourceError::NoCounters(_)))
        ));
    }

    #[test]
    fn test_buffer_names_the_opened_counters() {
        let config = CollectorConfig {
            hwcsamp_events: vec!["PAPI_TOT_INS".to_string(), "PAPI_BOGUS".to_string()],
            ..Default::default()
        };
        // Hardware counters are not available on every machine the tests
        // run on.
        if let Ok((buffer, source, options)) = HwcSamp::build(&config) {
            assert_eq!(buffer.events(), &["PAPI_TOT_INS".to_string()]);
            assert_eq!(source.events(), buffer.events());
            assert_eq!(options.epoch_start, EpochStart::Now);
        }
    }
}
