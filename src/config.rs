//! Collector configuration, read from the environment of the profiled
//! process.

use crate::flush::{EpochStart, FlushTrigger};
use crate::header::DataHeader;
use crate::sink::{sink_factory, DynSink, FileSink, NetworkSink, SinkFactory};

use anyhow::Context;
use clap::Parser;
use std::ops::RangeInclusive;
use std::path::PathBuf;

const SAMPLING_RATE_RANGE: RangeInclusive<u64> = 1..=1000;
/// Counter events between two overflow samples.
pub const DEFAULT_THRESHOLD: u64 = 40_000_000;

pub(crate) fn sampling_rate_in_range(s: &str) -> Result<u64, String> {
    let rate: u64 = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid sampling rate"))?;
    if !SAMPLING_RATE_RANGE.contains(&rate) {
        return Err(format!(
            "sampling rate not in allowed range {}-{}",
            SAMPLING_RATE_RANGE.start(),
            SAMPLING_RATE_RANGE.end()
        ));
    }
    Ok(rate)
}

#[derive(Parser, Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Experiment name written into every data header
    #[arg(long, env = "CBTF_EXPERIMENT", default_value = "perfcollect")]
    pub experiment: String,
    /// Program counter samples per second
    #[arg(long, env = "CBTF_PCSAMP_RATE", default_value_t = 100, value_parser = sampling_rate_in_range)]
    pub pcsamp_rate: u64,
    /// Call stack samples per second
    #[arg(long, env = "CBTF_USERTIME_RATE", default_value_t = 35, value_parser = sampling_rate_in_range)]
    pub usertime_rate: u64,
    /// Hardware counter samples per second
    #[arg(long, env = "CBTF_HWCSAMP_RATE", default_value_t = 100, value_parser = sampling_rate_in_range)]
    pub hwcsamp_rate: u64,
    /// Hardware counters to sample
    #[arg(
        long,
        env = "CBTF_HWCSAMP_EVENTS",
        value_delimiter = ',',
        default_value = "PAPI_TOT_CYC,PAPI_TOT_INS"
    )]
    pub hwcsamp_events: Vec<String>,
    /// I/O functions to trace, separated by `:` or `,`. All when unset
    #[arg(long, env = "CBTF_IO_TRACED")]
    pub io_traced: Option<String>,
    /// Memory functions to trace, separated by `:` or `,`. All when unset
    #[arg(long, env = "CBTF_MEM_TRACED")]
    pub mem_traced: Option<String>,
    /// MPI functions to trace, separated by `:` or `,`. All when unset
    #[arg(long, env = "CBTF_MPI_TRACED")]
    pub mpi_traced: Option<String>,
    /// POSIX threads functions to trace, separated by `:` or `,`. All when
    /// unset
    #[arg(long, env = "CBTF_PTHREADS_TRACED")]
    pub pthreads_traced: Option<String>,
    /// Hardware counter whose overflows the hwc collector samples
    #[arg(long, env = "CBTF_HWC_EVENT", default_value = "PAPI_TOT_CYC")]
    pub hwc_event: String,
    /// Counter events between two hwc samples
    #[arg(long, env = "CBTF_HWC_THRESHOLD", default_value_t = DEFAULT_THRESHOLD, value_parser = clap::value_parser!(u64).range(1..))]
    pub hwc_threshold: u64,
    /// Hardware counter whose overflows the hwctime collector samples
    #[arg(long, env = "CBTF_HWCTIME_EVENT", default_value = "PAPI_TOT_CYC")]
    pub hwctime_event: String,
    /// Counter events between two hwctime samples
    #[arg(long, env = "CBTF_HWCTIME_THRESHOLD", default_value_t = DEFAULT_THRESHOLD, value_parser = clap::value_parser!(u64).range(1..))]
    pub hwctime_threshold: u64,
    /// Directory data files are written to
    #[arg(long, env = "CBTF_RAWDATA_DIR", default_value = "/tmp")]
    pub rawdata_dir: PathBuf,
    /// Send data to this collection server instead of writing files
    #[arg(long, env = "CBTF_COLLECTOR_URL")]
    pub collector_url: Option<String>,
    /// The program is an MPI job: connect to the collection server once MPI
    /// reports the rank, instead of when collection starts
    #[arg(long, env = "CBTF_MPI")]
    pub mpi: bool,
    /// Log collector activity
    #[arg(long, env = "CBTF_DEBUG_COLLECTOR")]
    pub debug_collector: bool,
    /// Where each epoch after a flush starts: now, or contiguous with the
    /// previous one. Overrides every collector's default
    #[arg(long, env = "CBTF_EPOCH_START", value_enum)]
    pub epoch_start: Option<EpochStart>,
    /// Flush as soon as a buffer is full rather than when it overflows
    #[arg(long, env = "CBTF_FLUSH_ON_FULL")]
    pub flush_on_full: bool,
}

impl CollectorConfig {
    /// Reads the configuration from the environment only.
    pub fn from_env() -> anyhow::Result<Self> {
        CollectorConfig::try_parse_from(["perfcollect"])
            .context("invalid collector environment")
    }

    pub fn epoch_start_or(&self, default: EpochStart) -> EpochStart {
        self.epoch_start.unwrap_or(default)
    }

    pub fn flush_trigger(&self) -> FlushTrigger {
        if self.flush_on_full {
            FlushTrigger::Full
        } else {
            FlushTrigger::Overflow
        }
    }

    /// Creates per-thread sinks: network when a collection server is
    /// configured, data files otherwise.
    pub fn sink_factory(&self) -> SinkFactory {
        match &self.collector_url {
            Some(url) => {
                let url = url.clone();
                sink_factory(move |_: &DataHeader| Ok(Box::new(NetworkSink::new(&url)) as DynSink))
            }
            None => {
                let dir = self.rawdata_dir.clone();
                sink_factory(move |header: &DataHeader| {
                    Ok(Box::new(FileSink::create(&dir, header)?) as DynSink)
                })
            }
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            experiment: "perfcollect".to_string(),
            pcsamp_rate: 100,
            usertime_rate: 35,
            hwcsamp_rate: 100,
            hwcsamp_events: vec!["PAPI_TOT_CYC".to_string(), "PAPI_TOT_INS".to_string()],
            io_traced: None,
            mem_traced: None,
            mpi_traced: None,
            pthreads_traced: None,
            hwc_event: "PAPI_TOT_CYC".to_string(),
            hwc_threshold: DEFAULT_THRESHOLD,
            hwctime_event: "PAPI_TOT_CYC".to_string(),
            hwctime_threshold: DEFAULT_THRESHOLD,
            rawdata_dir: PathBuf::from("/tmp"),
            collector_url: None,
            mpi: false,
            debug_collector: false,
            epoch_start: None,
            flush_on_full: false,
        }
    }
}
