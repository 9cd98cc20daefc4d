use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use perfcollect::config::CollectorConfig;

use crate::validators::parse_duration;
use crate::validators::threads_in_range;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(PartialEq, clap::ValueEnum, Debug, Clone, Copy, Default)]
pub(crate) enum CollectorName {
    /// Program counter sampling
    #[default]
    Pcsamp,
    /// Call stack sampling
    Usertime,
    /// Hardware counter sampling
    Hwcsamp,
    /// Hardware counter overflow sampling
    Hwc,
    /// Call stack sampling on hardware counter overflows
    Hwctime,
    /// I/O call tracing
    Io,
    /// Memory allocation tracing
    Mem,
    /// POSIX threads call tracing
    Pthreads,
}

#[derive(Parser, Debug)]
#[command(version, about = "Per-thread performance data collectors")]
pub(crate) struct CliArgs {
    /// Set perfcollect's logging level
    #[arg(long, default_value_t, value_enum)]
    pub(crate) logging: LoggingLevel,
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Collect data from a synthetic multi-threaded workload
    Record(RecordArgs),
    /// Print the blobs stored in data files
    Dump {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Render the samples or events of data files as a flamegraph
    Flamegraph {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Where to write the SVG
        #[arg(long, short, default_value = "flame.svg")]
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct RecordArgs {
    /// Collector to run
    #[arg(long, default_value_t, value_enum)]
    pub(crate) collector: CollectorName,
    /// How long the workload runs in seconds
    #[arg(short = 'D', long, default_value = "5", value_parser = parse_duration)]
    pub(crate) duration: Duration,
    /// Number of workload threads
    #[arg(long, default_value_t = 4, value_parser = threads_in_range)]
    pub(crate) threads: usize,
    #[command(flatten)]
    pub(crate) config: CollectorConfig,
}
