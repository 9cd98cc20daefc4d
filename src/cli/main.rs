use std::fs::File;
use std::io::IsTerminal;
use std::os::fd::AsRawFd;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context};
use chrono::DateTime;
use clap::Parser;
use crossbeam_channel::bounded;
use inferno::flamegraph;
use itertools::Itertools;
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

use perfcollect::collector::io::{self, IoCall};
use perfcollect::collector::mem::{self, Allocation, MemCall};
use perfcollect::collector::pthreads::{self, PthreadsCall, ThreadCall};
use perfcollect::collector::{
    hwc, hwcsamp, hwctime, pcsamp, usertime, CollectorControl, CollectorKind,
};
use perfcollect::config::CollectorConfig;
use perfcollect::monitor::{Monitor, MonitorEvent};
use perfcollect::profile::FoldedStacks;
use perfcollect::util::address_of;
use perfcollect_proto::{decode_blobs, Blob, Payload};

mod args;
mod validators;

use crate::args::CliArgs;
use crate::args::CollectorName;
use crate::args::Commands;
use crate::args::LoggingLevel;
use crate::args::RecordArgs;

/// Iterations of busy work between two traced calls.
const TRACED_CALL_SPACING: u64 = 100_000;

/// Exit the process if any thread panics.
fn panic_thread_hook() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

impl CollectorName {
    fn id(self) -> &'static str {
        match self {
            CollectorName::Pcsamp => pcsamp::PcSamp::NAME,
            CollectorName::Usertime => usertime::Usertime::NAME,
            CollectorName::Hwcsamp => hwcsamp::HwcSamp::NAME,
            CollectorName::Hwc => hwc::Hwc::NAME,
            CollectorName::Hwctime => hwctime::HwcTime::NAME,
            CollectorName::Io => io::Io::NAME,
            CollectorName::Mem => mem::Mem::NAME,
            CollectorName::Pthreads => pthreads::Pthreads::NAME,
        }
    }
}

fn main() -> anyhow::Result<()> {
    panic_thread_hook();
    let args = CliArgs::parse();

    let level_filter = match args.logging {
        LoggingLevel::Trace => Level::TRACE,
        LoggingLevel::Debug => Level::DEBUG,
        LoggingLevel::Info => Level::INFO,
        LoggingLevel::Warn => Level::WARN,
        LoggingLevel::Error => Level::ERROR,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_filter)
        .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match args.command {
        Commands::Record(record_args) => record(record_args),
        Commands::Dump { paths } => dump(&paths),
        Commands::Flamegraph { paths, output } => render_flamegraph(&paths, &output),
    }
}

fn record(args: RecordArgs) -> anyhow::Result<()> {
    if args.config.collector_url.is_none() {
        std::fs::create_dir_all(&args.config.rawdata_dir).with_context(|| {
            format!("creating {}", args.config.rawdata_dir.to_string_lossy())
        })?;
    }

    let (stop_signal_sender, stop_signal_receive) = bounded(1);
    ctrlc::set_handler(move || {
        info!("received Ctrl+C, stopping...");
        let _ = stop_signal_sender.try_send(());
    })
    .context("setting Ctrl-C handler")?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::with_capacity(args.threads);
    for i in 0..args.threads {
        let stop = stop.clone();
        let config = args.config.clone();
        let collector = args.collector;
        let worker = thread::Builder::new()
            .name(format!("workload-{i}"))
            .spawn(move || run_worker(collector, config, i == 0, &stop))
            .context("spawning workload thread")?;
        workers.push(worker);
    }

    let _ = stop_signal_receive.recv_timeout(args.duration);
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow!("workload thread panicked"))?;
    }

    if args.config.collector_url.is_none() {
        let written = written_files(&args.config.rawdata_dir, args.collector)?;
        eprintln!(
            "{} data files written to {}",
            written.len(),
            args.config.rawdata_dir.to_string_lossy()
        );
        for path in written {
            println!("{}", path.to_string_lossy());
        }
    }
    Ok(())
}

fn run_worker(collector: CollectorName, config: CollectorConfig, first: bool, stop: &AtomicBool) {
    let workload = Workload { first, stop };
    match collector {
        CollectorName::Pcsamp => workload.run(pcsamp::runtime(config), |seed| spin(seed, 10_000)),
        CollectorName::Usertime => {
            workload.run(usertime::runtime(config), |seed| spin(seed, 10_000))
        }
        CollectorName::Hwcsamp => {
            workload.run(hwcsamp::runtime(config), |seed| spin(seed, 10_000))
        }
        CollectorName::Hwc => workload.run(hwc::runtime(config), |seed| spin(seed, 10_000)),
        CollectorName::Hwctime => {
            workload.run(hwctime::runtime(config), |seed| spin(seed, 10_000))
        }
        CollectorName::Io => {
            let null = match File::options().write(true).open("/dev/null") {
                Ok(null) => null,
                Err(err) => {
                    warn!("could not open /dev/null: {}", err);
                    return;
                }
            };
            let fd = null.as_raw_fd();
            workload.run(io::runtime(config), |seed| {
                traced_write(fd, seed);
                spin(seed, TRACED_CALL_SPACING)
            })
        }
        CollectorName::Mem => workload.run(mem::runtime(config), |seed| {
            traced_allocation(seed);
            spin(seed, TRACED_CALL_SPACING)
        }),
        CollectorName::Pthreads => workload.run(pthreads::runtime(config), |seed| {
            traced_lock(seed);
            spin(seed, TRACED_CALL_SPACING)
        }),
    }
}

struct Workload<'a> {
    /// The first thread stands in for the process: it also reports process
    /// start and exit.
    first: bool,
    stop: &'a AtomicBool,
}

impl Workload<'_> {
    /// Runs `step` until stopped, with the collector following the thread's
    /// lifecycle.
    fn run<C: CollectorControl>(&self, control: C, mut step: impl FnMut(u64) -> u64) {
        let span = span!(Level::DEBUG, "workload");
        let _entered = span.enter();

        let (init, exit) = if self.first {
            (MonitorEvent::ProcessInit, MonitorEvent::ProcessExit)
        } else {
            (MonitorEvent::ThreadInit, MonitorEvent::ThreadExit)
        };
        let mut monitor = Monitor::new(control);
        monitor.handle(init);
        let mut acc = 0u64;
        let mut iterations = 0u64;
        while !self.stop.load(Ordering::Relaxed) {
            acc = step(acc.wrapping_add(iterations));
            iterations += 1;
        }
        std::hint::black_box(acc);
        monitor.handle(exit);
        debug!("{} iterations", iterations);
    }
}

#[inline(never)]
fn spin(seed: u64, iterations: u64) -> u64 {
    (0..iterations).fold(seed, mix)
}

#[inline(never)]
fn mix(acc: u64, i: u64) -> u64 {
    acc.rotate_left(5) ^ i.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

#[inline(never)]
fn traced_write(fd: libc::c_int, seed: u64) {
    let buf = seed.to_le_bytes();
    let traced = io::start_event(IoCall::Write);
    let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if let Some(traced) = traced {
        io::record_event(
            traced,
            IoCall::Write,
            ret as i64,
            buf.len() as u64,
            address_of(libc::write as *const ()),
        );
    }
}

#[inline(never)]
fn traced_allocation(seed: u64) {
    let size = (seed % 4096 + 1) as usize;
    let traced = mem::start_event(MemCall::Malloc);
    let block = vec![0u8; size];
    let ptr = block.as_ptr() as u64;
    if let Some(traced) = traced {
        let allocation = Allocation {
            retval: ptr,
            size1: size as u64,
            ..Default::default()
        };
        mem::record_event(
            traced,
            MemCall::Malloc,
            allocation,
            address_of(libc::malloc as *const ()),
        );
    }

    let traced = mem::start_event(MemCall::Free);
    drop(block);
    if let Some(traced) = traced {
        let allocation = Allocation {
            ptr,
            ..Default::default()
        };
        mem::record_event(
            traced,
            MemCall::Free,
            allocation,
            address_of(libc::free as *const ()),
        );
    }
}

static WORKLOAD_MUTEX: TracedMutex = TracedMutex(std::cell::UnsafeCell::new(
    libc::PTHREAD_MUTEX_INITIALIZER,
));

struct TracedMutex(std::cell::UnsafeCell<libc::pthread_mutex_t>);

// SAFETY: the mutex is only used through the pthread API.
unsafe impl Sync for TracedMutex {}

#[inline(never)]
fn traced_lock(seed: u64) {
    let mutex = WORKLOAD_MUTEX.0.get();
    for (call, function) in [
        (PthreadsCall::MutexLock, libc::pthread_mutex_lock as *const ()),
        (PthreadsCall::MutexUnlock, libc::pthread_mutex_unlock as *const ()),
    ] {
        let traced = pthreads::start_event(call);
        // SAFETY: `mutex` is a statically initialized pthread mutex.
        let ret = unsafe {
            match call {
                PthreadsCall::MutexLock => libc::pthread_mutex_lock(mutex),
                _ => libc::pthread_mutex_unlock(mutex),
            }
        };
        if let Some(traced) = traced {
            let args = ThreadCall {
                retval: ret as u64,
                ptr1: mutex as u64,
                ..Default::default()
            };
            pthreads::record_event(traced, call, args, address_of(function));
        }
    }
    std::hint::black_box(seed);
}

fn written_files(dir: &Path, collector: CollectorName) -> anyhow::Result<Vec<PathBuf>> {
    let prefix = format!(
        "{}-{}-{}-",
        collector.id(),
        perfcollect_metadata::hostname(),
        std::process::id()
    );
    let mut written = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&prefix));
        if matches {
            written.push(path);
        }
    }
    written.sort();
    Ok(written)
}

fn read_blobs(path: &Path) -> anyhow::Result<Vec<Blob>> {
    let data =
        std::fs::read(path).with_context(|| format!("reading {}", path.to_string_lossy()))?;
    decode_blobs(&data).with_context(|| format!("decoding {}", path.to_string_lossy()))
}

fn dump(paths: &[PathBuf]) -> anyhow::Result<()> {
    for path in paths {
        let blobs = read_blobs(path)?;
        println!("{}: {} blobs", path.to_string_lossy(), blobs.len());
        for blob in &blobs {
            println!("{}", describe(blob));
        }
    }
    Ok(())
}

fn format_time(ns: u64) -> String {
    DateTime::from_timestamp_nanos(ns as i64)
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

fn describe(blob: &Blob) -> String {
    let header = match &blob.header {
        Some(header) => format!(
            "{} {}@{} pid={} tid={} rank={} [{} - {}] addresses {:#x}-{:#x}",
            header.experiment,
            header.collector,
            header.host,
            header.pid,
            header.posix_tid,
            header.rank,
            format_time(header.time_begin),
            format_time(header.time_end),
            header.addr_begin,
            header.addr_end,
        ),
        None => "<no header>".to_string(),
    };
    let payload = match &blob.payload {
        Some(Payload::Pcsamp(data)) => format!(
            "{} addresses, {} samples",
            data.pc.len(),
            data.count.iter().sum::<u64>()
        ),
        Some(Payload::Hwcsamp(data)) => format!(
            "{} addresses, {} samples, counters {}",
            data.pc.len(),
            data.count.iter().sum::<u64>(),
            data.events.iter().join(",")
        ),
        Some(Payload::Usertime(data)) => format!(
            "{} stacks in {} frames, {} samples",
            data.count.iter().filter(|count| **count != 0).count(),
            data.stacktraces.len(),
            data.count.iter().map(|count| *count as u64).sum::<u64>()
        ),
        Some(Payload::Io(data)) => format!(
            "{} events, {} stack frames",
            data.events.len(),
            data.stacktraces.len()
        ),
        Some(Payload::Mem(data)) => format!(
            "{} events, {} stack frames",
            data.events.len(),
            data.stacktraces.len()
        ),
        Some(Payload::Mpi(data)) => format!(
            "{} events, {} bytes transferred, {} stack frames",
            data.events.len(),
            data.events.iter().map(|event| event.size).sum::<u64>(),
            data.stacktraces.len()
        ),
        Some(Payload::Pthreads(data)) => format!(
            "{} events, {} stack frames",
            data.events.len(),
            data.stacktraces.len()
        ),
        Some(Payload::LinkedObjects(group)) => format!(
            "linked objects: {}",
            group
                .objects
                .iter()
                .map(|object| format!(
                    "{} {:#x}-{:#x}{}",
                    object.path,
                    object.addr_begin,
                    object.addr_end,
                    if object.is_executable { " (executable)" } else { "" }
                ))
                .join(", ")
        ),
        None => "empty".to_string(),
    };
    format!("{header}\n  {payload}")
}

fn render_flamegraph(paths: &[PathBuf], output: &Path) -> anyhow::Result<()> {
    let mut folded = FoldedStacks::new();
    for path in paths {
        for blob in read_blobs(path)? {
            folded.add_blob(&blob);
        }
    }
    if folded.is_empty() {
        bail!(
            "nothing to render in {}",
            paths.iter().map(|path| path.to_string_lossy()).join(", ")
        );
    }

    let mut options: flamegraph::Options<'_> = flamegraph::Options::default();
    let data = folded.to_folded();
    let f = File::create(output)
        .with_context(|| format!("creating {}", output.to_string_lossy()))?;
    flamegraph::from_reader(&mut options, data.as_bytes(), f)
        .map_err(|e| anyhow!("failed to generate flamegraph: {:?}", e))?;
    eprintln!(
        "Flamegraph successfully written to {}",
        output.to_string_lossy()
    );
    Ok(())
}
