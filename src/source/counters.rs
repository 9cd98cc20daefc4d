use super::{EventSource, SourceError, TickHandler, TimerSource};
use crate::buffer::{CounterDeltas, MAX_COUNTERS};
use crate::lifecycle::ProcessRegistry;

use errno::errno;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;
use std::cell::Cell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::raw::c_int;
use tracing::{debug, warn};

/// `(type, config)` of a counter name. Accepts the PAPI preset names used by
/// existing experiment configurations as well as perf style names.
pub fn counter_config(name: &str) -> Option<(u32, u64)> {
    use sys::bindings::*;

    let hardware = |config: u32| Some((PERF_TYPE_HARDWARE, config as u64));
    let software = |config: u32| Some((PERF_TYPE_SOFTWARE, config as u64));
    match name {
        "PAPI_TOT_CYC" | "cycles" | "cpu-cycles" => hardware(PERF_COUNT_HW_CPU_CYCLES),
        "PAPI_TOT_INS" | "instructions" => hardware(PERF_COUNT_HW_INSTRUCTIONS),
        "PAPI_REF_CYC" | "ref-cycles" => hardware(PERF_COUNT_HW_REF_CPU_CYCLES),
        "PAPI_L3_TCA" | "cache-references" => hardware(PERF_COUNT_HW_CACHE_REFERENCES),
        "PAPI_L3_TCM" | "cache-misses" => hardware(PERF_COUNT_HW_CACHE_MISSES),
        "PAPI_BR_INS" | "branches" | "branch-instructions" => {
            hardware(PERF_COUNT_HW_BRANCH_INSTRUCTIONS)
        }
        "PAPI_BR_MSP" | "branch-misses" => hardware(PERF_COUNT_HW_BRANCH_MISSES),
        "task-clock" => software(PERF_COUNT_SW_TASK_CLOCK),
        "page-faults" => software(PERF_COUNT_SW_PAGE_FAULTS),
        "context-switches" => software(PERF_COUNT_SW_CONTEXT_SWITCHES),
        "cpu-migrations" => software(PERF_COUNT_SW_CPU_MIGRATIONS),
        _ => None,
    }
}

/// Opens a counter of the calling thread. With a `sample_period` the counter
/// starts disabled and overflows every `sample_period` events.
///
/// # Safety
unsafe fn open_counter(type_: u32, config: u64, sample_period: Option<u64>) -> Result<OwnedFd, c_int> {
    let mut attrs: perf_event_attr = perf_event_attr {
        size: std::mem::size_of::<perf_event_attr>() as u32,
        type_,
        config,
        ..Default::default()
    };
    attrs.set_exclude_kernel(1);
    attrs.set_exclude_hv(1);
    if let Some(period) = sample_period {
        attrs.__bindgen_anon_1.sample_period = period;
        attrs.__bindgen_anon_2.wakeup_events = 1;
        attrs.set_disabled(1);
    }

    let ret = sys::perf_event_open(
        &mut attrs, 0,  /* pid: calling thread */
        -1, /* cpu */
        -1, /* group_fd */
        0,  /* flags */
    ) as c_int;

    if ret < 0 {
        return Err(errno().0);
    }

    Ok(OwnedFd::from_raw_fd(ret))
}

struct Counter {
    fd: OwnedFd,
    last: u64,
}

/// Hardware counters of the calling thread, read on every tick of a
/// [`TimerSource`].
pub struct CounterSource {
    timer: TimerSource,
    events: Vec<String>,
    counters: Vec<Counter>,
}

impl CounterSource {
    /// Opens the requested counters for the calling thread. Unknown or
    /// unavailable names are skipped with a warning, and at most
    /// [`MAX_COUNTERS`] are kept. Fails when nothing could be opened.
    pub fn open(timer: TimerSource, requested: &[String]) -> Result<Self, SourceError> {
        let mut events = Vec::new();
        let mut counters = Vec::new();

        for name in requested {
            if counters.len() == MAX_COUNTERS {
                warn!("at most {} counters are sampled, skipping {}", MAX_COUNTERS, name);
                continue;
            }
            let Some((type_, config)) = counter_config(name) else {
                warn!("unknown hardware counter {}, skipping", name);
                continue;
            };
            match unsafe { open_counter(type_, config, None) } {
                Ok(fd) => {
                    debug!("opened counter {}", name);
                    events.push(name.clone());
                    counters.push(Counter { fd, last: 0 });
                }
                Err(err) => warn!("counter {} unavailable (errno {}), skipping", name, err),
            }
        }

        if counters.is_empty() {
            return Err(SourceError::NoCounters(requested.join(",")));
        }
        Ok(CounterSource {
            timer,
            events,
            counters,
        })
    }

    /// Names of the counters actually sampled, in delta order.
    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Reads every counter and returns what it advanced by since the previous
    /// read. Only `read(2)` is called, which is async-signal-safe.
    pub fn read_deltas(&mut self) -> CounterDeltas {
        let mut deltas = CounterDeltas::default();
        for (counter, delta) in self.counters.iter_mut().zip(deltas.0.iter_mut()) {
            let mut value: u64 = 0;
            let ret = unsafe {
                libc::read(
                    counter.fd.as_raw_fd(),
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret as usize == std::mem::size_of::<u64>() {
                *delta = value.wrapping_sub(counter.last);
                counter.last = value;
            }
        }
        deltas
    }
}

impl EventSource for CounterSource {
    fn registry(&self) -> &'static ProcessRegistry {
        self.timer.registry()
    }

    fn setup_process(&self) -> Result<(), SourceError> {
        self.timer.setup_process()
    }

    fn teardown_process(&self) {
        self.timer.teardown_process()
    }

    fn attach(&mut self) -> Result<(), SourceError> {
        // Deltas start from the moment sampling starts.
        self.read_deltas();
        self.timer.attach()
    }

    fn detach(&mut self) {
        self.timer.detach()
    }

    fn suspend(&mut self) {
        self.timer.suspend()
    }

    fn unsuspend(&mut self) {
        self.timer.unsuspend()
    }
}

/// Signal counter overflows are delivered with.
const OVERFLOW_SIGNAL: Signal = Signal::SIGIO;

// Not exported by the libc crate.
const F_SETOWN_EX: c_int = 15;
const F_SETSIG: c_int = 10;
const F_OWNER_TID: c_int = 0;

#[repr(C)]
struct OwnerEx {
    type_: c_int,
    pid: libc::pid_t,
}

static OVERFLOW_REGISTRY: ProcessRegistry = ProcessRegistry::new();

thread_local! {
    static OVERFLOW: Cell<Option<(TickHandler, c_int)>> = const { Cell::new(None) };
}

extern "C" fn handle_overflow(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let saved = errno::errno();
    let _ = OVERFLOW.try_with(|overflow| {
        if let Some((on_overflow, fd)) = overflow.get() {
            on_overflow(context);
            // The counter disables itself after each overflow.
            unsafe { sys::ioctls::REFRESH(fd, 1) };
        }
    });
    errno::set_errno(saved);
}

/// One counter of the calling thread that interrupts it every `threshold`
/// events with `SIGIO`.
pub struct OverflowSource {
    event: String,
    type_: u32,
    config: u64,
    threshold: u64,
    on_overflow: TickHandler,
    fd: OwnedFd,
    owner: libc::pid_t,
    armed: bool,
}

impl OverflowSource {
    /// Opens `event` for the calling thread. Fails when the name is unknown
    /// or the counter is unavailable.
    pub fn open(event: &str, threshold: u64, on_overflow: TickHandler) -> Result<Self, SourceError> {
        let Some((type_, config)) = counter_config(event) else {
            warn!("unknown hardware counter {}", event);
            return Err(SourceError::NoCounters(event.to_string()));
        };
        let threshold = threshold.max(1);
        let fd = unsafe { open_counter(type_, config, Some(threshold)) }.map_err(|err| {
            warn!("counter {} unavailable (errno {})", event, err);
            SourceError::NoCounters(event.to_string())
        })?;
        debug!("opened counter {} overflowing every {} events", event, threshold);
        Ok(OverflowSource {
            event: event.to_string(),
            type_,
            config,
            threshold,
            on_overflow,
            fd,
            owner: nix::unistd::gettid().as_raw(),
            armed: false,
        })
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Routes overflow signals of the counter to the calling thread.
    fn deliver_here(&self) -> Result<(), SourceError> {
        let fd = self.fd.as_raw_fd();
        let owner = OwnerEx {
            type_: F_OWNER_TID,
            pid: self.owner,
        };
        Errno::result(unsafe { libc::fcntl(fd, F_SETOWN_EX, &owner as *const OwnerEx) })
            .and_then(|_| Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_ASYNC) }))
            .and_then(|_| Errno::result(unsafe { libc::fcntl(fd, F_SETSIG, OVERFLOW_SIGNAL as c_int) }))
            .map(drop)
            .map_err(SourceError::OverflowDelivery)
    }

    fn mask(how: SigmaskHow) {
        let mut set = SigSet::empty();
        set.add(OVERFLOW_SIGNAL);
        let _ = signal::pthread_sigmask(how, Some(&set), None);
    }
}

impl EventSource for OverflowSource {
    fn registry(&self) -> &'static ProcessRegistry {
        &OVERFLOW_REGISTRY
    }

    fn setup_process(&self) -> Result<(), SourceError> {
        let action = SigAction::new(
            SigHandler::SigAction(handle_overflow),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(OVERFLOW_SIGNAL, &action) }.map_err(|errno| {
            SourceError::Sigaction {
                signal: OVERFLOW_SIGNAL.as_str(),
                errno,
            }
        })?;
        debug!("installed {} handler", OVERFLOW_SIGNAL);
        Ok(())
    }

    fn teardown_process(&self) {
        let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let _ = unsafe { signal::sigaction(OVERFLOW_SIGNAL, &action) };
        debug!("removed {} handler", OVERFLOW_SIGNAL);
    }

    fn attach(&mut self) -> Result<(), SourceError> {
        if self.armed {
            return Ok(());
        }
        // A counter inherited over fork still counts the parent's thread.
        let tid = nix::unistd::gettid().as_raw();
        if tid != self.owner {
            self.fd = unsafe { open_counter(self.type_, self.config, Some(self.threshold)) }
                .map_err(|_| SourceError::NoCounters(self.event.clone()))?;
            self.owner = tid;
        }
        self.deliver_here()?;

        let fd = self.fd.as_raw_fd();
        OVERFLOW.with(|overflow| overflow.set(Some((self.on_overflow, fd))));
        Self::mask(SigmaskHow::SIG_UNBLOCK);
        if unsafe { sys::ioctls::REFRESH(fd, 1) } < 0 {
            let errno = Errno::last();
            OVERFLOW.with(|overflow| overflow.set(None));
            return Err(SourceError::OverflowDelivery(errno));
        }
        self.armed = true;
        Ok(())
    }

    fn detach(&mut self) {
        unsafe { sys::ioctls::DISABLE(self.fd.as_raw_fd(), 0) };
        let _ = OVERFLOW.try_with(|overflow| overflow.set(None));
        self.armed = false;
    }

    fn suspend(&mut self) {
        unsafe { sys::ioctls::DISABLE(self.fd.as_raw_fd(), 0) };
    }

    fn unsuspend(&mut self) {
        if self.armed {
            unsafe { sys::ioctls::REFRESH(self.fd.as_raw_fd(), 1) };
        }
    }
}
