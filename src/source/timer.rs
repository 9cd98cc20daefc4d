use super::{EventSource, SourceError};
use crate::lifecycle::ProcessRegistry;

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::cell::Cell;
use std::time::Duration;
use tracing::debug;

const SIGNAL: Signal = Signal::SIGPROF;

/// Called on the profiled thread, inside the signal handler, with the
/// interrupted `ucontext_t`.
pub type TickHandler = fn(context: *const libc::c_void);

static TIMER_REGISTRY: ProcessRegistry = ProcessRegistry::new();

thread_local! {
    static TICK: Cell<Option<TickHandler>> = const { Cell::new(None) };
}

extern "C" fn handle_tick(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let saved = errno::errno();
    let _ = TICK.try_with(|tick| {
        if let Some(on_tick) = tick.get() {
            on_tick(context);
        }
    });
    errno::set_errno(saved);
}

/// Per-thread CPU time timer delivering `SIGPROF` to the thread that armed
/// it.
pub struct TimerSource {
    interval: Duration,
    on_tick: TickHandler,
    timer: Option<libc::timer_t>,
}

impl TimerSource {
    pub fn new(interval: Duration, on_tick: TickHandler) -> Self {
        TimerSource {
            interval,
            on_tick,
            timer: None,
        }
    }

    /// Sampling rate in samples per second to a timer period.
    pub fn interval_for_rate(rate: u64) -> Duration {
        Duration::from_nanos(1_000_000_000 / rate.max(1))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    fn mask(how: SigmaskHow) {
        let mut set = SigSet::empty();
        set.add(SIGNAL);
        // Only fails for an invalid `how`.
        let _ = signal::pthread_sigmask(how, Some(&set), None);
    }
}

impl EventSource for TimerSource {
    fn registry(&self) -> &'static ProcessRegistry {
        &TIMER_REGISTRY
    }

    fn setup_process(&self) -> Result<(), SourceError> {
        let action = SigAction::new(
            SigHandler::SigAction(handle_tick),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(SIGNAL, &action) }.map_err(|errno| SourceError::Sigaction {
            signal: SIGNAL.as_str(),
            errno,
        })?;
        debug!("installed {} handler", SIGNAL);
        Ok(())
    }

    fn teardown_process(&self) {
        // A tick still in flight must not terminate the process.
        let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let _ = unsafe { signal::sigaction(SIGNAL, &action) };
        debug!("removed {} handler", SIGNAL);
    }

    fn attach(&mut self) -> Result<(), SourceError> {
        if self.timer.is_some() {
            return Ok(());
        }
        TICK.with(|tick| tick.set(Some(self.on_tick)));

        let mut timer: libc::timer_t = std::ptr::null_mut();
        let mut event: libc::sigevent = unsafe { std::mem::zeroed() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = SIGNAL as libc::c_int;
        event.sigev_notify_thread_id = nix::unistd::gettid().as_raw();

        let ret = unsafe { libc::timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut event, &mut timer) };
        if ret != 0 {
            return Err(SourceError::TimerCreate(Errno::last()));
        }

        let period = libc::timespec {
            tv_sec: self.interval.as_secs() as libc::time_t,
            tv_nsec: self.interval.subsec_nanos() as libc::c_long,
        };
        let interval = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };
        let ret = unsafe { libc::timer_settime(timer, 0, &interval, std::ptr::null_mut()) };
        if ret != 0 {
            let errno = Errno::last();
            unsafe { libc::timer_delete(timer) };
            return Err(SourceError::TimerSettime(errno));
        }

        Self::mask(SigmaskHow::SIG_UNBLOCK);
        self.timer = Some(timer);
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(timer) = self.timer.take() {
            unsafe { libc::timer_delete(timer) };
        }
        let _ = TICK.try_with(|tick| tick.set(None));
    }

    fn suspend(&mut self) {
        Self::mask(SigmaskHow::SIG_BLOCK);
    }

    fn unsuspend(&mut self) {
        Self::mask(SigmaskHow::SIG_UNBLOCK);
    }
}

impl Drop for TimerSource {
    fn drop(&mut self) {
        if self.timer.is_some() {
            self.detach();
        }
    }
}
