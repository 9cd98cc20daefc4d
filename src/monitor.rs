//! Process and thread lifecycle notifications, turned into collector
//! transitions.

use crate::collector::CollectorControl;
use crate::lifecycle::CollectionStatus;

use tracing::{debug, error, warn};

/// Notifications delivered by the process monitoring layer, on the thread
/// they concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent<'a> {
    ProcessInit,
    ProcessExit,
    ThreadInit,
    ThreadExit,
    PreFork,
    PostFork { child: bool },
    PreDlopen,
    /// A library finished loading.
    Dlopen { library: &'a str },
    Dlclose,
    PostDlclose,
    MpiPreInit,
    MpiInit,
    MpiPostCommRank(i32),
    MpiFinalize,
    MpiPostFinalize,
    MpiPcontrol(i32),
}

/// Follows the notifications of one thread and drives its collector.
pub struct Monitor<C> {
    control: C,
    status: CollectionStatus,
    in_mpi_pre_init: bool,
    /// MPI is initialized, collection stays paused until the rank arrives.
    awaiting_rank: bool,
}

impl<C: CollectorControl> Monitor<C> {
    pub fn new(control: C) -> Self {
        Monitor {
            control,
            status: CollectionStatus::NotStarted,
            in_mpi_pre_init: false,
            awaiting_rank: false,
        }
    }

    pub fn status(&self) -> CollectionStatus {
        self.status
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn handle(&mut self, event: MonitorEvent<'_>) {
        use MonitorEvent::*;

        let status = self.status;
        match event {
            ProcessInit | ThreadInit
                if matches!(status, CollectionStatus::NotStarted | CollectionStatus::Finished) =>
            {
                if let Err(err) = self.control.start() {
                    error!("could not start collecting: {}", err);
                    std::process::abort();
                }
                self.status = CollectionStatus::Started;
                if event == ProcessInit {
                    self.control.record_linked_objects(None);
                }
            }
            ProcessExit | ThreadExit if status.is_live() => {
                self.status = CollectionStatus::Finished;
                self.control.stop();
            }
            PreDlopen | Dlclose if status.is_active() && !self.in_mpi_pre_init => self.pause(),
            Dlopen { library } if status.is_live() => {
                self.control.record_linked_objects(Some(library));
                if status == CollectionStatus::Paused && !self.in_mpi_pre_init {
                    self.resume();
                }
            }
            PostDlclose if status == CollectionStatus::Paused && !self.in_mpi_pre_init => {
                self.resume()
            }
            PreFork if status.is_active() => {
                self.pause();
                self.control.flush();
            }
            PostFork { child: false } if status == CollectionStatus::Paused => self.resume(),
            PostFork { child: true } if status == CollectionStatus::Paused => {
                if let Err(err) = self.control.restart_in_child() {
                    error!("could not restart collecting in the child: {}", err);
                    std::process::abort();
                }
                self.resume();
            }
            MpiPreInit if status.is_active() => {
                self.pause();
                self.in_mpi_pre_init = true;
            }
            MpiInit if status == CollectionStatus::Paused => {
                self.in_mpi_pre_init = false;
                if self.control.awaits_rank() {
                    debug!("waiting for a rank before resuming");
                    self.awaiting_rank = true;
                } else {
                    self.resume();
                }
            }
            MpiPostCommRank(rank) if status.is_live() => {
                if let Err(err) = self.control.connect(rank) {
                    warn!("could not connect rank {}: {}", rank, err);
                }
                // Only a pause taken for MPI initialization ends here.
                let held_for_mpi = self.awaiting_rank || self.in_mpi_pre_init;
                self.awaiting_rank = false;
                self.in_mpi_pre_init = false;
                if status == CollectionStatus::Paused && held_for_mpi {
                    self.resume();
                }
            }
            MpiFinalize if status.is_active() => self.pause(),
            MpiPostFinalize if status == CollectionStatus::Paused => self.resume(),
            MpiPcontrol(0) if status.is_active() => self.pause(),
            MpiPcontrol(level) if level != 0 && status == CollectionStatus::Paused => {
                self.resume()
            }
            event => debug!("ignoring {:?} while {}", event, status),
        }
    }

    fn pause(&mut self) {
        self.status = CollectionStatus::Paused;
        self.control.pause();
    }

    fn resume(&mut self) {
        self.status = CollectionStatus::Resumed;
        self.control.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::StartError;
    use crate::flush::FlushStats;
    use crate::sink::SinkError;
    use rstest::rstest;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        awaits_rank: Cell<bool>,
    }

    impl Recorder {
        fn log(&self, call: impl Into<String>) {
            self.calls.borrow_mut().push(call.into());
        }
    }

    impl CollectorControl for Recorder {
        fn start(&self) -> Result<(), StartError> {
            self.log("start");
            Ok(())
        }

        fn pause(&self) {
            self.log("pause");
        }

        fn resume(&self) {
            self.log("resume");
        }

        fn flush(&self) {
            self.log("flush");
        }

        fn stop(&self) -> Option<FlushStats> {
            self.log("stop");
            Some(FlushStats::default())
        }

        fn status(&self) -> Option<CollectionStatus> {
            None
        }

        fn connect(&self, rank: i32) -> Result<(), SinkError> {
            self.log(format!("connect {rank}"));
            self.awaits_rank.set(false);
            Ok(())
        }

        fn awaits_rank(&self) -> bool {
            self.awaits_rank.get()
        }

        fn restart_in_child(&self) -> Result<(), StartError> {
            self.log("restart");
            Ok(())
        }

        fn record_linked_objects(&self, library: Option<&str>) {
            match library {
                Some(library) => self.log(format!("objects {library}")),
                None => self.log("objects"),
            }
        }
    }

    const LIBM: MonitorEvent<'static> = MonitorEvent::Dlopen { library: "libm.so.6" };

    fn run(events: &[MonitorEvent]) -> (CollectionStatus, Vec<String>) {
        let mut monitor = Monitor::new(Recorder::default());
        for event in events {
            monitor.handle(*event);
        }
        let calls = monitor.control().calls.borrow().clone();
        (monitor.status(), calls)
    }

    #[rstest]
    #[case::dlopen(
        &[MonitorEvent::ThreadInit, MonitorEvent::PreDlopen, LIBM],
        CollectionStatus::Resumed,
        &["start", "pause", "objects libm.so.6", "resume"]
    )]
    #[case::dlclose(
        &[MonitorEvent::ProcessInit, MonitorEvent::Dlclose, MonitorEvent::PostDlclose, MonitorEvent::ProcessExit],
        CollectionStatus::Finished,
        &["start", "objects", "pause", "resume", "stop"]
    )]
    #[case::fork_parent(
        &[MonitorEvent::ProcessInit, MonitorEvent::PreFork, MonitorEvent::PostFork { child: false }],
        CollectionStatus::Resumed,
        &["start", "objects", "pause", "flush", "resume"]
    )]
    #[case::fork_child(
        &[MonitorEvent::ProcessInit, MonitorEvent::PreFork, MonitorEvent::PostFork { child: true }],
        CollectionStatus::Resumed,
        &["start", "objects", "pause", "flush", "restart", "resume"]
    )]
    #[case::pcontrol(
        &[MonitorEvent::ProcessInit, MonitorEvent::MpiPcontrol(0), MonitorEvent::MpiPcontrol(0), MonitorEvent::MpiPcontrol(1)],
        CollectionStatus::Resumed,
        &["start", "objects", "pause", "resume"]
    )]
    #[case::finalize(
        &[MonitorEvent::ProcessInit, MonitorEvent::MpiFinalize, MonitorEvent::MpiPostFinalize],
        CollectionStatus::Resumed,
        &["start", "objects", "pause", "resume"]
    )]
    #[case::not_started(
        &[MonitorEvent::PreDlopen, LIBM, MonitorEvent::ThreadExit],
        CollectionStatus::NotStarted,
        &[]
    )]
    #[case::restart_after_exit(
        &[MonitorEvent::ThreadInit, MonitorEvent::ThreadExit, MonitorEvent::ThreadInit, MonitorEvent::ThreadInit],
        CollectionStatus::Started,
        &["start", "stop", "start"]
    )]
    #[case::rank_keeps_user_pause(
        &[MonitorEvent::ProcessInit, MonitorEvent::MpiPcontrol(0), MonitorEvent::MpiPostCommRank(3)],
        CollectionStatus::Paused,
        &["start", "objects", "pause", "connect 3"]
    )]
    #[case::dlopen_while_collecting(
        &[MonitorEvent::ThreadInit, LIBM],
        CollectionStatus::Started,
        &["start", "objects libm.so.6"]
    )]
    fn test_transitions(
        #[case] events: &[MonitorEvent<'static>],
        #[case] status: CollectionStatus,
        #[case] calls: &[&str],
    ) {
        let (actual_status, actual_calls) = run(events);
        assert_eq!(actual_status, status);
        assert_eq!(actual_calls, calls);
    }

    #[test]
    fn test_dlopen_during_mpi_pre_init_keeps_paused() {
        let (status, calls) = run(&[
            MonitorEvent::ProcessInit,
            MonitorEvent::MpiPreInit,
            MonitorEvent::PreDlopen,
            LIBM,
        ]);
        assert_eq!(status, CollectionStatus::Paused);
        assert_eq!(calls, vec!["start", "objects", "pause", "objects libm.so.6"]);
    }

    #[test]
    fn test_rank_resumes_deferred_collection() {
        let mut monitor = Monitor::new(Recorder::default());
        monitor.control().awaits_rank.set(true);
        monitor.handle(MonitorEvent::ProcessInit);
        monitor.handle(MonitorEvent::MpiPreInit);
        monitor.handle(MonitorEvent::MpiInit);
        assert_eq!(monitor.status(), CollectionStatus::Paused);

        monitor.handle(MonitorEvent::MpiPostCommRank(7));
        assert_eq!(monitor.status(), CollectionStatus::Resumed);
        assert_eq!(
            *monitor.control().calls.borrow(),
            vec!["start", "objects", "pause", "connect 7", "resume"]
        );
    }

    #[test]
    fn test_rank_after_deferred_resume_keeps_later_pause() {
        let mut monitor = Monitor::new(Recorder::default());
        monitor.control().awaits_rank.set(true);
        monitor.handle(MonitorEvent::ProcessInit);
        monitor.handle(MonitorEvent::MpiPreInit);
        monitor.handle(MonitorEvent::MpiInit);
        monitor.handle(MonitorEvent::MpiPostCommRank(1));
        monitor.handle(MonitorEvent::MpiPcontrol(0));

        // A second rank report must not undo the user's pause.
        monitor.handle(MonitorEvent::MpiPostCommRank(1));
        assert_eq!(monitor.status(), CollectionStatus::Paused);
    }

    #[test]
    fn test_mpi_init_resumes_when_connected() {
        let (status, calls) = run(&[
            MonitorEvent::ProcessInit,
            MonitorEvent::MpiPreInit,
            MonitorEvent::MpiInit,
            MonitorEvent::MpiPostCommRank(0),
        ]);
        assert_eq!(status, CollectionStatus::Resumed);
        assert_eq!(calls, vec!["start", "objects", "pause", "resume", "connect 0"]);
    }
}
