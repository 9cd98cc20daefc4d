use nix::unistd::{getpid, gettid};
use std::fmt::{Display, Formatter};

/// Process and kernel thread id of a collecting thread.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub struct TaskKey {
    pub pid: i32,
    pub tid: i32,
}

impl TaskKey {
    /// Identity of the calling thread. A forked child gets a new identity, so
    /// callers re-read it after fork instead of caching it process-wide.
    pub fn current() -> Self {
        TaskKey {
            pid: getpid().as_raw(),
            tid: gettid().as_raw(),
        }
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "pid={}, tid={}", self.pid, self.tid)
    }
}
