//! Collection states and process-wide bookkeeping of collecting threads.

use parking_lot::{const_mutex, Mutex};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionStatus {
    #[default]
    NotStarted,
    Started,
    Paused,
    Resumed,
    Finished,
}

impl CollectionStatus {
    /// `Started` and `Resumed` behave the same.
    pub fn is_active(self) -> bool {
        matches!(self, CollectionStatus::Started | CollectionStatus::Resumed)
    }

    /// Started at some point and not finished yet.
    pub fn is_live(self) -> bool {
        self.is_active() || self == CollectionStatus::Paused
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CollectionStatus::NotStarted => "not started",
            CollectionStatus::Started => "started",
            CollectionStatus::Paused => "paused",
            CollectionStatus::Resumed => "resumed",
            CollectionStatus::Finished => "finished",
        };
        write!(f, "{}", name)
    }
}

/// Counts the threads collecting through one event source so that its
/// process-wide setup runs on the first start and its teardown on the last
/// stop. Setup and teardown run with the count locked, so no thread observes
/// a half set up source.
pub struct ProcessRegistry {
    active: Mutex<usize>,
}

impl ProcessRegistry {
    pub const fn new() -> Self {
        ProcessRegistry {
            active: const_mutex(0),
        }
    }

    /// Registers a collecting thread, running `setup` if it is the first one.
    /// A failed setup leaves the count untouched.
    pub fn enter<E>(&self, setup: impl FnOnce() -> Result<(), E>) -> Result<usize, E> {
        let mut active = self.active.lock();
        if *active == 0 {
            setup()?;
        }
        *active += 1;
        Ok(*active)
    }

    /// Unregisters a collecting thread, running `teardown` if it was the last
    /// one. Unbalanced calls are ignored.
    pub fn exit(&self, teardown: impl FnOnce()) -> usize {
        let mut active = self.active.lock();
        if *active == 0 {
            return 0;
        }
        *active -= 1;
        if *active == 0 {
            teardown();
        }
        *active
    }

    pub fn active(&self) -> usize {
        *self.active.lock()
    }

    /// Only the forking thread survives in a child process, so the count
    /// becomes one if it collects and zero otherwise. A lock held by another
    /// thread of the parent at fork time is released, its holder does not
    /// exist in the child.
    pub fn reset_in_child(&self, collecting: bool) {
        let mut active = match self.active.try_lock() {
            Some(active) => active,
            None => {
                // SAFETY: the child is single threaded, nothing else can be
                // using the count.
                unsafe { self.active.force_unlock() };
                self.active.lock()
            }
        };
        *active = usize::from(collecting);
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_setup_and_teardown_run_once() {
        // Given
        let registry = Arc::new(ProcessRegistry::new());
        let setups = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        // When
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let setups = setups.clone();
                let teardowns = teardowns.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    registry
                        .enter(|| {
                            setups.fetch_add(1, Ordering::SeqCst);
                            Ok::<(), ()>(())
                        })
                        .unwrap();
                    barrier.wait();
                    registry.exit(|| {
                        teardowns.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        // Then
        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_failed_setup_is_retried_by_the_next_thread() {
        let registry = ProcessRegistry::new();
        assert_eq!(registry.enter(|| Err("no timer")), Err("no timer"));
        assert_eq!(registry.active(), 0);
        assert_eq!(registry.enter(|| Ok::<(), &str>(())), Ok(1));
    }

    #[test]
    fn test_unbalanced_exit_is_ignored() {
        let registry = ProcessRegistry::new();
        let mut teardowns = 0;
        assert_eq!(registry.exit(|| teardowns += 1), 0);
        assert_eq!(teardowns, 0);
    }

    #[test]
    fn test_reset_in_child_releases_a_lock_held_at_fork() {
        // Given
        let registry = ProcessRegistry::new();
        registry.enter(|| Ok::<(), ()>(())).unwrap();
        registry.enter(|| Ok::<(), ()>(())).unwrap();
        // A parent thread held the lock when the process forked.
        std::mem::forget(registry.active.lock());

        // When
        registry.reset_in_child(true);

        // Then
        assert_eq!(registry.active(), 1);
        let mut teardowns = 0;
        assert_eq!(registry.exit(|| teardowns += 1), 0);
        assert_eq!(teardowns, 1);
    }

    #[test]
    fn test_reset_in_child_without_collection() {
        let registry = ProcessRegistry::new();
        registry.enter(|| Ok::<(), ()>(())).unwrap();
        registry.reset_in_child(false);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_status() {
        assert!(CollectionStatus::Started.is_active());
        assert!(CollectionStatus::Resumed.is_active());
        assert!(!CollectionStatus::Paused.is_active());
        assert!(CollectionStatus::Paused.is_live());
        assert!(!CollectionStatus::Finished.is_live());
        assert_eq!(CollectionStatus::default(), CollectionStatus::NotStarted);
        assert_eq!(CollectionStatus::Resumed.to_string(), "resumed");
    }
}
