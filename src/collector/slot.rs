use std::cell::RefCell;
use std::thread::LocalKey;

/// Thread local home of one collector kind.
pub type SlotKey<T> = LocalKey<RefCell<Option<T>>>;

/// Access to the calling thread's collector of one kind.
///
/// Every accessor tolerates the slot being empty (the thread never started,
/// or already stopped) and the slot being busy (a signal handler interrupted
/// the thread while it was using its collector). Both turn into a no-op.
pub trait ThreadLocalStore<T> {
    /// Installs `value`, returning whatever was installed before. A busy slot
    /// hands `value` back.
    fn install(&'static self, value: T) -> Option<T>;

    /// Runs `f` on the installed value.
    fn with_installed<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> Option<R>;

    fn take(&'static self) -> Option<T>;

    fn is_installed(&'static self) -> bool {
        self.with_installed(|_| ()).is_some()
    }
}

impl<T: 'static> ThreadLocalStore<T> for SlotKey<T> {
    fn install(&'static self, value: T) -> Option<T> {
        self.try_with(|slot| match slot.try_borrow_mut() {
            Ok(mut slot) => slot.replace(value),
            Err(_) => Some(value),
        })
        .ok()
        .flatten()
    }

    fn with_installed<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.try_with(|slot| {
            let mut slot = slot.try_borrow_mut().ok()?;
            slot.as_mut().map(f)
        })
        .ok()
        .flatten()
    }

    fn take(&'static self) -> Option<T> {
        self.try_with(|slot| slot.try_borrow_mut().ok()?.take())
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    thread_local! {
        static SLOT: RefCell<Option<u32>> = const { RefCell::new(None) };
    }

    #[test]
    fn test_slot_lifecycle() {
        assert!(!SLOT.is_installed());
        assert_eq!(SLOT.with_installed(|value| *value), None);

        assert_eq!(SLOT.install(1), None);
        assert_eq!(SLOT.with_installed(|value| {
            *value += 1;
            *value
        }), Some(2));
        assert_eq!(SLOT.install(7), Some(2));
        assert_eq!(SLOT.take(), Some(7));
        assert_eq!(SLOT.take(), None);
    }

    #[test]
    fn test_reentrant_access_is_a_noop() {
        SLOT.install(1);
        let inner = SLOT.with_installed(|_| SLOT.with_installed(|value| *value));
        assert_eq!(inner, Some(None));
        SLOT.take();
    }

    #[test]
    fn test_slots_are_per_thread() {
        SLOT.install(1);
        let other = std::thread::spawn(|| SLOT.is_installed()).join().unwrap();
        assert!(!other);
        SLOT.take();
    }
}
