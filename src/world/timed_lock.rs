use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Mutual exclusion that only ever waits for a bounded time.
///
/// The protected value is moved out of the slot while locked and moved
/// back when the guard drops, so "locked" is simply "slot is empty". The
/// inner std mutex is held only for the move itself.
pub struct TimedMutex<T> {
    slot: Mutex<Option<T>>,
    released: Condvar,
}

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Mutex::new(Some(value)),
            released: Condvar::new(),
        }
    }

    pub fn lock_timeout(&self, timeout: Duration) -> Option<TimedGuard<'_, T>> {
        let value = self.take(timeout)?;
        Some(TimedGuard {
            lock: self,
            value: Some(value),
        })
    }

    pub fn try_lock(&self) -> Option<TimedGuard<'_, T>> {
        self.lock_timeout(Duration::ZERO)
    }

    pub fn is_locked(&self) -> bool {
        self.slot().is_none()
    }

    pub(crate) fn take(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .released
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = next;
        }
    }

    pub(crate) fn restore(&self, value: T) {
        *self.slot() = Some(value);
        self.released.notify_one();
    }

    fn slot(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default> Default for TimedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for TimedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

pub struct TimedGuard<'a, T> {
    lock: &'a TimedMutex<T>,
    value: Option<T>,
}

impl<T> Deref for TimedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.value.as_ref() {
            Some(value) => value,
            None => unreachable!("guard value is present until drop"),
        }
    }
}

impl<T> DerefMut for TimedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.value.as_mut() {
            Some(value) => value,
            None => unreachable!("guard value is present until drop"),
        }
    }
}

impl<T> Drop for TimedGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.lock.restore(value);
        }
    }
}
