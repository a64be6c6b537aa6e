//! Interrupt-masking lock
//!
//! [`IrqMutex`] wraps a `spin::Mutex` and masks interrupts for as long as
//! the guard lives, so state shared between thread context and the USB
//! interrupt handler can be touched from either side without deadlock.
//! Critical sections must stay short and must never invoke user callbacks.

use core::ops::{Deref, DerefMut};

use super::{InterruptState, disable_interrupts, restore_interrupts};

/// Spinlock that masks interrupts while held
pub struct IrqMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqMutex<T> {
    /// Create a new lock around `value`
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Mask interrupts, then acquire the lock
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let state = disable_interrupts();
        let guard = self.inner.lock();
        IrqMutexGuard {
            guard: Some(guard),
            state,
        }
    }

    /// Exclusive access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Guard returned by [`IrqMutex::lock`]
pub struct IrqMutexGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    state: InterruptState,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => &mut **guard,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before unmasking.
        drop(self.guard.take());
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        restore_interrupts(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_lock_on_drop() {
        let lock = IrqMutex::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }
}
