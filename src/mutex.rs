//! A futex-backed mutex and once-flag with `const` constructors, so they can
//! guard process-wide state from plain statics with no runtime setup. These
//! are only ever taken on slow paths, so there is no adaptive spinning or
//! wakeup-avoidance cleverness.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;

use crate::sync::{AtomicBool, AtomicU32, Ordering};

const FREE: u32 = 0;
const HELD_NO_WAITER: u32 = 1;
const HELD_POSSIBLE_WAITER: u32 = 2;

fn futex_wait(state: &AtomicU32, val: u32) {
    // Errors are ignored; a spurious return only costs another exchange.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            val,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

fn futex_wake(state: &AtomicU32, num: i32) {
    // Ignored here too; failure usually means a teardown race.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            state as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            num,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

pub(crate) struct Mutex<T> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(FREE),
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        let old_state = self.state.swap(HELD_NO_WAITER, Ordering::Acquire);
        if old_state != FREE {
            loop {
                let old_state = self.state.swap(HELD_POSSIBLE_WAITER, Ordering::Acquire);
                if old_state == FREE {
                    break;
                }
                futex_wait(&self.state, HELD_POSSIBLE_WAITER);
            }
        }
        MutexGuard { mutex: self }
    }
}

impl<T> core::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

pub(crate) struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.mutex.state.swap(FREE, Ordering::Release) == HELD_POSSIBLE_WAITER {
            futex_wake(&self.mutex.state, 1);
        }
    }
}

pub(crate) struct Once {
    initialized: AtomicBool,
    mu: Mutex<()>,
}

impl Once {
    pub(crate) const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            mu: Mutex::new(()),
        }
    }

    pub(crate) fn call_once(&self, func: impl FnOnce()) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.mu.lock();
        if self.initialized.load(Ordering::Relaxed) {
            return;
        }
        func();
        self.initialized.store(true, Ordering::Release);
    }
}

impl core::fmt::Debug for Once {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Once").finish_non_exhaustive()
    }
}
