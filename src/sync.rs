//! Priority-inheriting wake-up primitives.
//!
//! `std` and `parking_lot` expose no way to request `PTHREAD_PRIO_INHERIT`,
//! so the mutex and condition variable here sit directly on the pthread
//! objects. Any configuration step failing at construction is fatal.

use crate::ensure;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Add, Deref, DerefMut};
use std::time::Duration;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A point on `CLOCK_MONOTONIC`, used for absolute-deadline waits so that
/// scheduling jitter does not accumulate drift across periodic ticks.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct MonotonicInstant {
    secs: i64,
    nanos: u32,
}

impl MonotonicInstant {
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ensure!(ret == 0, "could not read monotonic clock");
        Self {
            secs: ts.tv_sec,
            nanos: ts.tv_nsec as u32,
        }
    }

    fn as_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.secs,
            tv_nsec: self.nanos as _,
        }
    }
}

impl Add<Duration> for MonotonicInstant {
    type Output = MonotonicInstant;

    fn add(self, rhs: Duration) -> MonotonicInstant {
        let mut secs = self.secs + rhs.as_secs() as i64;
        let mut nanos = self.nanos + rhs.subsec_nanos();
        if nanos >= NANOS_PER_SEC {
            nanos -= NANOS_PER_SEC;
            secs += 1;
        }
        MonotonicInstant { secs, nanos }
    }
}

/// Mutual exclusion with the priority-inheritance protocol: a low-priority
/// holder is temporarily boosted to the priority of the highest-priority
/// waiter, so a realtime thread blocked on the lock is not stalled behind
/// medium-priority work (priority inversion).
pub struct PrioMutex<T> {
    // pthread objects must not move once initialized.
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for PrioMutex<T> {}
unsafe impl<T: Send> Sync for PrioMutex<T> {}

impl<T> PrioMutex<T> {
    pub fn new(value: T) -> Self {
        let raw = Box::new(UnsafeCell::new(unsafe {
            mem::zeroed::<libc::pthread_mutex_t>()
        }));
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            ensure!(
                libc::pthread_mutexattr_init(&mut attr) == 0,
                "could not initialize mutex attributes"
            );
            ensure!(
                libc::pthread_mutexattr_setprotocol(&mut attr, libc::PTHREAD_PRIO_INHERIT) == 0,
                "could not request priority inheritance"
            );
            ensure!(
                libc::pthread_mutex_init(raw.get(), &attr) == 0,
                "could not initialize mutex"
            );
            ensure!(
                libc::pthread_mutexattr_destroy(&mut attr) == 0,
                "could not destroy mutex attributes"
            );
        }
        Self {
            raw,
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> PrioMutexGuard<'_, T> {
        let ret = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        ensure!(ret == 0, "could not lock mutex");
        PrioMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<PrioMutexGuard<'_, T>> {
        let ret = unsafe { libc::pthread_mutex_trylock(self.raw.get()) };
        match ret {
            0 => Some(PrioMutexGuard {
                mutex: self,
                _not_send: PhantomData,
            }),
            libc::EBUSY => None,
            _ => {
                ensure!(ret == 0 || ret == libc::EBUSY, "could not try-lock mutex");
                unreachable!()
            }
        }
    }
}

impl<T> Drop for PrioMutex<T> {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::pthread_mutex_destroy(self.raw.get());
        }
    }
}

/// RAII lock guard; releases the mutex on drop. Must stay on the locking
/// thread (pthread mutexes are owner-sensitive), hence not `Send`.
pub struct PrioMutexGuard<'a, T> {
    mutex: &'a PrioMutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for PrioMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for PrioMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for PrioMutexGuard<'_, T> {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
        debug_assert_eq!(ret, 0);
    }
}

/// Whether a timed condition wait returned because the deadline passed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

/// Condition variable paired with [`PrioMutex`], waiting on `CLOCK_MONOTONIC`
/// so absolute deadlines are immune to wall-clock adjustments.
pub struct PrioCondvar {
    raw: Box<UnsafeCell<libc::pthread_cond_t>>,
}

unsafe impl Send for PrioCondvar {}
unsafe impl Sync for PrioCondvar {}

impl PrioCondvar {
    pub fn new() -> Self {
        let raw = Box::new(UnsafeCell::new(unsafe {
            mem::zeroed::<libc::pthread_cond_t>()
        }));
        unsafe {
            let mut attr: libc::pthread_condattr_t = mem::zeroed();
            ensure!(
                libc::pthread_condattr_init(&mut attr) == 0,
                "could not initialize condvar attributes"
            );
            ensure!(
                libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC) == 0,
                "could not select monotonic clock"
            );
            ensure!(
                libc::pthread_cond_init(raw.get(), &attr) == 0,
                "could not initialize condvar"
            );
            ensure!(
                libc::pthread_condattr_destroy(&mut attr) == 0,
                "could not destroy condvar attributes"
            );
        }
        Self { raw }
    }

    /// Block until notified. Spurious wake-ups are possible; callers loop on
    /// their predicate.
    pub fn wait<'a, T>(&self, guard: PrioMutexGuard<'a, T>) -> PrioMutexGuard<'a, T> {
        let ret = unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) };
        ensure!(ret == 0, "could not wait on condvar");
        guard
    }

    /// Block until notified or until the absolute `deadline` passes.
    pub fn wait_until<'a, T>(
        &self,
        guard: PrioMutexGuard<'a, T>,
        deadline: MonotonicInstant,
    ) -> (PrioMutexGuard<'a, T>, WaitTimeoutResult) {
        let ts = deadline.as_timespec();
        let ret =
            unsafe { libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), &ts) };
        ensure!(
            ret == 0 || ret == libc::ETIMEDOUT,
            "could not wait on condvar"
        );
        (guard, WaitTimeoutResult(ret == libc::ETIMEDOUT))
    }

    pub fn notify_one(&self) {
        let ret = unsafe { libc::pthread_cond_signal(self.raw.get()) };
        ensure!(ret == 0, "could not signal condvar");
    }
}

impl Default for PrioCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PrioCondvar {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::pthread_cond_destroy(self.raw.get());
        }
    }
}
