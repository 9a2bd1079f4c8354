//! OS thread binding.
//!
//! One [`Thread`] owns one native OS thread configured for deterministic
//! scheduling: fixed-priority policy, CPU affinity, bounded stack and (for
//! realtime threads) memory pages locked into RAM. The spawned thread runs
//! the supplied update callback either periodically or whenever [`wake`]
//! is called; bursts of wake requests coalesce into a single wake-up.
//!
//! Configuration freezes once the OS thread is created: later `set_period`
//! or `set_stack_size` calls are silently ignored, and the scheduling
//! identity (kind, priority, affinity) is immutable from construction.
//!
//! [`wake`]: Thread::wake

use crate::alloc_guard::NoAllocGuard;
use crate::os::{OsThreadApi, PosixOs, SchedPolicy, ThreadAttrs, ThreadEntry, ThreadHandle};
use crate::sync::{MonotonicInstant, PrioCondvar, PrioMutex};
use crate::{ensure, ensure_ok, expect};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default stack size in bytes, on top of the OS-reserved minimum.
pub const DEFAULT_STACK_SIZE: usize = 2048 * 1024;

/// pthread names are capped at 15 bytes (plus NUL); longer names are cut.
pub const MAX_NAME_LEN: usize = 15;

/// Scheduling class of a thread or loop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadKind {
    /// Fixed-priority preemptive scheduling, pages locked into RAM.
    Realtime,
    /// Default time-shared scheduling.
    NonRealtime,
}

impl ThreadKind {
    fn policy(self) -> SchedPolicy {
        match self {
            ThreadKind::Realtime => SchedPolicy::Fifo,
            ThreadKind::NonRealtime => SchedPolicy::Other,
        }
    }
}

/// Control surface of a thread binding, the seam a `Loop` drives its worker
/// through. Production code uses [`Thread`]; tests inject a recording double.
pub trait ThreadControl: Send + Sync {
    /// Configure a periodic wake-up. Ignored once the OS thread exists.
    fn set_period(&self, period: Duration);

    /// Request a stack size (bytes, on top of the OS minimum). Ignored once
    /// the OS thread exists.
    fn set_stack_size(&self, size: usize);

    /// Whether the OS thread currently exists.
    fn created(&self) -> bool;

    /// Apply the scheduling configuration and spawn the OS thread.
    fn create(&self);

    /// Forcibly terminate the OS thread.
    fn cancel(&self);

    /// Wake the worker so it runs one more update.
    fn wake(&self);

    /// Ask the worker loop to exit; wakes it so it observes the request.
    fn stop(&self);

    /// Reap the finished OS thread.
    fn join(&self);
}

/// Wake-up state shared with the worker thread. The mutex is
/// priority-inheriting so a realtime worker blocked on it cannot be stalled
/// behind medium-priority threads preempting the signaller.
struct WakeState {
    running: CachePadded<AtomicBool>,
    pending: PrioMutex<bool>,
    cond: PrioCondvar,
}

type UpdateFn = Box<dyn FnMut() + Send>;

/// A configured, lazily created OS thread. See the module docs.
pub struct Thread {
    name: String,
    kind: ThreadKind,
    prio: i32,
    affinity: Option<usize>,
    os: Arc<dyn OsThreadApi>,
    max_stack_size: usize,
    period: Mutex<Duration>,
    stack_size: Mutex<usize>,
    created: CachePadded<AtomicBool>,
    handle: Mutex<Option<ThreadHandle>>,
    update: Arc<Mutex<UpdateFn>>,
    wake_state: Arc<WakeState>,
}

impl Thread {
    /// Create a thread binding over the real OS.
    ///
    /// `update` is the callback the spawned thread invokes each cycle.
    /// Realtime threads take a priority in `1..=98` (98 highest); `affinity`
    /// binds the thread to one CPU, `None` leaves it unbound.
    pub fn new(
        name: &str,
        kind: ThreadKind,
        prio: i32,
        affinity: Option<usize>,
        update: impl FnMut() + Send + 'static,
    ) -> Self {
        Self::with_os(name, kind, prio, affinity, update, Arc::new(PosixOs))
    }

    /// Like [`Thread::new`] with an explicit OS seam (tests inject a mock).
    pub fn with_os(
        name: &str,
        kind: ThreadKind,
        prio: i32,
        affinity: Option<usize>,
        update: impl FnMut() + Send + 'static,
        os: Arc<dyn OsThreadApi>,
    ) -> Self {
        expect!(!name.is_empty(), "thread needs to be named");
        if kind == ThreadKind::Realtime {
            expect!(
                prio > 0 && prio < 99,
                "realtime thread priority needs to be between 0 and 99"
            );
        }
        if let Some(cpu) = affinity {
            ensure!(
                cpu < os.hardware_concurrency(),
                "affinity does not match available CPUs"
            );
        }

        let limit = ensure_ok!(os.stack_rlimit(), "could not read stack resource limit");
        ensure!(
            limit > libc::PTHREAD_STACK_MIN,
            "stack resource limit below the pthread minimum"
        );

        let thread = Self {
            name: name.to_string(),
            kind,
            prio,
            affinity,
            os,
            max_stack_size: limit - libc::PTHREAD_STACK_MIN,
            period: Mutex::new(Duration::ZERO),
            stack_size: Mutex::new(0),
            created: CachePadded::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            update: Arc::new(Mutex::new(Box::new(update))),
            wake_state: Arc::new(WakeState {
                running: CachePadded::new(AtomicBool::new(false)),
                pending: PrioMutex::new(false),
                cond: PrioCondvar::new(),
            }),
        };
        thread.set_stack_size(DEFAULT_STACK_SIZE);
        thread
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Largest user stack size accepted by [`set_stack_size`], derived from
    /// the process stack rlimit at construction.
    ///
    /// [`set_stack_size`]: Thread::set_stack_size
    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    pub fn set_period(&self, period: Duration) {
        expect!(!period.is_zero(), "period must be greater than zero");
        if !self.created.load(Ordering::Acquire) {
            *self.period.lock() = period;
        }
    }

    pub fn set_stack_size(&self, size: usize) {
        if !self.created.load(Ordering::Acquire) {
            ensure!(size <= self.max_stack_size, "could not set stack size");
            *self.stack_size.lock() = size;
        }
    }

    pub fn created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    /// Spawn the OS thread. Idempotent while created; a second `create`
    /// after `cancel` is a violation (the stale handle was never reaped).
    pub fn create(&self) {
        if self.created.load(Ordering::Acquire) {
            return;
        }
        let mut handle = self.handle.lock();
        ensure!(handle.is_none(), "pthread already created");

        let attrs = ThreadAttrs {
            policy: self.kind.policy(),
            priority: self.prio,
            affinity: self.affinity,
            stack_size: *self.stack_size.lock() + libc::PTHREAD_STACK_MIN,
        };

        // Lock pages mapped so far; creation below maps more, hence the
        // second call afterwards. MCL_FUTURE is avoided on purpose: it would
        // pin pages of non-realtime threads too.
        if self.kind == ThreadKind::Realtime {
            ensure_ok!(self.os.lock_mapped_pages(), "could not lock pages");
        }

        self.wake_state.running.store(true, Ordering::Release);

        let entry: ThreadEntry = {
            let wake_state = Arc::clone(&self.wake_state);
            let update = Arc::clone(&self.update);
            let period = *self.period.lock();
            let realtime = self.kind == ThreadKind::Realtime;
            Box::new(move || worker_loop(&wake_state, period, realtime, &update))
        };

        let spawned = ensure_ok!(self.os.spawn(&attrs, entry), "could not create pthread");
        ensure_ok!(
            self.os.set_name(&spawned, truncate_name(&self.name)),
            "could not set thread name"
        );
        *handle = Some(spawned);

        if self.kind == ThreadKind::Realtime {
            ensure_ok!(self.os.lock_mapped_pages(), "could not lock pages");
        }

        self.created.store(true, Ordering::Release);
        tracing::debug!(name = %self.name, kind = ?self.kind, "thread created");
    }

    /// Forcibly terminate the OS thread. No-op when not created. The raw
    /// handle stays behind so `join` can still reap the cancelled thread.
    pub fn cancel(&self) {
        if self.created.load(Ordering::Acquire) {
            if let Some(handle) = self.handle.lock().as_ref() {
                ensure_ok!(self.os.cancel(handle), "could not cancel thread");
            }
            self.created.store(false, Ordering::Release);
            tracing::debug!(name = %self.name, "thread cancelled");
        }
    }

    /// Wake the worker. Multiple calls before the worker consumes the
    /// pending flag coalesce into exactly one wake-up.
    pub fn wake(&self) {
        let mut pending = self.wake_state.pending.lock();
        if !*pending {
            *pending = true;
            drop(pending);
            self.wake_state.cond.notify_one();
        }
    }

    /// Clear the running flag and wake the worker so it observes the stop.
    pub fn stop(&self) {
        self.wake_state.running.store(false, Ordering::Release);
        self.wake();
        tracing::debug!(name = %self.name, "thread stop requested");
    }

    /// Wait for OS-level completion and reset to not-created. No-op while
    /// still running or when no thread exists.
    pub fn join(&self) {
        if !self.wake_state.running.load(Ordering::Acquire) {
            if let Some(handle) = self.handle.lock().take() {
                ensure_ok!(self.os.join(handle), "could not join thread");
                self.created.store(false, Ordering::Release);
                tracing::debug!(name = %self.name, "thread joined");
            }
        }
    }
}

impl ThreadControl for Thread {
    fn set_period(&self, period: Duration) {
        Thread::set_period(self, period);
    }

    fn set_stack_size(&self, size: usize) {
        Thread::set_stack_size(self, size);
    }

    fn created(&self) -> bool {
        Thread::created(self)
    }

    fn create(&self) {
        Thread::create(self);
    }

    fn cancel(&self) {
        Thread::cancel(self);
    }

    fn wake(&self) {
        Thread::wake(self);
    }

    fn stop(&self) {
        Thread::stop(self);
    }

    fn join(&self) {
        Thread::join(self);
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Body of the spawned thread: run the update, then sleep until the next
/// periodic deadline or until woken. A wait timeout counts as an implicit
/// wake so periodic work executes on schedule without explicit `wake` calls;
/// the reference tick advances to the missed deadline, not to "now", so
/// jitter does not drift the schedule.
fn worker_loop(
    wake_state: &WakeState,
    period: Duration,
    realtime: bool,
    update: &Mutex<UpdateFn>,
) {
    let mut tick = MonotonicInstant::now();
    while wake_state.running.load(Ordering::Acquire) {
        {
            let _no_alloc = realtime.then(NoAllocGuard::enter);
            (*update.lock())();
        }

        let mut pending = wake_state.pending.lock();
        if wake_state.running.load(Ordering::Acquire) && !*pending {
            if !period.is_zero() {
                let next_tick = tick + period;
                while !*pending {
                    let (guard, timeout) = wake_state.cond.wait_until(pending, next_tick);
                    pending = guard;
                    if timeout.timed_out() {
                        *pending = true;
                    }
                }
                tick = next_tick;
            } else {
                while !*pending {
                    pending = wake_state.cond.wait(pending);
                }
            }
        }
        // consume the coalesced wake, whether it arrived during the update
        // or during the wait
        *pending = false;
    }
}
