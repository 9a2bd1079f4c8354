//! Loop lifecycle state machine.
//!
//! A [`Loop`] wraps exactly one thread binding and walks a strict lifecycle:
//! `Unconfigured → configure() → Configured → start() → Running → stop() →
//! Stopped`. Each transition is valid exactly once and in that order;
//! calling out of order is a contract violation. Application behavior plugs
//! in through the [`SchedulingHooks`] trait.

use crate::expect;
use crate::thread::{Thread, ThreadControl, ThreadKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Overridable hook points of a [`Loop`].
///
/// `on_configure` and `on_start` run synchronously on the caller's thread;
/// `on_run` runs on the loop's own worker thread, once per cycle. `on_stop`
/// runs after the worker has been joined, so no cycle can still be in
/// flight when it executes. The boolean hooks gate the transition: a false
/// return leaves the lifecycle where it was and is reported to the caller,
/// not treated as a violation.
pub trait SchedulingHooks: Send {
    fn on_configure(&mut self) -> bool {
        true
    }

    fn on_start(&mut self) -> bool {
        true
    }

    fn on_run(&mut self) {}

    fn on_stop(&mut self) -> bool {
        true
    }
}

/// Hooks that accept every transition and do nothing per cycle.
pub struct NoHooks;

impl SchedulingHooks for NoHooks {}

/// Adapter running a plain closure as the `on_run` hook, for loops that
/// need no other hook behavior.
pub struct FnHooks<F: FnMut() + Send>(pub F);

impl<F: FnMut() + Send> SchedulingHooks for FnHooks<F> {
    fn on_run(&mut self) {
        (self.0)()
    }
}

/// Anything a channel subscriber can wake on new data.
pub trait LoopWaker: Send + Sync {
    fn wake(&self);
}

/// Lifecycle position of a [`Loop`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoopState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

/// Builds the thread binding a loop runs on. The default factory spawns a
/// real [`Thread`]; tests inject one that returns a recording double.
pub type ThreadFactory = Box<
    dyn Fn(&str, ThreadKind, i32, Option<usize>, Box<dyn FnMut() + Send>) -> Arc<dyn ThreadControl>
        + Send
        + Sync,
>;

fn default_thread_factory() -> ThreadFactory {
    Box::new(|name, kind, prio, affinity, update| {
        Arc::new(Thread::new(name, kind, prio, affinity, update))
    })
}

/// A unit of periodic or event-triggered work on its own OS thread.
/// See the module docs for the lifecycle.
pub struct Loop {
    name: String,
    kind: ThreadKind,
    prio: i32,
    affinity: Option<usize>,
    hooks: Arc<Mutex<Box<dyn SchedulingHooks>>>,
    factory: ThreadFactory,
    thread: Mutex<Option<Arc<dyn ThreadControl>>>,
    configured: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl Loop {
    /// A loop on a fixed-priority realtime thread. `prio` follows the
    /// realtime range (1..=98), checked when the thread is configured.
    pub fn realtime(
        name: &str,
        prio: i32,
        affinity: Option<usize>,
        hooks: impl SchedulingHooks + 'static,
    ) -> Self {
        Self::with_thread_factory(
            name,
            ThreadKind::Realtime,
            prio,
            affinity,
            hooks,
            default_thread_factory(),
        )
    }

    /// A loop on a normally scheduled thread; priority does not apply.
    pub fn non_realtime(
        name: &str,
        affinity: Option<usize>,
        hooks: impl SchedulingHooks + 'static,
    ) -> Self {
        Self::with_thread_factory(
            name,
            ThreadKind::NonRealtime,
            0,
            affinity,
            hooks,
            default_thread_factory(),
        )
    }

    /// Full-control constructor with an injected thread factory.
    pub fn with_thread_factory(
        name: &str,
        kind: ThreadKind,
        prio: i32,
        affinity: Option<usize>,
        hooks: impl SchedulingHooks + 'static,
        factory: ThreadFactory,
    ) -> Self {
        expect!(!name.is_empty(), "loop needs to be named");
        Self {
            name: name.to_string(),
            kind,
            prio,
            affinity,
            hooks: Arc::new(Mutex::new(Box::new(hooks))),
            factory,
            thread: Mutex::new(None),
            configured: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn state(&self) -> LoopState {
        if self.stopped.load(Ordering::Acquire) {
            LoopState::Stopped
        } else if self.running.load(Ordering::Acquire) {
            LoopState::Running
        } else if self.configured.load(Ordering::Acquire) {
            LoopState::Configured
        } else {
            LoopState::Unconfigured
        }
    }

    /// Build the thread binding and run the `on_configure` hook. Returns
    /// the hook's verdict; on false the loop stays unconfigured and
    /// `configure` may be called again.
    pub fn configure(&self) -> bool {
        expect!(
            !self.configured.load(Ordering::Acquire),
            "loop already configured"
        );

        let update: Box<dyn FnMut() + Send> = {
            let hooks = Arc::clone(&self.hooks);
            Box::new(move || hooks.lock().on_run())
        };
        *self.thread.lock() = Some((self.factory)(
            &self.name,
            self.kind,
            self.prio,
            self.affinity,
            update,
        ));

        let configured = self.hooks.lock().on_configure();
        self.configured.store(configured, Ordering::Release);
        tracing::debug!(name = %self.name, configured, "loop configured");
        configured
    }

    /// Run the `on_start` hook and, if it approves, spawn the worker.
    /// Returns the hook's verdict; on false nothing was spawned and `start`
    /// may be retried.
    pub fn start(&self) -> bool {
        expect!(self.configured.load(Ordering::Acquire), "loop not configured");
        expect!(!self.running.load(Ordering::Acquire), "loop already running");

        if !self.hooks.lock().on_start() {
            tracing::debug!(name = %self.name, "loop start rejected by hook");
            return false;
        }

        if let Some(thread) = self.thread.lock().as_ref() {
            thread.create();
        }
        self.running.store(true, Ordering::Release);
        tracing::debug!(name = %self.name, "loop started");
        true
    }

    /// Wake the worker for one extra cycle. Valid only while running.
    pub fn wake(&self) {
        expect!(self.running.load(Ordering::Acquire), "loop not running");
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.wake();
        }
    }

    /// Halt the worker, join it, then run and report the `on_stop` hook.
    pub fn stop(&self) -> bool {
        expect!(self.running.load(Ordering::Acquire), "loop not running");

        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.stop();
            thread.join();
        }
        self.stopped.store(true, Ordering::Release);

        let stopped = self.hooks.lock().on_stop();
        tracing::debug!(name = %self.name, stopped, "loop stopped");
        stopped
    }

    /// Emergency teardown: forcibly terminate the worker, bypassing the
    /// state machine. No-op before `configure`; never a violation.
    pub fn cancel(&self) {
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.cancel();
            tracing::warn!(name = %self.name, "loop cancelled");
        }
    }

    /// Configure a periodic cycle on the underlying thread. Call between
    /// `configure` and `start`.
    pub fn set_period(&self, period: Duration) {
        expect!(self.configured.load(Ordering::Acquire), "loop not configured");
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.set_period(period);
        }
    }

    /// Request a worker stack size. Call between `configure` and `start`.
    pub fn set_stack_size(&self, size: usize) {
        expect!(self.configured.load(Ordering::Acquire), "loop not configured");
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.set_stack_size(size);
        }
    }
}

impl LoopWaker for Loop {
    fn wake(&self) {
        Loop::wake(self);
    }
}

impl Drop for Loop {
    // A live worker holds the hooks; joining here keeps it from outliving
    // the loop it belongs to.
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            let _ = self.stop();
        }
    }
}
