//! Single-import surface for applications building on this crate.

pub use crate::alloc_guard::{GuardedAllocator, NoAllocGuard, alloc_forbidden};
pub use crate::channel::{Publisher, Subscriber, SubscriberWriter};
pub use crate::contract::{
    ContractViolation, Violation, ViolationGuard, ViolationHandler, ViolationMode,
    panicking_handler, set_violation_handler,
};
pub use crate::loops::{
    FnHooks, Loop, LoopState, LoopWaker, NoHooks, SchedulingHooks, ThreadFactory,
};
pub use crate::os::{OsThreadApi, PosixOs, SchedPolicy, ThreadAttrs, ThreadHandle};
pub use crate::sync::{MonotonicInstant, PrioCondvar, PrioMutex, PrioMutexGuard};
pub use crate::thread::{DEFAULT_STACK_SIZE, Thread, ThreadControl, ThreadKind};
pub use crate::utils::LoggerConfig;
pub use crate::{ensure, ensure_ok, expect};
