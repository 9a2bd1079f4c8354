//! Injectable seam over the OS thread primitives the core needs.
//!
//! This boundary is a pure pass-through: no policy lives here. Production
//! code talks to [`PosixOs`]; tests substitute a mock implementation.

use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

/// Scheduling policy applied at thread creation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SchedPolicy {
    /// Fixed-priority preemptive scheduling (`SCHED_FIFO`).
    Fifo,
    /// Default time-shared scheduling (`SCHED_OTHER`).
    Other,
}

/// Thread attributes committed at creation time. The inherit-scheduling
/// flag is always forced to explicit by the implementation.
#[derive(Debug, Copy, Clone)]
pub struct ThreadAttrs {
    pub policy: SchedPolicy,
    /// Meaningful only for [`SchedPolicy::Fifo`].
    pub priority: i32,
    /// CPU index to bind to, `None` leaves the thread unbound.
    pub affinity: Option<usize>,
    /// Full stack size in bytes, including the OS-reserved minimum.
    pub stack_size: usize,
}

/// Opaque handle to a spawned OS thread.
#[derive(Debug)]
pub struct ThreadHandle {
    raw: libc::pthread_t,
}

impl ThreadHandle {
    pub fn from_raw(raw: libc::pthread_t) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> libc::pthread_t {
        self.raw
    }
}

/// Entry point executed on the new thread.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// The OS primitives used by the thread binding, injectable for tests.
pub trait OsThreadApi: Send + Sync {
    /// Number of processors available to the process.
    fn hardware_concurrency(&self) -> usize;

    /// Current soft limit of the stack-size resource (`RLIMIT_STACK`).
    fn stack_rlimit(&self) -> io::Result<usize>;

    /// Lock all currently mapped pages into physical memory (`MCL_CURRENT`).
    fn lock_mapped_pages(&self) -> io::Result<()>;

    /// Create a thread with the given attributes running `entry`.
    fn spawn(&self, attrs: &ThreadAttrs, entry: ThreadEntry) -> io::Result<ThreadHandle>;

    /// Assign a name to the thread. The caller pre-truncates to the OS limit.
    fn set_name(&self, handle: &ThreadHandle, name: &str) -> io::Result<()>;

    /// Forcibly terminate the thread.
    fn cancel(&self, handle: &ThreadHandle) -> io::Result<()>;

    /// Block until the thread finishes and reap it.
    fn join(&self, handle: ThreadHandle) -> io::Result<()>;
}

/// Production implementation backed by pthreads.
#[derive(Debug, Default)]
pub struct PosixOs;

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

extern "C" fn thread_trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    // Reclaims the double-boxed entry handed over by `spawn`.
    let entry = unsafe { Box::from_raw(arg as *mut ThreadEntry) };
    entry();
    ptr::null_mut()
}

impl OsThreadApi for PosixOs {
    fn hardware_concurrency(&self) -> usize {
        match core_affinity::get_core_ids() {
            Some(cores) if !cores.is_empty() => cores.len(),
            _ => {
                let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
                n.max(1) as usize
            }
        }
    }

    fn stack_rlimit(&self) -> io::Result<usize> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let ret = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX))
    }

    fn lock_mapped_pages(&self) -> io::Result<()> {
        let ret = unsafe { libc::mlockall(libc::MCL_CURRENT) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn spawn(&self, attrs: &ThreadAttrs, entry: ThreadEntry) -> io::Result<ThreadHandle> {
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            check(libc::pthread_attr_init(&mut attr))?;

            let result = configure_and_create(&mut attr, attrs, entry);

            // Attributes are a temporary object, released regardless of outcome.
            let _ = libc::pthread_attr_destroy(&mut attr);

            result.map(ThreadHandle::from_raw)
        }
    }

    fn set_name(&self, handle: &ThreadHandle, name: &str) -> io::Result<()> {
        let name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))?;
        check(unsafe { libc::pthread_setname_np(handle.raw, name.as_ptr()) })
    }

    fn cancel(&self, handle: &ThreadHandle) -> io::Result<()> {
        check(unsafe { libc::pthread_cancel(handle.raw) })
    }

    fn join(&self, handle: ThreadHandle) -> io::Result<()> {
        check(unsafe { libc::pthread_join(handle.raw, ptr::null_mut()) })
    }
}

unsafe fn configure_and_create(
    attr: &mut libc::pthread_attr_t,
    attrs: &ThreadAttrs,
    entry: ThreadEntry,
) -> io::Result<libc::pthread_t> {
    unsafe {
        check(libc::pthread_attr_setstacksize(attr, attrs.stack_size))?;

        let policy = match attrs.policy {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::Other => libc::SCHED_OTHER,
        };
        check(libc::pthread_attr_setschedpolicy(attr, policy))?;

        if attrs.policy == SchedPolicy::Fifo {
            let param = libc::sched_param {
                sched_priority: attrs.priority,
            };
            check(libc::pthread_attr_setschedparam(attr, &param))?;
        }

        if let Some(cpu) = attrs.affinity {
            let mut set: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            check(libc::pthread_attr_setaffinity_np(
                attr,
                mem::size_of::<libc::cpu_set_t>(),
                &set,
            ))?;
        }

        // Without this the new thread inherits the caller's scheduling
        // attributes and the policy/priority above are silently ignored.
        check(libc::pthread_attr_setinheritsched(
            attr,
            libc::PTHREAD_EXPLICIT_SCHED,
        ))?;

        let payload = Box::into_raw(Box::new(entry));
        let mut thread: libc::pthread_t = 0;
        let ret = libc::pthread_create(&mut thread, attr, thread_trampoline, payload.cast());
        if ret != 0 {
            drop(Box::from_raw(payload));
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(thread)
    }
}
