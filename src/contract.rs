//! Contract checks and violation reporting.
//!
//! Preconditions and invariants are asserted with [`expect!`] and
//! [`ensure!`]; a failed check reports a [`Violation`] through the handler
//! chain (thread-local, then global) and aborts the process if no handler
//! diverts it. Test harnesses install [`panicking_handler`] to turn
//! violations into catchable panics.
//!
//! [`expect!`]: crate::expect
//! [`ensure!`]: crate::ensure

use parking_lot::RwLock;
use std::cell::Cell;
use std::error::Error;
use std::fmt;
use std::process;

/// Which side of a contract failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ViolationMode {
    /// A precondition on the caller (`expect!`).
    Expect,
    /// A postcondition or invariant of the implementation (`ensure!`).
    Ensure,
}

/// A failed precondition, postcondition or invariant.
///
/// Violations are reported through [`handle_violation`] and are fatal by
/// default. They are not ordinary error values: expected failures (full
/// buffer, duplicate subscriber name, a hook returning false) are booleans,
/// never violations.
#[derive(Debug, Copy, Clone)]
pub struct Violation {
    pub mode: ViolationMode,
    pub expr: &'static str,
    pub msg: Option<&'static str>,
    pub file: &'static str,
    pub line: u32,
}

impl Violation {
    pub const fn new(
        mode: ViolationMode,
        expr: &'static str,
        msg: Option<&'static str>,
        file: &'static str,
        line: u32,
    ) -> Self {
        Self {
            mode,
            expr,
            msg,
            file,
            line,
        }
    }

    /// Formatted as the violation handlers report it:
    /// `<expr> asserted in <file>:<line>` with the file reduced to its basename.
    pub fn message(&self) -> String {
        let file = self.file.rsplit(['/', '\\']).next().unwrap_or(self.file);
        match self.msg {
            Some(msg) => format!(
                "{} && \"{}\" asserted in {}:{}",
                self.expr, msg, file, self.line
            ),
            None => format!("{} asserted in {}:{}", self.expr, file, self.line),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Catchable form of a violation, produced by [`panicking_handler`].
#[derive(Debug)]
pub struct ContractViolation {
    pub mode: ViolationMode,
    message: String,
}

impl ContractViolation {
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&Violation> for ContractViolation {
    fn from(violation: &Violation) -> Self {
        Self {
            mode: violation.mode,
            message: violation.message(),
        }
    }
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ContractViolation {}

/// Handler invoked on a violation. If it returns, the process aborts.
pub type ViolationHandler = fn(&Violation);

static GLOBAL_HANDLER: RwLock<Option<ViolationHandler>> = RwLock::new(None);

thread_local! {
    static LOCAL_HANDLER: Cell<Option<ViolationHandler>> = const { Cell::new(None) };
}

/// Install (or with `None`, remove) the process-wide violation handler.
/// Returns the previously installed handler.
pub fn set_violation_handler(handler: Option<ViolationHandler>) -> Option<ViolationHandler> {
    let mut slot = GLOBAL_HANDLER.write();
    std::mem::replace(&mut slot, handler)
}

/// Thread-local violation handler, restored to the previous one on drop.
///
/// Scoped to the installing thread, so concurrently running tests do not
/// race on a shared handler slot.
pub struct ViolationGuard {
    previous: Option<ViolationHandler>,
}

impl ViolationGuard {
    pub fn install(handler: ViolationHandler) -> Self {
        let previous = LOCAL_HANDLER.with(|slot| slot.replace(Some(handler)));
        Self { previous }
    }
}

impl Drop for ViolationGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = LOCAL_HANDLER.try_with(|slot| slot.set(previous));
    }
}

/// Ready-made handler that raises the violation as a panic carrying the
/// formatted message. For test harnesses; the core never catches violations.
pub fn panicking_handler(violation: &Violation) {
    panic!("{}", ContractViolation::from(violation));
}

/// Report a violation: thread-local handler first, then the global one,
/// then abort. A handler escapes by panicking (or not returning at all);
/// any handler that returns falls through to the abort.
pub fn handle_violation(violation: &Violation) -> ! {
    if let Some(handler) = LOCAL_HANDLER.with(|slot| slot.get()) {
        handler(violation);
    }
    if let Some(handler) = *GLOBAL_HANDLER.read() {
        handler(violation);
    }
    tracing::error!("contract violation: {}", violation.message());
    process::abort();
}

/// Precondition check. `expect!(cond)` or `expect!(cond, "msg")`.
#[macro_export]
macro_rules! expect {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::contract::handle_violation(&$crate::contract::Violation::new(
                $crate::contract::ViolationMode::Expect,
                stringify!($cond),
                None,
                file!(),
                line!(),
            ));
        }
    };
    ($cond:expr, $msg:expr $(,)?) => {
        if !$cond {
            $crate::contract::handle_violation(&$crate::contract::Violation::new(
                $crate::contract::ViolationMode::Expect,
                stringify!($cond),
                Some($msg),
                file!(),
                line!(),
            ));
        }
    };
}

/// Postcondition/invariant check. Same shape as [`expect!`].
#[macro_export]
macro_rules! ensure {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::contract::handle_violation(&$crate::contract::Violation::new(
                $crate::contract::ViolationMode::Ensure,
                stringify!($cond),
                None,
                file!(),
                line!(),
            ));
        }
    };
    ($cond:expr, $msg:expr $(,)?) => {
        if !$cond {
            $crate::contract::handle_violation(&$crate::contract::Violation::new(
                $crate::contract::ViolationMode::Ensure,
                stringify!($cond),
                Some($msg),
                file!(),
                line!(),
            ));
        }
    };
}

/// Unwrap a `Result` or escalate the error to a fatal violation.
/// OS call failures are programming/environment errors, not transient
/// conditions; there is no retry path.
#[macro_export]
macro_rules! ensure_ok {
    ($result:expr, $msg:expr $(,)?) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, $msg);
                $crate::contract::handle_violation(&$crate::contract::Violation::new(
                    $crate::contract::ViolationMode::Ensure,
                    stringify!($result),
                    Some($msg),
                    file!(),
                    line!(),
                ))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn failing_check() {
        crate::expect!(1 == 2, "one is never two");
    }

    fn panic_message(result: std::thread::Result<()>) -> String {
        let payload = result.expect_err("expected a violation panic");
        if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else {
            String::new()
        }
    }

    #[test]
    fn violation_message_has_expression_and_location() {
        let _guard = ViolationGuard::install(panicking_handler);
        let message = panic_message(catch_unwind(AssertUnwindSafe(failing_check)));
        assert!(message.contains("1 == 2"), "message: {message}");
        assert!(message.contains("one is never two"), "message: {message}");
        assert!(message.contains("asserted in contract.rs:"), "message: {message}");
    }

    #[test]
    fn guard_restores_previous_handler() {
        let _outer = ViolationGuard::install(panicking_handler);
        {
            fn inner(_: &Violation) {}
            let _inner = ViolationGuard::install(inner);
        }
        // outer handler active again: the violation panics instead of aborting
        let result = catch_unwind(AssertUnwindSafe(|| crate::ensure!(false)));
        assert!(result.is_err());
    }

    #[test]
    fn ensure_ok_passes_values_through() {
        let _guard = ViolationGuard::install(panicking_handler);
        let value: Result<u32, std::io::Error> = Ok(7);
        assert_eq!(crate::ensure_ok!(value, "never fails"), 7);

        let failing: Result<u32, std::io::Error> =
            Err(std::io::Error::from_raw_os_error(libc::EPERM));
        let result = catch_unwind(AssertUnwindSafe(move || {
            let _ = crate::ensure_ok!(failing, "os call failed");
        }));
        let message = panic_message(result);
        assert!(message.contains("os call failed"), "message: {message}");
    }
}
