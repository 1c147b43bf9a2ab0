//! Hardware fault triage and execution-context redirection.
//!
//! A fault is resolved in two steps. [`triage`] turns the raw fault into a
//! [`Disposition`]; the platform hook then either resumes, stages a call to
//! the redirect trampoline, or falls back to the previous crash handling.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tracing::warn;

use crate::context::ContextAccess;
use crate::fault::{AccessCause, Disposition, FaultCode, GuestAccessViolation};
use crate::violation::ViolationHandler;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod signal;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod trampoline;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use signal::{install, installed, INTERRUPT_SIGNAL};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use trampoline::redirect;

/// Fault counter bit set while a redirect has been staged but the
/// trampoline has not started yet.
const REDIRECT_IN_FLIGHT: u64 = 1 << 63;

thread_local! {
    static FAULTS: Cell<u64> = const { Cell::new(0) };
    static LINKAGE: Cell<Option<CallLinkage>> = const { Cell::new(None) };
}

/// Failure to register the process-wide fault hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InstallError {
    /// The hook and its engine were already installed.
    #[error("fault hook is already installed")]
    AlreadyInstalled,
    /// The host platform has no fault hook implementation.
    #[error("fault hook is not supported on this platform")]
    Unsupported,
    /// `sigaction` failed with the given errno.
    #[error("sigaction failed (errno {0})")]
    Sigaction(i32),
}

/// Raw hardware fault as delivered by the platform hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    /// Host address the hardware reported.
    pub host_address: usize,
    /// Whether the access was a write.
    pub is_write: bool,
    /// Whether the faulting thread is a managed thread allowed to emulate.
    pub managed: bool,
}

/// Return linkage recorded when a call is staged into a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLinkage {
    /// Instruction pointer the context held before staging.
    pub return_address: u64,
    /// Stack word reserved for the return address, `None` for leaf functions
    /// whose stack must not be touched.
    pub stack_slot: Option<u64>,
}

/// Resolves a hardware fault against the emulated window.
///
/// Faults outside the window, and faults raised while a previous redirect
/// is still in flight on this thread, are fatal. Inside the window a
/// managed thread gets the access emulated; anything not emulated becomes a
/// guest-visible access violation.
pub fn triage<C: ContextAccess + ?Sized>(
    handler: &ViolationHandler,
    event: FaultEvent,
    ctx: &mut C,
) -> Disposition {
    let base = handler.memory().base(0) as usize;
    let offset = event
        .host_address
        .checked_sub(base)
        .and_then(|offset| u64::try_from(offset).ok())
        .filter(|&offset| offset < handler.config().window_span)
        .and_then(|offset| u32::try_from(offset).ok());

    let Some(address) = offset else {
        return Disposition::Fatal {
            code: FaultCode::HostFaultOutsideWindow,
            host_address: event.host_address,
        };
    };

    let previous = FAULTS.with(|faults| {
        let count = faults.get();
        faults.set(count.wrapping_add(1));
        count
    });
    if previous & REDIRECT_IN_FLIGHT != 0 {
        return Disposition::Fatal {
            code: FaultCode::RecursiveFault,
            host_address: event.host_address,
        };
    }

    if event.managed && handler.handle(address, event.is_write, ctx) {
        return Disposition::Handled;
    }

    Disposition::Redirect {
        cause: AccessCause::from_write(event.is_write),
        address,
    }
}

/// Rewrites `ctx` so that on resume it enters `function(arg0, arg1)`.
///
/// The interrupted instruction pointer becomes the return linkage. Unless
/// `leaf` is set, one stack word is reserved below the current stack pointer
/// for it, exactly where a `call` would have pushed it; the word itself is
/// written by the callee once it runs. For leaf functions the stack is left
/// untouched and the linkage only lives in the returned value.
pub fn stage_call<C: ContextAccess + ?Sized>(
    ctx: &mut C,
    function: u64,
    arg0: u64,
    arg1: u64,
    leaf: bool,
) -> CallLinkage {
    let return_address = ctx.rip();
    ctx.set_argument(0, arg0);
    ctx.set_argument(1, arg1);

    let stack_slot = if leaf {
        None
    } else {
        let slot = ctx.rsp().wrapping_sub(8);
        ctx.set_rsp(slot);
        Some(slot)
    };

    ctx.set_rip(function);
    CallLinkage {
        return_address,
        stack_slot,
    }
}

/// Whether the function containing `rip` has no unwind metadata.
///
/// There is no unwind-table probe on this platform, so every function is
/// treated as having a frame and the synthetic return address is pushed.
#[must_use]
pub const fn is_leaf_function(_rip: u64) -> bool {
    false
}

/// Number of faults triaged inside the window on the current thread.
#[must_use]
pub fn fault_count() -> u64 {
    FAULTS.with(|faults| faults.get() & !REDIRECT_IN_FLIGHT)
}

/// Whether a redirect is staged on the current thread but has not run yet.
#[must_use]
pub fn redirect_in_flight() -> bool {
    FAULTS.with(|faults| faults.get() & REDIRECT_IN_FLIGHT != 0)
}

pub(crate) fn begin_redirect(linkage: CallLinkage) {
    LINKAGE.with(|slot| slot.set(Some(linkage)));
    FAULTS.with(|faults| faults.set(faults.get() | REDIRECT_IN_FLIGHT));
}

pub(crate) fn finish_redirect() -> Option<CallLinkage> {
    FAULTS.with(|faults| faults.set(faults.get() & !REDIRECT_IN_FLIGHT));
    LINKAGE.with(Cell::take)
}

/// Runs `f`, converting a guest access violation raised inside it into an error.
///
/// This is the recovery point for redirected faults. Other panics keep
/// unwinding. `f` is treated as unwind safe: the emulated state it touched is
/// expected to be discarded or reset by the caller on error.
///
/// # Errors
///
/// Returns the [`GuestAccessViolation`] raised by the trampoline.
pub fn catch_guest_fault<R>(f: impl FnOnce() -> R) -> Result<R, GuestAccessViolation> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<GuestAccessViolation>() {
            Ok(violation) => {
                warn!(target: "pagetrap::entry", %violation, "guest access violation");
                Err(*violation)
            }
            Err(other) => panic::resume_unwind(other),
        },
    }
}
