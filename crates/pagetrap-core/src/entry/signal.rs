//! Linux signal hooks: `SIGSEGV` for the emulated window and the interrupt
//! signal for [`ThreadCtrl::interrupt`](crate::thread::ThreadCtrl::interrupt).

use std::io;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use libc::c_int;
use tracing::{debug, error};

use crate::context::ucontext::UcontextAccess;
use crate::context::{ContextAccess, RegisterSnapshot};
use crate::decoder::HexBytes;
use crate::entry::{redirect, triage, FaultEvent, InstallError};
use crate::fault::{Disposition, FaultCode};
use crate::thread;
use crate::thread::interrupt::handle_interrupt;
use crate::violation::ViolationHandler;

/// Signal used to deliver thread interrupts.
pub const INTERRUPT_SIGNAL: c_int = libc::SIGUSR1;

static ENGINE: OnceLock<ViolationHandler> = OnceLock::new();
static PREVIOUS_SEGV: OnceLock<libc::sigaction> = OnceLock::new();
static INTERRUPT_HOOK: OnceLock<Result<(), InstallError>> = OnceLock::new();

type SigInfoHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Installs `handler` as the process-wide engine and hooks `SIGSEGV`.
///
/// The handler lives for the rest of the process. The previously installed
/// `SIGSEGV` action is kept and restored for faults the engine cannot own.
///
/// # Errors
///
/// Returns [`InstallError::AlreadyInstalled`] on a second call, or
/// [`InstallError::Sigaction`] if the kernel rejects the registration.
pub fn install(handler: ViolationHandler) -> Result<&'static ViolationHandler, InstallError> {
    if ENGINE.set(handler).is_err() {
        return Err(InstallError::AlreadyInstalled);
    }
    let engine = ENGINE.get().ok_or(InstallError::AlreadyInstalled)?;

    let previous = register(libc::SIGSEGV, on_segv, libc::SA_SIGINFO | libc::SA_ONSTACK)?;
    let _ = PREVIOUS_SEGV.set(previous);
    debug!(
        target: "pagetrap::entry",
        base = ?engine.memory().base(0),
        span = engine.config().window_span,
        "fault hook installed"
    );
    Ok(engine)
}

/// Engine registered through [`install`], if any.
#[must_use]
pub fn installed() -> Option<&'static ViolationHandler> {
    ENGINE.get()
}

/// Hooks [`INTERRUPT_SIGNAL`] once per process.
pub(crate) fn ensure_interrupt_handler() -> Result<(), InstallError> {
    *INTERRUPT_HOOK.get_or_init(|| {
        register(INTERRUPT_SIGNAL, on_interrupt, libc::SA_SIGINFO | libc::SA_RESTART).map(|_previous| ())
    })
}

/// Registers `handler` for `signal` and returns the action it replaced.
fn register(
    signal: c_int,
    handler: SigInfoHandler,
    flags: c_int,
) -> Result<libc::sigaction, InstallError> {
    // SAFETY: `sigaction` is plain old data; all-zero is a valid empty action.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler as usize;
    action.sa_flags = flags;
    // SAFETY: `sa_mask` is a valid, exclusively borrowed signal set.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    // SAFETY: see above.
    let mut previous: libc::sigaction = unsafe { mem::zeroed() };
    // SAFETY: both pointers reference live, initialized `sigaction` values.
    if unsafe { libc::sigaction(signal, &action, &mut previous) } != 0 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(InstallError::Sigaction(errno));
    }
    Ok(previous)
}

extern "C" fn on_segv(signal: c_int, info: *mut libc::siginfo_t, raw: *mut libc::c_void) {
    let Some(engine) = ENGINE.get() else {
        restore_previous(signal);
        return;
    };
    // SAFETY: the kernel passes the context of this very delivery.
    let Some(mut ctx) = (unsafe { UcontextAccess::from_raw(raw) }) else {
        restore_previous(signal);
        return;
    };
    // SAFETY: `info` is valid for an `SA_SIGINFO` handler.
    let host_address = unsafe { info.as_ref().map_or(0, |info| info.si_addr() as usize) };

    let event = FaultEvent {
        host_address,
        is_write: ctx.is_write_fault(),
        managed: thread::is_managed(),
    };

    match triage(engine, event, &mut ctx) {
        Disposition::Handled => {}
        Disposition::Redirect { cause, address } => redirect(&mut ctx, cause, address),
        Disposition::Fatal { code, host_address } => {
            if engine.config().report_fatal {
                let offset = host_address.checked_sub(engine.memory().base(0) as usize);
                report(code, host_address, offset, &ctx);
            }
            restore_previous(signal);
        }
    }
}

/// Reinstates the action that preceded [`install`]; the faulting instruction
/// is retried under it.
fn restore_previous(signal: c_int) {
    let Some(previous) = PREVIOUS_SEGV.get() else {
        // SAFETY: resetting to the default action is always valid.
        unsafe { libc::signal(signal, libc::SIG_DFL) };
        return;
    };
    // SAFETY: `previous` was filled in by the kernel.
    unsafe { libc::sigaction(signal, previous, ptr::null_mut()) };
}

/// Runs in signal context. `error!` and `eprintln!` are not
/// async-signal-safe; the process is about to crash, so a deadlock on a held
/// lock is the accepted worst case.
fn report<C: ContextAccess + ?Sized>(
    code: FaultCode,
    host_address: usize,
    offset: Option<usize>,
    ctx: &C,
) {
    let code_bytes = ctx.instruction_bytes();
    error!(
        target: "pagetrap::entry",
        %code,
        host_address = format_args!("{host_address:#x}"),
        offset = ?offset,
        rip = format_args!("{:#x}", ctx.rip()),
        code_bytes = %HexBytes(code_bytes),
        "unrecoverable access violation"
    );
    match offset {
        Some(offset) => eprintln!(
            "pagetrap: {code} at {host_address:#x} (window offset {offset:#x}, rip {:#x}: {})",
            ctx.rip(),
            HexBytes(code_bytes)
        ),
        None => eprintln!(
            "pagetrap: {code} at {host_address:#x} (below the window, rip {:#x}: {})",
            ctx.rip(),
            HexBytes(code_bytes)
        ),
    }
}

extern "C" fn on_interrupt(_signal: c_int, _info: *mut libc::siginfo_t, raw: *mut libc::c_void) {
    // SAFETY: the kernel passes the context of this very delivery.
    let snapshot = unsafe { UcontextAccess::from_raw(raw) }.map(|ctx| RegisterSnapshot::capture(&ctx));
    handle_interrupt(snapshot);
}
