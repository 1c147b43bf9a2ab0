//! Cross-thread interrupt delivery gated by the per-thread guard counter.
//!
//! The guard counter nests: [`InterruptGuard::enter`] increments it and
//! dropping the guard decrements it. While it is nonzero an arriving
//! interrupt only sets the deferred bit, and the handler runs when the
//! outermost guard is released. The disabled bit is set once during
//! finalize; from then on interrupts are discarded.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::Ordering;
use std::sync::PoisonError;
use std::time::Duration;

use tracing::error;

use crate::context::RegisterSnapshot;
use crate::thread::{with_current, ThreadCtrl, ThreadError, ThreadShared};

/// Guard counter bit: interrupts are discarded.
const INTERRUPTS_DISABLED: u32 = 0x8000_0000;
/// Guard counter bit: an interrupt arrived while guarded.
const INTERRUPT_DEFERRED: u32 = 0x4000_0000;

/// How often the initiator re-checks for an acknowledgement; the target
/// notifies without taking the mutex, so a wakeup can be missed.
const ACK_POLL: Duration = Duration::from_millis(1);

thread_local! {
    static INTERRUPTED: Cell<Option<RegisterSnapshot>> = const { Cell::new(None) };
}

/// Critical section during which interrupts are deferred.
///
/// Guards nest. Leaving the outermost guard runs a deferred handler.
#[derive(Debug)]
#[must_use = "interrupts are only deferred while the guard is alive"]
pub struct InterruptGuard {
    _thread_bound: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Enters a critical section on the current thread.
    ///
    /// Has no effect on threads that are not managed.
    pub fn enter() -> Self {
        with_current(|shared| shared.guard.fetch_add(1, Ordering::SeqCst));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let deferred = with_current(|shared| {
            shared.guard.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1) == INTERRUPT_DEFERRED
        });
        if deferred == Some(true) {
            test_interrupt();
        }
    }
}

/// Permanently disables interrupts on the current thread.
pub fn interrupt_disable() {
    with_current(|shared| shared.guard.fetch_or(INTERRUPTS_DISABLED, Ordering::SeqCst));
}

/// Runs a deferred interrupt handler if the current thread has one and is
/// no longer guarded; discards it if interrupts are disabled.
pub fn test_interrupt() {
    let Some(shared) = with_current(|shared| shared as *const ThreadShared) else {
        return;
    };
    // SAFETY: `with_current` handed out a pointer that stays valid for the
    // rest of the task on this thread.
    let shared = unsafe { &*shared };

    let guard = shared.guard.load(Ordering::SeqCst);
    if guard & INTERRUPTS_DISABLED != 0 {
        if take_handler(shared).is_some() {
            acknowledge(shared);
        }
        return;
    }

    if guard == INTERRUPT_DEFERRED && !std::thread::panicking() {
        shared.guard.store(0, Ordering::SeqCst);
        if let Some(handler) = take_handler(shared) {
            run_acknowledged(shared, handler);
        }
    }
}

/// Register state of the current thread at its most recent interrupt.
#[must_use]
pub fn interrupted_context() -> Option<RegisterSnapshot> {
    INTERRUPTED.with(Cell::get)
}

fn take_handler(shared: &ThreadShared) -> Option<fn()> {
    let raw = shared.interrupt.swap(0, Ordering::AcqRel);
    // SAFETY: nonzero values are only ever stored from a `fn()` in
    // `ThreadCtrl::interrupt`.
    (raw != 0).then(|| unsafe { mem::transmute::<usize, fn()>(raw) })
}

/// Releases the initiator. Never takes the mutex, so it is usable from a
/// signal handler.
fn acknowledge(shared: &ThreadShared) {
    shared.interrupt_busy.store(false, Ordering::Release);
    shared.icv.notify_all();
}

struct Acknowledge<'a>(&'a ThreadShared);

impl Drop for Acknowledge<'_> {
    fn drop(&mut self) {
        acknowledge(self.0);
    }
}

fn run_acknowledged(shared: &ThreadShared, handler: fn()) {
    let _ack = Acknowledge(shared);
    handler();
}

/// Interrupt entry on the target thread, called from the interrupt signal
/// handler with the interrupted register state.
#[cfg_attr(not(all(target_os = "linux", target_arch = "x86_64")), allow(dead_code))]
pub(crate) fn handle_interrupt(interrupted: Option<RegisterSnapshot>) {
    let Some(shared) = with_current(|shared| shared as *const ThreadShared) else {
        return;
    };
    // SAFETY: see `test_interrupt`.
    let shared = unsafe { &*shared };

    if interrupted.is_some() {
        INTERRUPTED.with(|slot| slot.set(interrupted));
    }

    let guard = shared.guard.load(Ordering::SeqCst);
    if guard & INTERRUPTS_DISABLED != 0 {
        if take_handler(shared).is_some() {
            acknowledge(shared);
        }
    } else if guard == 0 {
        if let Some(handler) = take_handler(shared) {
            if panic::catch_unwind(AssertUnwindSafe(|| run_acknowledged(shared, handler))).is_err() {
                // Not async-signal-safe, but the process aborts right after.
                error!(target: "pagetrap::thread", "interrupt handler panicked");
                process::abort();
            }
        }
    } else {
        shared.guard.fetch_or(INTERRUPT_DEFERRED, Ordering::SeqCst);
    }
}

impl ThreadCtrl {
    /// Runs `handler` on this thread, interrupting whatever it is doing.
    ///
    /// The handler runs on the target's own stack, immediately if the target
    /// is not guarded, otherwise when it leaves its outermost
    /// [`InterruptGuard`]. Returns once the handler has finished, or has been
    /// discarded because the target finished or disabled interrupts.
    ///
    /// Handlers that run immediately execute in signal context and must
    /// restrict themselves to async-signal-safe work.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::SelfInterrupt`] when called on the current
    /// thread, [`ThreadError::InterruptPending`] when another interrupt is
    /// still outstanding, or [`ThreadError::Install`] when delivery is not
    /// available.
    pub fn interrupt(&self, handler: fn()) -> Result<(), ThreadError> {
        if self.is_current() {
            return Err(ThreadError::SelfInterrupt);
        }
        delivery_ready()?;

        let shared = self.shared();
        if shared
            .interrupt_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ThreadError::InterruptPending);
        }
        shared.interrupt.store(handler as usize, Ordering::Release);

        shared.wait_started();
        let signalled = send_interrupt(shared);

        let mut state = shared.lock_state();
        while shared.interrupt_busy.load(Ordering::Acquire) {
            if !signalled || shared.is_finished() {
                // The target can no longer consume it.
                shared.interrupt.store(0, Ordering::Release);
                shared.interrupt_busy.store(false, Ordering::Release);
                break;
            }
            state = shared
                .icv
                .wait_timeout(state, ACK_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(state);
        Ok(())
    }

    /// Whether an interrupt is waiting for this thread to leave its guard.
    #[must_use]
    pub fn interrupt_deferred(&self) -> bool {
        let guard = self.shared().guard.load(Ordering::SeqCst);
        guard & INTERRUPTS_DISABLED == 0 && guard & INTERRUPT_DEFERRED != 0
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn delivery_ready() -> Result<(), ThreadError> {
    Ok(crate::entry::signal::ensure_interrupt_handler()?)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn delivery_ready() -> Result<(), ThreadError> {
    Err(crate::entry::InstallError::Unsupported.into())
}

/// Signals the target unless it has already been joined.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn send_interrupt(shared: &ThreadShared) -> bool {
    let handle = shared.lock_handle();
    match (handle.as_ref(), shared.native.get()) {
        // The handle lock keeps the thread from being joined, so `native`
        // still names it.
        (Some(_), Some(&native)) if !shared.is_finished() => {
            // SAFETY: `native` is a live, unjoined thread.
            unsafe { libc::pthread_kill(native, crate::entry::INTERRUPT_SIGNAL) == 0 }
        }
        _ => false,
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const fn send_interrupt(_shared: &ThreadShared) -> bool {
    false
}
