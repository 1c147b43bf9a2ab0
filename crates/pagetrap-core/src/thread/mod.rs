//! Managed threads: lifecycle, join, failure propagation and exit hooks.
//!
//! A managed thread is spawned through [`ThreadCtrl::spawn`]. Only managed
//! threads get faulting accesses emulated and can receive interrupts.

pub mod interrupt;

pub use interrupt::{interrupt_disable, interrupted_context, test_interrupt, InterruptGuard};

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, trace, warn};

use crate::entry::InstallError;
use crate::fault::{FaultCode, GuestAccessViolation};

/// Join contention counter value once the thread has been joined.
const JOIN_COMPLETED: u32 = 0x8000_0000;

static THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);
static RESERVATION_RELEASE: OnceLock<fn()> = OnceLock::new();

thread_local! {
    static CURRENT: Cell<*const ThreadShared> = const { Cell::new(ptr::null()) };
    static CURRENT_CTRL: RefCell<Option<ThreadCtrl>> = const { RefCell::new(None) };
}

/// Failure that escaped a managed thread's task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure {
    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task returned an error.
    #[error("task failed: {0}")]
    Failed(String),
    /// A guest access violation unwound out of the task.
    #[error("unhandled guest fault: {0}")]
    GuestFault(GuestAccessViolation),
}

/// Errors reported by thread control operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// The calling thread targeted itself with an interrupt.
    #[error("a thread cannot interrupt itself")]
    SelfInterrupt,
    /// The target already has an unconsumed interrupt handler.
    #[error("an interrupt is already pending")]
    InterruptPending,
    /// The calling thread tried to join itself.
    #[error("a thread cannot join itself")]
    SelfJoin,
    /// The OS refused to create the thread.
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(String),
    /// Interrupt delivery could not be set up.
    #[error("interrupt delivery unavailable: {0}")]
    Install(#[from] InstallError),
    /// The thread's task failed; shared by every joiner.
    #[error("thread task failed: {0}")]
    Task(Arc<TaskFailure>),
}

impl ThreadError {
    /// Fault taxonomy code, for errors that belong to it.
    #[must_use]
    pub const fn code(&self) -> Option<FaultCode> {
        match self {
            Self::SelfInterrupt => Some(FaultCode::SelfInterrupt),
            Self::InterruptPending => Some(FaultCode::InterruptPending),
            Self::Task(_) => Some(FaultCode::TaskFailed),
            Self::SelfJoin | Self::SpawnFailed(_) | Self::Install(_) => None,
        }
    }
}

type ExitHook = Box<dyn FnOnce() + Send>;

/// State shared between a thread's owners and the thread itself.
pub(crate) struct ThreadShared {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
    joining: AtomicU32,
    /// Guard nesting level plus the disabled/deferred bits.
    pub(crate) guard: AtomicU32,
    /// Pending interrupt handler as a function address, 0 when empty.
    pub(crate) interrupt: AtomicUsize,
    /// Set by the initiator before installing a handler, cleared on acknowledgement.
    pub(crate) interrupt_busy: AtomicBool,
    started: AtomicBool,
    finished: AtomicBool,
    failure: OnceLock<Arc<TaskFailure>>,
    atexit: Mutex<Vec<ExitHook>>,
    mutex: Mutex<()>,
    /// Start, finish and join notifications.
    jcv: Condvar,
    /// Interrupt acknowledgement.
    pub(crate) icv: Condvar,
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub(crate) native: OnceLock<libc::pthread_t>,
}

impl ThreadShared {
    fn new(name: String) -> Self {
        Self {
            name,
            handle: Mutex::new(None),
            joining: AtomicU32::new(0),
            guard: AtomicU32::new(0),
            interrupt: AtomicUsize::new(0),
            interrupt_busy: AtomicBool::new(false),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            failure: OnceLock::new(),
            atexit: Mutex::new(Vec::new()),
            mutex: Mutex::new(()),
            jcv: Condvar::new(),
            icv: Condvar::new(),
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            native: OnceLock::new(),
        }
    }

    /// Flips `flag` under the mutex and wakes every waiter on `jcv`.
    fn publish(&self, flag: &AtomicBool) {
        let _serialize = lock(&self.mutex);
        flag.store(true, Ordering::Release);
        self.jcv.notify_all();
    }

    /// Blocks until the thread has initialized or is already gone.
    pub(crate) fn wait_started(&self) {
        let guard = lock(&self.mutex);
        drop(
            self.jcv
                .wait_while(guard, |_| {
                    !self.started.load(Ordering::Acquire) && !self.finished.load(Ordering::Acquire)
                })
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        lock(&self.handle)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ()> {
        lock(&self.mutex)
    }
}

/// Recovers the guard of a poisoned mutex; every protected value stays
/// consistent across a panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a managed thread. Clones refer to the same thread.
#[derive(Clone)]
pub struct ThreadCtrl(Arc<ThreadShared>);

impl fmt::Debug for ThreadCtrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCtrl")
            .field("name", &self.0.name)
            .field("finished", &self.0.is_finished())
            .finish_non_exhaustive()
    }
}

impl ThreadCtrl {
    /// Starts `task` on a new managed thread called `name`.
    ///
    /// An error returned by the task, a panic, or a guest access violation
    /// unwinding out of it is stored and re-raised by every [`join`](Self::join).
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::SpawnFailed`] when the OS cannot create the thread.
    pub fn spawn<F, E>(name: impl Into<String>, task: F) -> Result<Self, ThreadError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.into();
        let ctrl = Self(Arc::new(ThreadShared::new(name.clone())));
        let body = ctrl.clone();

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || body.run(task))
            .map_err(|err| ThreadError::SpawnFailed(err.to_string()))?;
        *ctrl.0.lock_handle() = Some(handle);
        Ok(ctrl)
    }

    fn run<F, E>(self, task: F)
    where
        F: FnOnce() -> Result<(), E>,
        E: fmt::Display,
    {
        let shared = &*self.0;
        CURRENT.with(|current| current.set(shared));
        CURRENT_CTRL.with(|current| *current.borrow_mut() = Some(self.clone()));
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            // SAFETY: always safe to call.
            let _ = shared.native.set(unsafe { libc::pthread_self() });
        }
        THREAD_COUNT.fetch_add(1, Ordering::AcqRel);
        trace!(target: "pagetrap::thread", name = %shared.name, "thread started");
        shared.publish(&shared.started);

        let failure = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(TaskFailure::Failed(err.to_string())),
            Err(payload) => Some(failure_from_panic(payload)),
        };
        if let Some(failure) = failure {
            warn!(target: "pagetrap::thread", name = %shared.name, %failure, "task failed");
            let _ = shared.failure.set(Arc::new(failure));
        }

        self.finalize();
    }

    /// Disables interrupts, releases reservation state and runs exit hooks
    /// in reverse registration order.
    fn finalize(&self) {
        let shared = &*self.0;
        interrupt_disable();
        test_interrupt();

        if let Some(release) = RESERVATION_RELEASE.get() {
            release();
        }

        let hooks = mem::take(&mut *lock(&shared.atexit));
        for hook in hooks.into_iter().rev() {
            if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!(target: "pagetrap::thread", name = %shared.name, "exit hook panicked");
            }
        }

        THREAD_COUNT.fetch_sub(1, Ordering::AcqRel);
        trace!(target: "pagetrap::thread", name = %shared.name, "thread finished");
        shared.publish(&shared.finished);

        CURRENT.with(|current| current.set(ptr::null()));
        drop(CURRENT_CTRL.with(RefCell::take));
    }

    /// Thread name given at spawn.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether the task and its exit hooks have completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    fn is_current(&self) -> bool {
        CURRENT.with(|current| ptr::eq(current.get(), Arc::as_ptr(&self.0)))
    }

    pub(crate) fn shared(&self) -> &ThreadShared {
        &self.0
    }

    /// Registers `hook` to run when the thread finalizes.
    ///
    /// Hooks run on the thread itself, last registered first.
    pub fn push_atexit(&self, hook: impl FnOnce() + Send + 'static) {
        lock(&self.0.atexit).push(Box::new(hook));
    }

    /// Waits for the thread to finish.
    ///
    /// Any number of threads may join concurrently; the first performs the
    /// OS-level join and wakes the rest.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::Task`] with the stored failure, to every
    /// joiner, or [`ThreadError::SelfJoin`] when called from the thread itself.
    pub fn join(&self) -> Result<(), ThreadError> {
        if self.is_current() {
            return Err(ThreadError::SelfJoin);
        }

        let shared = &*self.0;
        let contention = shared.joining.fetch_add(1, Ordering::AcqRel);

        if contention >= JOIN_COMPLETED {
            shared.joining.store(JOIN_COMPLETED, Ordering::Release);
        } else if contention == 0 {
            let handle = shared.lock_handle().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!(target: "pagetrap::thread", name = %shared.name, "thread finalization panicked");
                }
            }

            if shared.joining.swap(JOIN_COMPLETED, Ordering::AcqRel) != 1 {
                drop(lock(&shared.mutex));
                shared.jcv.notify_all();
            }
        } else {
            let guard = lock(&shared.mutex);
            drop(
                shared
                    .jcv
                    .wait_while(guard, |_| shared.joining.load(Ordering::Acquire) < JOIN_COMPLETED)
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }

        self.test()
    }

    /// Waits up to `timeout` for the task to finish, then joins.
    ///
    /// Returns `Ok(false)` on timeout; the thread keeps running and can be
    /// joined later.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join).
    pub fn join_timeout(&self, timeout: Duration) -> Result<bool, ThreadError> {
        if self.is_current() {
            return Err(ThreadError::SelfJoin);
        }

        let shared = &*self.0;
        let guard = lock(&shared.mutex);
        let (guard, _) = shared
            .jcv
            .wait_timeout_while(guard, timeout, |_| !shared.is_finished())
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);

        if !shared.is_finished() {
            return Ok(false);
        }
        self.join().map(|()| true)
    }

    /// Returns the stored task failure without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::Task`] once the task has failed.
    pub fn test(&self) -> Result<(), ThreadError> {
        match self.0.failure.get() {
            Some(failure) => Err(ThreadError::Task(Arc::clone(failure))),
            None => Ok(()),
        }
    }
}

fn failure_from_panic(payload: Box<dyn Any + Send>) -> TaskFailure {
    match payload.downcast::<GuestAccessViolation>() {
        Ok(violation) => TaskFailure::GuestFault(*violation),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            TaskFailure::Panicked(message)
        }
    }
}

/// Runs `f` with the current thread's shared state, if it is managed.
///
/// Usable from signal handlers: it only reads a thread-local pointer.
pub(crate) fn with_current<R>(f: impl FnOnce(&ThreadShared) -> R) -> Option<R> {
    let current = CURRENT.with(Cell::get);
    // SAFETY: `CURRENT` is set by `ThreadCtrl::run`, which keeps the `Arc`
    // alive until after it resets the pointer, and is only read on this thread.
    unsafe { current.as_ref() }.map(f)
}

/// Handle of the calling thread, if it is managed.
#[must_use]
pub fn current_thread() -> Option<ThreadCtrl> {
    CURRENT_CTRL.with(|current| current.borrow().clone())
}

/// Whether the calling thread was spawned through [`ThreadCtrl::spawn`].
#[must_use]
pub fn is_managed() -> bool {
    CURRENT.with(|current| !current.get().is_null())
}

/// Number of managed threads currently running their task or finalizing.
#[must_use]
pub fn thread_count() -> usize {
    THREAD_COUNT.load(Ordering::Acquire)
}

/// Sleeps the calling thread for `micros` microseconds.
pub fn sleep(micros: u64) {
    thread::sleep(Duration::from_micros(micros));
}

/// Sets the process-wide hook that releases a thread's reservation state
/// during finalize. Returns `false` if a hook was already set.
pub fn set_reservation_release_hook(hook: fn()) -> bool {
    RESERVATION_RELEASE.set(hook).is_ok()
}
