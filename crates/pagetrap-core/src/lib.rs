//! Fault-driven memory virtualization core for the pagetrap emulator.
//!
//! Guest code runs natively against a reserved host window. Accesses that
//! fault inside the window are decoded, emulated against the privileged view
//! and resumed, or turned into guest-visible access violations.

/// Fault taxonomy, dispositions and the guest access violation payload.
pub mod fault;
pub use fault::{AccessCause, Disposition, FaultClass, FaultCode, GuestAccessViolation};

/// Engine configuration and validation.
pub mod config;
pub use config::{ConfigError, EngineConfig};

/// x86-64 memory-operand instruction decoder.
pub mod decoder;
pub use decoder::{
    Condition, DecodedOperation, Decoder, HexBytes, OpKind, Operand, MAX_INSTRUCTION_LENGTH,
};

/// Register and flag access over interrupted execution contexts.
pub mod context;
pub use context::{
    compute_compare_flags, read_operand_value, write_operand_value, ContextAccess,
    RegisterSnapshot,
};

/// Guest memory, device and hook interfaces plus privileged access primitives.
pub mod memory;
pub use memory::{
    AccessHook, DeviceRegistry, GuestMemory, MmioLayout, NoDevices, RegisterDevice,
};

/// Emulation of faulting accesses.
pub mod violation;
pub use violation::ViolationHandler;

/// Fault triage, context redirection and the process-wide fault hook.
pub mod entry;
pub use entry::{
    catch_guest_fault, fault_count, stage_call, triage, CallLinkage, FaultEvent, InstallError,
};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use entry::{install, installed, redirect, INTERRUPT_SIGNAL};

/// Managed threads, join semantics and cross-thread interrupts.
pub mod thread;
pub use thread::{
    current_thread, interrupt_disable, test_interrupt, InterruptGuard, TaskFailure, ThreadCtrl,
    ThreadError,
};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
