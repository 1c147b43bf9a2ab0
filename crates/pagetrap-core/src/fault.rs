use thiserror::Error;

/// Fault classes used for reporting and disposition policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultClass {
    /// Faulting host instruction could not be decoded.
    Decode,
    /// Computed address or access size overflows the emulated span.
    Range,
    /// Emulated memory access has no defined semantics; surfaces as a guest error.
    Guest,
    /// Decoder and operand evaluator tables disagree.
    Consistency,
    /// Interrupt delivery was requested in a forbidden way.
    InterruptProtocol,
    /// A managed thread's task failed.
    Thread,
    /// Genuine host-side fault outside the emulated window.
    Host,
}

/// Stable fault taxonomy for access-violation emulation and thread control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum FaultCode {
    /// Instruction form is not supported by the decoder.
    #[error("unsupported instruction encoding")]
    UnsupportedInstruction = 0x01,
    /// Address plus access size leaves the emulated address span.
    #[error("access range exceeds the emulated address span")]
    AccessRangeOverflow = 0x02,
    /// Register window slot has no device instance behind it.
    #[error("no device is mapped at the register window slot")]
    UnmappedDevice = 0x03,
    /// Device refused the register access or the access form is illegal for mmio.
    #[error("device register access rejected")]
    DeviceAccessRejected = 0x04,
    /// Decoded operation has no emulated memory form.
    #[error("operation has no emulated memory form")]
    UnsupportedOperation = 0x05,
    /// Block operation destination pointer does not match the faulting address.
    #[error("block operation pointer does not match the faulting address")]
    BlockPointerMismatch = 0x06,
    /// Operand kind cannot be resolved at the requested width.
    #[error("operand cannot be resolved at the requested width")]
    OperandMismatch = 0x07,
    /// Operand width outside 1, 2, 4, 8.
    #[error("invalid operand size")]
    InvalidOperandSize = 0x08,
    /// Host fault outside the emulated window.
    #[error("host fault outside the emulated window")]
    HostFaultOutsideWindow = 0x09,
    /// Fault raised while a previous redirect was still in flight.
    #[error("fault raised while a redirect was in flight")]
    RecursiveFault = 0x0A,
    /// Thread attempted to interrupt itself.
    #[error("a thread cannot interrupt itself")]
    SelfInterrupt = 0x0B,
    /// Target already has an unconsumed interrupt handler.
    #[error("an interrupt is already pending")]
    InterruptPending = 0x0C,
    /// Managed thread task returned an error or panicked.
    #[error("thread task failed")]
    TaskFailed = 0x0D,
    /// Reservation mechanism declined to run the privileged mutation.
    #[error("reservation refused the emulated access")]
    ReservationRefused = 0x0E,
}

impl FaultCode {
    /// Converts a fault code to its stable byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts the stable byte value back into a fault code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::UnsupportedInstruction),
            0x02 => Some(Self::AccessRangeOverflow),
            0x03 => Some(Self::UnmappedDevice),
            0x04 => Some(Self::DeviceAccessRejected),
            0x05 => Some(Self::UnsupportedOperation),
            0x06 => Some(Self::BlockPointerMismatch),
            0x07 => Some(Self::OperandMismatch),
            0x08 => Some(Self::InvalidOperandSize),
            0x09 => Some(Self::HostFaultOutsideWindow),
            0x0A => Some(Self::RecursiveFault),
            0x0B => Some(Self::SelfInterrupt),
            0x0C => Some(Self::InterruptPending),
            0x0D => Some(Self::TaskFailed),
            0x0E => Some(Self::ReservationRefused),
            _ => None,
        }
    }

    /// Returns the fault class for this fault code.
    #[must_use]
    pub const fn class(self) -> FaultClass {
        match self {
            Self::UnsupportedInstruction => FaultClass::Decode,
            Self::AccessRangeOverflow => FaultClass::Range,
            Self::UnmappedDevice
            | Self::DeviceAccessRejected
            | Self::UnsupportedOperation
            | Self::BlockPointerMismatch
            | Self::ReservationRefused => FaultClass::Guest,
            Self::OperandMismatch | Self::InvalidOperandSize => FaultClass::Consistency,
            Self::HostFaultOutsideWindow | Self::RecursiveFault => FaultClass::Host,
            Self::SelfInterrupt | Self::InterruptPending => FaultClass::InterruptProtocol,
            Self::TaskFailed => FaultClass::Thread,
        }
    }

    /// Whether the code indicates a host-side defect rather than a guest or
    /// task condition.
    ///
    /// This is a classification only. Fault triage still redirects every
    /// access the handler rejects inside the window as a guest-visible
    /// error, whatever its code; only [`Disposition::Fatal`] ends the process.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        !matches!(self.class(), FaultClass::Guest | FaultClass::Thread)
    }
}

/// Direction of the faulting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessCause {
    /// The instruction was reading memory.
    Reading,
    /// The instruction was writing memory.
    Writing,
}

impl AccessCause {
    /// Maps the hardware write bit onto a cause.
    #[must_use]
    pub const fn from_write(is_write: bool) -> Self {
        if is_write {
            Self::Writing
        } else {
            Self::Reading
        }
    }

    /// Human-readable cause used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Writing => "writing",
        }
    }

    /// Register encoding used when the cause crosses a staged call.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        match self {
            Self::Reading => 0,
            Self::Writing => 1,
        }
    }

    /// Inverse of [`AccessCause::as_raw`]; any nonzero value means writing.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self::from_write(raw != 0)
    }
}

impl std::fmt::Display for AccessCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one hardware-fault triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The access was emulated; execution resumes at the rewritten instruction pointer.
    Handled,
    /// The context must be redirected to raise a guest-visible access violation.
    Redirect {
        /// Direction of the failed access.
        cause: AccessCause,
        /// Emulated address of the failed access.
        address: u32,
    },
    /// The fault is a host defect and must not be resumed.
    Fatal {
        /// Reason the fault cannot be recovered.
        code: FaultCode,
        /// Raw host address reported by the hardware.
        host_address: usize,
    },
}

/// Guest-visible access violation raised by the redirect trampoline.
///
/// Travels as an unwind payload from the faulting frame to the nearest
/// [`catch_guest_fault`](crate::catch_guest_fault) recovery point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[error("access violation {cause} location {address:#010x} (host instruction {host_rip:#x})")]
pub struct GuestAccessViolation {
    /// Emulated address of the failed access.
    pub address: u32,
    /// Direction of the failed access.
    pub cause: AccessCause,
    /// Host instruction pointer of the faulting instruction.
    pub host_rip: u64,
}
