//! Uniform view over a host thread's saved register context.

pub mod flags;
pub mod operand;
pub mod snapshot;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ucontext;

pub use flags::compute_compare_flags;
pub use operand::{read_operand_value, write_operand_value};
pub use snapshot::RegisterSnapshot;

/// `rax` register index.
pub const RAX: u8 = 0;
/// `rcx` register index.
pub const RCX: u8 = 1;
/// `rdx` register index.
pub const RDX: u8 = 2;
/// `rbx` register index.
pub const RBX: u8 = 3;
/// `rsp` register index.
pub const RSP: u8 = 4;
/// `rbp` register index.
pub const RBP: u8 = 5;
/// `rsi` register index.
pub const RSI: u8 = 6;
/// `rdi` register index.
pub const RDI: u8 = 7;

/// Number of general-purpose and vector registers.
pub const REGISTER_COUNT: usize = 16;

/// Platform abstraction over a saved host register context.
///
/// Register indices follow the hardware encoding (`rax = 0 .. r15 = 15`).
/// Indices are masked to four bits by implementations.
pub trait ContextAccess {
    /// First and second integer argument registers of the platform calling
    /// convention. System V by default.
    const ARGUMENT_REGISTERS: [u8; 2] = [RDI, RSI];

    /// Reads a general-purpose register.
    fn gpr(&self, index: u8) -> u64;

    /// Writes a general-purpose register.
    fn set_gpr(&mut self, index: u8, value: u64);

    /// Reads a vector register, or `None` when the context carries no vector state.
    fn vector(&self, index: u8) -> Option<u128>;

    /// Writes a vector register. Returns `false` when the context carries no vector state.
    fn set_vector(&mut self, index: u8, value: u128) -> bool;

    /// Reads `RFLAGS`.
    fn flags(&self) -> u64;

    /// Writes `RFLAGS`.
    fn set_flags(&mut self, value: u64);

    /// Reads the instruction pointer.
    fn rip(&self) -> u64;

    /// Writes the instruction pointer.
    fn set_rip(&mut self, value: u64);

    /// Bytes of the instruction at the current instruction pointer, at
    /// least [`MAX_INSTRUCTION_LENGTH`](crate::MAX_INSTRUCTION_LENGTH) long when available.
    fn instruction_bytes(&self) -> &[u8];

    /// Reads the stack pointer.
    fn rsp(&self) -> u64 {
        self.gpr(RSP)
    }

    /// Writes the stack pointer.
    fn set_rsp(&mut self, value: u64) {
        self.set_gpr(RSP, value);
    }

    /// Writes the `slot`-th (0 or 1) call argument register.
    fn set_argument(&mut self, slot: usize, value: u64) {
        self.set_gpr(Self::ARGUMENT_REGISTERS[slot & 1], value);
    }

    /// Reads the `slot`-th (0 or 1) call argument register.
    fn argument(&self, slot: usize) -> u64 {
        self.gpr(Self::ARGUMENT_REGISTERS[slot & 1])
    }
}
