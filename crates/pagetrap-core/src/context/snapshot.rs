//! Owned register context used for interrupt bookkeeping and tests.

use crate::context::{ContextAccess, REGISTER_COUNT};

/// Instruction bytes kept by a snapshot.
pub const CODE_WINDOW: usize = 16;

/// Plain-data copy of a host register context.
///
/// `code` holds the bytes of the instruction at `rip`, since a snapshot
/// does not point into executable memory. The type is `Copy` and never
/// allocates, so it can be filled from inside a signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterSnapshot {
    /// General-purpose registers in hardware order.
    pub gprs: [u64; REGISTER_COUNT],
    /// `xmm0..=xmm15`.
    pub vectors: [u128; REGISTER_COUNT],
    /// `RFLAGS`.
    pub rflags: u64,
    /// Instruction pointer.
    pub rip: u64,
    /// Instruction bytes at `rip`; only the first `code_len` are meaningful.
    pub code: [u8; CODE_WINDOW],
    /// Number of valid bytes in `code`.
    pub code_len: usize,
}

impl RegisterSnapshot {
    /// Snapshot positioned at an instruction with the given encoding.
    #[must_use]
    pub fn at_instruction(rip: u64, code: &[u8]) -> Self {
        let mut snapshot = Self {
            rip,
            ..Self::default()
        };
        snapshot.set_code(code);
        snapshot
    }

    /// Replaces the instruction bytes, keeping at most [`CODE_WINDOW`].
    pub fn set_code(&mut self, code: &[u8]) {
        let len = code.len().min(CODE_WINDOW);
        self.code = [0; CODE_WINDOW];
        self.code[..len].copy_from_slice(&code[..len]);
        self.code_len = len;
    }

    /// Copies every register of another context.
    #[must_use]
    pub fn capture<C: ContextAccess + ?Sized>(ctx: &C) -> Self {
        let mut snapshot = Self::at_instruction(ctx.rip(), ctx.instruction_bytes());
        snapshot.rflags = ctx.flags();
        for (reg, (gpr, vector)) in (0u8..).zip(snapshot.gprs.iter_mut().zip(&mut snapshot.vectors)) {
            *gpr = ctx.gpr(reg);
            *vector = ctx.vector(reg).unwrap_or_default();
        }
        snapshot
    }
}

impl ContextAccess for RegisterSnapshot {
    fn gpr(&self, index: u8) -> u64 {
        self.gprs[usize::from(index & 0xF)]
    }

    fn set_gpr(&mut self, index: u8, value: u64) {
        self.gprs[usize::from(index & 0xF)] = value;
    }

    fn vector(&self, index: u8) -> Option<u128> {
        Some(self.vectors[usize::from(index & 0xF)])
    }

    fn set_vector(&mut self, index: u8, value: u128) -> bool {
        self.vectors[usize::from(index & 0xF)] = value;
        true
    }

    fn flags(&self) -> u64 {
        self.rflags
    }

    fn set_flags(&mut self, value: u64) {
        self.rflags = value;
    }

    fn rip(&self) -> u64 {
        self.rip
    }

    fn set_rip(&mut self, value: u64) {
        self.rip = value;
    }

    fn instruction_bytes(&self) -> &[u8] {
        &self.code[..self.code_len.min(CODE_WINDOW)]
    }
}
