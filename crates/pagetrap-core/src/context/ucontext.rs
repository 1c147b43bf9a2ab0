//! [`ContextAccess`] over the `ucontext_t` delivered to Linux x86-64 signal handlers.

use std::slice;

use crate::context::ContextAccess;
use crate::decoder::MAX_INSTRUCTION_LENGTH;

/// `gregs` slots in hardware register order.
const GPR_SLOTS: [libc::c_int; 16] = [
    libc::REG_RAX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RBX,
    libc::REG_RSP,
    libc::REG_RBP,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
];

/// Page-fault error code bit set for write accesses.
const PF_WRITE: u64 = 0x2;

/// Mutable view over a signal handler's `ucontext_t`.
pub struct UcontextAccess<'a> {
    ctx: &'a mut libc::ucontext_t,
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
impl<'a> UcontextAccess<'a> {
    /// Wraps the context passed as the third argument of an `SA_SIGINFO` handler.
    ///
    /// # Safety
    ///
    /// `raw` must point to the live `ucontext_t` of the current signal
    /// delivery, and nothing else may access it while the view exists.
    pub unsafe fn from_raw(raw: *mut libc::c_void) -> Option<Self> {
        // SAFETY: the caller guarantees `raw` is the kernel-provided context.
        unsafe { raw.cast::<libc::ucontext_t>().as_mut() }.map(|ctx| Self { ctx })
    }

    fn greg(&self, slot: libc::c_int) -> u64 {
        self.ctx.uc_mcontext.gregs[slot as usize] as u64
    }

    fn set_greg(&mut self, slot: libc::c_int, value: u64) {
        self.ctx.uc_mcontext.gregs[slot as usize] = value as i64;
    }

    /// Returns `true` when the hardware reported a write access.
    #[must_use]
    pub fn is_write_fault(&self) -> bool {
        self.greg(libc::REG_ERR) & PF_WRITE != 0
    }

    fn fpstate(&self) -> Option<&libc::_libc_fpstate> {
        // SAFETY: the kernel either leaves `fpregs` null or points it at the
        // saved FPU area inside the signal frame.
        unsafe { self.ctx.uc_mcontext.fpregs.as_ref() }
    }

    fn fpstate_mut(&mut self) -> Option<&mut libc::_libc_fpstate> {
        // SAFETY: see `fpstate`.
        unsafe { self.ctx.uc_mcontext.fpregs.as_mut() }
    }
}

#[allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation
)]
impl ContextAccess for UcontextAccess<'_> {
    fn gpr(&self, index: u8) -> u64 {
        self.greg(GPR_SLOTS[usize::from(index & 0xF)])
    }

    fn set_gpr(&mut self, index: u8, value: u64) {
        self.set_greg(GPR_SLOTS[usize::from(index & 0xF)], value);
    }

    fn vector(&self, index: u8) -> Option<u128> {
        let lanes = self.fpstate()?._xmm[usize::from(index & 0xF)].element;
        Some(
            lanes
                .iter()
                .rev()
                .fold(0u128, |acc, &lane| (acc << 32) | u128::from(lane)),
        )
    }

    fn set_vector(&mut self, index: u8, value: u128) -> bool {
        let Some(fp) = self.fpstate_mut() else {
            return false;
        };
        for (i, lane) in fp._xmm[usize::from(index & 0xF)]
            .element
            .iter_mut()
            .enumerate()
        {
            *lane = (value >> (32 * i)) as u32;
        }
        true
    }

    fn flags(&self) -> u64 {
        self.greg(libc::REG_EFL)
    }

    fn set_flags(&mut self, value: u64) {
        self.set_greg(libc::REG_EFL, value);
    }

    fn rip(&self) -> u64 {
        self.greg(libc::REG_RIP)
    }

    fn set_rip(&mut self, value: u64) {
        self.set_greg(libc::REG_RIP, value);
    }

    fn instruction_bytes(&self) -> &[u8] {
        let rip = self.rip() as *const u8;
        if rip.is_null() {
            return &[];
        }
        // SAFETY: `rip` is the address of the faulting instruction, which
        // lives in mapped executable memory; instructions are followed by
        // more code in the same text mapping.
        unsafe { slice::from_raw_parts(rip, MAX_INSTRUCTION_LENGTH) }
    }
}
