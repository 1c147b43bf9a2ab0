//! Redirect trampoline entered after a fault could not be emulated.

use std::arch::global_asm;
use std::panic;

use tracing::debug;

use crate::context::ContextAccess;
use crate::entry::{begin_redirect, finish_redirect, is_leaf_function, stage_call, CallLinkage};
use crate::fault::{AccessCause, GuestAccessViolation};

// Entered with `rsp` pointing at the reserved return slot, which may not be
// 16-byte aligned. The frame is described through `rbp` so the unwinder can
// walk from `raise_guest_fault` back into the interrupted function.
global_asm!(
    ".pushsection .text",
    ".p2align 4",
    ".globl pagetrap_redirect_entry",
    ".hidden pagetrap_redirect_entry",
    ".type pagetrap_redirect_entry,@function",
    "pagetrap_redirect_entry:",
    ".cfi_startproc",
    "push rbp",
    ".cfi_def_cfa_offset 16",
    ".cfi_offset rbp, -16",
    "mov rbp, rsp",
    ".cfi_def_cfa_register rbp",
    "and rsp, -16",
    "call {raise}",
    "ud2",
    ".cfi_endproc",
    ".size pagetrap_redirect_entry, .-pagetrap_redirect_entry",
    ".popsection",
    raise = sym raise_guest_fault,
);

extern "C" {
    fn pagetrap_redirect_entry();
}

/// Rewrites `ctx` to raise a [`GuestAccessViolation`] for `address` on resume.
///
/// Must be called on the thread that owns `ctx`, from its fault handler.
pub fn redirect<C: ContextAccess + ?Sized>(ctx: &mut C, cause: AccessCause, address: u32) {
    let entry = pagetrap_redirect_entry as unsafe extern "C" fn() as usize as u64;
    let leaf = is_leaf_function(ctx.rip());
    let linkage = stage_call(ctx, entry, cause.as_raw(), u64::from(address), leaf);
    begin_redirect(linkage);
}

/// Restores the return linkage of the redirected frame and unwinds with the
/// guest-visible error.
#[allow(clippy::cast_possible_truncation)]
extern "C-unwind" fn raise_guest_fault(cause: u64, address: u64) -> ! {
    let linkage = finish_redirect();
    let host_rip = linkage.map_or(0, |linkage| linkage.return_address);

    if let Some(CallLinkage {
        return_address,
        stack_slot: Some(slot),
    }) = linkage
    {
        // The unwinder looks up `return address - 1`; offsetting by one keeps
        // that lookup on the faulting instruction even at a function start.
        // SAFETY: `slot` is the word `stage_call` reserved directly above the
        // entry stub's frame on this thread's stack.
        unsafe { (slot as *mut u64).write(return_address.wrapping_add(1)) };
    }

    let violation = GuestAccessViolation {
        address: address as u32,
        cause: AccessCause::from_raw(cause),
        host_rip,
    };
    debug!(target: "pagetrap::entry", %violation, "raising guest fault");
    panic::resume_unwind(Box::new(violation))
}
