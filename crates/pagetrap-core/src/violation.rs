//! Emulation of a faulting host access against emulated memory.
//!
//! Each fault goes through the same sequence:
//! 1. Offer the access to the external hook
//! 2. Decode the host instruction
//! 3. Compute the access size (full run for repeated block operations)
//! 4. Reject accesses leaving the emulated span
//! 5. Route register-window accesses to the owning device
//! 6. Otherwise run the privileged mutation under the reservation mechanism
//! 7. Advance the instruction pointer, unless a block operation stopped at a page boundary

use std::fmt;

use tracing::{debug, error};

use crate::config::{ConfigError, EngineConfig};
use crate::context::flags::{add_flags, logic_flags, sub_flags, width_mask, CF, DF};
use crate::context::{
    compute_compare_flags, read_operand_value, write_operand_value, ContextAccess, RAX, RCX, RDI,
    RSI,
};
use crate::decoder::{DecodedOperation, Decoder, HexBytes, OpKind, Operand};
use crate::fault::FaultCode;
use crate::memory::{access, AccessHook, DeviceRegistry, GuestMemory, NoDevices};

/// Where the instruction pointer goes after a successful RAM emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Instruction fully emulated; skip it.
    Complete,
    /// Block operation stopped at a page boundary; re-execute it.
    Partial,
}

/// Decodes and emulates faulting accesses to the emulated window.
pub struct ViolationHandler {
    config: EngineConfig,
    memory: Box<dyn GuestMemory>,
    devices: Box<dyn DeviceRegistry>,
    hook: Option<Box<dyn AccessHook>>,
}

impl fmt::Debug for ViolationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViolationHandler")
            .field("config", &self.config)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl ViolationHandler {
    /// Creates a handler over `memory` with no devices and no hook.
    ///
    /// # Errors
    ///
    /// Returns the validation error when `config` is unusable.
    pub fn new(config: EngineConfig, memory: impl GuestMemory + 'static) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            memory: Box::new(memory),
            devices: Box::new(NoDevices),
            hook: None,
        })
    }

    /// Replaces the device registry consulted for register-window accesses.
    #[must_use]
    pub fn with_devices(mut self, devices: impl DeviceRegistry + 'static) -> Self {
        self.devices = Box::new(devices);
        self
    }

    /// Installs the hook offered every fault before decoding.
    #[must_use]
    pub fn with_hook(mut self, hook: impl AccessHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Emulated memory the handler operates on.
    #[must_use]
    pub fn memory(&self) -> &dyn GuestMemory {
        self.memory.as_ref()
    }

    /// Emulates the access at `address`; `true` when execution may resume.
    pub fn handle<C: ContextAccess + ?Sized>(&self, address: u32, is_write: bool, ctx: &mut C) -> bool {
        match self.try_handle(address, is_write, ctx) {
            Ok(()) => true,
            Err(code) => {
                error!(
                    target: "pagetrap::violation",
                    address = format_args!("{address:#010x}"),
                    is_write,
                    rip = format_args!("{:#x}", ctx.rip()),
                    %code,
                    "access not emulated"
                );
                false
            }
        }
    }

    /// Emulates the access at `address`, reporting why it could not be.
    ///
    /// On error the context may already carry partial register updates and
    /// must not be resumed at the faulting instruction.
    ///
    /// # Errors
    ///
    /// Returns the [`FaultCode`] describing the rejected access.
    pub fn try_handle<C: ContextAccess + ?Sized>(
        &self,
        address: u32,
        is_write: bool,
        ctx: &mut C,
    ) -> Result<(), FaultCode> {
        if self
            .hook
            .as_ref()
            .is_some_and(|hook| hook.on_access_violation(address, is_write))
        {
            return Ok(());
        }

        let op = Decoder::decode(ctx.instruction_bytes());
        if op.is_none() {
            error!(
                target: "pagetrap::violation",
                bytes = %HexBytes(ctx.instruction_bytes()),
                "unsupported instruction"
            );
            return Err(FaultCode::UnsupportedInstruction);
        }

        let access_size = access_size(&op, ctx)?;
        let span = self.config.window_span;
        let start = u64::from(address);
        if start + u64::from(op.size) > span || start + access_size > span {
            error!(
                target: "pagetrap::violation",
                address = format_args!("{address:#010x}"),
                size = op.size,
                access_size,
                "access exceeds the emulated span"
            );
            return Err(FaultCode::AccessRangeOverflow);
        }

        if let Some(slot) = self.config.mmio.slot_of(address) {
            return self.emulate_mmio(&op, slot, address, is_write, ctx);
        }

        // `access_size <= span <= 4 GiB` after the range check above.
        let reserved = u32::try_from(access_size).map_err(|_| FaultCode::AccessRangeOverflow)?;
        let mut outcome = Err(FaultCode::ReservationRefused);
        let accepted = self
            .memory
            .reservation_query(address, reserved, is_write, &mut || {
                outcome = self.emulate_ram(&op, address, ctx);
                outcome.is_ok()
            });

        match outcome {
            Ok(Progress::Complete) if accepted => {
                advance(ctx, &op);
                Ok(())
            }
            Ok(Progress::Partial) if accepted => {
                debug!(
                    target: "pagetrap::violation",
                    remaining = ctx.gpr(RCX),
                    "block operation stopped at page boundary"
                );
                Ok(())
            }
            Ok(_) => Err(FaultCode::ReservationRefused),
            Err(code) => Err(code),
        }
    }

    fn emulate_mmio<C: ContextAccess + ?Sized>(
        &self,
        op: &DecodedOperation,
        slot: u32,
        address: u32,
        is_write: bool,
        ctx: &mut C,
    ) -> Result<(), FaultCode> {
        let Some(device) = self.devices.device(slot) else {
            error!(
                target: "pagetrap::violation",
                slot,
                address = format_args!("{address:#010x}"),
                "register window has no device"
            );
            return Err(FaultCode::UnmappedDevice);
        };

        if op.size != 4 {
            return Err(FaultCode::DeviceAccessRejected);
        }

        match op.kind {
            OpKind::Load | OpKind::LoadBe | OpKind::LoadCompare | OpKind::LoadTest => {
                if is_write {
                    return Err(FaultCode::DeviceAccessRejected);
                }
                let raw = device
                    .read_reg(address)
                    .ok_or(FaultCode::DeviceAccessRejected)?;
                let value = u64::from(if op.kind == OpKind::LoadBe {
                    raw
                } else {
                    raw.swap_bytes()
                });

                match op.kind {
                    OpKind::LoadCompare => {
                        let rhs = read_operand_value(ctx, op.operand, op.size, op.length)?;
                        compute_compare_flags(ctx, op.size, value, rhs, true)?;
                    }
                    OpKind::LoadTest => {
                        let rhs = read_operand_value(ctx, op.operand, op.size, op.length)?;
                        let flags = logic_flags(ctx.flags(), op.size, value & rhs)?;
                        ctx.set_flags(flags);
                    }
                    _ => write_operand_value(ctx, op.operand, op.size, value)?,
                }
            }
            OpKind::Store | OpKind::StoreBe => {
                if !is_write {
                    return Err(FaultCode::DeviceAccessRejected);
                }
                let value = read_operand_value(ctx, op.operand, op.size, op.length)?;
                let value = u32::try_from(value).map_err(|_| FaultCode::OperandMismatch)?;
                let value = if op.kind == OpKind::Store {
                    value.swap_bytes()
                } else {
                    value
                };
                if !device.write_reg(address, value) {
                    return Err(FaultCode::DeviceAccessRejected);
                }
            }
            _ => return Err(FaultCode::DeviceAccessRejected),
        }

        advance(ctx, op);
        Ok(())
    }

    fn emulate_ram<C: ContextAccess + ?Sized>(
        &self,
        op: &DecodedOperation,
        address: u32,
        ctx: &mut C,
    ) -> Result<Progress, FaultCode> {
        if op.kind.is_block() {
            return self.emulate_block(op, address, ctx);
        }

        let ptr = self.memory.base_priv(address);
        if ptr.is_null() {
            return Err(FaultCode::UnsupportedOperation);
        }
        let size = op.size;

        // SAFETY: `base_priv` is valid up to the end of the window and the
        // range check guarantees `address + size` stays inside it.
        unsafe {
            match op.kind {
                OpKind::Store | OpKind::StoreBe if size == 16 => {
                    let Operand::Vector(index) = op.operand else {
                        return Err(FaultCode::OperandMismatch);
                    };
                    let value = ctx.vector(index).ok_or(FaultCode::OperandMismatch)?;
                    access::store_bytes(ptr, &value.to_le_bytes());
                }
                OpKind::Store | OpKind::StoreBe if size > 8 => {
                    return Err(FaultCode::UnsupportedOperation);
                }
                OpKind::Store | OpKind::StoreBe => {
                    let value = read_operand_value(ctx, op.operand, size, op.length)?;
                    let value = if op.kind == OpKind::StoreBe {
                        swap_width(value, size)?
                    } else {
                        value
                    };
                    access::store(ptr, size, value)?;
                }
                OpKind::Exchange => {
                    let value = read_operand_value(ctx, op.operand, size, op.length)?;
                    let old = access::exchange(ptr, size, value)?;
                    write_operand_value(ctx, op.operand, size, old)?;
                }
                OpKind::CompareExchange => {
                    let new = read_operand_value(ctx, op.operand, size, op.length)?;
                    let expected = ctx.gpr(RAX) & width_mask(size)?;
                    let old = access::compare_exchange(ptr, size, expected, new)?;
                    if old != expected {
                        write_operand_value(ctx, Operand::Gpr(RAX), size, old)?;
                    }
                    compute_compare_flags(ctx, size, expected, old, true)?;
                }
                OpKind::And | OpKind::Or | OpKind::Xor => {
                    let rhs = read_operand_value(ctx, op.operand, size, op.length)?;
                    let apply = |v: u64| match op.kind {
                        OpKind::And => v & rhs,
                        OpKind::Or => v | rhs,
                        _ => v ^ rhs,
                    };
                    let old = access::fetch_update(ptr, size, apply)?;
                    let flags = logic_flags(ctx.flags(), size, apply(old))?;
                    ctx.set_flags(flags);
                }
                OpKind::Inc => {
                    let old = access::fetch_update(ptr, size, |v| v.wrapping_add(1))?;
                    let flags = add_flags(ctx.flags(), size, old, 1, false, false)?;
                    ctx.set_flags(flags);
                }
                OpKind::Dec => {
                    let old = access::fetch_update(ptr, size, |v| v.wrapping_sub(1))?;
                    let flags = sub_flags(ctx.flags(), size, old, 1, false, false)?;
                    ctx.set_flags(flags);
                }
                OpKind::Add | OpKind::AddCarry => {
                    let rhs = read_operand_value(ctx, op.operand, size, op.length)?;
                    let carry = op.kind == OpKind::AddCarry && ctx.flags() & CF != 0;
                    let old = access::fetch_update(ptr, size, |v| {
                        v.wrapping_add(rhs).wrapping_add(u64::from(carry))
                    })?;
                    let flags = add_flags(ctx.flags(), size, old, rhs, carry, true)?;
                    ctx.set_flags(flags);
                }
                OpKind::Sub | OpKind::SubBorrow => {
                    let rhs = read_operand_value(ctx, op.operand, size, op.length)?;
                    let borrow = op.kind == OpKind::SubBorrow && ctx.flags() & CF != 0;
                    let old = access::fetch_update(ptr, size, |v| {
                        v.wrapping_sub(rhs).wrapping_sub(u64::from(borrow))
                    })?;
                    let flags = sub_flags(ctx.flags(), size, old, rhs, borrow, true)?;
                    ctx.set_flags(flags);
                }
                _ => {
                    error!(
                        target: "pagetrap::violation",
                        kind = ?op.kind,
                        address = format_args!("{address:#010x}"),
                        "operation has no RAM form"
                    );
                    return Err(FaultCode::UnsupportedOperation);
                }
            }
        }

        Ok(Progress::Complete)
    }

    /// `movs`/`stos` one element at a time up to the next page boundary.
    fn emulate_block<C: ContextAccess + ?Sized>(
        &self,
        op: &DecodedOperation,
        address: u32,
        ctx: &mut C,
    ) -> Result<Progress, FaultCode> {
        width_mask(op.size)?;
        if ctx.flags() & DF != 0 {
            error!(target: "pagetrap::violation", "descending block operation");
            return Err(FaultCode::UnsupportedOperation);
        }

        let target = self.memory.base(address) as u64;
        if target != ctx.gpr(RDI) {
            error!(
                target: "pagetrap::violation",
                expected = format_args!("{target:#x}"),
                rdi = format_args!("{:#x}", ctx.gpr(RDI)),
                "block destination does not match the faulting address"
            );
            return Err(FaultCode::BlockPointerMismatch);
        }

        let repeated = op.operand != Operand::NotSet;
        if repeated && ctx.gpr(RCX) == 0 {
            return Ok(Progress::Complete);
        }

        let step = u32::from(op.size);
        let page_mask = self.config.page_size - 1;
        let fill = ctx.gpr(RAX);
        let mut address = address;

        loop {
            let dest = self.memory.base_priv(address);
            if dest.is_null() {
                return Err(FaultCode::UnsupportedOperation);
            }

            // SAFETY: the run was range-checked against the window, and the
            // source of `movs` is either translated into the privileged view
            // or is ordinary host memory the instruction was about to read.
            unsafe {
                let value = if op.kind == OpKind::BlockMove {
                    access::load(self.privileged_source(ctx.gpr(RSI)), op.size)?
                } else {
                    fill
                };
                access::store(dest, op.size, value)?;
            }

            if op.kind == OpKind::BlockMove {
                ctx.set_gpr(RSI, ctx.gpr(RSI).wrapping_add(u64::from(step)));
            }
            ctx.set_gpr(RDI, ctx.gpr(RDI).wrapping_add(u64::from(step)));
            address = address.wrapping_add(step);

            if !repeated {
                return Ok(Progress::Complete);
            }

            let remaining = ctx.gpr(RCX) - 1;
            ctx.set_gpr(RCX, remaining);
            if remaining == 0 {
                return Ok(Progress::Complete);
            }
            if address & page_mask < step {
                return Ok(Progress::Partial);
            }
        }
    }

    /// Maps a host source pointer inside the guest view onto the privileged view.
    #[allow(clippy::cast_possible_truncation)]
    fn privileged_source(&self, host: u64) -> *const u8 {
        let base = self.memory.base(0) as u64;
        match host.checked_sub(base) {
            Some(offset) if offset < self.config.window_span => {
                self.memory.base_priv(offset as u32).cast_const()
            }
            _ => host as *const u8,
        }
    }
}

/// Bytes the reservation mechanism must cover for this access.
fn access_size<C: ContextAccess + ?Sized>(op: &DecodedOperation, ctx: &C) -> Result<u64, FaultCode> {
    let size = u64::from(op.size);
    match op.kind {
        // Descending runs are rejected later; nothing to bound-check here.
        OpKind::BlockMove | OpKind::BlockStore if ctx.flags() & DF != 0 => Ok(0),
        OpKind::BlockMove | OpKind::BlockStore if op.operand != Operand::NotSet => size
            .checked_mul(ctx.gpr(RCX))
            .ok_or(FaultCode::AccessRangeOverflow),
        OpKind::CompareExchange => {
            let new = read_operand_value(ctx, op.operand, op.size, op.length)?;
            let expected = ctx.gpr(RAX) & width_mask(op.size)?;
            // Memory cannot change when the replacement equals the comparand.
            Ok(if new == expected { 0 } else { size })
        }
        _ => Ok(size),
    }
}

fn advance<C: ContextAccess + ?Sized>(ctx: &mut C, op: &DecodedOperation) {
    ctx.set_rip(ctx.rip().wrapping_add(u64::from(op.length)));
}

#[allow(clippy::cast_possible_truncation)]
const fn swap_width(value: u64, size: u8) -> Result<u64, FaultCode> {
    match size {
        2 => Ok((value as u16).swap_bytes() as u64),
        4 => Ok((value as u32).swap_bytes() as u64),
        8 => Ok(value.swap_bytes()),
        _ => Err(FaultCode::InvalidOperandSize),
    }
}

#[cfg(test)]
mod tests {
    use super::{swap_width, ViolationHandler};
    use crate::config::EngineConfig;
    use crate::context::flags::{CF, DF, ZF};
    use crate::context::{ContextAccess, RegisterSnapshot, RAX, RCX, RDI};
    use crate::fault::FaultCode;
    use crate::memory::GuestMemory;
    use std::cell::UnsafeCell;
    use std::sync::{Arc, Mutex};

    const WINDOW: usize = 0x4000;

    /// Single-view memory that also counts reservation queries.
    struct Flat {
        bytes: Box<[UnsafeCell<u8>]>,
        last_query: Mutex<Option<(u32, u32, bool)>>,
        refuse: bool,
    }

    // SAFETY: tests access the buffer from one thread.
    unsafe impl Sync for Flat {}

    impl Flat {
        fn new() -> Self {
            Self {
                bytes: (0..WINDOW).map(|_| UnsafeCell::new(0)).collect(),
                last_query: Mutex::new(None),
                refuse: false,
            }
        }

        fn read(&self, address: usize, len: usize) -> Vec<u8> {
            (address..address + len)
                .map(|i| unsafe { *self.bytes[i].get() })
                .collect()
        }
    }

    impl GuestMemory for Flat {
        fn base(&self, address: u32) -> *mut u8 {
            self.bytes[0].get().wrapping_add(address as usize)
        }

        fn base_priv(&self, address: u32) -> *mut u8 {
            self.base(address)
        }

        fn reservation_query(
            &self,
            address: u32,
            size: u32,
            is_write: bool,
            mutate: &mut dyn FnMut() -> bool,
        ) -> bool {
            *self.last_query.lock().unwrap() = Some((address, size, is_write));
            !self.refuse && mutate()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            window_span: WINDOW as u64,
            ..EngineConfig::default()
        }
    }

    fn handler() -> (ViolationHandler, Arc<Flat>) {
        let memory = Arc::new(Flat::new());
        let handler = ViolationHandler::new(config(), Arc::clone(&memory)).expect("valid config");
        (handler, memory)
    }

    #[test]
    fn store_advances_rip_and_writes_memory() {
        let (handler, memory) = handler();
        // mov dword [rdi], ecx
        let mut ctx = RegisterSnapshot::at_instruction(0x1000, &[0x89, 0x0F]);
        ctx.gprs[usize::from(RCX)] = 0xAABB_CCDD;
        handler.try_handle(0x100, true, &mut ctx).expect("handled");
        assert_eq!(ctx.rip, 0x1002);
        assert_eq!(memory.read(0x100, 4), [0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn movbe_store_swaps_bytes() {
        let (handler, memory) = handler();
        // movbe [rdi], eax
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0x0F, 0x38, 0xF1, 0x07]);
        ctx.gprs[usize::from(RAX)] = 0x1122_3344;
        handler.try_handle(0x20, true, &mut ctx).expect("handled");
        assert_eq!(memory.read(0x20, 4), [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(ctx.rip, 4);
    }

    #[test]
    fn cmpxchg_with_equal_operands_reserves_nothing() {
        let (handler, memory) = handler();
        // lock cmpxchg [rdi], ecx
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0xF0, 0x0F, 0xB1, 0x0F]);
        ctx.gprs[usize::from(RAX)] = 7;
        ctx.gprs[usize::from(RCX)] = 7;
        handler.try_handle(0x40, true, &mut ctx).expect("handled");
        assert_eq!(*memory.last_query.lock().unwrap(), Some((0x40, 0, true)));
        assert_eq!(ctx.rflags & ZF, 0, "memory held 0, not 7");
        assert_eq!(ctx.gprs[usize::from(RAX)], 0);
    }

    #[test]
    fn cmpxchg_success_sets_zero_flag() {
        let (handler, memory) = handler();
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0xF0, 0x0F, 0xB1, 0x0F]);
        ctx.gprs[usize::from(RAX)] = 0;
        ctx.gprs[usize::from(RCX)] = 0x55;
        handler.try_handle(0x40, true, &mut ctx).expect("handled");
        assert_eq!(*memory.last_query.lock().unwrap(), Some((0x40, 4, true)));
        assert_ne!(ctx.rflags & ZF, 0);
        assert_eq!(memory.read(0x40, 4), [0x55, 0, 0, 0]);
    }

    #[test]
    fn add_with_carry_uses_incoming_carry() {
        let (handler, memory) = handler();
        // adc byte [rdi], 0xFF
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0x80, 0x17, 0xFF]);
        ctx.rflags = CF;
        handler.try_handle(0x10, true, &mut ctx).expect("handled");
        assert_eq!(memory.read(0x10, 1), [0x00]);
        assert_ne!(ctx.rflags & CF, 0);
        assert_ne!(ctx.rflags & ZF, 0);
    }

    #[test]
    fn descending_block_store_is_rejected() {
        let (handler, _memory) = handler();
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0xF3, 0xAB]);
        ctx.rflags = DF;
        ctx.gprs[usize::from(RCX)] = 2;
        ctx.gprs[usize::from(RDI)] = handler.memory().base(0x80) as u64;
        assert_eq!(
            handler.try_handle(0x80, true, &mut ctx),
            Err(FaultCode::UnsupportedOperation)
        );
    }

    #[test]
    fn refused_reservation_is_unhandled() {
        let mut memory = Flat::new();
        memory.refuse = true;
        let handler = ViolationHandler::new(config(), memory).expect("valid config");
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0x89, 0x0F]);
        assert!(!handler.handle(0x100, true, &mut ctx));
        assert_eq!(ctx.rip(), 0);
    }

    #[test]
    fn access_past_span_is_rejected() {
        let (handler, _memory) = handler();
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0x48, 0x89, 0x0F]);
        assert_eq!(
            handler.try_handle(WINDOW as u32 - 4, true, &mut ctx),
            Err(FaultCode::AccessRangeOverflow)
        );
    }

    #[test]
    fn hook_claims_fault_before_decoding() {
        let (handler, _memory) = handler();
        let handler = handler.with_hook(|address: u32, _write: bool| address == 0x200);
        let mut ctx = RegisterSnapshot::at_instruction(0, &[0x0F, 0x0B]);
        assert_eq!(handler.try_handle(0x200, false, &mut ctx), Ok(()));
        assert_eq!(ctx.rip, 0);
        assert_eq!(
            handler.try_handle(0x204, false, &mut ctx),
            Err(FaultCode::UnsupportedInstruction)
        );
    }

    #[test]
    fn swap_width_rejects_bytes() {
        assert_eq!(swap_width(0x1234, 2), Ok(0x3412));
        assert_eq!(swap_width(1, 1), Err(FaultCode::InvalidOperandSize));
    }
}
