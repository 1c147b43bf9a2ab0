//! Resolution of decoded operands against a register context.

use tracing::error;

use crate::context::flags::width_mask;
use crate::context::ContextAccess;
use crate::decoder::Operand;
use crate::fault::FaultCode;

/// Reads the immediate of `width` bytes ending at byte `length` of the instruction.
fn immediate<C: ContextAccess + ?Sized>(
    ctx: &C,
    length: u8,
    width: usize,
) -> Result<i64, FaultCode> {
    let end = usize::from(length);
    let bytes = end
        .checked_sub(width)
        .and_then(|start| ctx.instruction_bytes().get(start..end))
        .ok_or(FaultCode::OperandMismatch)?;

    Ok(match *bytes {
        [b] => i64::from(i8::from_le_bytes([b])),
        [a, b] => i64::from(i16::from_le_bytes([a, b])),
        [a, b, c, d] => i64::from(i32::from_le_bytes([a, b, c, d])),
        _ => return Err(FaultCode::OperandMismatch),
    })
}

/// Resolves `operand` to a value of `size` bytes.
///
/// General registers are truncated to `size`. Immediates are re-read from
/// the trailing bytes of the instruction of `length` bytes at the context's
/// instruction pointer and sign-extended; `imm16` is only defined for 2-byte
/// and `imm32` only for 4- and 8-byte destinations. Condition operands
/// evaluate to 0 or 1.
///
/// # Errors
///
/// Returns [`FaultCode::OperandMismatch`] when the operand/size pair has no
/// defined mapping.
#[allow(clippy::cast_sign_loss)]
pub fn read_operand_value<C: ContextAccess + ?Sized>(
    ctx: &C,
    operand: Operand,
    size: u8,
    length: u8,
) -> Result<u64, FaultCode> {
    let value = match (operand, size) {
        (Operand::Gpr(index), 1 | 2 | 4 | 8) => Ok(ctx.gpr(index)),
        (Operand::LegacyByte(index @ 0..=3), 1) => Ok(ctx.gpr(index)),
        (Operand::LegacyByte(index @ 4..=7), 1) => Ok(ctx.gpr(index - 4) >> 8),
        (Operand::Imm8, 1 | 2 | 4 | 8) => immediate(ctx, length, 1).map(|v| v as u64),
        (Operand::Imm16, 2) => immediate(ctx, length, 2).map(|v| v as u64),
        (Operand::Imm32, 4 | 8) => immediate(ctx, length, 4).map(|v| v as u64),
        (Operand::Condition(condition), _) => Ok(u64::from(condition.evaluate(ctx.flags()))),
        _ => Err(FaultCode::OperandMismatch),
    };

    match value {
        Ok(value) => Ok(value & width_mask(size).unwrap_or(u64::MAX)),
        Err(code) => {
            error!(
                target: "pagetrap::violation",
                ?operand,
                size,
                length,
                "operand cannot be read"
            );
            Err(code)
        }
    }
}

/// Writes `value` into a register operand using partial-register semantics.
///
/// Byte and word writes keep the untouched bits of the backing register,
/// dword writes zero-extend and qword writes replace it.
///
/// # Errors
///
/// Returns [`FaultCode::OperandMismatch`] for immediates, conditions, vector
/// registers or unsupported widths.
pub fn write_operand_value<C: ContextAccess + ?Sized>(
    ctx: &mut C,
    operand: Operand,
    size: u8,
    value: u64,
) -> Result<(), FaultCode> {
    match (operand, size) {
        (Operand::Gpr(index), 1 | 2) => {
            let mask = if size == 1 { 0xFF } else { 0xFFFF };
            let old = ctx.gpr(index);
            ctx.set_gpr(index, (old & !mask) | (value & mask));
        }
        (Operand::Gpr(index), 4) => ctx.set_gpr(index, value & 0xFFFF_FFFF),
        (Operand::Gpr(index), 8) => ctx.set_gpr(index, value),
        (Operand::LegacyByte(index @ 0..=3), 1) => {
            let old = ctx.gpr(index);
            ctx.set_gpr(index, (old & !0xFF) | (value & 0xFF));
        }
        (Operand::LegacyByte(index @ 4..=7), 1) => {
            let old = ctx.gpr(index - 4);
            ctx.set_gpr(index - 4, (old & !0xFF00) | ((value & 0xFF) << 8));
        }
        _ => {
            error!(
                target: "pagetrap::violation",
                ?operand,
                size,
                value = format_args!("{value:#x}"),
                "invalid operand destination"
            );
            return Err(FaultCode::OperandMismatch);
        }
    }

    Ok(())
}
