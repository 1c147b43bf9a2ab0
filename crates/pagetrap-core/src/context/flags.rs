//! `RFLAGS` bits and arithmetic flag computation at 1, 2, 4 and 8 byte widths.

use crate::context::ContextAccess;
use crate::fault::FaultCode;

/// Carry flag.
pub const CF: u64 = 0x001;
/// Parity flag.
pub const PF: u64 = 0x004;
/// Auxiliary carry flag.
pub const AF: u64 = 0x010;
/// Zero flag.
pub const ZF: u64 = 0x040;
/// Sign flag.
pub const SF: u64 = 0x080;
/// Direction flag.
pub const DF: u64 = 0x400;
/// Overflow flag.
pub const OF: u64 = 0x800;

/// Flags written by arithmetic and logic instructions.
pub const STATUS_FLAGS: u64 = CF | PF | AF | ZF | SF | OF;

/// Value mask for an operand width, or an error for unsupported widths.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] unless `size` is 1, 2, 4 or 8.
pub const fn width_mask(size: u8) -> Result<u64, FaultCode> {
    match size {
        1 => Ok(0xFF),
        2 => Ok(0xFFFF),
        4 => Ok(0xFFFF_FFFF),
        8 => Ok(u64::MAX),
        _ => Err(FaultCode::InvalidOperandSize),
    }
}

const fn sign_bit(mask: u64) -> u64 {
    mask ^ (mask >> 1)
}

/// Flag word with `ZF`, `SF` and `PF` derived from `result`, keeping
/// everything outside [`STATUS_FLAGS`] and the explicitly provided bits.
const fn with_result(flags: u64, mask: u64, result: u64, status: u64) -> u64 {
    let mut out = (flags & !STATUS_FLAGS) | status;
    if result & mask == 0 {
        out |= ZF;
    }
    if result & sign_bit(mask) != 0 {
        out |= SF;
    }
    if (result as u8).count_ones() % 2 == 0 {
        out |= PF;
    }
    out
}

/// Flags of `x - y - borrow` (`cmp`, `sub`, `sbb`, `dec`).
///
/// With `update_carry == false` the incoming `CF` is preserved.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] for widths other than 1, 2, 4, 8.
pub const fn sub_flags(
    flags: u64,
    size: u8,
    x: u64,
    y: u64,
    borrow: bool,
    update_carry: bool,
) -> Result<u64, FaultCode> {
    let mask = match width_mask(size) {
        Ok(mask) => mask,
        Err(code) => return Err(code),
    };
    let (x, y) = (x & mask, y & mask);
    let result = x.wrapping_sub(y).wrapping_sub(borrow as u64) & mask;

    let mut status = 0;
    let carry = if update_carry {
        (x as u128) < (y as u128) + (borrow as u128)
    } else {
        flags & CF != 0
    };
    if carry {
        status |= CF;
    }
    if (x ^ y) & (x ^ result) & sign_bit(mask) != 0 {
        status |= OF;
    }
    if (x ^ y ^ result) & 0x10 != 0 {
        status |= AF;
    }

    Ok(with_result(flags, mask, result, status))
}

/// Flags of `x + y + carry` (`add`, `adc`, `inc`).
///
/// With `update_carry == false` the incoming `CF` is preserved.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] for widths other than 1, 2, 4, 8.
pub const fn add_flags(
    flags: u64,
    size: u8,
    x: u64,
    y: u64,
    carry_in: bool,
    update_carry: bool,
) -> Result<u64, FaultCode> {
    let mask = match width_mask(size) {
        Ok(mask) => mask,
        Err(code) => return Err(code),
    };
    let (x, y) = (x & mask, y & mask);
    let result = x.wrapping_add(y).wrapping_add(carry_in as u64) & mask;

    let mut status = 0;
    let carry = if update_carry {
        (x as u128) + (y as u128) + (carry_in as u128) > mask as u128
    } else {
        flags & CF != 0
    };
    if carry {
        status |= CF;
    }
    if (x ^ result) & (y ^ result) & sign_bit(mask) != 0 {
        status |= OF;
    }
    if (x ^ y ^ result) & 0x10 != 0 {
        status |= AF;
    }

    Ok(with_result(flags, mask, result, status))
}

/// Flags of a bitwise result (`and`, `or`, `xor`, `test`): `CF`, `OF` and
/// `AF` cleared.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] for widths other than 1, 2, 4, 8.
pub const fn logic_flags(flags: u64, size: u8, result: u64) -> Result<u64, FaultCode> {
    match width_mask(size) {
        Ok(mask) => Ok(with_result(flags, mask, result, 0)),
        Err(code) => Err(code),
    }
}

/// Recomputes the status flags of `x - y` at `size` bytes in `ctx`.
///
/// When `with_carry` is `false`, `CF` keeps its previous value, matching the
/// `inc`/`dec` forms.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] for widths other than 1, 2, 4, 8;
/// the context is left untouched.
pub fn compute_compare_flags<C: ContextAccess + ?Sized>(
    ctx: &mut C,
    size: u8,
    x: u64,
    y: u64,
    with_carry: bool,
) -> Result<(), FaultCode> {
    let flags = sub_flags(ctx.flags(), size, x, y, false, with_carry)?;
    ctx.set_flags(flags);
    Ok(())
}
