//! Partial x86-64 decoder for the memory-touching forms emitted by the
//! code generator.
//!
//! The decoder never looks at operand addresses: the faulting address is
//! supplied by the hardware. It only needs the operation, the register or
//! immediate on the other side of the access, the operand width and the
//! total instruction length so the instruction pointer can be advanced.

use std::fmt;

use tracing::info;

pub mod operation;
pub use operation::{Condition, DecodedOperation, OpKind, Operand};

/// Architectural upper bound on x86-64 instruction length.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

const RCX: u8 = 1;

const LOCK: u8 = 0xF0;
const REPNE: u8 = 0xF2;
const REPE: u8 = 0xF3;
const OPERAND_SIZE: u8 = 0x66;
const ADDRESS_SIZE: u8 = 0x67;

/// Prefix state accumulated before the opcode.
#[derive(Debug, Default, Clone, Copy)]
struct Prefixes {
    lock: bool,
    repne: bool,
    repe: bool,
    oso: bool,
    segment: Option<u8>,
    rex: u8,
}

impl Prefixes {
    const fn rex_r(self) -> u8 {
        if self.rex & 0x4 == 0 {
            0
        } else {
            8
        }
    }

    const fn op_size(self) -> u8 {
        if self.rex & 0x8 != 0 {
            8
        } else if self.oso {
            2
        } else {
            4
        }
    }

    /// Immediate marker and byte count for `imm16/imm32` forms.
    const fn full_immediate(self) -> (Operand, usize) {
        if self.oso {
            (Operand::Imm16, 2)
        } else {
            (Operand::Imm32, 4)
        }
    }

    fn set_flag(flag: &mut bool, name: &str, at: usize) {
        if *flag {
            info!(target: "pagetrap::decode", offset = at, "{name} prefix found twice");
        }
        *flag = true;
    }
}

const fn reg_field(modrm: u8) -> u8 {
    (modrm >> 3) & 0x7
}

const fn gpr(modrm: u8, prefixes: Prefixes) -> Operand {
    Operand::Gpr(reg_field(modrm) | prefixes.rex_r())
}

const fn xmm(modrm: u8, prefixes: Prefixes) -> Operand {
    Operand::Vector(reg_field(modrm) | prefixes.rex_r())
}

/// Byte register named by the reg field; any REX prefix selects the uniform
/// `spl/bpl/sil/dil` encoding instead of `ah/ch/dh/bh`.
const fn byte_register(modrm: u8, prefixes: Prefixes) -> Operand {
    if prefixes.rex == 0 {
        Operand::LegacyByte(reg_field(modrm))
    } else {
        gpr(modrm, prefixes)
    }
}

/// Bytes taken by ModRM, SIB and displacement, starting at the ModRM byte.
fn modrm_length(code: &[u8], at: usize) -> Option<usize> {
    let modrm = *code.get(at)?;
    let rm = modrm & 0x7;

    Some(match modrm >> 6 {
        0 if rm == 4 => {
            // SIB with base 101 carries a disp32 instead of a base register.
            if *code.get(at + 1)? & 0x7 == 5 {
                6
            } else {
                2
            }
        }
        0 if rm == 5 => 5, // rip-relative disp32
        0 => 1,
        1 if rm == 4 => 3,
        1 => 2,
        2 if rm == 4 => 6,
        2 => 5,
        _ => 1,
    })
}

/// Builds a ModRM-addressed form; `imm` counts trailing immediate bytes.
fn with_modrm(
    code: &[u8],
    at: usize,
    kind: OpKind,
    operand: Operand,
    size: u8,
    imm: usize,
) -> Option<DecodedOperation> {
    let length = at + modrm_length(code, at)? + imm;

    Some(DecodedOperation {
        kind,
        operand,
        size,
        length: u8::try_from(length).ok()?,
    })
}

/// Operation selected by the reg field of opcodes `80`, `81` and `83`.
const fn group1_kind(modrm: u8) -> OpKind {
    match reg_field(modrm) {
        0 => OpKind::Add,
        1 => OpKind::Or,
        2 => OpKind::AddCarry,
        3 => OpKind::SubBorrow,
        4 => OpKind::And,
        5 => OpKind::Sub,
        6 => OpKind::Xor,
        _ => OpKind::LoadCompare,
    }
}

/// Operation of the `op r/m, r` ALU rows (`00..=39`) and `test` (`84/85`).
const fn alu_kind(opcode: u8) -> OpKind {
    match opcode & !1 {
        0x00 => OpKind::Add,
        0x08 => OpKind::Or,
        0x10 => OpKind::AddCarry,
        0x18 => OpKind::SubBorrow,
        0x20 => OpKind::And,
        0x28 => OpKind::Sub,
        0x30 => OpKind::Xor,
        0x38 => OpKind::LoadCompare,
        _ => OpKind::LoadTest,
    }
}

/// Stateless decoder entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder;

impl Decoder {
    /// Decodes the instruction at the start of `code`.
    ///
    /// Returns [`DecodedOperation::UNSUPPORTED`] for malformed, truncated or
    /// unsupported forms. A supported result never reports a length larger
    /// than `code.len()` or [`MAX_INSTRUCTION_LENGTH`].
    #[must_use]
    pub fn decode(code: &[u8]) -> DecodedOperation {
        let mut prefixes = Prefixes::default();
        let mut at = 0;

        loop {
            let Some(&byte) = code.get(at) else {
                return DecodedOperation::UNSUPPORTED;
            };

            if at >= MAX_INSTRUCTION_LENGTH {
                return DecodedOperation::UNSUPPORTED;
            }

            match byte {
                LOCK => Prefixes::set_flag(&mut prefixes.lock, "LOCK", at),
                REPNE => Prefixes::set_flag(&mut prefixes.repne, "REPNE", at),
                REPE => Prefixes::set_flag(&mut prefixes.repe, "REPE", at),
                OPERAND_SIZE => {
                    Prefixes::set_flag(&mut prefixes.oso, "operand-size override", at);
                }
                0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 => match prefixes.segment {
                    Some(first) => info!(
                        target: "pagetrap::decode",
                        offset = at,
                        "segment prefix {byte:#04x} found after {first:#04x}"
                    ),
                    None => prefixes.segment = Some(byte),
                },
                ADDRESS_SIZE => {
                    info!(target: "pagetrap::decode", offset = at, "address-size override prefix found");
                    return DecodedOperation::UNSUPPORTED;
                }
                0x40..=0x4F => {
                    if prefixes.rex != 0 {
                        info!(
                            target: "pagetrap::decode",
                            offset = at,
                            "REX prefix {byte:#04x} found after {:#04x}",
                            prefixes.rex
                        );
                    }
                    prefixes.rex = byte;
                }
                _ => break,
            }

            // REX only applies when it immediately precedes the opcode.
            if !(0x40..=0x4F).contains(&byte) && prefixes.rex != 0 {
                info!(
                    target: "pagetrap::decode",
                    offset = at,
                    "REX prefix {:#04x} ignored before legacy prefix {byte:#04x}",
                    prefixes.rex
                );
                prefixes.rex = 0;
            }

            at += 1;
        }

        match decode_opcode(code, at, prefixes) {
            Some(op)
                if usize::from(op.length) <= code.len()
                    && usize::from(op.length) <= MAX_INSTRUCTION_LENGTH =>
            {
                op
            }
            _ => DecodedOperation::UNSUPPORTED,
        }
    }
}

fn decode_opcode(code: &[u8], at: usize, p: Prefixes) -> Option<DecodedOperation> {
    let opcode = *code.get(at)?;
    let m = at + 1;
    let modrm = || code.get(m).copied();

    match opcode {
        0x0F => decode_0f(code, at + 1, p),
        0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 | 0x84 if !p.oso => {
            let reg = byte_register(modrm()?, p);
            with_modrm(code, m, alu_kind(opcode), reg, 1, 0)
        }
        0x01 | 0x09 | 0x11 | 0x19 | 0x21 | 0x29 | 0x31 | 0x39 | 0x85 => {
            let reg = gpr(modrm()?, p);
            with_modrm(code, m, alu_kind(opcode), reg, p.op_size(), 0)
        }
        0x80 => with_modrm(code, m, group1_kind(modrm()?), Operand::Imm8, 1, 1),
        0x81 => {
            let (imm, bytes) = p.full_immediate();
            with_modrm(code, m, group1_kind(modrm()?), imm, p.op_size(), bytes)
        }
        0x83 => with_modrm(
            code,
            m,
            group1_kind(modrm()?),
            Operand::Imm8,
            p.op_size(),
            1,
        ),
        0x86 if !p.oso => with_modrm(code, m, OpKind::Exchange, byte_register(modrm()?, p), 1, 0),
        0x87 => with_modrm(code, m, OpKind::Exchange, gpr(modrm()?, p), p.op_size(), 0),
        0x88 if !p.lock && !p.oso => {
            with_modrm(code, m, OpKind::Store, byte_register(modrm()?, p), 1, 0)
        }
        0x89 if !p.lock => with_modrm(code, m, OpKind::Store, gpr(modrm()?, p), p.op_size(), 0),
        0x8A if !p.lock && !p.oso => {
            with_modrm(code, m, OpKind::Load, byte_register(modrm()?, p), 1, 0)
        }
        0x8B if !p.lock => with_modrm(code, m, OpKind::Load, gpr(modrm()?, p), p.op_size(), 0),
        0xA4 | 0xA5 | 0xAA | 0xAB if !p.lock && !p.repne => decode_block(opcode, at, p),
        0xC4 | 0xC5 => decode_vex(code, at, p),
        0xC6 if !p.lock && !p.oso && reg_field(modrm()?) == 0 => {
            with_modrm(code, m, OpKind::Store, Operand::Imm8, 1, 1)
        }
        0xC7 if !p.lock && reg_field(modrm()?) == 0 => {
            let (imm, bytes) = p.full_immediate();
            with_modrm(code, m, OpKind::Store, imm, p.op_size(), bytes)
        }
        0xF6 if reg_field(modrm()?) == 0 => {
            with_modrm(code, m, OpKind::LoadTest, Operand::Imm8, 1, 1)
        }
        0xF7 if reg_field(modrm()?) == 0 => {
            let (imm, bytes) = p.full_immediate();
            with_modrm(code, m, OpKind::LoadTest, imm, p.op_size(), bytes)
        }
        0xFE | 0xFF if reg_field(modrm()?) <= 1 => {
            let kind = if reg_field(modrm()?) == 0 {
                OpKind::Inc
            } else {
                OpKind::Dec
            };
            let size = if opcode == 0xFE { 1 } else { p.op_size() };
            with_modrm(code, m, kind, Operand::NotSet, size, 0)
        }
        _ => None,
    }
}

/// `movs`/`stos`; a `rep` prefix counts down `rcx`.
fn decode_block(opcode: u8, at: usize, p: Prefixes) -> Option<DecodedOperation> {
    let byte_form = opcode & 1 == 0;
    if byte_form && p.oso {
        return None;
    }

    let kind = if opcode & !1 == 0xA4 {
        OpKind::BlockMove
    } else {
        OpKind::BlockStore
    };

    Some(DecodedOperation {
        kind,
        operand: if p.repe {
            Operand::Gpr(RCX)
        } else {
            Operand::NotSet
        },
        size: if byte_form { 1 } else { p.op_size() },
        length: u8::try_from(at + 1).ok()?,
    })
}

fn decode_0f(code: &[u8], at: usize, p: Prefixes) -> Option<DecodedOperation> {
    let opcode = *code.get(at)?;
    let m = at + 1;
    let modrm = || code.get(m).copied();

    match opcode {
        // movups/movaps/movupd/movapd m, xmm
        0x11 | 0x29 if !p.repe && !p.repne => {
            with_modrm(code, m, OpKind::Store, xmm(modrm()?, p), 16, 0)
        }
        // movdqu (f3) / movdqa (66) m, xmm
        0x7F if p.repe != p.oso => with_modrm(code, m, OpKind::Store, xmm(modrm()?, p), 16, 0),
        0xB0 if !p.oso => with_modrm(
            code,
            m,
            OpKind::CompareExchange,
            byte_register(modrm()?, p),
            1,
            0,
        ),
        0xB1 => with_modrm(
            code,
            m,
            OpKind::CompareExchange,
            gpr(modrm()?, p),
            p.op_size(),
            0,
        ),
        0x90..=0x9F if !p.lock => with_modrm(
            code,
            m,
            OpKind::Store,
            Operand::Condition(Condition::from_nibble(opcode)),
            1,
            0,
        ),
        0x38 => match *code.get(at + 1)? {
            op @ (0xF0 | 0xF1) if !p.repne => {
                let kind = if op == 0xF0 {
                    OpKind::LoadBe
                } else {
                    OpKind::StoreBe
                };
                let m = at + 2;
                with_modrm(code, m, kind, gpr(*code.get(m)?, p), p.op_size(), 0)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Two-byte (`c5`) and three-byte (`c4`) VEX forms with the implied `0f` map.
fn decode_vex(code: &[u8], at: usize, p: Prefixes) -> Option<DecodedOperation> {
    let short = code.get(at).copied()? == 0xC5;
    let first = *code.get(at + 1)?;
    let last = if short { first } else { *code.get(at + 2)? };
    let map = if short { 1 } else { first & 0x1F };

    let mut rex = 0;
    if first & 0x80 == 0 {
        rex |= 0x4;
    }
    if !short && last & 0x80 != 0 {
        rex |= 0x8;
    }

    let pp = last & 0x3;
    let p = Prefixes {
        rex,
        oso: pp == 1,
        repe: pp == 2,
        repne: pp == 3,
        ..p
    };
    let width = if last & 0x4 == 0 { 16 } else { 32 };

    let op = at + if short { 2 } else { 3 };
    let m = op + 1;

    if map != 1 {
        return None;
    }

    match *code.get(op)? {
        // vmovups/vmovaps/vmovupd/vmovapd m, xmm/ymm
        0x11 | 0x29 if !p.repe && !p.repne => {
            with_modrm(code, m, OpKind::Store, xmm(*code.get(m)?, p), width, 0)
        }
        // vmovdqu/vmovdqa m, xmm/ymm
        0x7F if p.repe || p.oso => {
            with_modrm(code, m, OpKind::Store, xmm(*code.get(m)?, p), width, 0)
        }
        _ => None,
    }
}

/// Formats a byte slice as space-separated hex for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
