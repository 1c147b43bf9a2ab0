//! Tagged decode results: operation kind, operand and condition codes.

use crate::context::flags::{CF, OF, PF, SF, ZF};

/// Memory operation implied by a decoded host instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum OpKind {
    /// Decoding failed or the form is unsupported.
    #[default]
    None,
    /// Read memory into a register.
    Load,
    /// Read memory into a register with a byte swap (`movbe r, m`).
    LoadBe,
    /// Compare memory against the operand, updating flags only.
    LoadCompare,
    /// Bitwise test memory against the operand, updating flags only.
    LoadTest,
    /// Write the operand to memory.
    Store,
    /// Write the operand to memory with a byte swap (`movbe m, r`).
    StoreBe,
    /// `movs`, optionally repeated.
    BlockMove,
    /// `stos`, optionally repeated.
    BlockStore,
    /// `xchg m, r`.
    Exchange,
    /// `cmpxchg m, r`.
    CompareExchange,
    /// `and m, operand`.
    And,
    /// `or m, operand`.
    Or,
    /// `xor m, operand`.
    Xor,
    /// `inc m`.
    Inc,
    /// `dec m`.
    Dec,
    /// `add m, operand`.
    Add,
    /// `adc m, operand`.
    AddCarry,
    /// `sub m, operand`.
    Sub,
    /// `sbb m, operand`.
    SubBorrow,
}

impl OpKind {
    /// Kinds that read memory into the context without writing memory.
    #[must_use]
    pub const fn is_load(self) -> bool {
        matches!(
            self,
            Self::Load | Self::LoadBe | Self::LoadCompare | Self::LoadTest
        )
    }

    /// Kinds that iterate over consecutive elements.
    #[must_use]
    pub const fn is_block(self) -> bool {
        matches!(self, Self::BlockMove | Self::BlockStore)
    }
}

/// `SETcc` condition, numbered like the low nibble of opcodes `0F 90..=9F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum Condition {
    /// Overflow.
    O = 0x0,
    /// Not overflow.
    No = 0x1,
    /// Carry (below).
    C = 0x2,
    /// Not carry (above or equal).
    Nc = 0x3,
    /// Zero (equal).
    Z = 0x4,
    /// Not zero.
    Nz = 0x5,
    /// Below or equal.
    Be = 0x6,
    /// Above.
    Nbe = 0x7,
    /// Sign.
    S = 0x8,
    /// Not sign.
    Ns = 0x9,
    /// Parity even.
    P = 0xA,
    /// Parity odd.
    Np = 0xB,
    /// Less (signed).
    L = 0xC,
    /// Greater or equal (signed).
    Nl = 0xD,
    /// Less or equal (signed).
    Le = 0xE,
    /// Greater (signed).
    Nle = 0xF,
}

impl Condition {
    /// Converts the low nibble of a `SETcc` opcode into a condition.
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Self {
        match nibble & 0xF {
            0x0 => Self::O,
            0x1 => Self::No,
            0x2 => Self::C,
            0x3 => Self::Nc,
            0x4 => Self::Z,
            0x5 => Self::Nz,
            0x6 => Self::Be,
            0x7 => Self::Nbe,
            0x8 => Self::S,
            0x9 => Self::Ns,
            0xA => Self::P,
            0xB => Self::Np,
            0xC => Self::L,
            0xD => Self::Nl,
            0xE => Self::Le,
            _ => Self::Nle,
        }
    }

    /// Evaluates the condition against a raw `RFLAGS` value.
    #[must_use]
    pub const fn evaluate(self, flags: u64) -> bool {
        let cf = flags & CF != 0;
        let zf = flags & ZF != 0;
        let sf = flags & SF != 0;
        let of = flags & OF != 0;
        let pf = flags & PF != 0;
        let less = sf != of;

        // Odd encodings negate the even one below them.
        let base = match (self as u8) & !1 {
            0x0 => of,
            0x2 => cf,
            0x4 => zf,
            0x6 => cf || zf,
            0x8 => sf,
            0xA => pf,
            0xC => less,
            _ => less || zf,
        };

        base != ((self as u8) & 1 != 0)
    }
}

/// Register or immediate the decoded operation works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Operand {
    /// General-purpose register `0..=15` in hardware order (`rax, rcx, ...`).
    Gpr(u8),
    /// Legacy byte register: `0..=3` are `al, cl, dl, bl`, `4..=7` are `ah, ch, dh, bh`.
    LegacyByte(u8),
    /// Vector register `xmm0..=xmm15`.
    Vector(u8),
    /// Boolean produced by a `SETcc` condition.
    Condition(Condition),
    /// 8-bit immediate in the last byte of the instruction.
    Imm8,
    /// 16-bit immediate in the last two bytes of the instruction.
    Imm16,
    /// 32-bit immediate in the last four bytes of the instruction.
    Imm32,
    /// Implicit operand.
    #[default]
    NotSet,
}

/// Abstract memory operation decoded from one host instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DecodedOperation {
    /// Operation kind; `None` when decoding failed.
    pub kind: OpKind,
    /// Register or immediate operand.
    pub operand: Operand,
    /// Operand size in bytes: 1, 2, 4, 8, 16 or 32.
    pub size: u8,
    /// Instruction length in bytes; 0 when `kind` is `None`.
    pub length: u8,
}

impl DecodedOperation {
    /// Result for unsupported or malformed instructions.
    pub const UNSUPPORTED: Self = Self {
        kind: OpKind::None,
        operand: Operand::NotSet,
        size: 0,
        length: 0,
    };

    /// Returns `true` when decoding failed.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self.kind, OpKind::None)
    }
}
