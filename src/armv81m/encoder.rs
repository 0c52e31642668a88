// This module provides the Thumb-2 and MVE instruction encoders used by every kernel
// generator. Each instruction family is a small record with named fields (operation,
// registers, immediate, encoding form) and a single assemble step that validates the
// operands and packs the bits. Nothing here touches a buffer: encoders are pure
// functions from a record to an Instr, either one 16-bit half-word or a 32-bit pair
// whose first (high) half-word is stored first. assemble reports operand problems as
// EncodingError; the fail-soft encode path used by the backend logs the problem and
// substitutes the architectural no-op of the same width so that later offsets in the
// instruction stream stay where the generator computed them. The modified immediate
// helpers implement the Thumb-2 12-bit constant scheme (byte, two replicated patterns,
// full splat, rotated byte) in both directions.

//! Thumb-2 and MVE instruction encoding.

use std::fmt;

use log::warn;

use crate::core::error::EncodingError;
use crate::core::register_file::{QReg, Reg, RegSet, SReg};

/// 16-bit `NOP`.
pub const NOP_NARROW: u16 = 0xBF00;

/// 32-bit `NOP.W`.
pub const NOP_WIDE: u32 = 0xF3AF_8000;

/// `BX LR`.
pub const BX_LR: u16 = 0x4770;

/// Instruction size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Narrow,
    Wide,
}

impl Width {
    /// Buffer slots occupied.
    pub const fn halfwords(self) -> usize {
        match self {
            Width::Narrow => 1,
            Width::Wide => 2,
        }
    }
}

/// One encoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instr {
    Narrow(u16),
    /// High half-word in bits 31:16; it is stored first.
    Wide(u32),
}

impl Instr {
    pub const fn nop(width: Width) -> Instr {
        match width {
            Width::Narrow => Instr::Narrow(NOP_NARROW),
            Width::Wide => Instr::Wide(NOP_WIDE),
        }
    }

    pub const fn pair(hw1: u16, hw2: u16) -> Instr {
        Instr::Wide((hw1 as u32) << 16 | hw2 as u32)
    }

    pub const fn width(self) -> Width {
        match self {
            Instr::Narrow(_) => Width::Narrow,
            Instr::Wide(_) => Width::Wide,
        }
    }

    /// Half-words in storage order.
    pub const fn halfwords(self) -> (u16, Option<u16>) {
        match self {
            Instr::Narrow(hw) => (hw, None),
            Instr::Wide(word) => ((word >> 16) as u16, Some(word as u16)),
        }
    }

    pub const fn is_nop(self) -> bool {
        matches!(self, Instr::Narrow(NOP_NARROW) | Instr::Wide(NOP_WIDE))
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instr::Narrow(hw) => write!(f, "{hw:04x}"),
            Instr::Wide(word) => write!(f, "{:04x} {:04x}", word >> 16, word & 0xFFFF),
        }
    }
}

/// An instruction family record.
pub trait Encode: fmt::Debug {
    /// Width of the selected form, known even when the operands are invalid.
    fn width(&self) -> Width;

    /// Validate the operands and pack the bits.
    fn assemble(&self) -> Result<Instr, EncodingError>;

    /// Fail-soft encoding: a same-width no-op replaces an invalid instruction.
    fn encode(&self) -> Instr {
        match self.assemble() {
            Ok(insn) => insn,
            Err(err) => {
                warn!("{err}: {self:?} replaced by nop");
                Instr::nop(self.width())
            }
        }
    }
}

/// Fail-soft encoding of any family record.
pub fn encode<E: Encode + ?Sized>(insn: &E) -> Instr {
    insn.encode()
}

// ---------------------------------------------------------------------------
// Modified immediate constants
// ---------------------------------------------------------------------------

/// Whether `value` fits the Thumb-2 modified immediate scheme.
pub fn can_encode_constant(value: u32) -> bool {
    encode_constant(value).is_some()
}

/// 12-bit `i:imm3:imm8` field for `value`, if it has one.
pub fn encode_constant(value: u32) -> Option<u16> {
    if value <= 0xFF {
        return Some(value as u16);
    }
    let b0 = value & 0xFF;
    let b1 = (value >> 8) & 0xFF;
    if value == b0 | b0 << 16 {
        return Some(0x100 | b0 as u16);
    }
    if value == b1 << 8 | b1 << 24 {
        return Some(0x200 | b1 as u16);
    }
    if value == b0.wrapping_mul(0x0101_0101) {
        return Some(0x300 | b0 as u16);
    }
    (8..=31u32).find_map(|rot| {
        let unrotated = value.rotate_left(rot);
        (unrotated <= 0xFF && unrotated & 0x80 != 0)
            .then(|| (rot << 7 | (unrotated & 0x7F)) as u16)
    })
}

/// Value denoted by a 12-bit modified immediate field.
pub fn expand_constant(imm12: u16) -> u32 {
    let imm8 = (imm12 & 0xFF) as u32;
    if imm12 >> 10 & 0x3 == 0 {
        match imm12 >> 8 & 0x3 {
            0 => imm8,
            1 => imm8 | imm8 << 16,
            2 => imm8 << 8 | imm8 << 24,
            _ => imm8.wrapping_mul(0x0101_0101),
        }
    } else {
        (0x80 | (imm12 & 0x7F) as u32).rotate_right((imm12 >> 7 & 0x1F) as u32)
    }
}

// ---------------------------------------------------------------------------
// Operand helpers
// ---------------------------------------------------------------------------

fn low(reg: Reg) -> Result<u16, EncodingError> {
    if reg.is_low() {
        Ok(reg.num() as u16)
    } else {
        Err(EncodingError::LowRegisterRequired { reg })
    }
}

fn not_pc(reg: Reg, role: &'static str) -> Result<u16, EncodingError> {
    if reg == Reg::Pc {
        return Err(EncodingError::RegisterNotAllowed { reg, role });
    }
    Ok(reg.num() as u16)
}

fn general(reg: Reg, role: &'static str) -> Result<u16, EncodingError> {
    if matches!(reg, Reg::Sp | Reg::Pc) {
        return Err(EncodingError::RegisterNotAllowed { reg, role });
    }
    Ok(reg.num() as u16)
}

fn unsigned(value: u32, max: u32) -> Result<u32, EncodingError> {
    if value > max {
        return Err(EncodingError::ImmediateOutOfRange {
            value: value as i64,
            min: 0,
            max: max as i64,
        });
    }
    Ok(value)
}

fn signed(value: i32, min: i32, max: i32) -> Result<i32, EncodingError> {
    if value < min || value > max {
        return Err(EncodingError::ImmediateOutOfRange {
            value: value as i64,
            min: min as i64,
            max: max as i64,
        });
    }
    Ok(value)
}

fn aligned(value: i32, align: u32) -> Result<i32, EncodingError> {
    if value.rem_euclid(align as i32) != 0 {
        return Err(EncodingError::Misaligned {
            value: value as i64,
            align,
        });
    }
    Ok(value)
}

fn modified(value: u32) -> Result<u16, EncodingError> {
    encode_constant(value).ok_or(EncodingError::NotModifiedImmediate { value })
}

/// Split a 12-bit field into the `i`, `imm3`, `imm8` positions of a wide instruction:
/// `i` goes to bit 10 of the first half-word, `imm3:imm8` to the second.
fn split12(imm12: u16) -> (u16, u16) {
    let i = (imm12 >> 11 & 1) << 10;
    let rest = (imm12 >> 8 & 0x7) << 12 | (imm12 & 0xFF);
    (i, rest)
}

// ---------------------------------------------------------------------------
// Conditions and lane sizes
// ---------------------------------------------------------------------------

/// Condition code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Cond {
    const ALL: [Cond; 15] = [
        Cond::Eq, Cond::Ne, Cond::Cs, Cond::Cc, Cond::Mi,
        Cond::Pl, Cond::Vs, Cond::Vc, Cond::Hi, Cond::Ls,
        Cond::Ge, Cond::Lt, Cond::Gt, Cond::Le, Cond::Al,
    ];

    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Cond> {
        Self::ALL.get(code as usize).copied()
    }

    pub const fn suffix(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Cs => "cs",
            Cond::Cc => "cc",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Al => "",
        }
    }
}

/// Vector element size for predicate and tail-predication instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneSize {
    B8,
    B16,
    B32,
    B64,
}

impl LaneSize {
    pub const fn code(self) -> u16 {
        match self {
            LaneSize::B8 => 0,
            LaneSize::B16 => 1,
            LaneSize::B32 => 2,
            LaneSize::B64 => 3,
        }
    }

    pub const fn from_code(code: u16) -> LaneSize {
        match code & 3 {
            0 => LaneSize::B8,
            1 => LaneSize::B16,
            2 => LaneSize::B32,
            _ => LaneSize::B64,
        }
    }

    pub const fn bits(self) -> u32 {
        8 << self.code()
    }

    /// Lanes in a 128-bit vector.
    pub const fn lanes(self) -> u32 {
        128 / self.bits()
    }
}

/// Addressing mode of immediate-offset loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indexing {
    /// `[Rn, #off]`
    Offset,
    /// `[Rn, #off]!`
    PreIndex,
    /// `[Rn], #off`
    PostIndex,
}

impl Indexing {
    /// `(P, W)` bits.
    const fn bits(self) -> (u16, u16) {
        match self {
            Indexing::Offset => (1, 0),
            Indexing::PreIndex => (1, 1),
            Indexing::PostIndex => (0, 1),
        }
    }
}

// ---------------------------------------------------------------------------
// Scalar data processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddSub {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddSubImmForm {
    /// `ADDS/SUBS Rd, Rn, #imm3`, low registers.
    Narrow3,
    /// `ADDS/SUBS Rdn, #imm8`, low register, `rd == rn`.
    Narrow8,
    /// `ADD.W/SUB.W Rd, Rn, #const`.
    Modified,
    /// `ADDW/SUBW Rd, Rn, #imm12`.
    Plain12,
}

/// Add or subtract an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddSubImm {
    pub op: AddSub,
    pub rd: Reg,
    pub rn: Reg,
    pub imm: u32,
    pub form: AddSubImmForm,
}

impl Encode for AddSubImm {
    fn width(&self) -> Width {
        match self.form {
            AddSubImmForm::Narrow3 | AddSubImmForm::Narrow8 => Width::Narrow,
            AddSubImmForm::Modified | AddSubImmForm::Plain12 => Width::Wide,
        }
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let sub = self.op == AddSub::Sub;
        match self.form {
            AddSubImmForm::Narrow3 => {
                let imm = unsigned(self.imm, 7)? as u16;
                let base = if sub { 0x1E00 } else { 0x1C00 };
                Ok(Instr::Narrow(
                    base | imm << 6 | low(self.rn)? << 3 | low(self.rd)?,
                ))
            }
            AddSubImmForm::Narrow8 => {
                if self.rd != self.rn {
                    return Err(EncodingError::RegisterNotAllowed {
                        reg: self.rn,
                        role: "a second source of the two-operand form",
                    });
                }
                let imm = unsigned(self.imm, 0xFF)? as u16;
                let base = if sub { 0x3800 } else { 0x3000 };
                Ok(Instr::Narrow(base | low(self.rd)? << 8 | imm))
            }
            AddSubImmForm::Modified => {
                let (i, rest) = split12(modified(self.imm)?);
                let base = if sub { 0xF1A0 } else { 0xF100 };
                let rn = general(self.rn, "an immediate arithmetic source")?;
                let rd = general(self.rd, "an immediate arithmetic destination")?;
                Ok(Instr::pair(base | i | rn, rest | rd << 8))
            }
            AddSubImmForm::Plain12 => {
                let (i, rest) = split12(unsigned(self.imm, 0xFFF)? as u16);
                let base = if sub { 0xF2A0 } else { 0xF200 };
                let rn = general(self.rn, "an immediate arithmetic source")?;
                let rd = general(self.rd, "an immediate arithmetic destination")?;
                Ok(Instr::pair(base | i | rn, rest | rd << 8))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddSubRegForm {
    /// `ADDS/SUBS Rd, Rn, Rm`, low registers.
    Narrow3,
    /// `ADD Rdn, Rm`, any registers, `rd == rn`, add only.
    NarrowAcc,
    /// `ADD.W/SUB.W Rd, Rn, Rm, LSL #shift`.
    Wide,
}

/// Add or subtract a register, optionally shifted left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddSubReg {
    pub op: AddSub,
    pub rd: Reg,
    pub rn: Reg,
    pub rm: Reg,
    pub shift: u8,
    pub form: AddSubRegForm,
}

impl Encode for AddSubReg {
    fn width(&self) -> Width {
        match self.form {
            AddSubRegForm::Wide => Width::Wide,
            _ => Width::Narrow,
        }
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let sub = self.op == AddSub::Sub;
        if self.form != AddSubRegForm::Wide {
            unsigned(self.shift as u32, 0)?;
        }
        match self.form {
            AddSubRegForm::Narrow3 => {
                let base = if sub { 0x1A00 } else { 0x1800 };
                Ok(Instr::Narrow(
                    base | low(self.rm)? << 6 | low(self.rn)? << 3 | low(self.rd)?,
                ))
            }
            AddSubRegForm::NarrowAcc => {
                if sub {
                    return Err(EncodingError::RegisterNotAllowed {
                        reg: self.rd,
                        role: "the destination of a two-operand subtract",
                    });
                }
                if self.rd != self.rn {
                    return Err(EncodingError::RegisterNotAllowed {
                        reg: self.rn,
                        role: "a second source of the two-operand form",
                    });
                }
                let rd = not_pc(self.rd, "an accumulate destination")?;
                let rm = not_pc(self.rm, "an accumulate source")?;
                Ok(Instr::Narrow(0x4400 | (rd >> 3) << 7 | rm << 3 | (rd & 7)))
            }
            AddSubRegForm::Wide => {
                let shift = unsigned(self.shift as u32, 31)? as u16;
                let base = if sub { 0xEBA0 } else { 0xEB00 };
                let rn = general(self.rn, "a register arithmetic source")?;
                let rm = general(self.rm, "a shifted operand")?;
                let rd = general(self.rd, "a register arithmetic destination")?;
                Ok(Instr::pair(
                    base | rn,
                    (shift >> 2) << 12 | rd << 8 | (shift & 3) << 6 | rm,
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpImmForm {
    /// `CMP Rn, #imm8`, low register.
    Narrow8,
    /// `CMP.W Rn, #const`.
    Modified,
}

/// Compare against an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpImm {
    pub rn: Reg,
    pub imm: u32,
    pub form: CmpImmForm,
}

impl Encode for CmpImm {
    fn width(&self) -> Width {
        match self.form {
            CmpImmForm::Narrow8 => Width::Narrow,
            CmpImmForm::Modified => Width::Wide,
        }
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        match self.form {
            CmpImmForm::Narrow8 => {
                let imm = unsigned(self.imm, 0xFF)? as u16;
                Ok(Instr::Narrow(0x2800 | low(self.rn)? << 8 | imm))
            }
            CmpImmForm::Modified => {
                let (i, rest) = split12(modified(self.imm)?);
                let rn = not_pc(self.rn, "a compare operand")?;
                Ok(Instr::pair(0xF1B0 | i | rn, rest | 0x0F00))
            }
        }
    }
}

/// Compare two registers; the 16-bit form is chosen from the operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpReg {
    pub rn: Reg,
    pub rm: Reg,
}

impl Encode for CmpReg {
    fn width(&self) -> Width {
        Width::Narrow
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let rn = not_pc(self.rn, "a compare operand")?;
        let rm = not_pc(self.rm, "a compare operand")?;
        if self.rn.is_low() && self.rm.is_low() {
            Ok(Instr::Narrow(0x4280 | rm << 3 | rn))
        } else {
            Ok(Instr::Narrow(0x4500 | (rn >> 3) << 7 | rm << 3 | (rn & 7)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovImmForm {
    /// `MOVS Rd, #imm8`, low register.
    Narrow8,
    /// `MOV.W Rd, #const`.
    Modified,
    /// `MOVW Rd, #imm16`.
    Plain16,
    /// `MOVT Rd, #imm16`, writes the top half only.
    Top16,
}

/// Move an immediate into a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovImm {
    pub rd: Reg,
    pub imm: u32,
    pub form: MovImmForm,
}

impl Encode for MovImm {
    fn width(&self) -> Width {
        match self.form {
            MovImmForm::Narrow8 => Width::Narrow,
            _ => Width::Wide,
        }
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        match self.form {
            MovImmForm::Narrow8 => {
                let imm = unsigned(self.imm, 0xFF)? as u16;
                Ok(Instr::Narrow(0x2000 | low(self.rd)? << 8 | imm))
            }
            MovImmForm::Modified => {
                let (i, rest) = split12(modified(self.imm)?);
                let rd = general(self.rd, "an immediate move destination")?;
                Ok(Instr::pair(0xF04F | i, rest | rd << 8))
            }
            MovImmForm::Plain16 | MovImmForm::Top16 => {
                let imm = unsigned(self.imm, 0xFFFF)? as u16;
                let rd = general(self.rd, "an immediate move destination")?;
                let base = if self.form == MovImmForm::Top16 { 0xF2C0 } else { 0xF240 };
                let (i, rest) = split12(imm & 0xFFF);
                Ok(Instr::pair(base | i | imm >> 12, rest | rd << 8))
            }
        }
    }
}

/// `MOV Rd, Rm` (16-bit, any registers except a PC destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovReg {
    pub rd: Reg,
    pub rm: Reg,
}

impl Encode for MovReg {
    fn width(&self) -> Width {
        Width::Narrow
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let rd = not_pc(self.rd, "a move destination")?;
        let rm = self.rm.num() as u16;
        Ok(Instr::Narrow(0x4600 | (rd >> 3) << 7 | rm << 3 | (rd & 7)))
    }
}

// ---------------------------------------------------------------------------
// Scalar loads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LdrImmForm {
    /// `LDR Rt, [Rn, #imm5*4]`, low registers, offset mode only.
    Narrow,
    /// `LDR.W Rt, [Rn, #imm12]`, offset mode only.
    Wide12,
    /// `LDR Rt, [Rn, #+-imm8]` with indexing; offset mode needs a negative offset.
    Wide8,
}

/// Word load with an immediate offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdrImm {
    pub rt: Reg,
    pub rn: Reg,
    pub offset: i32,
    pub indexing: Indexing,
    pub form: LdrImmForm,
}

impl Encode for LdrImm {
    fn width(&self) -> Width {
        match self.form {
            LdrImmForm::Narrow => Width::Narrow,
            _ => Width::Wide,
        }
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        if self.form != LdrImmForm::Wide8 && self.indexing != Indexing::Offset {
            return Err(EncodingError::RegisterNotAllowed {
                reg: self.rn,
                role: "a writeback base of an unindexed load form",
            });
        }
        match self.form {
            LdrImmForm::Narrow => {
                let offset = aligned(signed(self.offset, 0, 124)?, 4)? as u16;
                Ok(Instr::Narrow(
                    0x6800 | (offset >> 2) << 6 | low(self.rn)? << 3 | low(self.rt)?,
                ))
            }
            LdrImmForm::Wide12 => {
                let offset = signed(self.offset, 0, 0xFFF)? as u16;
                let rn = not_pc(self.rn, "a load base")?;
                let rt = general(self.rt, "a load destination")?;
                Ok(Instr::pair(0xF8D0 | rn, rt << 12 | offset))
            }
            LdrImmForm::Wide8 => {
                let max = if self.indexing == Indexing::Offset { -1 } else { 0xFF };
                let offset = signed(self.offset, -0xFF, max)?;
                let rn = not_pc(self.rn, "a load base")?;
                let rt = general(self.rt, "a load destination")?;
                if self.indexing != Indexing::Offset && self.rn == self.rt {
                    return Err(EncodingError::RegisterNotAllowed {
                        reg: self.rt,
                        role: "both the destination and the writeback base",
                    });
                }
                let (p, w) = self.indexing.bits();
                let u = u16::from(offset >= 0);
                Ok(Instr::pair(
                    0xF850 | rn,
                    rt << 12 | 0x800 | p << 10 | u << 9 | w << 8 | offset.unsigned_abs() as u16,
                ))
            }
        }
    }
}

/// `LDR.W Rt, [Rn, Rm, LSL #shift]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdrReg {
    pub rt: Reg,
    pub rn: Reg,
    pub rm: Reg,
    pub shift: u8,
}

impl Encode for LdrReg {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let shift = unsigned(self.shift as u32, 3)? as u16;
        let rn = not_pc(self.rn, "a load base")?;
        let rm = general(self.rm, "a load index")?;
        let rt = general(self.rt, "a load destination")?;
        Ok(Instr::pair(0xF850 | rn, rt << 12 | shift << 4 | rm))
    }
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

/// Branch with a byte offset relative to the instruction address plus 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub cond: Cond,
    pub offset: i32,
    pub width: Width,
}

impl Branch {
    /// Reachable offsets of the selected form.
    pub const fn range(cond: Cond, width: Width) -> (i32, i32) {
        match (width, matches!(cond, Cond::Al)) {
            (Width::Narrow, false) => (-256, 254),
            (Width::Narrow, true) => (-2048, 2046),
            (Width::Wide, false) => (-(1 << 20), (1 << 20) - 2),
            (Width::Wide, true) => (-(1 << 24), (1 << 24) - 2),
        }
    }

    pub const fn fits(cond: Cond, width: Width, offset: i32) -> bool {
        let (min, max) = Self::range(cond, width);
        offset >= min && offset <= max && offset % 2 == 0
    }
}

impl Encode for Branch {
    fn width(&self) -> Width {
        self.width
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let (min, max) = Self::range(self.cond, self.width);
        if self.offset % 2 != 0 {
            return Err(EncodingError::OddBranchOffset { offset: self.offset });
        }
        if self.offset < min || self.offset > max {
            return Err(EncodingError::BranchOutOfRange {
                offset: self.offset,
                min,
                max,
            });
        }
        let half = self.offset >> 1;
        let unconditional = self.cond == Cond::Al;
        match self.width {
            Width::Narrow if unconditional => Ok(Instr::Narrow(0xE000 | (half & 0x7FF) as u16)),
            Width::Narrow => Ok(Instr::Narrow(
                0xD000 | self.cond.code() << 8 | (half & 0xFF) as u16,
            )),
            Width::Wide if unconditional => {
                let s = (half >> 23 & 1) as u16;
                let i1 = (half >> 22 & 1) as u16;
                let i2 = (half >> 21 & 1) as u16;
                let j1 = (!i1 ^ s) & 1;
                let j2 = (!i2 ^ s) & 1;
                Ok(Instr::pair(
                    0xF000 | s << 10 | (half >> 11 & 0x3FF) as u16,
                    0x9000 | j1 << 13 | j2 << 11 | (half & 0x7FF) as u16,
                ))
            }
            Width::Wide => {
                let s = (half >> 19 & 1) as u16;
                let j2 = (half >> 18 & 1) as u16;
                let j1 = (half >> 17 & 1) as u16;
                Ok(Instr::pair(
                    0xF000 | s << 10 | self.cond.code() << 6 | (half >> 11 & 0x3F) as u16,
                    0x8000 | j1 << 13 | j2 << 11 | (half & 0x7FF) as u16,
                ))
            }
        }
    }
}

/// `BX Rm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bx {
    pub rm: Reg,
}

impl Encode for Bx {
    fn width(&self) -> Width {
        Width::Narrow
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let rm = not_pc(self.rm, "a branch target register")?;
        Ok(Instr::Narrow(0x4700 | rm << 3))
    }
}

/// `NOP` of either width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nop {
    pub width: Width,
}

impl Encode for Nop {
    fn width(&self) -> Width {
        self.width
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        Ok(Instr::nop(self.width))
    }
}

/// Low-overhead loop start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// `DLS`: the body runs at least once.
    Do,
    /// `WLS`: skips forward by `exit` bytes when the count is zero.
    While { exit: i32 },
}

/// `DLS`/`WLS LR, Rn`, or the tail-predicated `DLSTP`/`WLSTP` when `tail` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStart {
    pub kind: LoopKind,
    pub rn: Reg,
    pub tail: Option<LaneSize>,
}

/// Largest forward or backward reach of the loop instructions, in bytes.
pub const LOOP_RANGE: i32 = 4094;

fn loop_offset(offset: i32) -> Result<u16, EncodingError> {
    if offset % 2 != 0 {
        return Err(EncodingError::OddBranchOffset { offset });
    }
    if !(0..=LOOP_RANGE).contains(&offset) {
        return Err(EncodingError::BranchOutOfRange {
            offset,
            min: 0,
            max: LOOP_RANGE,
        });
    }
    let offset = offset as u16;
    Ok((offset >> 1 & 1) << 11 | (offset >> 2 & 0x3FF) << 1)
}

impl Encode for LoopStart {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let rn = general(self.rn, "a loop count")?;
        let hw1 = match self.tail {
            None => 0xF040 | rn,
            Some(size) => 0xF000 | size.code() << 4 | rn,
        };
        let hw2 = match self.kind {
            LoopKind::Do => 0xE001,
            LoopKind::While { exit } => 0xC001 | loop_offset(exit)?,
        };
        Ok(Instr::pair(hw1, hw2))
    }
}

/// `LE LR` / `LETP LR` branching back by `back` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEnd {
    pub back: i32,
    pub tail_predicated: bool,
}

impl Encode for LoopEnd {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let hw1 = if self.tail_predicated { 0xF01F } else { 0xF00F };
        Ok(Instr::pair(hw1, 0xC001 | loop_offset(self.back)?))
    }
}

/// `PUSH`; the 16-bit form is used when the list is R0-R7 plus LR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Push {
    pub regs: RegSet,
}

impl Encode for Push {
    fn width(&self) -> Width {
        if self.regs.is_low_plus(Reg::Lr) {
            Width::Narrow
        } else {
            Width::Wide
        }
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let list = self.regs;
        if list.is_empty() {
            return Err(EncodingError::InvalidRegisterList { list });
        }
        let bits = list.bits();
        match self.width() {
            Width::Narrow => Ok(Instr::Narrow(
                0xB400 | u16::from(list.contains(Reg::Lr)) << 8 | (bits & 0xFF),
            )),
            Width::Wide => {
                if list.len() < 2 || list.contains(Reg::Sp) || list.contains(Reg::Pc) {
                    return Err(EncodingError::InvalidRegisterList { list });
                }
                Ok(Instr::pair(0xE92D, bits))
            }
        }
    }
}

/// `POP`; the 16-bit form is used when the list is R0-R7 plus PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pop {
    pub regs: RegSet,
}

impl Encode for Pop {
    fn width(&self) -> Width {
        if self.regs.is_low_plus(Reg::Pc) {
            Width::Narrow
        } else {
            Width::Wide
        }
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let list = self.regs;
        if list.is_empty() {
            return Err(EncodingError::InvalidRegisterList { list });
        }
        let bits = list.bits();
        match self.width() {
            Width::Narrow => Ok(Instr::Narrow(
                0xBC00 | u16::from(list.contains(Reg::Pc)) << 8 | (bits & 0xFF),
            )),
            Width::Wide => {
                if list.len() < 2
                    || list.contains(Reg::Sp)
                    || (list.contains(Reg::Pc) && list.contains(Reg::Lr))
                {
                    return Err(EncodingError::InvalidRegisterList { list });
                }
                Ok(Instr::pair(0xE8BD, bits))
            }
        }
    }
}

fn vstack(base: u16, first: u8, count: u8) -> Result<Instr, EncodingError> {
    if count == 0 || count > 16 || first as u32 + count as u32 > 32 {
        return Err(EncodingError::InvalidRegisterRange { first, count });
    }
    let d = (first as u16 >> 4) << 6;
    let vd = first as u16 & 0xF;
    Ok(Instr::pair(base | d, vd << 12 | 0x0B00 | (count as u16) * 2))
}

/// `VPUSH {D<first>-D<first+count-1>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VPush {
    pub first: u8,
    pub count: u8,
}

impl Encode for VPush {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        vstack(0xED2D, self.first, self.count)
    }
}

/// `VPOP {D<first>-D<first+count-1>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VPop {
    pub first: u8,
    pub count: u8,
}

impl Encode for VPop {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        vstack(0xECBD, self.first, self.count)
    }
}

// ---------------------------------------------------------------------------
// MVE
// ---------------------------------------------------------------------------

/// Direction of a vector memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemOp {
    Load,
    Store,
}

/// Largest vector load/store offset magnitude in bytes.
pub const VEC_OFFSET_MAX: i32 = 508;

/// `VLDRW.U32` / `VSTRW.32 Qd, [Rn, #off]` with 7-bit word-scaled offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VecMem {
    pub op: MemOp,
    pub qd: QReg,
    pub rn: Reg,
    pub offset: i32,
    pub indexing: Indexing,
}

impl Encode for VecMem {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let offset = aligned(signed(self.offset, -VEC_OFFSET_MAX, VEC_OFFSET_MAX)?, 4)?;
        let rn = not_pc(self.rn, "a vector memory base")?;
        let (p, w) = self.indexing.bits();
        if w == 1 && self.rn == Reg::Sp {
            return Err(EncodingError::RegisterNotAllowed {
                reg: self.rn,
                role: "a vector writeback base",
            });
        }
        let u = u16::from(offset >= 0);
        let l = u16::from(self.op == MemOp::Load);
        let imm7 = (offset.unsigned_abs() >> 2) as u16;
        Ok(Instr::pair(
            0xEC00 | p << 8 | u << 7 | w << 5 | l << 4 | rn,
            (self.qd.num() as u16) << 13 | 0x1F00 | imm7,
        ))
    }
}

/// `VFMA.F32 Qda, Qn, Rm`: every lane of `qda` += `qn` lane * scalar `rm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfmaScalar {
    pub qda: QReg,
    pub qn: QReg,
    pub rm: Reg,
}

impl Encode for VfmaScalar {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let rm = general(self.rm, "a broadcast scalar")?;
        Ok(Instr::pair(
            0xEE31 | (self.qn.num() as u16) << 1,
            (self.qda.num() as u16) << 13 | 0x0E40 | rm,
        ))
    }
}

/// `VFMA.F32 Qd, Qn, Qm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfmaVector {
    pub qd: QReg,
    pub qn: QReg,
    pub qm: QReg,
}

impl Encode for VfmaVector {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let d = self.qd.num() as u16 * 2;
        let n = self.qn.num() as u16 * 2;
        let m = self.qm.num() as u16 * 2;
        Ok(Instr::pair(0xEF00 | n, d << 12 | 0x0C50 | m))
    }
}

/// `VMOV.I32 Qd, #value` for a single byte shifted left by 0, 8, 16 or 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmovImm {
    pub qd: QReg,
    pub value: u32,
}

impl VmovImm {
    /// `(cmode, imm8)` for a splat-able value.
    pub fn split(value: u32) -> Option<(u16, u16)> {
        (0..4u32).find_map(|n| {
            let byte = value >> (8 * n) & 0xFF;
            (byte << (8 * n) == value).then_some(((2 * n) as u16, byte as u16))
        })
    }
}

impl Encode for VmovImm {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let (cmode, imm8) =
            Self::split(self.value).ok_or(EncodingError::NotSplatImmediate { value: self.value })?;
        let d = self.qd.num() as u16 * 2;
        Ok(Instr::pair(
            0xEF80 | (imm8 >> 7) << 12 | (imm8 >> 4 & 7),
            d << 12 | cmode << 8 | 0x0050 | (imm8 & 0xF),
        ))
    }
}

/// `VCTP.<size> Rn`: predicate the first `Rn` lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vctp {
    pub size: LaneSize,
    pub rn: Reg,
}

impl Encode for Vctp {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let rn = general(self.rn, "a lane count")?;
        Ok(Instr::pair(0xF000 | self.size.code() << 4 | rn, 0xE801))
    }
}

/// `VPST` predicating the next `count` vector instructions (all "then").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vpst {
    pub count: u8,
}

impl Encode for Vpst {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        if !(1..=4).contains(&self.count) {
            return Err(EncodingError::InvalidPredicateCount { count: self.count });
        }
        let mask = 1u16 << (4 - self.count);
        Ok(Instr::pair(
            0xFE31 | (mask >> 3 & 1) << 6,
            0x0F4D | (mask & 7) << 13,
        ))
    }
}

/// `VMOV Sn, Rt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmovSr {
    pub sd: SReg,
    pub rt: Reg,
}

impl Encode for VmovSr {
    fn width(&self) -> Width {
        Width::Wide
    }

    fn assemble(&self) -> Result<Instr, EncodingError> {
        let rt = general(self.rt, "a core-to-float source")?;
        let sn = self.sd.num() as u16;
        Ok(Instr::pair(0xEE00 | sn >> 1, rt << 12 | 0x0A10 | (sn & 1) << 7))
    }
}
