//! Decoding of the instruction subset the encoders produce.
//!
//! The decoder turns half-words back into semantic operations. It backs the
//! disassembly printed by `kernelgen --disasm`, the host simulator, and the tests
//! that check encoders and branch fixups against an independent reading of the
//! bits. Anything outside the emitted subset is reported as undefined.

use std::fmt;

use thiserror::Error;

use super::encoder::{
    expand_constant, Cond, Indexing, LaneSize, MemOp, Width, NOP_NARROW,
};
use crate::core::register_file::{QReg, Reg, RegSet, SReg};

/// Half-words that are not part of the supported subset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("undefined instruction {hw1:04x}")]
    UndefinedNarrow { hw1: u16 },

    #[error("undefined instruction {hw1:04x} {hw2:04x}")]
    UndefinedWide { hw1: u16, hw2: u16 },

    #[error("32-bit instruction {hw1:04x} truncated")]
    Truncated { hw1: u16 },

    #[error("no instruction to decode")]
    Empty,
}

/// Semantic operation of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    MovImm { rd: Reg, imm: u32, setflags: bool },
    MovTop { rd: Reg, imm: u16 },
    MovReg { rd: Reg, rm: Reg },
    AddImm { rd: Reg, rn: Reg, imm: u32, setflags: bool },
    SubImm { rd: Reg, rn: Reg, imm: u32, setflags: bool },
    AddReg { rd: Reg, rn: Reg, rm: Reg, shift: u8, setflags: bool },
    SubReg { rd: Reg, rn: Reg, rm: Reg, shift: u8, setflags: bool },
    CmpImm { rn: Reg, imm: u32 },
    CmpReg { rn: Reg, rm: Reg },
    LdrImm { rt: Reg, rn: Reg, offset: i32, indexing: Indexing },
    LdrReg { rt: Reg, rn: Reg, rm: Reg, shift: u8 },
    Branch { cond: Cond, offset: i32 },
    Bx { rm: Reg },
    Push { regs: RegSet },
    Pop { regs: RegSet },
    VPush { first: u8, count: u8 },
    VPop { first: u8, count: u8 },
    LoopStart { rn: Reg, tail: Option<LaneSize>, exit: Option<i32> },
    LoopEnd { back: i32, tail_predicated: bool },
    VecMem { op: MemOp, qd: QReg, rn: Reg, offset: i32, indexing: Indexing },
    VfmaScalar { qda: QReg, qn: QReg, rm: Reg },
    VfmaVector { qd: QReg, qn: QReg, qm: QReg },
    VmovImm { qd: QReg, value: u32 },
    Vctp { size: LaneSize, rn: Reg },
    Vpst { count: u8 },
    VmovSr { sd: SReg, rt: Reg },
    Nop,
}

impl Op {
    /// Vector instructions are the ones a VPST block predicates.
    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            Op::VecMem { .. }
                | Op::VfmaScalar { .. }
                | Op::VfmaVector { .. }
                | Op::VmovImm { .. }
                | Op::Vctp { .. }
        )
    }

    /// Byte offset from the instruction address to the branch destination, if any.
    pub fn branch_offset(&self) -> Option<i32> {
        match *self {
            Op::Branch { offset, .. } => Some(offset + 4),
            Op::LoopStart { exit: Some(exit), .. } => Some(exit + 4),
            Op::LoopEnd { back, .. } => Some(4 - back),
            _ => None,
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub op: Op,
    pub width: Width,
}

fn sext(value: u32, bits: u32) -> i32 {
    ((value << (32 - bits)) as i32) >> (32 - bits)
}

fn is_wide(hw1: u16) -> bool {
    matches!(hw1 >> 11, 0b11101 | 0b11110 | 0b11111)
}

/// Decode the instruction at the start of `words`.
pub fn decode(words: &[u16]) -> Result<Decoded, DecodeError> {
    let &hw1 = words.first().ok_or(DecodeError::Empty)?;
    if !is_wide(hw1) {
        let op = decode_narrow(hw1).ok_or(DecodeError::UndefinedNarrow { hw1 })?;
        return Ok(Decoded { op, width: Width::Narrow });
    }
    let &hw2 = words.get(1).ok_or(DecodeError::Truncated { hw1 })?;
    let op = decode_wide(hw1, hw2).ok_or(DecodeError::UndefinedWide { hw1, hw2 })?;
    Ok(Decoded { op, width: Width::Wide })
}

fn decode_narrow(hw: u16) -> Option<Op> {
    if hw == NOP_NARROW {
        return Some(Op::Nop);
    }
    let lo3 = |shift: u16| Reg::from_field(hw >> shift & 7);
    let op = match hw >> 11 {
        0b00100 => Op::MovImm { rd: lo3(8), imm: (hw & 0xFF) as u32, setflags: true },
        0b00101 => Op::CmpImm { rn: lo3(8), imm: (hw & 0xFF) as u32 },
        0b00110 => Op::AddImm { rd: lo3(8), rn: lo3(8), imm: (hw & 0xFF) as u32, setflags: true },
        0b00111 => Op::SubImm { rd: lo3(8), rn: lo3(8), imm: (hw & 0xFF) as u32, setflags: true },
        0b00011 => {
            let (rd, rn) = (lo3(0), lo3(3));
            let imm = (hw >> 6 & 7) as u32;
            match hw >> 9 & 3 {
                0 => Op::AddReg { rd, rn, rm: lo3(6), shift: 0, setflags: true },
                1 => Op::SubReg { rd, rn, rm: lo3(6), shift: 0, setflags: true },
                2 => Op::AddImm { rd, rn, imm, setflags: true },
                _ => Op::SubImm { rd, rn, imm, setflags: true },
            }
        }
        0b01101 => Op::LdrImm {
            rt: lo3(0),
            rn: lo3(3),
            offset: ((hw >> 6 & 0x1F) * 4) as i32,
            indexing: Indexing::Offset,
        },
        0b11100 => Op::Branch { cond: Cond::Al, offset: sext(((hw & 0x7FF) as u32) << 1, 12) },
        0b11010 | 0b11011 => {
            let cond = Cond::from_code(hw >> 8 & 0xF).filter(|c| *c != Cond::Al)?;
            Op::Branch { cond, offset: sext(((hw & 0xFF) as u32) << 1, 9) }
        }
        0b01000 => {
            let hi = Reg::from_field((hw >> 7 & 1) << 3 | (hw & 7));
            let rm = Reg::from_field(hw >> 3);
            match hw >> 8 {
                0x44 => Op::AddReg { rd: hi, rn: hi, rm, shift: 0, setflags: false },
                0x45 => Op::CmpReg { rn: hi, rm },
                0x46 => Op::MovReg { rd: hi, rm },
                0x47 if hw & 0x87 == 0 => Op::Bx { rm },
                _ if hw >> 6 == 0x10A => Op::CmpReg { rn: lo3(0), rm: lo3(3) },
                _ => return None,
            }
        }
        0b10110 if hw & 0xFE00 == 0xB400 => Op::Push {
            regs: RegSet::from_bits(hw & 0xFF | (hw >> 8 & 1) << 14),
        },
        0b10111 if hw & 0xFE00 == 0xBC00 => Op::Pop {
            regs: RegSet::from_bits(hw & 0xFF | (hw >> 8 & 1) << 15),
        },
        _ => return None,
    };
    Some(op)
}

fn loop_offset(hw2: u16) -> i32 {
    ((hw2 >> 1 & 0x3FF) << 2 | (hw2 >> 11 & 1) << 1) as i32
}

fn decode_wide(hw1: u16, hw2: u16) -> Option<Op> {
    let rn = Reg::from_field(hw1);
    if hw1 == 0xF3AF && hw2 == 0x8000 {
        return Some(Op::Nop);
    }
    if hw1 == 0xE92D {
        return Some(Op::Push { regs: RegSet::from_bits(hw2) });
    }
    if hw1 == 0xE8BD {
        return Some(Op::Pop { regs: RegSet::from_bits(hw2) });
    }
    if hw1 & 0xFFBF == 0xED2D && hw2 & 0x0F00 == 0x0B00 {
        let first = ((hw1 >> 6 & 1) << 4 | hw2 >> 12) as u8;
        return Some(Op::VPush { first, count: (hw2 & 0xFF) as u8 / 2 });
    }
    if hw1 & 0xFFBF == 0xECBD && hw2 & 0x0F00 == 0x0B00 {
        let first = ((hw1 >> 6 & 1) << 4 | hw2 >> 12) as u8;
        return Some(Op::VPop { first, count: (hw2 & 0xFF) as u8 / 2 });
    }
    if hw1 & 0xFE40 == 0xEC00 && hw2 & 0x1F80 == 0x1F00 {
        let indexing = match (hw1 >> 8 & 1, hw1 >> 5 & 1) {
            (1, 0) => Indexing::Offset,
            (1, _) => Indexing::PreIndex,
            (0, 1) => Indexing::PostIndex,
            _ => return None,
        };
        let magnitude = ((hw2 & 0x7F) * 4) as i32;
        let offset = if hw1 >> 7 & 1 == 1 { magnitude } else { -magnitude };
        let op = if hw1 >> 4 & 1 == 1 { MemOp::Load } else { MemOp::Store };
        return Some(Op::VecMem { op, qd: QReg::from_field(hw2 >> 13), rn, offset, indexing });
    }
    if hw1 & 0xFFF1 == 0xEE31 && hw2 & 0x1FF0 == 0x0E40 {
        return Some(Op::VfmaScalar {
            qda: QReg::from_field(hw2 >> 13),
            qn: QReg::from_field(hw1 >> 1),
            rm: Reg::from_field(hw2),
        });
    }
    if hw1 & 0xFFF1 == 0xEF00 && hw2 & 0x1FF1 == 0x0C50 {
        return Some(Op::VfmaVector {
            qd: QReg::from_field(hw2 >> 13),
            qn: QReg::from_field(hw1 >> 1),
            qm: QReg::from_field(hw2 >> 1),
        });
    }
    if hw1 & 0xEFF8 == 0xEF80 && hw2 & 0x10F0 == 0x0050 {
        let cmode = hw2 >> 8 & 0xF;
        if cmode & 1 != 0 || cmode > 6 {
            return None;
        }
        let imm8 = ((hw1 >> 12 & 1) << 7 | (hw1 & 7) << 4 | (hw2 & 0xF)) as u32;
        return Some(Op::VmovImm { qd: QReg::from_field(hw2 >> 13), value: imm8 << (4 * cmode) });
    }
    if hw1 & 0xFFF0 == 0xEE00 && hw2 & 0x0F7F == 0x0A10 {
        return Some(Op::VmovSr {
            sd: SReg::from_field((hw1 & 0xF) << 1 | (hw2 >> 7 & 1)),
            rt: Reg::from_field(hw2 >> 12),
        });
    }
    if hw1 & 0xFFBF == 0xFE31 && hw2 & 0x1FFF == 0x0F4D {
        let mask = (hw1 >> 6 & 1) << 3 | hw2 >> 13;
        if !mask.is_power_of_two() {
            return None;
        }
        return Some(Op::Vpst { count: (4 - mask.trailing_zeros()) as u8 });
    }
    if hw1 & 0xFE00 == 0xEA00 && hw2 & 0x8000 == 0 {
        return decode_shifted_register(hw1, hw2);
    }
    if hw1 & 0xFFF0 == 0xF8D0 && rn != Reg::Pc {
        return Some(Op::LdrImm {
            rt: Reg::from_field(hw2 >> 12),
            rn,
            offset: (hw2 & 0xFFF) as i32,
            indexing: Indexing::Offset,
        });
    }
    if hw1 & 0xFFF0 == 0xF850 && rn != Reg::Pc {
        return decode_load(rn, hw2);
    }
    if hw1 & 0xF800 == 0xF000 && hw2 & 0x8000 == 0 {
        return decode_immediate(hw1, hw2);
    }
    if hw1 & 0xFF80 == 0xF000 && hw2 & 0xC000 == 0xC000 {
        return decode_loop(hw1, hw2);
    }
    if hw1 & 0xF800 == 0xF000 && hw2 & 0xC000 == 0x8000 {
        return decode_branch(hw1, hw2);
    }
    None
}

fn decode_shifted_register(hw1: u16, hw2: u16) -> Option<Op> {
    if hw2 >> 4 & 3 != 0 {
        return None;
    }
    let setflags = hw1 >> 4 & 1 == 1;
    let rn = Reg::from_field(hw1);
    let rd = Reg::from_field(hw2 >> 8);
    let rm = Reg::from_field(hw2);
    let shift = ((hw2 >> 12 & 7) << 2 | (hw2 >> 6 & 3)) as u8;
    match hw1 >> 5 & 0xF {
        0b1000 if !(rd == Reg::Pc && setflags) => {
            Some(Op::AddReg { rd, rn, rm, shift, setflags })
        }
        0b1101 if rd == Reg::Pc && setflags && shift == 0 => Some(Op::CmpReg { rn, rm }),
        0b1101 if rd != Reg::Pc => Some(Op::SubReg { rd, rn, rm, shift, setflags }),
        _ => None,
    }
}

fn decode_load(rn: Reg, hw2: u16) -> Option<Op> {
    let rt = Reg::from_field(hw2 >> 12);
    if hw2 & 0x0800 != 0 {
        let magnitude = (hw2 & 0xFF) as i32;
        let up = hw2 >> 9 & 1 == 1;
        let indexing = match (hw2 >> 10 & 1, hw2 >> 8 & 1) {
            (1, 0) if !up => Indexing::Offset,
            (1, 1) => Indexing::PreIndex,
            (0, 1) => Indexing::PostIndex,
            _ => return None,
        };
        let offset = if up { magnitude } else { -magnitude };
        return Some(Op::LdrImm { rt, rn, offset, indexing });
    }
    if hw2 & 0x0FC0 == 0 {
        return Some(Op::LdrReg {
            rt,
            rn,
            rm: Reg::from_field(hw2),
            shift: (hw2 >> 4 & 3) as u8,
        });
    }
    None
}

fn decode_immediate(hw1: u16, hw2: u16) -> Option<Op> {
    let rn = Reg::from_field(hw1);
    let rd = Reg::from_field(hw2 >> 8);
    let imm12 = (hw1 >> 10 & 1) << 11 | (hw2 >> 12 & 7) << 8 | (hw2 & 0xFF);
    if hw1 & 0x0200 == 0 {
        let setflags = hw1 >> 4 & 1 == 1;
        let imm = expand_constant(imm12);
        return match hw1 >> 5 & 0xF {
            0b1000 if !(rd == Reg::Pc && setflags) => Some(Op::AddImm { rd, rn, imm, setflags }),
            0b1101 if rd == Reg::Pc && setflags => Some(Op::CmpImm { rn, imm }),
            0b1101 => Some(Op::SubImm { rd, rn, imm, setflags }),
            0b0010 if rn == Reg::Pc => Some(Op::MovImm { rd, imm, setflags }),
            _ => None,
        };
    }
    let imm = imm12 as u32;
    match hw1 >> 4 & 0x1F {
        0b00000 => Some(Op::AddImm { rd, rn, imm, setflags: false }),
        0b01010 => Some(Op::SubImm { rd, rn, imm, setflags: false }),
        0b00100 => Some(Op::MovImm { rd, imm: imm | ((hw1 & 0xF) as u32) << 12, setflags: false }),
        0b01100 => Some(Op::MovTop { rd, imm: imm as u16 | (hw1 & 0xF) << 12 }),
        _ => None,
    }
}

fn decode_loop(hw1: u16, hw2: u16) -> Option<Op> {
    let rn = Reg::from_field(hw1);
    let size = hw1 >> 4 & 7;
    if hw2 == 0xE801 && size < 4 {
        return Some(Op::Vctp { size: LaneSize::from_code(size), rn });
    }
    if (hw1 == 0xF00F || hw1 == 0xF01F) && hw2 & 0xF001 == 0xC001 {
        return Some(Op::LoopEnd { back: loop_offset(hw2), tail_predicated: hw1 == 0xF01F });
    }
    let tail = match size {
        4 => None,
        0..=3 => Some(LaneSize::from_code(size)),
        _ => return None,
    };
    match hw2 {
        0xE001 => Some(Op::LoopStart { rn, tail, exit: None }),
        _ if hw2 & 0xF001 == 0xC001 => Some(Op::LoopStart { rn, tail, exit: Some(loop_offset(hw2)) }),
        _ => None,
    }
}

fn decode_branch(hw1: u16, hw2: u16) -> Option<Op> {
    let s = (hw1 >> 10 & 1) as u32;
    let j1 = (hw2 >> 13 & 1) as u32;
    let j2 = (hw2 >> 11 & 1) as u32;
    let imm11 = (hw2 & 0x7FF) as u32;
    if hw2 & 0x1000 != 0 {
        let i1 = !(j1 ^ s) & 1;
        let i2 = !(j2 ^ s) & 1;
        let imm = s << 24 | i1 << 23 | i2 << 22 | ((hw1 & 0x3FF) as u32) << 12 | imm11 << 1;
        return Some(Op::Branch { cond: Cond::Al, offset: sext(imm, 25) });
    }
    let cond = Cond::from_code(hw1 >> 6 & 0xF).filter(|c| *c != Cond::Al)?;
    let imm = s << 20 | j2 << 19 | j1 << 18 | ((hw1 & 0x3F) as u32) << 12 | imm11 << 1;
    Some(Op::Branch { cond, offset: sext(imm, 21) })
}

fn fmt_imm(f: &mut fmt::Formatter<'_>, imm: u32) -> fmt::Result {
    if imm < 256 {
        write!(f, "#{imm}")
    } else {
        write!(f, "#{imm:#x}")
    }
}

fn fmt_shift(f: &mut fmt::Formatter<'_>, shift: u8) -> fmt::Result {
    if shift != 0 {
        write!(f, ", lsl #{shift}")?;
    }
    Ok(())
}

fn fmt_lane(tail: Option<LaneSize>) -> String {
    tail.map(|size| format!("tp.{}", size.bits())).unwrap_or_default()
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = |setflags: bool| if setflags { "s" } else { "" };
        match *self {
            Op::MovImm { rd, imm, setflags } => {
                write!(f, "mov{} {rd}, ", s(setflags))?;
                fmt_imm(f, imm)
            }
            Op::MovTop { rd, imm } => write!(f, "movt {rd}, #{imm:#x}"),
            Op::MovReg { rd, rm } => write!(f, "mov {rd}, {rm}"),
            Op::AddImm { rd, rn, imm, setflags } => {
                write!(f, "add{} {rd}, {rn}, ", s(setflags))?;
                fmt_imm(f, imm)
            }
            Op::SubImm { rd, rn, imm, setflags } => {
                write!(f, "sub{} {rd}, {rn}, ", s(setflags))?;
                fmt_imm(f, imm)
            }
            Op::AddReg { rd, rn, rm, shift, setflags } => {
                write!(f, "add{} {rd}, {rn}, {rm}", s(setflags))?;
                fmt_shift(f, shift)
            }
            Op::SubReg { rd, rn, rm, shift, setflags } => {
                write!(f, "sub{} {rd}, {rn}, {rm}", s(setflags))?;
                fmt_shift(f, shift)
            }
            Op::CmpImm { rn, imm } => {
                write!(f, "cmp {rn}, ")?;
                fmt_imm(f, imm)
            }
            Op::CmpReg { rn, rm } => write!(f, "cmp {rn}, {rm}"),
            Op::LdrImm { rt, rn, offset, indexing } => match indexing {
                Indexing::Offset => write!(f, "ldr {rt}, [{rn}, #{offset}]"),
                Indexing::PreIndex => write!(f, "ldr {rt}, [{rn}, #{offset}]!"),
                Indexing::PostIndex => write!(f, "ldr {rt}, [{rn}], #{offset}"),
            },
            Op::LdrReg { rt, rn, rm, shift } => {
                write!(f, "ldr {rt}, [{rn}, {rm}")?;
                fmt_shift(f, shift)?;
                f.write_str("]")
            }
            Op::Branch { cond, offset } => write!(f, "b{} #{offset}", cond.suffix()),
            Op::Bx { rm } => write!(f, "bx {rm}"),
            Op::Push { regs } => write!(f, "push {regs}"),
            Op::Pop { regs } => write!(f, "pop {regs}"),
            Op::VPush { first, count } => write!(f, "vpush {{d{first}-d{}}}", first + count - 1),
            Op::VPop { first, count } => write!(f, "vpop {{d{first}-d{}}}", first + count - 1),
            Op::LoopStart { rn, tail, exit: None } => write!(f, "dls{} lr, {rn}", fmt_lane(tail)),
            Op::LoopStart { rn, tail, exit: Some(exit) } => {
                write!(f, "wls{} lr, {rn}, #{exit}", fmt_lane(tail))
            }
            Op::LoopEnd { back, tail_predicated } => {
                write!(f, "le{} lr, #-{back}", if tail_predicated { "tp" } else { "" })
            }
            Op::VecMem { op, qd, rn, offset, indexing } => {
                let mnemonic = match op {
                    MemOp::Load => "vldrw.u32",
                    MemOp::Store => "vstrw.32",
                };
                match indexing {
                    Indexing::Offset => write!(f, "{mnemonic} {qd}, [{rn}, #{offset}]"),
                    Indexing::PreIndex => write!(f, "{mnemonic} {qd}, [{rn}, #{offset}]!"),
                    Indexing::PostIndex => write!(f, "{mnemonic} {qd}, [{rn}], #{offset}"),
                }
            }
            Op::VfmaScalar { qda, qn, rm } => write!(f, "vfma.f32 {qda}, {qn}, {rm}"),
            Op::VfmaVector { qd, qn, qm } => write!(f, "vfma.f32 {qd}, {qn}, {qm}"),
            Op::VmovImm { qd, value } => write!(f, "vmov.i32 {qd}, #{value:#x}"),
            Op::Vctp { size, rn } => write!(f, "vctp.{} {rn}", size.bits()),
            Op::Vpst { count } => write!(f, "vpst{}", "t".repeat(count as usize - 1)),
            Op::VmovSr { sd, rt } => write!(f, "vmov {sd}, {rt}"),
            Op::Nop => f.write_str("nop"),
        }
    }
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.op, f)
    }
}

/// Listing line: half-word index, raw encoding, and disassembly.
pub fn disassemble(words: &[u16]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut at = 0;
    while at < words.len() {
        match decode(&words[at..]) {
            Ok(decoded) => {
                let raw = match decoded.width {
                    Width::Narrow => format!("{:04x}     ", words[at]),
                    Width::Wide => format!("{:04x} {:04x}", words[at], words[at + 1]),
                };
                lines.push(format!("{:5}: {raw}  {decoded}", at * 2));
                at += decoded.width.halfwords();
            }
            Err(err) => {
                lines.push(format!("{:5}: {:04x}       <{err}>", at * 2, words[at]));
                at += 1;
            }
        }
    }
    lines
}
