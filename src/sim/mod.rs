// This module interprets the Thumb-2 and MVE subset the generators emit, so generated
// kernels can be executed and checked on the development host. The machine models the
// sixteen scalar registers, the eight 128-bit vector registers, the NZCV flags, one
// four-lane VPT predicate with the number of instructions a VPST block still covers,
// and the tail predication state of WLSTP/LETP loops. Memory is a set of disjoint
// regions; any access outside them, or a misaligned one, stops execution with an error
// instead of being silently absorbed, which is what lets the tests prove that kernels
// never touch memory past their operands. Predicated-off lanes are neither loaded nor
// stored. Floating point multiply-accumulate is fused, as VFMA is on the target.
// Execution starts at CODE_BASE with LR holding a magic return address; reaching it
// ends the call.

//! Host-side interpreter for generated code.

mod harness;
mod memory;

pub use harness::{run_gemm, run_triad, GemmRun, A_BASE, B_BASE, CANARY, CANARY_WORDS, C_BASE};
pub use memory::Memory;

use log::trace;
use thiserror::Error;

use crate::armv81m::decoder::{decode, DecodeError, Op};
use crate::armv81m::encoder::{Cond, Indexing, LaneSize, MemOp};
use crate::core::register_file::{QReg, Reg, SReg, NUM_SCALAR_REGS, NUM_VECTOR_REGS};

/// Address of the first code half-word.
pub const CODE_BASE: u32 = 0x0000_1000;

/// Returning here ends a call.
pub const RETURN_ADDRESS: u32 = 0xFFFF_FFF0;

pub const STACK_TOP: u32 = 0x3000_0000;
pub const STACK_SIZE: u32 = 0x1_0000;

pub const DEFAULT_STEP_LIMIT: u64 = 50_000_000;

const LANES: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("cannot execute at {address:#010x}: {source}")]
    Undefined {
        address: u32,
        #[source]
        source: DecodeError,
    },

    #[error("pc {address:#010x} is outside the code")]
    PcOutOfRange { address: u32 },

    #[error("{access} of {size} bytes at unmapped address {address:#010x}")]
    Unmapped {
        address: u32,
        size: u32,
        access: &'static str,
    },

    #[error("unaligned {size}-byte access at {address:#010x}")]
    Unaligned { address: u32, size: u32 },

    #[error("write to read-only memory at {address:#010x}")]
    ReadOnly { address: u32 },

    #[error("region of {len} bytes at {base:#010x} overlaps mapped memory")]
    Overlap { base: u32, len: usize },

    #[error("step limit of {limit} instructions reached")]
    StepLimit { limit: u64 },

    #[error("`{op}` at {address:#010x} is not allowed inside a VPT block")]
    VptBlock { address: u32, op: String },

    #[error("branch to ARM state at {target:#010x}")]
    ArmState { target: u32 },

    #[error("unsupported at {address:#010x}: {what}")]
    Unsupported { address: u32, what: String },
}

/// Condition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

impl Flags {
    pub fn holds(&self, cond: Cond) -> bool {
        match cond {
            Cond::Eq => self.z,
            Cond::Ne => !self.z,
            Cond::Cs => self.c,
            Cond::Cc => !self.c,
            Cond::Mi => self.n,
            Cond::Pl => !self.n,
            Cond::Vs => self.v,
            Cond::Vc => !self.v,
            Cond::Hi => self.c && !self.z,
            Cond::Ls => !self.c || self.z,
            Cond::Ge => self.n == self.v,
            Cond::Lt => self.n != self.v,
            Cond::Gt => !self.z && self.n == self.v,
            Cond::Le => self.z || self.n != self.v,
            Cond::Al => true,
        }
    }
}

fn add_with_carry(x: u32, y: u32, carry: bool) -> (u32, bool, bool) {
    let wide = u64::from(x) + u64::from(y) + u64::from(carry);
    let result = wide as u32;
    let signed = i64::from(x as i32) + i64::from(y as i32) + i64::from(carry);
    (result, wide >> 32 != 0, i64::from(result as i32) != signed)
}

/// Initial value of callee-saved scalar register `n`.
const fn scalar_sentinel(n: usize) -> u32 {
    0x5EED_0000 | n as u32
}

/// Initial value of lane `lane` of callee-saved vector register `q`.
const fn vector_sentinel(q: usize, lane: usize) -> u32 {
    0x7FC0_C0DE | (q as u32) << 8 | (lane as u32) << 4
}

/// Architectural state plus memory.
#[derive(Debug, Clone)]
pub struct Machine {
    regs: [u32; NUM_SCALAR_REGS],
    q: [[u32; LANES]; NUM_VECTOR_REGS],
    flags: Flags,
    predicate: [bool; LANES],
    vpt_remaining: u8,
    tail_predicated: bool,
    memory: Memory,
    step_limit: u64,
    steps: u64,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Fresh machine with a mapped stack and recognizable values in the callee-saved
    /// registers.
    pub fn new() -> Self {
        let stack = vec![0; STACK_SIZE as usize];
        let memory = Memory::with_region(STACK_TOP - STACK_SIZE, stack, true);
        let mut regs = [0; NUM_SCALAR_REGS];
        for (n, reg) in regs.iter_mut().enumerate().take(12).skip(4) {
            *reg = scalar_sentinel(n);
        }
        regs[Reg::Sp.num() as usize] = STACK_TOP;
        let mut q = [[0; LANES]; NUM_VECTOR_REGS];
        for (n, lanes) in q.iter_mut().enumerate().skip(4) {
            for (lane, value) in lanes.iter_mut().enumerate() {
                *value = vector_sentinel(n, lane);
            }
        }
        Self {
            regs,
            q,
            flags: Flags::default(),
            predicate: [true; LANES],
            vpt_remaining: 0,
            tail_predicated: false,
            memory,
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn reg(&self, reg: Reg) -> u32 {
        self.regs[reg.num() as usize]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.regs[reg.num() as usize] = value;
    }

    pub fn q(&self, q: QReg) -> [f32; LANES] {
        self.q[q.num() as usize].map(f32::from_bits)
    }

    pub fn set_q(&mut self, q: QReg, value: [f32; LANES]) {
        self.q[q.num() as usize] = value.map(f32::to_bits);
    }

    pub fn single(&self, s: SReg) -> f32 {
        let n = s.num() as usize;
        f32::from_bits(self.q[n / LANES][n % LANES])
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Instructions executed by the last call.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// R4-R11 and Q4-Q7 hold the same values as in `before`, and SP is back at the
    /// top of the stack every call starts from.
    pub fn callee_saved_match(&self, before: &Machine) -> bool {
        self.regs[4..12] == before.regs[4..12]
            && self.regs[Reg::Sp.num() as usize] == STACK_TOP
            && self.q[4..] == before.q[4..]
    }

    /// Run `code` as a function with up to four word arguments; returns R0.
    pub fn call(&mut self, code: &[u16], args: &[u32]) -> Result<u32, SimError> {
        for (reg, &arg) in self.regs.iter_mut().zip(args.iter().take(4)) {
            *reg = arg;
        }
        self.regs[Reg::Sp.num() as usize] = STACK_TOP;
        self.regs[Reg::Lr.num() as usize] = RETURN_ADDRESS | 1;
        self.vpt_remaining = 0;
        self.tail_predicated = false;
        self.steps = 0;
        let mut pc = CODE_BASE;
        while pc != RETURN_ADDRESS {
            if self.steps >= self.step_limit {
                return Err(SimError::StepLimit {
                    limit: self.step_limit,
                });
            }
            pc = self.step(code, pc)?;
            self.steps += 1;
        }
        Ok(self.regs[0])
    }

    fn read(&self, reg: Reg, pc: u32) -> u32 {
        match reg {
            Reg::Pc => pc.wrapping_add(4),
            _ => self.regs[reg.num() as usize],
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        self.regs[reg.num() as usize] = value;
    }

    fn set_nz(&mut self, value: u32) {
        self.flags.n = value >> 31 != 0;
        self.flags.z = value == 0;
    }

    fn arithmetic(&mut self, x: u32, y: u32, subtract: bool, setflags: bool) -> u32 {
        let (result, c, v) = if subtract {
            add_with_carry(x, !y, true)
        } else {
            add_with_carry(x, y, false)
        };
        if setflags {
            self.set_nz(result);
            self.flags.c = c;
            self.flags.v = v;
        }
        result
    }

    /// Interworking branch: only Thumb targets are valid.
    fn exchange(target: u32) -> Result<u32, SimError> {
        if target & 1 == 0 {
            return Err(SimError::ArmState { target });
        }
        Ok(target & !1)
    }

    /// Lanes an MVE instruction at `pc` acts on, consuming one VPT block slot.
    fn lane_mask(&mut self, op: &Op, pc: u32) -> Result<[bool; LANES], SimError> {
        let mut mask = [true; LANES];
        if self.vpt_remaining > 0 {
            if !op.is_vector() {
                return Err(SimError::VptBlock {
                    address: pc,
                    op: op.to_string(),
                });
            }
            self.vpt_remaining -= 1;
            mask = self.predicate;
        }
        if self.tail_predicated && op.is_vector() {
            let active = self.regs[Reg::Lr.num() as usize].min(LANES as u32) as usize;
            mask.iter_mut().skip(active).for_each(|lane| *lane = false);
        }
        Ok(mask)
    }

    fn require_words(size: LaneSize, pc: u32) -> Result<(), SimError> {
        if size != LaneSize::B32 {
            return Err(SimError::Unsupported {
                address: pc,
                what: format!("{}-bit lanes", size.bits()),
            });
        }
        Ok(())
    }

    /// Execute the instruction at `pc` and return the next pc.
    fn step(&mut self, code: &[u16], pc: u32) -> Result<u32, SimError> {
        let index = pc
            .checked_sub(CODE_BASE)
            .map(|offset| offset as usize / 2)
            .filter(|&index| pc % 2 == 0 && index < code.len())
            .ok_or(SimError::PcOutOfRange { address: pc })?;
        let decoded = decode(&code[index..]).map_err(|source| SimError::Undefined {
            address: pc,
            source,
        })?;
        let op = decoded.op;
        trace!("{pc:#010x}: {op}");
        let mask = self.lane_mask(&op, pc)?;
        let mut next = pc + 2 * decoded.width.halfwords() as u32;
        let sp = Reg::Sp.num() as usize;

        match op {
            Op::Nop => {}
            Op::MovImm { rd, imm, setflags } => {
                self.write(rd, imm);
                if setflags {
                    self.set_nz(imm);
                }
            }
            Op::MovTop { rd, imm } => {
                let low = self.read(rd, pc) & 0xFFFF;
                self.write(rd, low | u32::from(imm) << 16);
            }
            Op::MovReg { rd, rm } => {
                let value = self.read(rm, pc);
                self.write(rd, value);
            }
            Op::AddImm { rd, rn, imm, setflags } | Op::SubImm { rd, rn, imm, setflags } => {
                let subtract = matches!(op, Op::SubImm { .. });
                let result = self.arithmetic(self.read(rn, pc), imm, subtract, setflags);
                self.write(rd, result);
            }
            Op::AddReg { rd, rn, rm, shift, setflags }
            | Op::SubReg { rd, rn, rm, shift, setflags } => {
                let subtract = matches!(op, Op::SubReg { .. });
                let y = self.read(rm, pc) << shift;
                let result = self.arithmetic(self.read(rn, pc), y, subtract, setflags);
                self.write(rd, result);
            }
            Op::CmpImm { rn, imm } => {
                self.arithmetic(self.read(rn, pc), imm, true, true);
            }
            Op::CmpReg { rn, rm } => {
                self.arithmetic(self.read(rn, pc), self.read(rm, pc), true, true);
            }
            Op::LdrImm { rt, rn, offset, indexing } => {
                let base = self.read(rn, pc);
                let moved = base.wrapping_add_signed(offset);
                let address = if indexing == Indexing::PostIndex { base } else { moved };
                let value = self.memory.read_u32(address)?;
                if indexing != Indexing::Offset {
                    self.write(rn, moved);
                }
                self.write(rt, value);
            }
            Op::LdrReg { rt, rn, rm, shift } => {
                let address = self.read(rn, pc).wrapping_add(self.read(rm, pc) << shift);
                let value = self.memory.read_u32(address)?;
                self.write(rt, value);
            }
            Op::Branch { cond, offset } => {
                if self.flags.holds(cond) {
                    next = (pc + 4).wrapping_add_signed(offset);
                }
            }
            Op::Bx { rm } => next = Self::exchange(self.read(rm, pc))?,
            Op::Push { regs } => {
                let mut address = self.regs[sp] - 4 * regs.len();
                self.regs[sp] = address;
                for reg in regs.iter() {
                    let value = self.read(reg, pc);
                    self.memory.write_u32(address, value)?;
                    address += 4;
                }
            }
            Op::Pop { regs } => {
                let mut address = self.regs[sp];
                for reg in regs.iter() {
                    let value = self.memory.read_u32(address)?;
                    if reg == Reg::Pc {
                        next = Self::exchange(value)?;
                    } else {
                        self.write(reg, value);
                    }
                    address += 4;
                }
                self.regs[sp] = address;
            }
            Op::VPush { first, count } => {
                let mut address = self.regs[sp] - 8 * u32::from(count);
                self.regs[sp] = address;
                for d in first..first + count {
                    let (q, half) = (d as usize / 2, d as usize % 2 * 2);
                    let [low, high] = [self.q[q][half], self.q[q][half + 1]];
                    self.memory.write_u32(address, low)?;
                    self.memory.write_u32(address + 4, high)?;
                    address += 8;
                }
            }
            Op::VPop { first, count } => {
                let mut address = self.regs[sp];
                for d in first..first + count {
                    let (q, half) = (d as usize / 2, d as usize % 2 * 2);
                    self.q[q][half] = self.memory.read_u32(address)?;
                    self.q[q][half + 1] = self.memory.read_u32(address + 4)?;
                    address += 8;
                }
                self.regs[sp] = address;
            }
            Op::LoopStart { rn, tail, exit } => {
                if let Some(size) = tail {
                    Self::require_words(size, pc)?;
                }
                let count = self.read(rn, pc);
                match exit {
                    Some(exit) if count == 0 => next = (pc + 4).wrapping_add_signed(exit),
                    _ => {
                        self.write(Reg::Lr, count);
                        self.tail_predicated = tail.is_some();
                    }
                }
            }
            Op::LoopEnd { back, tail_predicated } => {
                let lr = self.read(Reg::Lr, pc);
                let step = if tail_predicated { LANES as u32 } else { 1 };
                if lr > step {
                    self.write(Reg::Lr, lr - step);
                    next = (pc + 4).wrapping_add_signed(-back);
                } else if tail_predicated {
                    self.tail_predicated = false;
                }
            }
            Op::VecMem { op: access, qd, rn, offset, indexing } => {
                let base = self.read(rn, pc);
                let moved = base.wrapping_add_signed(offset);
                let address = if indexing == Indexing::PostIndex { base } else { moved };
                let q = qd.num() as usize;
                for lane in 0..LANES {
                    let at = address.wrapping_add(4 * lane as u32);
                    match access {
                        MemOp::Load => {
                            self.q[q][lane] = if mask[lane] { self.memory.read_u32(at)? } else { 0 };
                        }
                        MemOp::Store if mask[lane] => {
                            let value = self.q[q][lane];
                            self.memory.write_u32(at, value)?;
                        }
                        MemOp::Store => {}
                    }
                }
                if indexing != Indexing::Offset {
                    self.write(rn, moved);
                }
            }
            Op::VfmaScalar { qda, qn, rm } => {
                let scalar = f32::from_bits(self.read(rm, pc));
                let (acc, src) = (qda.num() as usize, qn.num() as usize);
                for lane in (0..LANES).filter(|&lane| mask[lane]) {
                    let product = f32::from_bits(self.q[src][lane]);
                    let sum = product.mul_add(scalar, f32::from_bits(self.q[acc][lane]));
                    self.q[acc][lane] = sum.to_bits();
                }
            }
            Op::VfmaVector { qd, qn, qm } => {
                let (acc, x, y) = (qd.num() as usize, qn.num() as usize, qm.num() as usize);
                for lane in (0..LANES).filter(|&lane| mask[lane]) {
                    let product = f32::from_bits(self.q[x][lane]);
                    let factor = f32::from_bits(self.q[y][lane]);
                    let sum = product.mul_add(factor, f32::from_bits(self.q[acc][lane]));
                    self.q[acc][lane] = sum.to_bits();
                }
            }
            Op::VmovImm { qd, value } => {
                for lane in (0..LANES).filter(|&lane| mask[lane]) {
                    self.q[qd.num() as usize][lane] = value;
                }
            }
            Op::Vctp { size, rn } => {
                Self::require_words(size, pc)?;
                let count = self.read(rn, pc);
                for lane in 0..LANES {
                    self.predicate[lane] = mask[lane] && (lane as u32) < count;
                }
            }
            Op::Vpst { count } => {
                self.vpt_remaining = count;
            }
            Op::VmovSr { sd, rt } => {
                let n = sd.num() as usize;
                self.q[n / LANES][n % LANES] = self.read(rt, pc);
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv81m::backend::Backend;
    use crate::armv81m::encoder::{
        AddSub, AddSubImm, AddSubImmForm, Bx, CmpImm, CmpImmForm, MovImm, MovImmForm, Pop,
        Push, Vpst, VmovImm,
    };
    use crate::core::register_file::RegSet;

    #[test]
    fn test_add_with_carry_flags() {
        assert_eq!(add_with_carry(1, !1, true), (0, true, false));
        assert_eq!(add_with_carry(0x7FFF_FFFF, 1, false), (0x8000_0000, false, true));
        assert_eq!(add_with_carry(0, !1, true), (u32::MAX, false, false));
    }

    #[test]
    fn test_counted_loop() {
        let mut words = [0u16; 32];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.emit(&MovImm { rd: Reg::R0, imm: 0, form: MovImmForm::Narrow8 });
        let top = backend.mark();
        backend.emit(&AddSubImm {
            op: AddSub::Add,
            rd: Reg::R0,
            rn: Reg::R0,
            imm: 3,
            form: AddSubImmForm::Narrow8,
        });
        backend.emit(&CmpImm { rn: Reg::R0, imm: 30, form: CmpImmForm::Narrow8 });
        backend.branch_to(top, Cond::Ne);
        backend.emit(&Bx { rm: Reg::Lr });
        let mut machine = Machine::new();
        assert_eq!(machine.call(backend.code(), &[]), Ok(30));
        assert_eq!(machine.steps(), 1 + 10 * 3 + 1);
    }

    #[test]
    fn test_vpt_block_rejects_scalar_instruction() {
        let mut words = [0u16; 16];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.emit(&Vpst { count: 2 });
        backend.emit(&VmovImm { qd: QReg::Q0, value: 0 });
        backend.emit(&Bx { rm: Reg::Lr });
        let mut machine = Machine::new();
        assert!(matches!(
            machine.call(backend.code(), &[]),
            Err(SimError::VptBlock { .. })
        ));
    }

    #[test]
    fn test_callee_saved_check_follows_the_stack() {
        let mut words = [0u16; 16];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.emit(&Push { regs: RegSet::of(&[Reg::R4, Reg::Lr]) });
        backend.emit(&MovImm { rd: Reg::R4, imm: 9, form: MovImmForm::Narrow8 });
        backend.emit(&Pop { regs: RegSet::of(&[Reg::R4, Reg::Pc]) });
        let mut machine = Machine::new();
        let before = machine.clone();
        assert_eq!(machine.call(backend.code(), &[]), Ok(0));
        assert_eq!(machine.reg(Reg::Sp), STACK_TOP);
        assert!(machine.callee_saved_match(&before));

        // Returning with R4 still pushed leaves SP low.
        let mut words = [0u16; 16];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.emit(&Push { regs: RegSet::of(&[Reg::R4]) });
        backend.emit(&Bx { rm: Reg::Lr });
        let mut machine = Machine::new();
        machine.call(backend.code(), &[]).unwrap();
        assert!(!machine.callee_saved_match(&before));
    }

    #[test]
    fn test_fresh_machine_has_a_stack() {
        let machine = Machine::new();
        assert_eq!(machine.reg(Reg::Sp), STACK_TOP);
        assert_eq!(machine.memory().read_u32(STACK_TOP - 4), Ok(0));
        assert_eq!(machine.memory().read_u32(STACK_TOP - STACK_SIZE), Ok(0));
    }

    #[test]
    fn test_runaway_code_hits_step_limit() {
        let code = [0xE7FEu16];
        let mut machine = Machine::new().with_step_limit(100);
        assert_eq!(
            machine.call(&code, &[]),
            Err(SimError::StepLimit { limit: 100 })
        );
    }

    #[test]
    fn test_fallthrough_leaves_code() {
        let code = [0xBF00u16];
        let mut machine = Machine::new();
        assert_eq!(
            machine.call(&code, &[]),
            Err(SimError::PcOutOfRange { address: CODE_BASE + 2 })
        );
    }
}
