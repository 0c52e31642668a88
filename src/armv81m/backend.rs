// This module provides the instruction buffer every generator writes into. Backend
// wraps a caller-supplied half-word slice and a write cursor; it never allocates code
// memory. Instructions are appended after a capacity check, and a 32-bit instruction
// takes two consecutive slots with the high half-word first. Control flow is resolved
// with positions (half-word indices) rather than pointers: backward branches and loop
// ends are emitted against a BranchTarget recorded earlier, forward branches reserve a
// same-width no-op Placeholder that is patched once the destination is known. Both
// tokens are consumed by use, so each recorded target ends up in exactly one branch.
// Problems are recorded as faults instead of aborting: soft faults leave a no-op in the
// stream, fatal ones make finish() replace the kernel with a single BX LR so the
// exposed function is harmless. Exposing the buffer issues the DSB/ISB pair and
// returns a Kernel that borrows the backend.

//! Instruction buffer with branch fixups.

use std::any::type_name;

use log::{error, trace, warn};

use super::encoder::{Branch, Cond, Encode, Instr, LoopEnd, Width, BX_LR, LOOP_RANGE};
use super::exec::{synchronize_instruction_stream, Kernel, KernelAbi};
use crate::core::error::{
    BackendError, EncodingError, Fault, GenerateError, GenerateResult,
};

/// Smallest usable buffer: one 32-bit instruction, or the return stub.
pub const MIN_CAPACITY: usize = 2;

/// Index of a half-word slot in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(usize);

impl Position {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    pub const fn byte_offset(self) -> usize {
        self.0 * 2
    }
}

/// Destination of a backward branch or loop end.
#[must_use = "a branch target is resolved by exactly one branch"]
#[derive(Debug, PartialEq, Eq)]
pub struct BranchTarget {
    pos: Position,
}

impl BranchTarget {
    pub fn position(&self) -> Position {
        self.pos
    }
}

/// Reserved slot for a forward branch.
#[must_use = "a placeholder must be patched or it stays a no-op"]
#[derive(Debug, PartialEq, Eq)]
pub struct Placeholder {
    pos: Position,
    width: Width,
}

impl Placeholder {
    pub fn position(&self) -> Position {
        self.pos
    }

    pub fn width(&self) -> Width {
        self.width
    }
}

fn family<E>() -> &'static str {
    let name = type_name::<E>();
    name.rsplit("::").next().unwrap_or(name)
}

/// Append-only instruction buffer over caller-owned memory.
#[derive(Debug)]
pub struct Backend<'buf> {
    words: &'buf mut [u16],
    cursor: usize,
    faults: Vec<Fault>,
    exhausted: bool,
}

impl<'buf> Backend<'buf> {
    pub fn new(words: &'buf mut [u16]) -> Result<Self, BackendError> {
        if words.len() < MIN_CAPACITY {
            return Err(BackendError::BufferTooSmall {
                capacity: words.len(),
                minimum: MIN_CAPACITY,
            });
        }
        Ok(Self {
            words,
            cursor: 0,
            faults: Vec::new(),
            exhausted: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Half-words written so far.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Where the next instruction goes.
    pub fn position(&self) -> Position {
        Position(self.cursor)
    }

    pub fn code(&self) -> &[u16] {
        &self.words[..self.cursor]
    }

    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    pub fn has_fatal_fault(&self) -> bool {
        self.faults.iter().any(Fault::is_fatal)
    }

    pub fn record(&mut self, fault: Fault) {
        if fault.is_fatal() {
            error!("{fault}");
        } else {
            warn!("{fault}");
        }
        self.faults.push(fault);
    }

    /// Start a new kernel at the beginning of the buffer.
    pub fn reset_kernel(&mut self) {
        self.cursor = 0;
        self.faults.clear();
        self.exhausted = false;
    }

    /// Append an already encoded instruction.
    pub fn add_instruction(&mut self, insn: Instr) -> Position {
        let pos = Position(self.cursor);
        if self.exhausted {
            return pos;
        }
        let need = insn.width().halfwords();
        if self.cursor + need > self.words.len() {
            self.exhausted = true;
            self.record(Fault::CapacityExceeded {
                capacity: self.words.len(),
            });
            return pos;
        }
        trace!("{:5}: {insn}", pos.byte_offset());
        let (hw1, hw2) = insn.halfwords();
        self.words[self.cursor] = hw1;
        if let Some(hw2) = hw2 {
            self.words[self.cursor + 1] = hw2;
        }
        self.cursor += need;
        pos
    }

    /// Assemble and append; invalid operands leave a same-width no-op.
    pub fn emit<E: Encode>(&mut self, insn: &E) -> Position {
        let insn = match insn.assemble() {
            Ok(insn) => insn,
            Err(error) => {
                self.record(Fault::Encoding {
                    at: self.cursor,
                    error,
                });
                Instr::nop(insn.width())
            }
        };
        self.add_instruction(insn)
    }

    /// Target at the next instruction to be emitted.
    pub fn mark(&self) -> BranchTarget {
        BranchTarget {
            pos: self.position(),
        }
    }

    /// Emit `insn` and return a target at its first half-word.
    pub fn add_branch_target<E: Encode>(&mut self, insn: &E) -> BranchTarget {
        let pos = self.emit(insn);
        BranchTarget { pos }
    }

    /// Reserve a slot for a forward branch.
    pub fn add_branch_placeholder(&mut self, width: Width) -> Placeholder {
        let pos = self.add_instruction(Instr::nop(width));
        Placeholder { pos, width }
    }

    /// Byte displacement of `to` as seen from an instruction at `from` (PC = from + 4).
    pub fn compute_displacement(from: Position, to: Position) -> i32 {
        (to.0 as i64 - from.0 as i64) as i32 * 2 - 4
    }

    fn overflow(&mut self, from: Position, to: Position, displacement: i32, instruction: &'static str) {
        self.record(Fault::DisplacementOverflow {
            from: from.0,
            to: to.0,
            displacement,
            instruction,
        });
    }

    /// Backward (or known) branch, 16-bit when the displacement allows it.
    pub fn branch_to(&mut self, target: BranchTarget, cond: Cond) {
        let from = self.position();
        let offset = Self::compute_displacement(from, target.pos);
        let width = if Branch::fits(cond, Width::Narrow, offset) {
            Width::Narrow
        } else {
            Width::Wide
        };
        if !Branch::fits(cond, width, offset) {
            self.overflow(from, target.pos, offset, "Branch");
            self.add_instruction(Instr::nop(Width::Wide));
            return;
        }
        self.emit(&Branch { cond, offset, width });
    }

    /// `LE`/`LETP` back to `target`.
    pub fn loop_end(&mut self, target: BranchTarget, tail_predicated: bool) {
        let from = self.position();
        let back = -Self::compute_displacement(from, target.pos);
        if !(0..=LOOP_RANGE).contains(&back) {
            self.overflow(from, target.pos, -back, "LoopEnd");
            self.add_instruction(Instr::nop(Width::Wide));
            return;
        }
        self.emit(&LoopEnd {
            back,
            tail_predicated,
        });
    }

    /// Patch `placeholder` with the instruction `make` builds for a forward
    /// displacement to the current position.
    pub fn bind<E: Encode>(&mut self, placeholder: Placeholder, make: impl FnOnce(i32) -> E) {
        let offset = Self::compute_displacement(placeholder.pos, self.position());
        self.patch(placeholder, &make(offset));
    }

    /// Overwrite a placeholder with an instruction of the same width.
    pub fn patch<E: Encode>(&mut self, placeholder: Placeholder, insn: &E) {
        let at = placeholder.pos.0;
        if at + placeholder.width.halfwords() > self.cursor {
            return;
        }
        if insn.width() != placeholder.width {
            self.record(Fault::PlaceholderWidth {
                at,
                expected: placeholder.width,
                found: insn.width(),
            });
            return;
        }
        match insn.assemble() {
            Ok(encoded) => {
                trace!("{:5}: {encoded} (patched)", placeholder.pos.byte_offset());
                let (hw1, hw2) = encoded.halfwords();
                self.words[at] = hw1;
                if let Some(hw2) = hw2 {
                    self.words[at + 1] = hw2;
                }
            }
            Err(
                EncodingError::BranchOutOfRange { offset, .. }
                | EncodingError::OddBranchOffset { offset },
            ) => {
                let to = Position((at as i64 + (offset as i64 + 4) / 2).max(0) as usize);
                self.overflow(placeholder.pos, to, offset, family::<E>());
            }
            Err(error) => self.record(Fault::Encoding { at, error }),
        }
    }

    /// Close the kernel; a fatal fault turns it into a bare `BX LR`.
    pub fn finish(&mut self) {
        if !self.has_fatal_fault() {
            return;
        }
        error!(
            "kernel discarded after {} fault(s), replaced by a return stub",
            self.faults.len()
        );
        self.words[0] = BX_LR;
        self.cursor = 1;
    }

    /// Synchronize the instruction stream and hand out the kernel.
    pub fn expose_as_callable<F: KernelAbi>(&self) -> Kernel<'_, F> {
        synchronize_instruction_stream();
        Kernel::new(self.code())
    }

    /// Finished kernel together with the faults recorded while generating it.
    pub fn generated<F: KernelAbi>(&self) -> Generated<'_, F> {
        Generated {
            kernel: self.expose_as_callable(),
            faults: &self.faults,
        }
    }
}

/// Outcome of a `generate` call.
#[derive(Debug)]
pub struct Generated<'buf, F> {
    kernel: Kernel<'buf, F>,
    faults: &'buf [Fault],
}

impl<'buf, F: KernelAbi> Generated<'buf, F> {
    /// No fault of any kind was recorded.
    pub fn is_valid(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn faults(&self) -> &'buf [Fault] {
        self.faults
    }

    pub fn kernel(&self) -> &Kernel<'buf, F> {
        &self.kernel
    }

    pub fn code(&self) -> &'buf [u16] {
        self.kernel.code()
    }

    pub fn into_result(self) -> GenerateResult<Kernel<'buf, F>> {
        if self.faults.is_empty() {
            Ok(self.kernel)
        } else {
            Err(GenerateError {
                faults: self.faults.to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv81m::decoder::{decode, Op};
    use crate::armv81m::encoder::{MovImm, MovImmForm, Nop, NOP_NARROW, NOP_WIDE};
    use crate::armv81m::exec::ConstantFn;
    use crate::core::register_file::Reg;

    fn nop() -> Nop {
        Nop { width: Width::Narrow }
    }

    #[test]
    fn test_new_rejects_tiny_buffer() {
        let mut words = [0u16; 1];
        assert!(matches!(
            Backend::new(&mut words),
            Err(BackendError::BufferTooSmall { capacity: 1, minimum: 2 })
        ));
    }

    #[test]
    fn test_wide_instruction_order() {
        let mut words = [0u16; 4];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.add_instruction(Instr::Wide(0xF3AF_8000));
        assert_eq!(backend.code(), &[0xF3AF, 0x8000]);
    }

    #[test]
    fn test_displacement() {
        assert_eq!(Backend::compute_displacement(Position(0), Position(2)), 0);
        assert_eq!(Backend::compute_displacement(Position(4), Position(0)), -12);
        assert_eq!(Backend::compute_displacement(Position(0), Position(10)), 16);
    }

    #[test]
    fn test_backward_branch_lands_on_target() {
        let mut words = [0u16; 16];
        let mut backend = Backend::new(&mut words).unwrap();
        let target = backend.add_branch_target(&nop());
        backend.emit(&nop());
        let from = backend.position();
        backend.branch_to(target, Cond::Ne);
        let op = decode(&backend.code()[from.index()..]).unwrap().op;
        assert_eq!(op, Op::Branch { cond: Cond::Ne, offset: -8 });
        let landing = from.byte_offset() as i32 + op.branch_offset().unwrap();
        assert_eq!(landing, 0);
    }

    #[test]
    fn test_far_branch_goes_wide() {
        let mut words = [0u16; 400];
        let mut backend = Backend::new(&mut words).unwrap();
        let target = backend.mark();
        for _ in 0..200 {
            backend.emit(&nop());
        }
        backend.branch_to(target, Cond::Lt);
        let decoded = decode(&backend.code()[200..]).unwrap();
        assert_eq!(decoded.width, Width::Wide);
        assert_eq!(decoded.op, Op::Branch { cond: Cond::Lt, offset: -404 });
        assert!(backend.faults().is_empty());
    }

    #[test]
    fn test_forward_placeholder() {
        let mut words = [0u16; 16];
        let mut backend = Backend::new(&mut words).unwrap();
        let placeholder = backend.add_branch_placeholder(Width::Narrow);
        assert_eq!(backend.code(), &[NOP_NARROW]);
        backend.emit(&nop());
        backend.emit(&nop());
        backend.bind(placeholder, |offset| Branch {
            cond: Cond::Eq,
            offset,
            width: Width::Narrow,
        });
        let op = decode(backend.code()).unwrap().op;
        assert_eq!(op, Op::Branch { cond: Cond::Eq, offset: 2 });
        assert_eq!(op.branch_offset(), Some(6));
    }

    #[test]
    fn test_placeholder_width_mismatch_is_fatal() {
        let mut words = [0u16; 16];
        let mut backend = Backend::new(&mut words).unwrap();
        let placeholder = backend.add_branch_placeholder(Width::Narrow);
        backend.patch(
            placeholder,
            &Branch {
                cond: Cond::Al,
                offset: 0,
                width: Width::Wide,
            },
        );
        assert!(backend.has_fatal_fault());
        backend.finish();
        assert_eq!(backend.code(), &[BX_LR]);
    }

    #[test]
    fn test_capacity_exhaustion_stubs_kernel() {
        let mut words = [0u16; 3];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.emit(&nop());
        backend.add_instruction(Instr::Wide(NOP_WIDE));
        backend.add_instruction(Instr::Wide(NOP_WIDE));
        backend.emit(&nop());
        assert_eq!(backend.faults(), &[Fault::CapacityExceeded { capacity: 3 }]);
        backend.finish();
        let generated = backend.generated::<ConstantFn>();
        assert_eq!(generated.code(), &[BX_LR]);
        assert!(!generated.is_valid());
        assert!(generated.into_result().is_err());
    }

    #[test]
    fn test_soft_fault_keeps_offsets() {
        let mut words = [0u16; 8];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.emit(&MovImm {
            rd: Reg::R9,
            imm: 7,
            form: MovImmForm::Narrow8,
        });
        backend.emit(&nop());
        backend.finish();
        assert_eq!(backend.code(), &[NOP_NARROW, NOP_NARROW]);
        assert_eq!(backend.faults().len(), 1);
        assert!(!backend.has_fatal_fault());
    }

    #[test]
    fn test_reset_kernel() {
        let mut words = [0u16; 8];
        let mut backend = Backend::new(&mut words).unwrap();
        backend.emit(&nop());
        backend.reset_kernel();
        assert!(backend.is_empty());
        assert!(backend.faults().is_empty());
        assert_eq!(backend.position(), Position::new(0));
    }

    #[test]
    fn test_loop_end_out_of_range() {
        let mut words = [0u16; 4200];
        let mut backend = Backend::new(&mut words).unwrap();
        let target = backend.mark();
        for _ in 0..2100 {
            backend.emit(&nop());
        }
        backend.loop_end(target, false);
        assert!(matches!(
            backend.faults(),
            [Fault::DisplacementOverflow { instruction: "LoopEnd", .. }]
        ));
    }
}
