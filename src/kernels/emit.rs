// This module holds the small emission sequences every generator shares: materializing
// a 32-bit constant in a register, adding a signed constant to a register, and the
// callee-saved register save and restore around a kernel body. Each helper picks the
// shortest encoding the value allows (16-bit immediate forms first, then ADDW/SUBW or a
// modified immediate, then a MOVW/MOVT pair) so that generated code stays compact and the
// choice is deterministic for a given value.

use log::trace;

use crate::armv81m::backend::Backend;
use crate::armv81m::encoder::{
    can_encode_constant, AddSub, AddSubImm, AddSubImmForm, AddSubReg, AddSubRegForm, MovImm,
    MovImmForm, MovReg, Pop, Push, VPop, VPush,
};
use crate::core::register_file::{Reg, RegSet};

/// `D8`-`D15`, the callee-saved half of the vector register file (`Q4`-`Q7`).
const SAVED_D_FIRST: u8 = 8;
const SAVED_D_COUNT: u8 = 8;

/// Put `value` in `rd`.
pub(crate) fn load_constant(backend: &mut Backend<'_>, rd: Reg, value: u32) {
    if rd.is_low() && value <= 0xFF {
        backend.emit(&MovImm {
            rd,
            imm: value,
            form: MovImmForm::Narrow8,
        });
    } else if can_encode_constant(value) {
        backend.emit(&MovImm {
            rd,
            imm: value,
            form: MovImmForm::Modified,
        });
    } else {
        backend.emit(&MovImm {
            rd,
            imm: value & 0xFFFF,
            form: MovImmForm::Plain16,
        });
        if value > 0xFFFF {
            backend.emit(&MovImm {
                rd,
                imm: value >> 16,
                form: MovImmForm::Top16,
            });
        }
    }
}

/// `rd = rn + value`. `scratch` is clobbered when the value needs a register.
pub(crate) fn add_constant(backend: &mut Backend<'_>, rd: Reg, rn: Reg, value: i64, scratch: Reg) {
    if value == 0 {
        if rd != rn {
            backend.emit(&MovReg { rd, rm: rn });
        }
        return;
    }
    let op = if value < 0 { AddSub::Sub } else { AddSub::Add };
    let magnitude = value.unsigned_abs() as u32;
    let form = if rd == rn && rd.is_low() && magnitude <= 0xFF {
        AddSubImmForm::Narrow8
    } else if rd.is_low() && rn.is_low() && magnitude <= 7 {
        AddSubImmForm::Narrow3
    } else if magnitude <= 0xFFF {
        AddSubImmForm::Plain12
    } else if can_encode_constant(magnitude) {
        AddSubImmForm::Modified
    } else {
        trace!("{rd} = {rn} {value:+} through {scratch}");
        load_constant(backend, scratch, magnitude);
        backend.emit(&AddSubReg {
            op,
            rd,
            rn,
            rm: scratch,
            shift: 0,
            form: AddSubRegForm::Wide,
        });
        return;
    };
    backend.emit(&AddSubImm {
        op,
        rd,
        rn,
        imm: magnitude,
        form,
    });
}

/// Save `regs` plus LR, and `D8`-`D15` when `vector` is set.
pub(crate) fn save_callee(backend: &mut Backend<'_>, regs: RegSet, vector: bool) {
    let mut list = regs;
    list.set(Reg::Lr);
    backend.emit(&Push { regs: list });
    if vector {
        backend.emit(&VPush {
            first: SAVED_D_FIRST,
            count: SAVED_D_COUNT,
        });
    }
}

/// Undo [`save_callee`] and return through the saved LR.
pub(crate) fn restore_and_return(backend: &mut Backend<'_>, regs: RegSet, vector: bool) {
    if vector {
        backend.emit(&VPop {
            first: SAVED_D_FIRST,
            count: SAVED_D_COUNT,
        });
    }
    let mut list = regs;
    list.set(Reg::Pc);
    backend.emit(&Pop { regs: list });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv81m::decoder::{decode, disassemble, Op};

    fn ops(code: &[u16]) -> Vec<Op> {
        let mut at = 0;
        let mut out = Vec::new();
        while at < code.len() {
            let decoded = decode(&code[at..]).unwrap();
            at += decoded.width.halfwords();
            out.push(decoded.op);
        }
        out
    }

    fn constant_ops(rd: Reg, value: u32) -> Vec<Op> {
        let mut words = [0u16; 8];
        let mut backend = Backend::new(&mut words).unwrap();
        load_constant(&mut backend, rd, value);
        assert!(backend.faults().is_empty());
        ops(backend.code())
    }

    #[test]
    fn test_load_constant_forms() {
        assert_eq!(
            constant_ops(Reg::R0, 42),
            [Op::MovImm { rd: Reg::R0, imm: 42, setflags: true }]
        );
        assert_eq!(
            constant_ops(Reg::Lr, 0x0300),
            [Op::MovImm { rd: Reg::Lr, imm: 0x0300, setflags: false }]
        );
        assert_eq!(
            constant_ops(Reg::R9, 0x1234),
            [Op::MovImm { rd: Reg::R9, imm: 0x1234, setflags: false }]
        );
        assert_eq!(
            constant_ops(Reg::R12, 0x4049_0FDB),
            [
                Op::MovImm { rd: Reg::R12, imm: 0x0FDB, setflags: false },
                Op::MovTop { rd: Reg::R12, imm: 0x4049 },
            ]
        );
    }

    #[test]
    fn test_add_constant_forms() {
        let mut words = [0u16; 32];
        let mut backend = Backend::new(&mut words).unwrap();
        add_constant(&mut backend, Reg::R0, Reg::R0, 32, Reg::R3);
        add_constant(&mut backend, Reg::R2, Reg::R2, -96, Reg::R3);
        add_constant(&mut backend, Reg::R8, Reg::R8, 8, Reg::R3);
        add_constant(&mut backend, Reg::R10, Reg::R2, 0x0001_0000, Reg::R3);
        add_constant(&mut backend, Reg::R1, Reg::R1, 0x0001_2344, Reg::R3);
        add_constant(&mut backend, Reg::R4, Reg::R1, 0, Reg::R3);
        assert!(backend.faults().is_empty());
        let text = disassemble(backend.code());
        assert_eq!(text.len(), 8, "{text:#?}");
        assert_eq!(
            ops(backend.code()),
            [
                Op::AddImm { rd: Reg::R0, rn: Reg::R0, imm: 32, setflags: true },
                Op::SubImm { rd: Reg::R2, rn: Reg::R2, imm: 96, setflags: true },
                Op::AddImm { rd: Reg::R8, rn: Reg::R8, imm: 8, setflags: false },
                Op::AddImm { rd: Reg::R10, rn: Reg::R2, imm: 0x0001_0000, setflags: false },
                Op::MovImm { rd: Reg::R3, imm: 0x2344, setflags: false },
                Op::MovTop { rd: Reg::R3, imm: 1 },
                Op::AddReg { rd: Reg::R1, rn: Reg::R1, rm: Reg::R3, shift: 0, setflags: false },
                Op::MovReg { rd: Reg::R4, rm: Reg::R1 },
            ]
        );
    }

    #[test]
    fn test_save_and_restore() {
        let mut words = [0u16; 16];
        let mut backend = Backend::new(&mut words).unwrap();
        let regs = RegSet::range(Reg::R4, Reg::R11);
        save_callee(&mut backend, regs, true);
        restore_and_return(&mut backend, regs, true);
        assert_eq!(
            backend.code(),
            &[0xE92D, 0x4FF0, 0xED2D, 0x8B10, 0xECBD, 0x8B10, 0xE8BD, 0x8FF0]
        );
    }
}
