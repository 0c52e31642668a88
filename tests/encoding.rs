use proptest::prelude::*;

use mvejit::armv81m::encoder::{
    can_encode_constant, encode_constant, expand_constant, AddSub, AddSubImm, AddSubImmForm,
    Branch, Bx, CmpImm, CmpImmForm, Cond, Encode, Instr, MovImm, MovImmForm, NOP_NARROW,
    NOP_WIDE,
};
use mvejit::armv81m::{decode, disassemble, Backend, Op, Width};
use mvejit::core::{Fault, Reg};
use mvejit::sim::Machine;

proptest! {
    #[test]
    fn encoded_constants_expand_back(value in any::<u32>()) {
        if let Some(imm12) = encode_constant(value) {
            prop_assert!(imm12 < 0x1000);
            prop_assert_eq!(expand_constant(imm12), value);
        }
    }

    #[test]
    fn every_expansion_is_encodable(imm12 in 0u16..0x1000) {
        // imm12 values with a zero byte under a replicated pattern are reserved.
        let reserved = (imm12 >> 10) == 0 && (imm12 >> 8) != 0 && imm12 & 0xFF == 0;
        prop_assume!(!reserved);
        let value = expand_constant(imm12);
        let canonical = encode_constant(value);
        prop_assert!(canonical.is_some(), "{imm12:#x} -> {value:#x}");
        prop_assert_eq!(canonical.map(expand_constant), Some(value));
    }

    #[test]
    fn rotated_bytes_are_encodable(byte in 0x80u32..=0xFF, rotation in 8u32..32) {
        prop_assert!(can_encode_constant(byte.rotate_right(rotation)));
    }

    #[test]
    fn distant_bits_are_not_encodable(high in prop_oneof![9u32..=15, 17u32..=23]) {
        prop_assert!(!can_encode_constant(1 | 1 << high));
    }
}

fn emitted(insn: &impl Encode) -> Instr {
    insn.encode()
}

#[test]
fn known_encodings() {
    let cases: [(Instr, &str); 4] = [
        (
            emitted(&MovImm { rd: Reg::R0, imm: 42, form: MovImmForm::Narrow8 }),
            "movs",
        ),
        (emitted(&Bx { rm: Reg::Lr }), "bx"),
        (
            emitted(&AddSubImm {
                op: AddSub::Sub,
                rd: Reg::R2,
                rn: Reg::R2,
                imm: 200,
                form: AddSubImmForm::Narrow8,
            }),
            "subs",
        ),
        (
            emitted(&CmpImm { rn: Reg::R10, imm: 0x00AF_00AF, form: CmpImmForm::Modified }),
            "cmp",
        ),
    ];
    assert_eq!(cases[0].0, Instr::Narrow(0x202A));
    assert_eq!(cases[1].0, Instr::Narrow(0x4770));
    assert_eq!(cases[2].0, Instr::Narrow(0x3AC8));
    assert_eq!(cases[3].0, Instr::pair(0xF1BA, 0x1FAF));
    for (insn, text) in cases {
        let (hw1, hw2) = insn.halfwords();
        let mut words = vec![hw1];
        words.extend(hw2);
        let line = disassemble(&words).join("");
        assert!(line.to_lowercase().contains(text), "{line} lacks {text}");
    }
}

#[test]
fn invalid_operands_fall_back_to_nops() {
    let narrow = MovImm { rd: Reg::R9, imm: 1, form: MovImmForm::Narrow8 };
    assert!(narrow.assemble().is_err());
    assert_eq!(narrow.encode(), Instr::Narrow(NOP_NARROW));

    let wide = MovImm { rd: Reg::R9, imm: 0x101, form: MovImmForm::Modified };
    assert!(wide.assemble().is_err());
    assert_eq!(wide.encode(), Instr::Wide(NOP_WIDE));

    let mut words = [0u16; 8];
    let mut backend = Backend::new(&mut words).unwrap();
    backend.emit(&narrow);
    backend.emit(&wide);
    backend.emit(&Bx { rm: Reg::Lr });
    backend.finish();
    assert!(matches!(backend.faults(), [Fault::Encoding { at: 0, .. }, Fault::Encoding { at: 1, .. }]));
    assert!(!backend.has_fatal_fault());
    assert_eq!(backend.code(), &[NOP_NARROW, 0xF3AF, 0x8000, 0x4770]);
    assert_eq!(decode(backend.code()).unwrap().op, Op::Nop);
}

#[test]
fn branches_land_on_their_targets() {
    let mut words = [0u16; 64];
    let mut backend = Backend::new(&mut words).unwrap();
    backend.emit(&MovImm { rd: Reg::R0, imm: 0, form: MovImmForm::Narrow8 });
    let skip = backend.add_branch_placeholder(Width::Narrow);
    backend.emit(&MovImm { rd: Reg::R0, imm: 99, form: MovImmForm::Narrow8 });
    backend.bind(skip, |offset| Branch { cond: Cond::Al, offset, width: Width::Narrow });
    let top = backend.mark();
    backend.emit(&AddSubImm {
        op: AddSub::Add,
        rd: Reg::R0,
        rn: Reg::R0,
        imm: 1,
        form: AddSubImmForm::Narrow8,
    });
    backend.emit(&CmpImm { rn: Reg::R0, imm: 5, form: CmpImmForm::Narrow8 });
    backend.branch_to(top, Cond::Ne);
    backend.emit(&Bx { rm: Reg::Lr });
    backend.finish();
    assert!(backend.faults().is_empty());

    let mut machine = Machine::new();
    assert_eq!(machine.call(backend.code(), &[]), Ok(5));
    assert_eq!(machine.steps(), 2 + 5 * 3 + 1);
}

#[test]
fn far_forward_branch_is_wide() {
    let mut words = vec![0u16; 1024];
    let mut backend = Backend::new(&mut words).unwrap();
    backend.emit(&MovImm { rd: Reg::R0, imm: 0, form: MovImmForm::Narrow8 });
    let skip = backend.add_branch_placeholder(Width::Wide);
    for _ in 0..600 {
        backend.emit(&MovImm { rd: Reg::R0, imm: 7, form: MovImmForm::Narrow8 });
    }
    backend.bind(skip, |offset| Branch { cond: Cond::Eq, offset, width: Width::Wide });
    backend.emit(&Bx { rm: Reg::Lr });
    backend.finish();
    assert!(backend.faults().is_empty());
    assert_eq!(
        decode(&backend.code()[1..]).unwrap().op,
        Op::Branch { cond: Cond::Eq, offset: 1200 }
    );

    let mut machine = Machine::new();
    assert_eq!(machine.call(backend.code(), &[]), Ok(0));
    assert_eq!(machine.steps(), 3);
}
