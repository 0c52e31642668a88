// This module generates the streaming triad out[i] = a[i] * s + b[i] with the scalar s
// fixed at generation time. The loop is a tail-predicated low-overhead loop: WLSTP.32
// takes the element count, skips the body entirely when it is zero, and LETP closes each
// iteration while the hardware masks the lanes past the end of the arrays. The exit
// offset of WLSTP is only known once the body is emitted, so the instruction starts as a
// placeholder and is patched afterwards.

//! Streaming triad generator.

use crate::armv81m::backend::{Backend, Generated};
use crate::armv81m::encoder::{
    Indexing, LaneSize, LoopKind, LoopStart, MemOp, Pop, Push, VecMem, VfmaScalar, Width,
};
use crate::armv81m::exec::TriadFn;
use crate::core::error::BackendError;
use crate::core::register_file::{QReg, Reg, RegSet};

use super::emit::load_constant;

const A: Reg = Reg::R0;
const B: Reg = Reg::R1;
const OUT: Reg = Reg::R2;
const LEN: Reg = Reg::R3;
const SCALAR: Reg = Reg::R12;

#[derive(Debug)]
pub struct TriadGenerator<'buf> {
    backend: Backend<'buf>,
}

impl<'buf> TriadGenerator<'buf> {
    pub fn new(buffer: &'buf mut [u16]) -> Result<Self, BackendError> {
        Ok(Self {
            backend: Backend::new(buffer)?,
        })
    }

    /// `fn(a, b, out, len)` computing `out[i] = a[i] * scalar + b[i]` for `i < len`.
    pub fn generate(&mut self, scalar: f32) -> Generated<'_, TriadFn> {
        let backend = &mut self.backend;
        backend.reset_kernel();
        let frame = RegSet::of(&[Reg::R7]);
        let mut saved = frame;
        saved.set(Reg::Lr);
        backend.emit(&Push { regs: saved });
        load_constant(backend, SCALAR, scalar.to_bits());

        let start = backend.add_branch_placeholder(Width::Wide);
        let body = backend.mark();
        let post = |op, qd, rn| VecMem {
            op,
            qd,
            rn,
            offset: 16,
            indexing: Indexing::PostIndex,
        };
        backend.emit(&post(MemOp::Load, QReg::Q0, B));
        backend.emit(&post(MemOp::Load, QReg::Q1, A));
        backend.emit(&VfmaScalar {
            qda: QReg::Q0,
            qn: QReg::Q1,
            rm: SCALAR,
        });
        backend.emit(&post(MemOp::Store, QReg::Q0, OUT));
        backend.loop_end(body, true);
        backend.bind(start, |exit| LoopStart {
            kind: LoopKind::While { exit },
            rn: LEN,
            tail: Some(LaneSize::B32),
        });

        let mut restored = frame;
        restored.set(Reg::Pc);
        backend.emit(&Pop { regs: restored });
        backend.finish();
        self.backend.generated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv81m::decoder::{decode, Op};

    #[test]
    fn test_triad_layout() {
        let mut buffer = [0u16; 64];
        let mut generator = TriadGenerator::new(&mut buffer).unwrap();
        let generated = generator.generate(2.0);
        assert!(generated.is_valid(), "{:?}", generated.faults());
        let code = generated.code();
        assert_eq!(code[0], 0xB580);
        // 2.0 = 0x40000000 is a rotated byte: one MOV.W.
        let start = decode(&code[3..]).unwrap();
        assert_eq!(
            start.op,
            Op::LoopStart {
                rn: LEN,
                tail: Some(LaneSize::B32),
                exit: Some(20),
            }
        );
        let exit = 3 + (start.op.branch_offset().unwrap() / 2) as usize;
        assert_eq!(decode(&code[exit..]).unwrap().op, Op::Pop {
            regs: RegSet::of(&[Reg::R7, Reg::Pc]),
        });
        assert_eq!(
            decode(&code[exit - 2..]).unwrap().op,
            Op::LoopEnd {
                back: 20,
                tail_predicated: true,
            }
        );
    }
}
