//! Sequential read generator.
//!
//! The kernel streams `iterations * unroll` vectors from `src` with post-incrementing
//! VLDRW and does nothing with them. It measures load bandwidth only.

use crate::armv81m::backend::{Backend, Generated};
use crate::armv81m::encoder::{Indexing, LoopKind, LoopStart, MemOp, Pop, Push, VecMem, Width};
use crate::armv81m::exec::StreamFn;
use crate::core::error::{BackendError, Fault};
use crate::core::register_file::{QReg, Reg, RegSet};

/// Most loads per loop iteration.
pub const MAX_UNROLL: u32 = 64;

const SRC: Reg = Reg::R0;
const ITERATIONS: Reg = Reg::R1;

#[derive(Debug)]
pub struct StreamGenerator<'buf> {
    backend: Backend<'buf>,
}

impl<'buf> StreamGenerator<'buf> {
    pub fn new(buffer: &'buf mut [u16]) -> Result<Self, BackendError> {
        Ok(Self {
            backend: Backend::new(buffer)?,
        })
    }

    /// `fn(src, iterations)` reading `unroll` vectors per iteration.
    pub fn generate(&mut self, unroll: u32) -> Generated<'_, StreamFn> {
        let backend = &mut self.backend;
        backend.reset_kernel();
        if !(1..=MAX_UNROLL).contains(&unroll) {
            backend.record(Fault::InvalidShape {
                reason: format!("unroll {unroll} outside 1..={MAX_UNROLL}"),
            });
        } else {
            backend.emit(&Push {
                regs: RegSet::of(&[Reg::R7, Reg::Lr]),
            });
            let start = backend.add_branch_placeholder(Width::Wide);
            let body = backend.mark();
            for i in 0..unroll {
                backend.emit(&VecMem {
                    op: MemOp::Load,
                    qd: QReg::from_field((i % 4) as u16),
                    rn: SRC,
                    offset: 16,
                    indexing: Indexing::PostIndex,
                });
            }
            backend.loop_end(body, false);
            backend.bind(start, |exit| LoopStart {
                kind: LoopKind::While { exit },
                rn: ITERATIONS,
                tail: None,
            });
            backend.emit(&Pop {
                regs: RegSet::of(&[Reg::R7, Reg::Pc]),
            });
        }
        backend.finish();
        self.backend.generated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv81m::decoder::{decode, Op};
    use crate::armv81m::encoder::BX_LR;

    #[test]
    fn test_unrolled_loads() {
        let mut buffer = [0u16; 64];
        let mut generator = StreamGenerator::new(&mut buffer).unwrap();
        let generated = generator.generate(5);
        assert!(generated.is_valid());
        let code = generated.code();
        // push, wls, 5 loads, le, pop
        assert_eq!(code.len(), 1 + 2 + 10 + 2 + 1);
        assert_eq!(
            decode(&code[1..]).unwrap().op,
            Op::LoopStart {
                rn: ITERATIONS,
                tail: None,
                exit: Some(24),
            }
        );
        assert_eq!(
            decode(&code[11..]).unwrap().op,
            Op::VecMem {
                op: MemOp::Load,
                qd: QReg::Q0,
                rn: SRC,
                offset: 16,
                indexing: Indexing::PostIndex,
            }
        );
    }

    #[test]
    fn test_unroll_out_of_range() {
        let mut buffer = [0u16; 64];
        let mut generator = StreamGenerator::new(&mut buffer).unwrap();
        let generated = generator.generate(0);
        assert_eq!(generated.code(), &[BX_LR]);
        assert!(!generated.is_valid());
    }
}
