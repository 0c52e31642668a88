//! Peak FMA throughput generator.

use crate::armv81m::backend::{Backend, Generated};
use crate::armv81m::encoder::{LoopKind, LoopStart, VfmaVector, VmovImm, Width};
use crate::armv81m::exec::PeakFn;
use crate::core::error::{BackendError, Fault};
use crate::core::register_file::{QReg, Reg, RegSet};

use super::emit::{restore_and_return, save_callee};

/// Longest FMA chain per loop iteration.
pub const MAX_FMA_COUNT: u32 = 256;

/// Independent accumulators the chain rotates through.
pub const ACCUMULATORS: u32 = 6;

/// The two multiplicands: 0.5 and 2.0, whose product is exactly one.
const HALF: u32 = 0x3F00_0000;
const TWO: u32 = 0x4000_0000;

const ITERATIONS: Reg = Reg::R0;

#[derive(Debug)]
pub struct PeakGenerator<'buf> {
    backend: Backend<'buf>,
}

impl<'buf> PeakGenerator<'buf> {
    pub fn new(buffer: &'buf mut [u16]) -> Result<Self, BackendError> {
        Ok(Self {
            backend: Backend::new(buffer)?,
        })
    }

    /// `fn(iterations)` running `fma_count` VFMA.F32 per iteration with no memory
    /// traffic; accumulator `q(i mod 6)` gains 1.0 per FMA it receives.
    pub fn generate(&mut self, fma_count: u32) -> Generated<'_, PeakFn> {
        let backend = &mut self.backend;
        backend.reset_kernel();
        if !(1..=MAX_FMA_COUNT).contains(&fma_count) {
            backend.record(Fault::InvalidShape {
                reason: format!("fma count {fma_count} outside 1..={MAX_FMA_COUNT}"),
            });
            backend.finish();
            return self.backend.generated();
        }

        let frame = RegSet::of(&[Reg::R7]);
        save_callee(backend, frame, true);
        for q in 0..ACCUMULATORS {
            backend.emit(&VmovImm {
                qd: QReg::from_field(q as u16),
                value: 0,
            });
        }
        backend.emit(&VmovImm { qd: QReg::Q6, value: HALF });
        backend.emit(&VmovImm { qd: QReg::Q7, value: TWO });

        let start = backend.add_branch_placeholder(Width::Wide);
        let body = backend.mark();
        for i in 0..fma_count {
            backend.emit(&VfmaVector {
                qd: QReg::from_field((i % ACCUMULATORS) as u16),
                qn: QReg::Q6,
                qm: QReg::Q7,
            });
        }
        backend.loop_end(body, false);
        backend.bind(start, |exit| LoopStart {
            kind: LoopKind::While { exit },
            rn: ITERATIONS,
            tail: None,
        });
        restore_and_return(backend, frame, true);
        backend.finish();
        self.backend.generated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv81m::decoder::{decode, disassemble, Op};

    #[test]
    fn test_chain_rotates_accumulators() {
        let mut buffer = [0u16; 128];
        let mut generator = PeakGenerator::new(&mut buffer).unwrap();
        let generated = generator.generate(8);
        assert!(generated.is_valid(), "{:?}", generated.faults());
        let listing = disassemble(generated.code());
        assert!(listing.iter().any(|line| line.ends_with("vmov.i32 q6, #0x3f000000")));
        let fmas: Vec<String> = listing
            .iter()
            .filter(|line| line.contains("vfma.f32"))
            .cloned()
            .collect();
        assert_eq!(fmas.len(), 8);
        assert!(fmas[6].ends_with("vfma.f32 q0, q6, q7"));
        assert!(fmas[7].ends_with("vfma.f32 q1, q6, q7"));
    }

    #[test]
    fn test_saves_vector_registers() {
        let mut buffer = [0u16; 128];
        let mut generator = PeakGenerator::new(&mut buffer).unwrap();
        let generated = generator.generate(1);
        let code = generated.code();
        assert_eq!(decode(&code[1..]).unwrap().op, Op::VPush { first: 8, count: 8 });
        assert_eq!(generator.generate(MAX_FMA_COUNT + 1).faults().len(), 1);
    }
}
