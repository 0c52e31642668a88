//! Functions that return a constant.

use crate::armv81m::backend::{Backend, Generated};
use crate::armv81m::encoder::{Bx, VmovSr};
use crate::armv81m::exec::{ConstantF32Fn, ConstantFn};
use crate::core::error::BackendError;
use crate::core::register_file::{Reg, SReg};

use super::emit::load_constant;

#[derive(Debug)]
pub struct ConstantGenerator<'buf> {
    backend: Backend<'buf>,
}

impl<'buf> ConstantGenerator<'buf> {
    pub fn new(buffer: &'buf mut [u16]) -> Result<Self, BackendError> {
        Ok(Self {
            backend: Backend::new(buffer)?,
        })
    }

    /// `fn() -> i32` returning `value` in R0.
    pub fn generate(&mut self, value: i32) -> Generated<'_, ConstantFn> {
        self.backend.reset_kernel();
        load_constant(&mut self.backend, Reg::R0, value as u32);
        self.backend.emit(&Bx { rm: Reg::Lr });
        self.backend.finish();
        self.backend.generated()
    }

    /// `fn() -> f32` returning `value` in S0 (hard-float calling convention).
    pub fn generate_f32(&mut self, value: f32) -> Generated<'_, ConstantF32Fn> {
        self.backend.reset_kernel();
        load_constant(&mut self.backend, Reg::R0, value.to_bits());
        self.backend.emit(&VmovSr {
            sd: SReg::S0,
            rt: Reg::R0,
        });
        self.backend.emit(&Bx { rm: Reg::Lr });
        self.backend.finish();
        self.backend.generated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv81m::encoder::BX_LR;

    #[test]
    fn test_small_constant() {
        let mut buffer = [0u16; 8];
        let mut generator = ConstantGenerator::new(&mut buffer).unwrap();
        let generated = generator.generate(42);
        assert!(generated.is_valid());
        assert_eq!(generated.code(), &[0x202A, BX_LR]);
    }

    #[test]
    fn test_negative_constant() {
        let mut buffer = [0u16; 8];
        let mut generator = ConstantGenerator::new(&mut buffer).unwrap();
        // 0xFFFFFFFF is a splat of 0xFF.
        assert_eq!(generator.generate(-1).code(), &[0xF04F, 0x30FF, BX_LR]);
        // MOVW r0, #0xFFFE; MOVT r0, #0xFFFF
        assert_eq!(
            generator.generate(-2).code(),
            &[0xF64F, 0x70FE, 0xF6CF, 0x70FF, BX_LR]
        );
    }

    #[test]
    fn test_float_constant() {
        let mut buffer = [0u16; 8];
        let mut generator = ConstantGenerator::new(&mut buffer).unwrap();
        let generated = generator.generate_f32(1.0);
        assert!(generated.is_valid());
        // MOV.W r0, #0x3F800000; VMOV s0, r0; BX LR
        assert_eq!(generated.code(), &[0xF04F, 0x507E, 0xEE00, 0x0A10, BX_LR]);
    }
}
