//! Convenience runners that lay out operands, call a kernel and collect the results.

use log::debug;

use super::{Machine, SimError};
use crate::config::GemmShape;

pub const A_BASE: u32 = 0x2000_0000;
pub const B_BASE: u32 = 0x2400_0000;
pub const C_BASE: u32 = 0x2800_0000;

/// Words mapped past the end of every output array.
pub const CANARY_WORDS: usize = 8;
pub const CANARY: u32 = 0xCAFE_F00D;

/// Outcome of one simulated GEMM call.
#[derive(Debug, Clone, PartialEq)]
pub struct GemmRun {
    /// `C` after the call, `ldc * n` floats.
    pub c: Vec<f32>,
    /// The words after `C` were not written.
    pub canary_intact: bool,
    /// R4-R11, SP and Q4-Q7 were restored.
    pub callee_saved_intact: bool,
    pub steps: u64,
}

fn map_output(machine: &mut Machine, base: u32, values: &[f32]) -> Result<(), SimError> {
    let mut bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    for _ in 0..CANARY_WORDS {
        bytes.extend_from_slice(&CANARY.to_le_bytes());
    }
    machine.memory_mut().map(base, bytes, true)
}

fn canary_intact(machine: &Machine, end: u32) -> Result<bool, SimError> {
    for i in 0..CANARY_WORDS as u32 {
        if machine.memory().read_u32(end + 4 * i)? != CANARY {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Run a GEMM kernel for `shape` on column-major `a`, `b` and `c`.
///
/// `A` and `B` are mapped read-only and exactly as long as the shape says, so any
/// stray access fails the run.
pub fn run_gemm(
    code: &[u16],
    shape: &GemmShape,
    a: &[f32],
    b: &[f32],
    c: &[f32],
) -> Result<GemmRun, SimError> {
    let mut machine = Machine::new();
    machine.memory_mut().map_f32s(A_BASE, &a[..shape.a_len()], false)?;
    machine.memory_mut().map_f32s(B_BASE, &b[..shape.b_len()], false)?;
    let c = &c[..shape.c_len()];
    map_output(&mut machine, C_BASE, c)?;

    let before = machine.clone();
    machine.call(code, &[A_BASE, B_BASE, C_BASE])?;
    debug!(
        "gemm {}x{}x{} ran {} instructions",
        shape.m,
        shape.k,
        shape.n,
        machine.steps()
    );

    Ok(GemmRun {
        c: machine.memory().read_f32s(C_BASE, c.len())?,
        canary_intact: canary_intact(&machine, C_BASE + 4 * c.len() as u32)?,
        callee_saved_intact: machine.callee_saved_match(&before),
        steps: machine.steps(),
    })
}

/// Run a triad kernel over the first `len` elements of `a` and `b`.
///
/// Fails with [`SimError::Unmapped`] if the kernel writes a canary word.
pub fn run_triad(code: &[u16], a: &[f32], b: &[f32], len: usize) -> Result<Vec<f32>, SimError> {
    let mut machine = Machine::new();
    machine.memory_mut().map_f32s(A_BASE, &a[..len], false)?;
    machine.memory_mut().map_f32s(B_BASE, &b[..len], false)?;
    map_output(&mut machine, C_BASE, &vec![0.0; len])?;

    machine.call(code, &[A_BASE, B_BASE, C_BASE, len as u32])?;
    if !canary_intact(&machine, C_BASE + 4 * len as u32)? {
        return Err(SimError::Unmapped {
            address: C_BASE + 4 * len as u32,
            size: 4,
            access: "write",
        });
    }
    machine.memory().read_f32s(C_BASE, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_output_places_canary() {
        let mut machine = Machine::new();
        map_output(&mut machine, C_BASE, &[1.0, 2.0]).unwrap();
        assert_eq!(machine.memory().read_u32(C_BASE + 8), Ok(CANARY));
        assert_eq!(canary_intact(&machine, C_BASE + 8), Ok(true));
        machine.memory_mut().write_u32(C_BASE + 12, 0).unwrap();
        assert_eq!(canary_intact(&machine, C_BASE + 8), Ok(false));
    }
}
