// This module defines the error types shared by the encoders, the instruction buffer and
// the kernel generators, using the thiserror crate. EncodingError is returned by the
// per-family assemble step when an operand does not fit the selected encoding; it never
// aborts generation on its own, the fail-soft encode path substitutes a no-op instead.
// Fault is what the backend records while a kernel is being generated. Soft faults leave
// a no-op in the stream; fatal faults (buffer exhaustion, branch displacement overflow,
// invalid shapes, mismatched placeholder patches) make the backend replace the whole
// kernel with a single return instruction when generation finishes. GenerateError
// carries the recorded faults for callers that prefer a Result.

//! Error types for instruction encoding and kernel generation.

use thiserror::Error;

use super::register_file::{Reg, RegSet};
use crate::armv81m::encoder::Width;

/// Operand validation failure reported by an instruction family's assemble step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("{reg} is not a low register (r0-r7)")]
    LowRegisterRequired { reg: Reg },

    #[error("{reg} cannot be used as {role}")]
    RegisterNotAllowed { reg: Reg, role: &'static str },

    #[error("immediate {value} outside {min}..={max}")]
    ImmediateOutOfRange { value: i64, min: i64, max: i64 },

    #[error("immediate {value} is not a multiple of {align}")]
    Misaligned { value: i64, align: u32 },

    #[error("{value:#010x} is not a modified immediate constant")]
    NotModifiedImmediate { value: u32 },

    #[error("{value:#010x} is not a shifted byte splat")]
    NotSplatImmediate { value: u32 },

    #[error("branch offset {offset} outside {min}..={max}")]
    BranchOutOfRange { offset: i32, min: i32, max: i32 },

    #[error("branch offset {offset} is odd")]
    OddBranchOffset { offset: i32 },

    #[error("invalid register list {list}")]
    InvalidRegisterList { list: RegSet },

    #[error("invalid register range d{first}+{count}")]
    InvalidRegisterRange { first: u8, count: u8 },

    #[error("VPST covers 1 to 4 instructions, got {count}")]
    InvalidPredicateCount { count: u8 },
}

/// Problem recorded by the backend while generating a kernel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("encoding failed at half-word {at}: {error}")]
    Encoding {
        at: usize,
        #[source]
        error: EncodingError,
    },

    #[error("no spare register left for {value}")]
    RegisterUnavailable { value: &'static str },

    #[error("displacement {displacement} from half-word {from} to {to} does not fit {instruction}")]
    DisplacementOverflow {
        from: usize,
        to: usize,
        displacement: i32,
        instruction: &'static str,
    },

    #[error("instruction buffer full ({capacity} half-words)")]
    CapacityExceeded { capacity: usize },

    #[error("invalid kernel shape: {reason}")]
    InvalidShape { reason: String },

    #[error("placeholder at half-word {at} is {expected:?} but the patch is {found:?}")]
    PlaceholderWidth {
        at: usize,
        expected: Width,
        found: Width,
    },
}

impl Fault {
    /// Fatal faults invalidate the whole kernel.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Fault::Encoding { .. } | Fault::RegisterUnavailable { .. })
    }
}

/// Backend construction failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("buffer of {capacity} half-words is smaller than the {minimum} half-word minimum")]
    BufferTooSmall { capacity: usize, minimum: usize },
}

/// Generation finished with faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "kernel generation recorded {} fault(s), first: {}",
    .faults.len(),
    .faults.first().map(ToString::to_string).unwrap_or_default()
)]
pub struct GenerateError {
    pub faults: Vec<Fault>,
}

/// Result type alias for generation.
pub type GenerateResult<T> = Result<T, GenerateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_severity() {
        let soft = Fault::Encoding {
            at: 3,
            error: EncodingError::LowRegisterRequired { reg: Reg::R9 },
        };
        assert!(!soft.is_fatal());
        assert!(!Fault::RegisterUnavailable { value: "m bound" }.is_fatal());
        assert!(Fault::CapacityExceeded { capacity: 8 }.is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = EncodingError::NotModifiedImmediate { value: 0x101 };
        assert_eq!(err.to_string(), "0x00000101 is not a modified immediate constant");

        let err = GenerateError {
            faults: vec![Fault::CapacityExceeded { capacity: 16 }],
        };
        assert!(err.to_string().contains("1 fault(s)"));
    }
}
