//! Armv8.1-M (Thumb-2 + MVE) specific components.
//!
//! This module contains everything that knows about the target instruction set:
//! - Instruction encoding (`encoder`), one record per instruction family
//! - Decoding and disassembly of the emitted subset (`decoder`)
//! - The instruction buffer with branch fixups (`backend`)
//! - Exposing a finished buffer as a callable (`exec`)

pub mod backend;
pub mod decoder;
pub mod encoder;
pub mod exec;

pub use backend::{Backend, BranchTarget, Generated, Placeholder, Position, MIN_CAPACITY};
pub use decoder::{decode, disassemble, DecodeError, Decoded, Op};
pub use encoder::{
    can_encode_constant, encode, encode_constant, expand_constant, Cond, Encode, Indexing,
    Instr, LaneSize, MemOp, Width,
};
pub use exec::{
    ConstantF32Fn, ConstantFn, GemmFn, Kernel, KernelAbi, PeakFn, StreamFn, TriadFn,
};
