//! Kernel generators.
//!
//! Every generator owns a [`Backend`](crate::armv81m::Backend) over a caller-provided
//! buffer and regenerates into it from the start on each `generate` call. The returned
//! [`Generated`](crate::armv81m::Generated) borrows the generator, so a kernel cannot
//! outlive the next regeneration of its buffer.
//!
//! - [`gemm`] - shape-specialized single precision GEMM
//! - [`triad`] - streaming `out = a * s + b` with tail predication
//! - [`stream`] - sequential vector loads without compute
//! - [`peak`] - register-only FMA chain
//! - [`constant`] - functions returning a fixed value

pub mod constant;
mod emit;
pub mod gemm;
pub mod peak;
pub mod strategy;
pub mod stream;
pub mod triad;

pub use constant::ConstantGenerator;
pub use gemm::{GemmGenerator, Regime};
pub use peak::PeakGenerator;
pub use strategy::Strategy;
pub use stream::StreamGenerator;
pub use triad::TriadGenerator;
