//! mvejit - runtime code generation for Armv8.1-M with Helium.
//!
//! The crate writes Thumb-2 and MVE machine code straight into a caller-provided
//! half-word buffer. Its main product is a single precision GEMM kernel specialized
//! for one problem shape (`C += A * B`, column-major, leading dimensions known at
//! generation time); a few smaller generators produce streaming triad, sequential
//! load and peak FMA microbenchmarks plus constant-returning functions.
//!
//! # Primary Usage
//!
//! ```
//! use mvejit::config::GemmShape;
//! use mvejit::kernels::GemmGenerator;
//!
//! let mut buffer = vec![0u16; 4096];
//! let mut generator = GemmGenerator::new(&mut buffer)?;
//! let generated = generator.generate(GemmShape::new(12, 4, 5));
//! assert!(generated.is_valid());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Register names, register sets and error types
//! - [`armv81m`] - Encoders, decoder, instruction buffer and callable exposure
//! - [`kernels`] - GEMM, triad, sequential, peak and constant generators
//! - [`config`] - Kernel shapes and tiling parameters
//! - [`sim`] - Host-side interpreter for the emitted instruction subset
//! - [`reference`] - Naive oracle used to check generated kernels
//! - [`elf`] - ARM ELF relocatable export of a generated kernel

pub mod armv81m;
pub mod config;
pub mod core;
pub mod elf;
pub mod kernels;
pub mod reference;
pub mod sim;

pub use armv81m::{Backend, Generated, Kernel};
pub use config::{GemmConfig, GemmShape};
pub use crate::core::{Fault, GenerateError};
pub use kernels::{ConstantGenerator, GemmGenerator, PeakGenerator, StreamGenerator, TriadGenerator};
