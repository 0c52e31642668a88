// This module collects the target-independent pieces shared by the encoders, the
// instruction buffer and the kernel generators: register names with a compact bit set
// over the scalar register file, and the error and fault types every layer reports
// through. Nothing in here emits code.

//! Shared register and error types.

pub mod error;
pub mod register_file;

pub use error::{BackendError, EncodingError, Fault, GenerateError, GenerateResult};
pub use register_file::{QReg, Reg, RegSet, SReg};
