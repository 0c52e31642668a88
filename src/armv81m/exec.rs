//! Handing generated code to the processor.
//!
//! This module is the crate's single unsafe boundary: it issues the barriers that
//! make freshly written instructions visible to instruction fetch, and on Arm
//! targets it turns the Thumb entry address into a typed function pointer.

use std::marker::PhantomData;

/// `C += A * B` over column-major tiles of a fixed shape.
pub type GemmFn = extern "C" fn(a: *const f32, b: *const f32, c: *mut f32);

/// `out[i] = a[i] * s + b[i]` for `i < len`.
pub type TriadFn = extern "C" fn(a: *const f32, b: *const f32, out: *mut f32, len: u32);

/// Streams `iterations` unrolled vector loads from `src`.
pub type StreamFn = extern "C" fn(src: *const f32, iterations: u32);

/// Runs `iterations` rounds of the fixed FMA chain.
pub type PeakFn = extern "C" fn(iterations: u32);

/// Returns a constant integer.
pub type ConstantFn = extern "C" fn() -> i32;

/// Returns a constant float in `s0`.
pub type ConstantF32Fn = extern "C" fn() -> f32;

mod sealed {
    pub trait Sealed {}
}

/// Calling conventions a generated kernel can be exposed as.
pub trait KernelAbi: sealed::Sealed + Copy {}

macro_rules! kernel_abi {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}
            impl KernelAbi for $ty {}
            const _: () = assert!(std::mem::size_of::<$ty>() == std::mem::size_of::<usize>());
        )*
    };
}

kernel_abi!(GemmFn, TriadFn, StreamFn, PeakFn, ConstantFn, ConstantF32Fn);

/// Make buffer writes visible to instruction fetch.
pub fn synchronize_instruction_stream() {
    #[cfg(target_arch = "arm")]
    // SAFETY: DSB and ISB only order memory and the pipeline.
    unsafe {
        std::arch::asm!("dsb sy", "isb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "arm"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// A finished kernel, borrowed from the buffer it was written into.
#[derive(Debug)]
pub struct Kernel<'buf, F> {
    code: &'buf [u16],
    _abi: PhantomData<F>,
}

impl<'buf, F: KernelAbi> Kernel<'buf, F> {
    pub(crate) fn new(code: &'buf [u16]) -> Self {
        Self {
            code,
            _abi: PhantomData,
        }
    }

    /// Emitted half-words.
    pub fn code(&self) -> &'buf [u16] {
        self.code
    }

    pub fn len_bytes(&self) -> usize {
        self.code.len() * 2
    }

    /// Entry address with the Thumb bit set.
    pub fn entry_address(&self) -> usize {
        self.code.as_ptr() as usize | 1
    }

    /// Typed entry point.
    ///
    /// The buffer must live in memory the processor may execute from.
    #[cfg(target_arch = "arm")]
    pub fn function(&self) -> F {
        let entry = self.entry_address();
        // SAFETY: F is one of the pointer-sized `extern "C" fn` types above and the
        // barriers were issued when the kernel was exposed.
        unsafe { std::mem::transmute_copy::<usize, F>(&entry) }
    }
}
