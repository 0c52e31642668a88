// This module decides, before any GEMM code is emitted, which problem-dependent values
// live in registers and which stay encoded as immediates. Most strides and offsets of a
// realistic problem fit the immediate fields of the load, add and compare instructions
// the microkernel uses; the ones that do not claim a register from a small pool of
// scalars the fixed register roles leave free. The pool holds R10-R12, the m and n index
// registers when their loop is not emitted, and the B scalar registers a narrow tile does
// not need. Values claim registers in a fixed priority order (B column stride, A column
// stride, C column bases, loop bounds), so the choice is deterministic for a shape. A
// value that needs a register and cannot get one falls back to another immediate form
// where one exists; otherwise it is reported as unavailable and rematerialized at every
// use in a register that is dead at that point of the kernel. The kernel stays correct
// and only grows.

use std::fmt;

use log::debug;

use crate::armv81m::encoder::{can_encode_constant, VEC_OFFSET_MAX};
use crate::config::GemmShape;
use crate::core::register_file::{Reg, RegSet};

/// A tile pointer, advanced by the loops around the microkernel.
pub const A_TILE: Reg = Reg::R0;
pub const B_TILE: Reg = Reg::R1;
pub const C_TILE: Reg = Reg::R2;
/// Walks A inside the microkernel; constant scratch outside of it.
pub const A_WALK: Reg = Reg::R3;
pub const B_WALK: Reg = Reg::R4;
/// Broadcast B value of tile column `j`.
pub const B_SCALARS: [Reg; 3] = [Reg::R5, Reg::R6, Reg::R7];
pub const M_INDEX: Reg = Reg::R8;
pub const N_INDEX: Reg = Reg::R9;

/// Largest `LDR.W Rt, [Rn, #imm12]` and `ADDW` immediate.
pub const IMM12_MAX: u32 = 0xFFF;

/// Loop structure of one kernel, as far as register usage is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub m_loop: bool,
    pub n_loop: bool,
    /// Tallest microkernel emitted.
    pub max_tile_m: u32,
    /// Widest microkernel emitted.
    pub max_tile_n: u32,
    /// Rows covered by full m tiles; the m loop exits when the index reaches it.
    pub m_bound: u32,
    /// Columns covered by full n tiles.
    pub n_bound: u32,
}

/// How the A walk register moves to the next column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AStride {
    /// Writeback of the last A vector load.
    PostIndex(u32),
    /// `ADDW`.
    Plain(u32),
    /// `ADD.W` with a modified immediate.
    Modified(u32),
    Register(Reg),
    /// Rebuilt in the column 0 B scalar before each advance.
    Scratch(u32),
}

/// How columns `1..nt` of B are addressed from the B walk register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BStride {
    /// `LDR Rt, [Rb, #j*ldb*4]`.
    Offset(u32),
    /// `LDR Rt, [Rb, Rs, LSL #(j-1)]` with `Rs = ldb*4`.
    Register(Reg),
    /// Address of column `j` built in its own B scalar register.
    Scratch(u32),
}

/// Base of C column `j` of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CColumn {
    /// Reached from the C tile pointer with a vector load offset.
    Offset(u32),
    /// Register recomputed at each microkernel entry.
    Register(Reg),
    /// Rebuilt in the column's B scalar register before the C loads and again before
    /// the C stores.
    Scratch(u32),
}

/// How a loop index is compared against its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// No loop, nothing to compare.
    Absent,
    /// `CMP.W` with a modified immediate.
    Immediate(u32),
    Register(Reg),
    /// Loaded into the A walk register at the loop tail.
    Scratch(u32),
}

/// Register assignment for one GEMM kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub a_stride: AStride,
    pub b_stride: BStride,
    /// Columns 1 and 2 of the widest tile.
    pub c_columns: [CColumn; 2],
    pub m_bound: Bound,
    pub n_bound: Bound,
    /// Registers set up once after the prologue, with their values.
    pub preloads: Vec<(Reg, u32)>,
    /// Values that needed a register and got none; they are rematerialized per use.
    pub unavailable: Vec<&'static str>,
    /// Pool registers left over.
    pub spare: RegSet,
}

impl Strategy {
    /// Whether every value got a register or an immediate form.
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    /// How C column `j` (1 or 2) of a tile is addressed.
    pub fn c_column(&self, j: u32) -> CColumn {
        self.c_columns[j as usize - 1]
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a {:?}, b {:?}, c {:?}, m {:?}, n {:?}, spare {}",
            self.a_stride, self.b_stride, self.c_columns, self.m_bound, self.n_bound, self.spare
        )
    }
}

/// Registers the fixed roles leave free for `layout`.
pub fn pool(layout: &Layout) -> RegSet {
    let mut pool = RegSet::of(&[Reg::R10, Reg::R11, Reg::R12]);
    if !layout.m_loop {
        pool.set(M_INDEX);
    }
    if !layout.n_loop {
        pool.set(N_INDEX);
    }
    for (j, &reg) in B_SCALARS.iter().enumerate().skip(1) {
        if layout.max_tile_n <= j as u32 {
            pool.set(reg);
        }
    }
    pool
}

struct Claims {
    pool: RegSet,
    preloads: Vec<(Reg, u32)>,
    unavailable: Vec<&'static str>,
}

impl Claims {
    /// A register for `name`, loaded with `value` after the prologue when given.
    fn take(&mut self, name: &'static str, value: Option<u32>) -> Option<Reg> {
        let reg = self.pool.take_first();
        match (reg, value) {
            (Some(reg), Some(value)) => self.preloads.push((reg, value)),
            (Some(_), None) => {}
            (None, _) => self.unavailable.push(name),
        }
        reg
    }

    fn bound(&mut self, active: bool, value: u32, name: &'static str) -> Bound {
        if !active {
            return Bound::Absent;
        }
        if can_encode_constant(value) {
            return Bound::Immediate(value);
        }
        self.take(name, Some(value))
            .map_or(Bound::Scratch(value), Bound::Register)
    }
}

/// Assign registers for `shape` under `layout`.
pub fn plan(shape: &GemmShape, layout: &Layout) -> Strategy {
    plan_with_pool(shape, layout, pool(layout))
}

pub(crate) fn plan_with_pool(shape: &GemmShape, layout: &Layout, pool: RegSet) -> Strategy {
    let mut claims = Claims {
        pool,
        preloads: Vec::new(),
        unavailable: Vec::new(),
    };
    let a_bytes = shape.lda * 4;
    let b_bytes = shape.ldb * 4;
    let c_bytes = shape.ldc * 4;
    let vectors = layout.max_tile_m.div_ceil(4);

    let b_stride = if layout.max_tile_n < 2 || (layout.max_tile_n - 1) * b_bytes <= IMM12_MAX {
        BStride::Offset(b_bytes)
    } else {
        claims
            .take("the B column stride", Some(b_bytes))
            .map_or(BStride::Scratch(b_bytes), BStride::Register)
    };

    let a_stride = if a_bytes <= VEC_OFFSET_MAX as u32 {
        AStride::PostIndex(a_bytes)
    } else if a_bytes <= IMM12_MAX {
        AStride::Plain(a_bytes)
    } else if let Some(reg) = claims.pool.take_first() {
        claims.preloads.push((reg, a_bytes));
        AStride::Register(reg)
    } else if can_encode_constant(a_bytes) {
        AStride::Modified(a_bytes)
    } else {
        claims.unavailable.push("the A column stride");
        AStride::Scratch(a_bytes)
    };

    let mut c_columns = [CColumn::Offset(0); 2];
    for (slot, j) in c_columns.iter_mut().zip(1u32..) {
        let offset = j * c_bytes;
        *slot = if j >= layout.max_tile_n || offset + 16 * (vectors - 1) <= VEC_OFFSET_MAX as u32 {
            CColumn::Offset(offset)
        } else {
            let name = if j == 1 { "the C column 1 base" } else { "the C column 2 base" };
            claims
                .take(name, None)
                .map_or(CColumn::Scratch(offset), CColumn::Register)
        };
    }

    let m_bound = claims.bound(layout.m_loop, layout.m_bound, "the m loop bound");
    let n_bound = claims.bound(layout.n_loop, layout.n_bound, "the n loop bound");

    let strategy = Strategy {
        a_stride,
        b_stride,
        c_columns,
        m_bound,
        n_bound,
        preloads: claims.preloads,
        unavailable: claims.unavailable,
        spare: claims.pool,
    };
    debug!("register strategy: {strategy}");
    strategy
}
