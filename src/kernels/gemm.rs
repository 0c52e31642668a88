// This module generates single precision GEMM kernels (C += A * B, column-major) that
// are specialized for one problem shape. Every dimension and leading dimension is known
// at generation time, so loop trip counts, strides and tile remainders are folded into
// the instruction stream. The problem is covered by register-blocked microkernels of at
// most 16x1 or 8x3 elements: the A column slice lives in up to four vector registers,
// each C column of the tile in as many accumulators, and one B value per tile column is
// broadcast from a scalar register into VFMA.F32. Depending on m and n the kernel is a
// single microkernel, a loop over m, a loop over n, or an n loop around an m loop, with
// trailing microkernels for the remainders so every element of C is updated exactly
// once. Inside a microkernel the k loop is a low-overhead DLS/LE loop with the first and
// last steps peeled so that pointer updates happen only where needed. Rows that do not
// fill a whole vector are handled with VCTP and VPST predication, so the kernel never
// reads or writes memory outside the operands.

//! GEMM kernel generation.

use log::debug;

use super::emit::{add_constant, load_constant, restore_and_return, save_callee};
use super::strategy::{
    self, AStride, BStride, Bound, CColumn, Layout, Strategy, A_TILE, A_WALK, B_SCALARS,
    B_TILE, B_WALK, C_TILE, M_INDEX, N_INDEX,
};
use crate::armv81m::backend::{Backend, Generated};
use crate::armv81m::encoder::{
    AddSub, AddSubImm, AddSubImmForm, AddSubReg, AddSubRegForm, CmpImm, CmpImmForm, CmpReg,
    Cond, Indexing, LaneSize, LdrImm, LdrImmForm, LdrReg, LoopKind, LoopStart, MemOp, MovImm,
    MovImmForm, MovReg, VecMem, VfmaScalar, Vctp, Vpst,
};
use crate::armv81m::exec::GemmFn;
use crate::config::{GemmConfig, GemmShape};
use crate::core::error::{BackendError, Fault};
use crate::core::register_file::{QReg, Reg, RegSet};

/// How the microkernels are arranged over the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// One microkernel covers all of C.
    Single,
    /// Loop over row blocks of `tile_m`, all n columns at once.
    MLoop { tile_m: u32 },
    /// Loop over column blocks of `tile_n`, all m rows at once.
    NLoop { tile_n: u32 },
    /// Column blocks outside, row blocks inside.
    Nested { tile_m: u32, tile_n: u32 },
}

impl Regime {
    pub fn select(shape: &GemmShape, config: &GemmConfig) -> Regime {
        let (m, n) = (shape.m, shape.n);
        if (m <= config.column_tile_m && n == 1) || (m <= config.tile_m && n <= config.tile_n) {
            Regime::Single
        } else if n <= config.tile_n {
            let tile_m = if n == 1 { config.column_tile_m } else { config.tile_m };
            Regime::MLoop { tile_m }
        } else if m <= config.tile_m {
            Regime::NLoop {
                tile_n: config.tile_n,
            }
        } else {
            Regime::Nested {
                tile_m: config.tile_m,
                tile_n: config.tile_n,
            }
        }
    }

    pub fn layout(&self, shape: &GemmShape) -> Layout {
        let (m, n) = (shape.m, shape.n);
        let full = |total: u32, tile: u32| total - total % tile;
        match *self {
            Regime::Single => Layout {
                m_loop: false,
                n_loop: false,
                max_tile_m: m,
                max_tile_n: n,
                m_bound: 0,
                n_bound: 0,
            },
            Regime::MLoop { tile_m } => Layout {
                m_loop: true,
                n_loop: false,
                max_tile_m: tile_m,
                max_tile_n: n,
                m_bound: full(m, tile_m),
                n_bound: 0,
            },
            Regime::NLoop { tile_n } => Layout {
                m_loop: false,
                n_loop: true,
                max_tile_m: m,
                max_tile_n: tile_n,
                m_bound: 0,
                n_bound: full(n, tile_n),
            },
            Regime::Nested { tile_m, tile_n } => Layout {
                m_loop: true,
                n_loop: true,
                max_tile_m: tile_m,
                max_tile_n: tile_n,
                m_bound: full(m, tile_m),
                n_bound: full(n, tile_n),
            },
        }
    }
}

/// Generates GEMM kernels into a caller-owned buffer.
#[derive(Debug)]
pub struct GemmGenerator<'buf> {
    backend: Backend<'buf>,
    config: GemmConfig,
}

impl<'buf> GemmGenerator<'buf> {
    pub fn new(buffer: &'buf mut [u16]) -> Result<Self, BackendError> {
        Self::with_config(buffer, GemmConfig::default())
    }

    pub fn with_config(buffer: &'buf mut [u16], config: GemmConfig) -> Result<Self, BackendError> {
        Ok(Self {
            backend: Backend::new(buffer)?,
            config,
        })
    }

    pub fn config(&self) -> &GemmConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.backend.capacity()
    }

    /// Generate the kernel for `shape`, replacing whatever the buffer held.
    ///
    /// Never fails outright: problems are reported through the returned faults, and a
    /// fatal one leaves a kernel that returns immediately.
    pub fn generate(&mut self, shape: GemmShape) -> Generated<'_, GemmFn> {
        self.backend.reset_kernel();
        let checked = self
            .config
            .validate()
            .map_err(|err| format!("tiling: {err}"))
            .and_then(|()| shape.validate());
        match checked {
            Err(reason) => self.backend.record(Fault::InvalidShape { reason }),
            Ok(()) => {
                let regime = Regime::select(&shape, &self.config);
                let layout = regime.layout(&shape);
                debug!(
                    "gemm m={} k={} n={} lda={} ldb={} ldc={}: {regime:?}",
                    shape.m, shape.k, shape.n, shape.lda, shape.ldb, shape.ldc
                );
                let strategy = strategy::plan(&shape, &layout);
                KernelEmitter {
                    backend: &mut self.backend,
                    shape,
                    strategy,
                }
                .emit(regime);
            }
        }
        self.backend.finish();
        self.backend.generated()
    }
}

/// Registers and vector slots of one microkernel.
#[derive(Debug, Clone, Copy)]
struct Tile {
    nt: u32,
    vectors: u32,
    tail: u32,
}

impl Tile {
    fn new(mt: u32, nt: u32) -> Self {
        Self {
            nt,
            vectors: mt.div_ceil(4),
            tail: mt % 4,
        }
    }

    /// Index of the vector that holds fewer than four rows.
    fn partial(&self) -> Option<u32> {
        (self.tail != 0).then(|| self.vectors - 1)
    }

    fn a(&self, i: u32) -> QReg {
        QReg::from_field(i as u16)
    }

    fn acc(&self, i: u32, j: u32) -> QReg {
        QReg::from_field((self.vectors * (j + 1) + i) as u16)
    }
}

/// What the n loop runs for each block of columns.
#[derive(Debug, Clone, Copy)]
enum Columns {
    Microkernel,
    MLoop { tile_m: u32 },
}

struct KernelEmitter<'a, 'buf> {
    backend: &'a mut Backend<'buf>,
    shape: GemmShape,
    strategy: Strategy,
}

impl KernelEmitter<'_, '_> {
    fn saved() -> RegSet {
        RegSet::range(Reg::R4, Reg::R11)
    }

    fn emit(mut self, regime: Regime) {
        save_callee(self.backend, Self::saved(), true);
        for &value in &self.strategy.unavailable {
            self.backend.record(Fault::RegisterUnavailable { value });
        }
        for &(reg, value) in &self.strategy.preloads {
            load_constant(self.backend, reg, value);
        }
        let (m, n) = (self.shape.m, self.shape.n);
        match regime {
            Regime::Single => self.microkernel(m, n),
            Regime::MLoop { tile_m } => self.m_loop(tile_m, n),
            Regime::NLoop { tile_n } => self.n_loop(tile_n, Columns::Microkernel),
            Regime::Nested { tile_m, tile_n } => self.n_loop(tile_n, Columns::MLoop { tile_m }),
        }
        restore_and_return(self.backend, Self::saved(), true);
    }

    fn columns(&mut self, columns: Columns, nt: u32) {
        match columns {
            Columns::Microkernel => self.microkernel(self.shape.m, nt),
            Columns::MLoop { tile_m } => self.m_loop(tile_m, nt),
        }
    }

    fn compare(&mut self, index: Reg, bound: Bound) {
        match bound {
            Bound::Immediate(imm) => {
                self.backend.emit(&CmpImm {
                    rn: index,
                    imm,
                    form: CmpImmForm::Modified,
                });
            }
            Bound::Register(rm) => {
                self.backend.emit(&CmpReg { rn: index, rm });
            }
            Bound::Scratch(value) => {
                load_constant(self.backend, A_WALK, value);
                self.backend.emit(&CmpReg { rn: index, rm: A_WALK });
            }
            Bound::Absent => {}
        }
    }

    /// Full row blocks of `tile_m`, then the remaining rows.
    fn m_loop(&mut self, tile_m: u32, nt: u32) {
        let rest = self.shape.m % tile_m;
        load_constant(self.backend, M_INDEX, 0);
        let top = self.backend.mark();
        self.microkernel(tile_m, nt);
        let step = i64::from(tile_m) * 4;
        add_constant(self.backend, A_TILE, A_TILE, step, A_WALK);
        add_constant(self.backend, C_TILE, C_TILE, step, A_WALK);
        add_constant(self.backend, M_INDEX, M_INDEX, i64::from(tile_m), A_WALK);
        self.compare(M_INDEX, self.strategy.m_bound);
        self.backend.branch_to(top, Cond::Ne);
        if rest > 0 {
            self.microkernel(rest, nt);
        }
    }

    /// Full column blocks of `tile_n`, then the remaining columns.
    fn n_loop(&mut self, tile_n: u32, columns: Columns) {
        let shape = self.shape;
        let rest = shape.n % tile_n;
        // Row offset an inner m loop leaves in the A and C tile pointers.
        let rewind = match columns {
            Columns::Microkernel => 0,
            Columns::MLoop { tile_m } => i64::from(shape.m - shape.m % tile_m) * 4,
        };
        load_constant(self.backend, N_INDEX, 0);
        let top = self.backend.mark();
        self.columns(columns, tile_n);
        add_constant(self.backend, A_TILE, A_TILE, -rewind, A_WALK);
        let b_step = i64::from(tile_n) * i64::from(shape.ldb) * 4;
        add_constant(self.backend, B_TILE, B_TILE, b_step, A_WALK);
        let c_step = i64::from(tile_n) * i64::from(shape.ldc) * 4 - rewind;
        add_constant(self.backend, C_TILE, C_TILE, c_step, A_WALK);
        add_constant(self.backend, N_INDEX, N_INDEX, i64::from(tile_n), A_WALK);
        self.compare(N_INDEX, self.strategy.n_bound);
        self.backend.branch_to(top, Cond::Ne);
        if rest > 0 {
            self.columns(columns, rest);
        }
    }

    /// Base register and offset of each C column of a tile. Must run while the A walk
    /// register is free.
    fn column_bases(&mut self, nt: u32) -> [(Reg, i32); 3] {
        let mut bases = [(C_TILE, 0); 3];
        for j in 1..nt {
            bases[j as usize] = match self.strategy.c_column(j) {
                CColumn::Register(reg) => {
                    let bytes = i64::from(j) * i64::from(self.shape.ldc) * 4;
                    add_constant(self.backend, reg, C_TILE, bytes, A_WALK);
                    (reg, 0)
                }
                CColumn::Offset(offset) => (C_TILE, offset as i32),
                CColumn::Scratch(bytes) => {
                    let reg = B_SCALARS[j as usize];
                    add_constant(self.backend, reg, C_TILE, i64::from(bytes), A_WALK);
                    (reg, 0)
                }
            };
        }
        bases
    }

    /// Rebuild the C columns kept in B scalar registers, which the k loop overwrote.
    fn rebuild_scratch_columns(&mut self, nt: u32) {
        for j in 1..nt {
            if let CColumn::Scratch(bytes) = self.strategy.c_column(j) {
                let reg = B_SCALARS[j as usize];
                add_constant(self.backend, reg, C_TILE, i64::from(bytes), A_WALK);
            }
        }
    }

    fn microkernel(&mut self, mt: u32, nt: u32) {
        let tile = Tile::new(mt, nt);
        debug!("microkernel {mt}x{nt} at half-word {}", self.backend.len());
        let bases = self.column_bases(nt);
        self.backend.emit(&MovReg { rd: A_WALK, rm: A_TILE });
        self.backend.emit(&MovReg { rd: B_WALK, rm: B_TILE });
        if tile.tail > 0 {
            self.backend.emit(&MovImm {
                rd: B_SCALARS[0],
                imm: tile.tail,
                form: MovImmForm::Narrow8,
            });
            self.backend.emit(&Vctp {
                size: LaneSize::B32,
                rn: B_SCALARS[0],
            });
        }
        self.transfer_c(&tile, &bases, MemOp::Load);

        let k = self.shape.k;
        self.k_step(&tile, k > 1);
        if k >= 3 {
            load_constant(self.backend, Reg::Lr, k - 2);
            self.backend.emit(&LoopStart {
                kind: LoopKind::Do,
                rn: Reg::Lr,
                tail: None,
            });
            let top = self.backend.mark();
            self.k_step(&tile, true);
            self.backend.loop_end(top, false);
        }
        if k >= 2 {
            self.k_step(&tile, false);
        }
        self.rebuild_scratch_columns(nt);
        self.transfer_c(&tile, &bases, MemOp::Store);
    }

    /// Load or store the accumulators; the partial row vectors go last under one VPST.
    fn transfer_c(&mut self, tile: &Tile, bases: &[(Reg, i32); 3], op: MemOp) {
        let access = |i: u32, j: u32| {
            let (rn, offset) = bases[j as usize];
            VecMem {
                op,
                qd: tile.acc(i, j),
                rn,
                offset: offset + 16 * i as i32,
                indexing: Indexing::Offset,
            }
        };
        for j in 0..tile.nt {
            for i in (0..tile.vectors).filter(|&i| Some(i) != tile.partial()) {
                self.backend.emit(&access(i, j));
            }
        }
        if let Some(i) = tile.partial() {
            self.backend.emit(&Vpst { count: tile.nt as u8 });
            for j in 0..tile.nt {
                self.backend.emit(&access(i, j));
            }
        }
    }

    /// One rank-1 update of the tile, optionally moving A and B to the next k.
    fn k_step(&mut self, tile: &Tile, advance: bool) {
        let post = match self.strategy.a_stride {
            AStride::PostIndex(bytes) if advance => Some(bytes as i32),
            _ => None,
        };
        for i in (0..tile.vectors).rev() {
            if Some(i) == tile.partial() {
                self.backend.emit(&Vpst { count: 1 });
            }
            let (offset, indexing) = match post {
                Some(bytes) if i == 0 => (bytes, Indexing::PostIndex),
                _ => (16 * i as i32, Indexing::Offset),
            };
            self.backend.emit(&VecMem {
                op: MemOp::Load,
                qd: tile.a(i),
                rn: A_WALK,
                offset,
                indexing,
            });
        }
        if advance && post.is_none() {
            self.advance_a();
        }

        for j in 1..tile.nt {
            self.load_b(j);
        }
        let first = if advance {
            LdrImm {
                rt: B_SCALARS[0],
                rn: B_WALK,
                offset: 4,
                indexing: Indexing::PostIndex,
                form: LdrImmForm::Wide8,
            }
        } else {
            LdrImm {
                rt: B_SCALARS[0],
                rn: B_WALK,
                offset: 0,
                indexing: Indexing::Offset,
                form: LdrImmForm::Narrow,
            }
        };
        self.backend.emit(&first);

        for j in 0..tile.nt {
            for i in 0..tile.vectors {
                self.backend.emit(&VfmaScalar {
                    qda: tile.acc(i, j),
                    qn: tile.a(i),
                    rm: B_SCALARS[j as usize],
                });
            }
        }
    }

    fn advance_a(&mut self) {
        let (imm, form) = match self.strategy.a_stride {
            AStride::PostIndex(bytes) | AStride::Plain(bytes) => (bytes, AddSubImmForm::Plain12),
            AStride::Modified(bytes) => (bytes, AddSubImmForm::Modified),
            AStride::Register(rm) => {
                self.backend.emit(&AddSubReg {
                    op: AddSub::Add,
                    rd: A_WALK,
                    rn: A_WALK,
                    rm,
                    shift: 0,
                    form: AddSubRegForm::NarrowAcc,
                });
                return;
            }
            AStride::Scratch(bytes) => {
                // The column 0 B value of the previous step is consumed.
                load_constant(self.backend, B_SCALARS[0], bytes);
                self.backend.emit(&AddSubReg {
                    op: AddSub::Add,
                    rd: A_WALK,
                    rn: A_WALK,
                    rm: B_SCALARS[0],
                    shift: 0,
                    form: AddSubRegForm::NarrowAcc,
                });
                return;
            }
        };
        self.backend.emit(&AddSubImm {
            op: AddSub::Add,
            rd: A_WALK,
            rn: A_WALK,
            imm,
            form,
        });
    }

    /// B value of tile column `j` (`j` >= 1) at the current k.
    fn load_b(&mut self, j: u32) {
        let rt = B_SCALARS[j as usize];
        match self.strategy.b_stride {
            BStride::Offset(stride) => {
                let offset = (j * stride) as i32;
                let form = if offset <= 124 { LdrImmForm::Narrow } else { LdrImmForm::Wide12 };
                self.backend.emit(&LdrImm {
                    rt,
                    rn: B_WALK,
                    offset,
                    indexing: Indexing::Offset,
                    form,
                });
            }
            BStride::Register(rm) => {
                self.backend.emit(&LdrReg {
                    rt,
                    rn: B_WALK,
                    rm,
                    shift: (j - 1) as u8,
                });
            }
            BStride::Scratch(stride) => {
                load_constant(self.backend, rt, j * stride);
                self.backend.emit(&AddSubReg {
                    op: AddSub::Add,
                    rd: rt,
                    rn: rt,
                    rm: B_WALK,
                    shift: 0,
                    form: AddSubRegForm::NarrowAcc,
                });
                self.backend.emit(&LdrImm {
                    rt,
                    rn: rt,
                    offset: 0,
                    indexing: Indexing::Offset,
                    form: LdrImmForm::Narrow,
                });
            }
        }
    }
}
