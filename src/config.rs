//! Kernel shapes and tiling parameters.

use thiserror::Error;

use crate::core::register_file::NUM_VECTOR_REGS;

/// Largest dimension or leading dimension accepted by the GEMM generator.
pub const MAX_DIMENSION: u32 = 1 << 24;

/// Largest microkernel height (four 4-lane vectors).
pub const MAX_TILE_M: u32 = 16;

/// Largest microkernel width (one B scalar register per column).
pub const MAX_TILE_N: u32 = 3;

/// Buffer size the command line tool allocates unless told otherwise.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tile height {tile_m} must be a multiple of 4 in 4..={max}")]
    TileHeight { tile_m: u32, max: u32 },

    #[error("tile width {tile_n} must be in 1..={max}")]
    TileWidth { tile_n: u32, max: u32 },

    #[error("a {tile_m}x{tile_n} tile needs {needed} vector registers, {available} available")]
    RegisterBudget {
        tile_m: u32,
        tile_n: u32,
        needed: u32,
        available: u32,
    },
}

/// Vector registers a `tile_m` x `tile_n` microkernel occupies: one per A vector plus
/// one accumulator per A vector and column.
pub fn vector_registers(tile_m: u32, tile_n: u32) -> u32 {
    tile_m.div_ceil(4) * (tile_n + 1)
}

/// Tiling used by the GEMM generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmConfig {
    /// Height of the general tile.
    pub tile_m: u32,
    /// Width of the general tile.
    pub tile_n: u32,
    /// Height of the single-column tile used when `n == 1`.
    pub column_tile_m: u32,
}

impl Default for GemmConfig {
    fn default() -> Self {
        Self {
            tile_m: 8,
            tile_n: 3,
            column_tile_m: 16,
        }
    }
}

impl GemmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tile_m in [self.tile_m, self.column_tile_m] {
            if tile_m == 0 || tile_m % 4 != 0 || tile_m > MAX_TILE_M {
                return Err(ConfigError::TileHeight {
                    tile_m,
                    max: MAX_TILE_M,
                });
            }
        }
        if self.tile_n == 0 || self.tile_n > MAX_TILE_N {
            return Err(ConfigError::TileWidth {
                tile_n: self.tile_n,
                max: MAX_TILE_N,
            });
        }
        for (tile_m, tile_n) in [(self.tile_m, self.tile_n), (self.column_tile_m, 1)] {
            let needed = vector_registers(tile_m, tile_n);
            if needed > NUM_VECTOR_REGS as u32 {
                return Err(ConfigError::RegisterBudget {
                    tile_m,
                    tile_n,
                    needed,
                    available: NUM_VECTOR_REGS as u32,
                });
            }
        }
        Ok(())
    }
}

/// Problem shape of `C += A * B` with column-major operands.
///
/// `A` is `m x k` with leading dimension `lda`, `B` is `k x n` with `ldb`, `C` is
/// `m x n` with `ldc`. Element `(i, j)` of a matrix with leading dimension `ld`
/// lives at float index `i + j * ld`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmShape {
    pub m: u32,
    pub k: u32,
    pub n: u32,
    pub lda: u32,
    pub ldb: u32,
    pub ldc: u32,
}

impl GemmShape {
    /// Densely packed operands.
    pub const fn new(m: u32, k: u32, n: u32) -> Self {
        Self {
            m,
            k,
            n,
            lda: m,
            ldb: k,
            ldc: m,
        }
    }

    pub const fn with_leading_dimensions(self, lda: u32, ldb: u32, ldc: u32) -> Self {
        Self {
            lda,
            ldb,
            ldc,
            ..self
        }
    }

    /// Floats spanned by `A`, `B` and `C`.
    pub fn a_len(&self) -> usize {
        self.lda as usize * self.k as usize
    }

    pub fn b_len(&self) -> usize {
        self.ldb as usize * self.n as usize
    }

    pub fn c_len(&self) -> usize {
        self.ldc as usize * self.n as usize
    }

    /// Check the generator's preconditions, describing the first violation.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("m", self.m), ("k", self.k), ("n", self.n)] {
            if value == 0 {
                return Err(format!("{name} must be at least 1"));
            }
        }
        for (name, value, min, min_name) in [
            ("lda", self.lda, self.m, "m"),
            ("ldb", self.ldb, self.k, "k"),
            ("ldc", self.ldc, self.m, "m"),
        ] {
            if value < min {
                return Err(format!("{name} = {value} is smaller than {min_name} = {min}"));
            }
        }
        for (name, value) in [
            ("m", self.m),
            ("k", self.k),
            ("n", self.n),
            ("lda", self.lda),
            ("ldb", self.ldb),
            ("ldc", self.ldc),
        ] {
            if value > MAX_DIMENSION {
                return Err(format!("{name} = {value} exceeds {MAX_DIMENSION}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(GemmConfig::default().validate(), Ok(()));
        assert_eq!(vector_registers(8, 3), 8);
        assert_eq!(vector_registers(16, 1), 8);
        assert_eq!(vector_registers(5, 2), 6);
    }

    #[test]
    fn test_config_rejects_oversized_tiles() {
        let wide = GemmConfig {
            tile_m: 12,
            ..GemmConfig::default()
        };
        assert!(matches!(
            wide.validate(),
            Err(ConfigError::RegisterBudget { needed: 12, .. })
        ));
        let odd = GemmConfig {
            tile_m: 6,
            ..GemmConfig::default()
        };
        assert!(matches!(odd.validate(), Err(ConfigError::TileHeight { .. })));
        let flat = GemmConfig {
            tile_n: 0,
            ..GemmConfig::default()
        };
        assert!(matches!(flat.validate(), Err(ConfigError::TileWidth { .. })));
    }

    #[test]
    fn test_shape_validation() {
        assert_eq!(GemmShape::new(3, 4, 5).validate(), Ok(()));
        assert!(GemmShape::new(0, 4, 5).validate().is_err());
        let short = GemmShape::new(8, 8, 8).with_leading_dimensions(7, 8, 8);
        assert_eq!(
            short.validate(),
            Err("lda = 7 is smaller than m = 8".to_string())
        );
        let padded = GemmShape::new(5, 3, 2).with_leading_dimensions(9, 4, 6);
        assert_eq!(padded.validate(), Ok(()));
        assert_eq!(padded.a_len(), 27);
        assert_eq!(padded.b_len(), 8);
        assert_eq!(padded.c_len(), 12);
    }
}
