//! Register names and register sets.
//!
//! The generator never allocates registers in the general sense: every kernel uses
//! fixed roles. What it does need is a compact way to name the Armv8.1-M register
//! files and a bit set over the scalar registers, used both for push/pop register
//! lists and for the pool of spare registers the GEMM strategy hands out.

use std::fmt;

/// Number of scalar (general purpose) registers.
pub const NUM_SCALAR_REGS: usize = 16;

/// Number of 128-bit MVE vector registers.
pub const NUM_VECTOR_REGS: usize = 8;

/// Number of single precision registers aliased onto the vector file.
pub const NUM_SINGLE_REGS: usize = 32;

/// Scalar register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

impl Reg {
    const ALL: [Reg; NUM_SCALAR_REGS] = [
        Reg::R0, Reg::R1, Reg::R2, Reg::R3,
        Reg::R4, Reg::R5, Reg::R6, Reg::R7,
        Reg::R8, Reg::R9, Reg::R10, Reg::R11,
        Reg::R12, Reg::Sp, Reg::Lr, Reg::Pc,
    ];

    /// Architectural register number (0-15).
    pub const fn num(self) -> u8 {
        self as u8
    }

    /// Register reachable by the 3-bit fields of 16-bit encodings.
    pub const fn is_low(self) -> bool {
        (self as u8) < 8
    }

    pub fn from_num(num: u8) -> Option<Reg> {
        Self::ALL.get(num as usize).copied()
    }

    /// Register named by the low four bits of an instruction field.
    pub const fn from_field(bits: u16) -> Reg {
        Self::ALL[(bits & 0xF) as usize]
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Sp => f.write_str("sp"),
            Reg::Lr => f.write_str("lr"),
            Reg::Pc => f.write_str("pc"),
            r => write!(f, "r{}", r.num()),
        }
    }
}

/// MVE vector register (four 32-bit lanes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum QReg {
    Q0 = 0,
    Q1,
    Q2,
    Q3,
    Q4,
    Q5,
    Q6,
    Q7,
}

impl QReg {
    const ALL: [QReg; NUM_VECTOR_REGS] = [
        QReg::Q0, QReg::Q1, QReg::Q2, QReg::Q3,
        QReg::Q4, QReg::Q5, QReg::Q6, QReg::Q7,
    ];

    pub const fn num(self) -> u8 {
        self as u8
    }

    pub fn from_num(num: u8) -> Option<QReg> {
        Self::ALL.get(num as usize).copied()
    }

    /// Register named by the low three bits of an instruction field.
    pub const fn from_field(bits: u16) -> QReg {
        Self::ALL[(bits & 0x7) as usize]
    }
}

impl fmt::Display for QReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.num())
    }
}

/// Single precision register `S0`-`S31`.
///
/// `S(4q + l)` aliases lane `l` of `Q(q)` for the first 16 registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SReg(u8);

impl SReg {
    pub const S0: SReg = SReg(0);

    pub fn new(num: u8) -> Option<SReg> {
        ((num as usize) < NUM_SINGLE_REGS).then_some(SReg(num))
    }

    pub const fn num(self) -> u8 {
        self.0
    }

    pub const fn from_field(bits: u16) -> SReg {
        SReg((bits & 0x1F) as u8)
    }
}

impl fmt::Display for SReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Bit set over the scalar registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegSet {
    bits: u16,
}

impl RegSet {
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self { bits }
    }

    /// Inclusive range `first..=last` by register number.
    pub fn range(first: Reg, last: Reg) -> Self {
        let mut set = Self::new();
        for num in first.num()..=last.num() {
            if let Some(reg) = Reg::from_num(num) {
                set.set(reg);
            }
        }
        set
    }

    pub fn of(regs: &[Reg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    pub const fn bits(&self) -> u16 {
        self.bits
    }

    pub const fn contains(&self, reg: Reg) -> bool {
        self.bits & (1 << reg as u8) != 0
    }

    pub fn set(&mut self, reg: Reg) {
        self.bits |= 1 << reg.num();
    }

    pub fn clear(&mut self, reg: Reg) {
        self.bits &= !(1 << reg.num());
    }

    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub const fn len(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Only R0-R7 plus the registers in `extra`.
    pub const fn is_low_plus(&self, extra: Reg) -> bool {
        self.bits & !(0xFF | (1 << extra as u8)) == 0
    }

    /// Lowest-numbered register in the set.
    pub fn first(&self) -> Option<Reg> {
        if self.bits == 0 {
            return None;
        }
        Reg::from_num(self.bits.trailing_zeros() as u8)
    }

    /// Remove and return the lowest-numbered register.
    pub fn take_first(&mut self) -> Option<Reg> {
        let reg = self.first()?;
        self.clear(reg);
        Some(reg)
    }

    pub fn iter(&self) -> impl Iterator<Item = Reg> + '_ {
        (0..NUM_SCALAR_REGS as u8)
            .filter(move |n| self.bits & (1 << n) != 0)
            .filter_map(Reg::from_num)
    }
}

impl fmt::Display for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, reg) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{reg}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_numbers() {
        assert_eq!(Reg::R0.num(), 0);
        assert_eq!(Reg::Lr.num(), 14);
        assert_eq!(Reg::from_num(13), Some(Reg::Sp));
        assert_eq!(Reg::from_num(16), None);
        assert!(Reg::R7.is_low());
        assert!(!Reg::R8.is_low());
        assert_eq!(QReg::from_num(7), Some(QReg::Q7));
        assert!(SReg::new(32).is_none());
    }

    #[test]
    fn test_reg_set_operations() {
        let mut set = RegSet::range(Reg::R4, Reg::R11);
        set.set(Reg::Lr);
        assert_eq!(set.bits(), 0x4FF0);
        assert_eq!(set.len(), 9);
        assert!(set.contains(Reg::R8));
        assert!(!set.contains(Reg::R12));

        set.clear(Reg::R4);
        assert_eq!(set.first(), Some(Reg::R5));
        assert_eq!(set.take_first(), Some(Reg::R5));
        assert_eq!(set.first(), Some(Reg::R6));
    }

    #[test]
    fn test_reg_set_low_plus() {
        assert!(RegSet::of(&[Reg::R4, Reg::Lr]).is_low_plus(Reg::Lr));
        assert!(!RegSet::of(&[Reg::R8, Reg::Lr]).is_low_plus(Reg::Lr));
        assert!(RegSet::of(&[Reg::R7, Reg::Pc]).is_low_plus(Reg::Pc));
    }

    #[test]
    fn test_reg_set_display() {
        let set = RegSet::of(&[Reg::R0, Reg::R10, Reg::Pc]);
        assert_eq!(set.to_string(), "{r0, r10, pc}");
    }
}
