//! x86-64 register definitions and System V AMD64 calling conventions.
//!
//! This module provides:
//! - General-purpose register (GPR) definitions with hardware encodings
//! - XMM register definitions
//! - Register sets backed by 16-bit bitfields for O(1) membership testing
//! - DWARF register numbering (the numbering live-outs and stack maps use)
//!
//! # Performance Considerations
//! - All register types are `Copy` with `#[repr(u8)]` for zero-cost encoding
//! - Calling-convention sets are const-evaluated

use std::fmt;

// =============================================================================
// General-Purpose Registers (GPR)
// =============================================================================

/// x86-64 general-purpose register with its hardware encoding.
///
/// The encoding (0-15) maps directly to the ModRM/REX instruction fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// All 16 general-purpose registers in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// System V integer argument registers, in argument order.
    pub const ARGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low 3 bits of the encoding (the ModRM field value).
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Whether the encoding needs a REX extension bit (R8-R15).
    #[inline(always)]
    pub const fn is_extended(self) -> bool {
        self.encoding() >= 8
    }

    /// Whether a callee must preserve this register across a call
    /// (System V: RBX, RSP, RBP, R12-R15).
    #[inline]
    pub const fn is_callee_save(self) -> bool {
        matches!(
            self,
            Gpr::Rbx | Gpr::Rsp | Gpr::Rbp | Gpr::R12 | Gpr::R13 | Gpr::R14 | Gpr::R15
        )
    }

    /// Convert from encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        match enc {
            0 => Some(Gpr::Rax),
            1 => Some(Gpr::Rcx),
            2 => Some(Gpr::Rdx),
            3 => Some(Gpr::Rbx),
            4 => Some(Gpr::Rsp),
            5 => Some(Gpr::Rbp),
            6 => Some(Gpr::Rsi),
            7 => Some(Gpr::Rdi),
            8 => Some(Gpr::R8),
            9 => Some(Gpr::R9),
            10 => Some(Gpr::R10),
            11 => Some(Gpr::R11),
            12 => Some(Gpr::R12),
            13 => Some(Gpr::R13),
            14 => Some(Gpr::R14),
            15 => Some(Gpr::R15),
            _ => None,
        }
    }

    /// Convert from a DWARF register number.
    ///
    /// DWARF orders the first eight registers differently from the hardware
    /// encoding: 0=RAX, 1=RDX, 2=RCX, 3=RBX, 4=RSI, 5=RDI, 6=RBP, 7=RSP,
    /// then 8-15 map to R8-R15 directly.
    #[inline]
    pub const fn from_dwarf(regnum: u16) -> Option<Gpr> {
        match regnum {
            0 => Some(Gpr::Rax),
            1 => Some(Gpr::Rdx),
            2 => Some(Gpr::Rcx),
            3 => Some(Gpr::Rbx),
            4 => Some(Gpr::Rsi),
            5 => Some(Gpr::Rdi),
            6 => Some(Gpr::Rbp),
            7 => Some(Gpr::Rsp),
            8 => Some(Gpr::R8),
            9 => Some(Gpr::R9),
            10 => Some(Gpr::R10),
            11 => Some(Gpr::R11),
            12 => Some(Gpr::R12),
            13 => Some(Gpr::R13),
            14 => Some(Gpr::R14),
            15 => Some(Gpr::R15),
            _ => None,
        }
    }

    /// The DWARF register number for this register.
    #[inline]
    pub const fn dwarf(self) -> u16 {
        match self {
            Gpr::Rax => 0,
            Gpr::Rdx => 1,
            Gpr::Rcx => 2,
            Gpr::Rbx => 3,
            Gpr::Rsi => 4,
            Gpr::Rdi => 5,
            Gpr::Rbp => 6,
            Gpr::Rsp => 7,
            Gpr::R8 => 8,
            Gpr::R9 => 9,
            Gpr::R10 => 10,
            Gpr::R11 => 11,
            Gpr::R12 => 12,
            Gpr::R13 => 13,
            Gpr::R14 => 14,
            Gpr::R15 => 15,
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(name)
    }
}

// =============================================================================
// GPR Sets
// =============================================================================

/// A set of general-purpose registers using a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GprSet(u16);

impl GprSet {
    /// Empty register set.
    pub const EMPTY: GprSet = GprSet(0);

    /// All 16 registers.
    pub const ALL: GprSet = GprSet(0xFFFF);

    /// Callee-save registers (System V): RBX, RSP, RBP, R12-R15.
    pub const CALLEE_SAVE: GprSet = GprSet(
        (1 << Gpr::Rbx as u16)
            | (1 << Gpr::Rsp as u16)
            | (1 << Gpr::Rbp as u16)
            | (1 << Gpr::R12 as u16)
            | (1 << Gpr::R13 as u16)
            | (1 << Gpr::R14 as u16)
            | (1 << Gpr::R15 as u16),
    );

    /// Caller-clobbered registers (System V): everything not callee-save.
    pub const CALLER_CLOBBERED: GprSet = GprSet(!Self::CALLEE_SAVE.0);

    /// The registers the IC rewriter may allocate.
    ///
    /// RSP/RBP are structural; callee-save registers are excluded because
    /// the unwinder does not know how to restore them across an IC.
    pub const ALLOCATABLE: GprSet = GprSet(
        (1 << Gpr::Rax as u16)
            | (1 << Gpr::Rcx as u16)
            | (1 << Gpr::Rdx as u16)
            | (1 << Gpr::Rdi as u16)
            | (1 << Gpr::Rsi as u16)
            | (1 << Gpr::R8 as u16)
            | (1 << Gpr::R9 as u16)
            | (1 << Gpr::R10 as u16)
            | (1 << Gpr::R11 as u16),
    );

    /// Registers whose low byte is addressable without a REX prefix,
    /// the legal destinations for `setcc` here: RAX, RBX, RCX, RDX.
    pub const SETCC: GprSet = GprSet(
        (1 << Gpr::Rax as u16)
            | (1 << Gpr::Rbx as u16)
            | (1 << Gpr::Rcx as u16)
            | (1 << Gpr::Rdx as u16),
    );

    /// Create a set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: Gpr) -> Self {
        GprSet(1 << reg.encoding())
    }

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        GprSet(bits)
    }

    /// Get the raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Check if the set contains a register.
    #[inline(always)]
    pub const fn contains(self, reg: Gpr) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Check if the set is empty.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add a register to the set.
    #[inline(always)]
    pub const fn insert(self, reg: Gpr) -> Self {
        GprSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register from the set.
    #[inline(always)]
    pub const fn remove(self, reg: Gpr) -> Self {
        GprSet(self.0 & !(1 << reg.encoding()))
    }

    /// Union of two sets.
    #[inline(always)]
    pub const fn union(self, other: GprSet) -> Self {
        GprSet(self.0 | other.0)
    }

    /// Intersection of two sets.
    #[inline(always)]
    pub const fn intersection(self, other: GprSet) -> Self {
        GprSet(self.0 & other.0)
    }

    /// Count the registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over registers in the set in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        (0u8..16).filter_map(move |i| {
            if (self.0 & (1 << i)) != 0 {
                Gpr::from_encoding(i)
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for GprSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GprSet{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", reg)?;
            first = false;
        }
        write!(f, "}}")
    }
}

// =============================================================================
// XMM Registers
// =============================================================================

/// x86-64 XMM register.
///
/// All XMM registers are caller-clobbered under System V.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    /// All 16 XMM registers in encoding order.
    pub const ALL: [Xmm; 16] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
        Xmm::Xmm8,
        Xmm::Xmm9,
        Xmm::Xmm10,
        Xmm::Xmm11,
        Xmm::Xmm12,
        Xmm::Xmm13,
        Xmm::Xmm14,
        Xmm::Xmm15,
    ];

    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low 3 bits of the encoding (the ModRM field value).
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Whether the encoding needs a REX extension bit.
    #[inline(always)]
    pub const fn is_extended(self) -> bool {
        self.encoding() >= 8
    }

    /// Convert from encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Xmm> {
        match enc {
            0 => Some(Xmm::Xmm0),
            1 => Some(Xmm::Xmm1),
            2 => Some(Xmm::Xmm2),
            3 => Some(Xmm::Xmm3),
            4 => Some(Xmm::Xmm4),
            5 => Some(Xmm::Xmm5),
            6 => Some(Xmm::Xmm6),
            7 => Some(Xmm::Xmm7),
            8 => Some(Xmm::Xmm8),
            9 => Some(Xmm::Xmm9),
            10 => Some(Xmm::Xmm10),
            11 => Some(Xmm::Xmm11),
            12 => Some(Xmm::Xmm12),
            13 => Some(Xmm::Xmm13),
            14 => Some(Xmm::Xmm14),
            15 => Some(Xmm::Xmm15),
            _ => None,
        }
    }

    /// Convert from a DWARF register number (XMM0-XMM15 are 17-32).
    #[inline]
    pub const fn from_dwarf(regnum: u16) -> Option<Xmm> {
        if regnum >= 17 && regnum <= 32 {
            Xmm::from_encoding((regnum - 17) as u8)
        } else {
            None
        }
    }

    /// The DWARF register number for this register.
    #[inline(always)]
    pub const fn dwarf(self) -> u16 {
        self.encoding() as u16 + 17
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.encoding())
    }
}

// =============================================================================
// XMM Sets
// =============================================================================

/// A set of XMM registers using a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct XmmSet(u16);

impl XmmSet {
    /// Empty register set.
    pub const EMPTY: XmmSet = XmmSet(0);

    /// All 16 registers.
    pub const ALL: XmmSet = XmmSet(0xFFFF);

    /// Create a set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: Xmm) -> Self {
        XmmSet(1 << reg.encoding())
    }

    /// Check if the set contains a register.
    #[inline(always)]
    pub const fn contains(self, reg: Xmm) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Check if the set is empty.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add a register to the set.
    #[inline(always)]
    pub const fn insert(self, reg: Xmm) -> Self {
        XmmSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register from the set.
    #[inline(always)]
    pub const fn remove(self, reg: Xmm) -> Self {
        XmmSet(self.0 & !(1 << reg.encoding()))
    }

    /// Count the registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over registers in the set in encoding order.
    pub fn iter(self) -> impl Iterator<Item = Xmm> {
        (0u8..16).filter_map(move |i| {
            if (self.0 & (1 << i)) != 0 {
                Xmm::from_encoding(i)
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for XmmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XmmSet{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", reg)?;
            first = false;
        }
        write!(f, "}}")
    }
}

// =============================================================================
// Generic Registers
// =============================================================================

/// Either a general-purpose or an XMM register.
///
/// Live-out sets and stack-map records mix the two register files; this is
/// the common currency for DWARF-numbered values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericReg {
    Gp(Gpr),
    Xmm(Xmm),
}

impl GenericReg {
    /// Convert from a DWARF register number.
    #[inline]
    pub fn from_dwarf(regnum: u16) -> Option<GenericReg> {
        if let Some(gp) = Gpr::from_dwarf(regnum) {
            Some(GenericReg::Gp(gp))
        } else {
            Xmm::from_dwarf(regnum).map(GenericReg::Xmm)
        }
    }

    /// The DWARF register number.
    #[inline]
    pub const fn dwarf(self) -> u16 {
        match self {
            GenericReg::Gp(r) => r.dwarf(),
            GenericReg::Xmm(r) => r.dwarf(),
        }
    }

    /// Whether a call clobbers this register.
    #[inline]
    pub const fn is_clobbered_by_call(self) -> bool {
        match self {
            GenericReg::Gp(r) => !r.is_callee_save(),
            GenericReg::Xmm(_) => true,
        }
    }
}

impl fmt::Display for GenericReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenericReg::Gp(r) => write!(f, "{}", r),
            GenericReg::Xmm(r) => write!(f, "{}", r),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Gpr Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_gpr_encoding() {
        assert_eq!(Gpr::Rax.encoding(), 0);
        assert_eq!(Gpr::Rdi.encoding(), 7);
        assert_eq!(Gpr::R15.encoding(), 15);
    }

    #[test]
    fn test_gpr_extended() {
        assert!(!Gpr::Rdi.is_extended());
        assert!(Gpr::R8.is_extended());
        assert_eq!(Gpr::R11.low_bits(), 3);
    }

    #[test]
    fn test_gpr_callee_save() {
        assert!(Gpr::Rbx.is_callee_save());
        assert!(Gpr::Rsp.is_callee_save());
        assert!(Gpr::R12.is_callee_save());
        assert!(!Gpr::Rax.is_callee_save());
        assert!(!Gpr::R11.is_callee_save());
    }

    #[test]
    fn test_gpr_dwarf_roundtrip() {
        for reg in Gpr::ALL {
            assert_eq!(Gpr::from_dwarf(reg.dwarf()), Some(reg));
        }
        // The DWARF numbering swaps RDX/RCX relative to the hw encoding.
        assert_eq!(Gpr::from_dwarf(1), Some(Gpr::Rdx));
        assert_eq!(Gpr::from_dwarf(2), Some(Gpr::Rcx));
        assert_eq!(Gpr::from_dwarf(6), Some(Gpr::Rbp));
        assert_eq!(Gpr::from_dwarf(16), None);
    }

    #[test]
    fn test_gpr_args_order() {
        assert_eq!(
            Gpr::ARGS,
            [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
        );
    }

    // -------------------------------------------------------------------------
    // GprSet Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_gpr_set_allocatable() {
        let set = GprSet::ALLOCATABLE;
        assert_eq!(set.count(), 9);
        assert!(set.contains(Gpr::Rax));
        assert!(set.contains(Gpr::R11));
        assert!(!set.contains(Gpr::Rsp));
        assert!(!set.contains(Gpr::Rbp));
        assert!(!set.contains(Gpr::Rbx));
        assert!(!set.contains(Gpr::R12));
    }

    #[test]
    fn test_gpr_set_callee_save_disjoint_from_clobbered() {
        assert!(GprSet::CALLEE_SAVE
            .intersection(GprSet::CALLER_CLOBBERED)
            .is_empty());
        assert_eq!(
            GprSet::CALLEE_SAVE.union(GprSet::CALLER_CLOBBERED),
            GprSet::ALL
        );
    }

    #[test]
    fn test_gpr_set_insert_remove() {
        let set = GprSet::EMPTY.insert(Gpr::Rcx).insert(Gpr::R9);
        assert_eq!(set.count(), 2);
        assert!(set.contains(Gpr::Rcx));
        let set = set.remove(Gpr::Rcx);
        assert!(!set.contains(Gpr::Rcx));
        assert!(set.contains(Gpr::R9));
    }

    #[test]
    fn test_gpr_set_iter_order() {
        let set = GprSet::EMPTY.insert(Gpr::R10).insert(Gpr::Rax).insert(Gpr::Rdi);
        let regs: Vec<_> = set.iter().collect();
        assert_eq!(regs, vec![Gpr::Rax, Gpr::Rdi, Gpr::R10]);
    }

    #[test]
    fn test_gpr_set_setcc() {
        assert!(GprSet::SETCC.contains(Gpr::Rax));
        assert!(GprSet::SETCC.contains(Gpr::Rdx));
        assert!(!GprSet::SETCC.contains(Gpr::Rsi));
        // Inside the allocatable set only RAX/RCX/RDX survive.
        assert_eq!(GprSet::SETCC.intersection(GprSet::ALLOCATABLE).count(), 3);
    }

    // -------------------------------------------------------------------------
    // Xmm Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_xmm_dwarf_roundtrip() {
        for reg in Xmm::ALL {
            assert_eq!(Xmm::from_dwarf(reg.dwarf()), Some(reg));
        }
        assert_eq!(Xmm::Xmm0.dwarf(), 17);
        assert_eq!(Xmm::Xmm15.dwarf(), 32);
        assert_eq!(Xmm::from_dwarf(16), None);
        assert_eq!(Xmm::from_dwarf(33), None);
    }

    #[test]
    fn test_xmm_set_ops() {
        let set = XmmSet::EMPTY.insert(Xmm::Xmm1).insert(Xmm::Xmm8);
        assert_eq!(set.count(), 2);
        assert!(set.contains(Xmm::Xmm8));
        assert!(!set.contains(Xmm::Xmm0));
        let regs: Vec<_> = set.iter().collect();
        assert_eq!(regs, vec![Xmm::Xmm1, Xmm::Xmm8]);
    }

    // -------------------------------------------------------------------------
    // GenericReg Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_generic_reg_from_dwarf() {
        assert_eq!(GenericReg::from_dwarf(0), Some(GenericReg::Gp(Gpr::Rax)));
        assert_eq!(GenericReg::from_dwarf(6), Some(GenericReg::Gp(Gpr::Rbp)));
        assert_eq!(GenericReg::from_dwarf(17), Some(GenericReg::Xmm(Xmm::Xmm0)));
        assert_eq!(GenericReg::from_dwarf(33), None);
    }

    #[test]
    fn test_generic_reg_clobbered() {
        assert!(GenericReg::Gp(Gpr::Rax).is_clobbered_by_call());
        assert!(!GenericReg::Gp(Gpr::R12).is_clobbered_by_call());
        assert!(GenericReg::Xmm(Xmm::Xmm7).is_clobbered_by_call());
    }
}
