//! Value locations.
//!
//! A `Location` names one place a symbolic value can live during a
//! rewrite: a register, a slot in the per-slot scratch slab, a stack
//! slot, or one of the pseudo-locations used as allocation hints. A value
//! may occupy several locations at once; the allocator keeps the
//! location→value map and each value's location set in sync.

use std::fmt;

use opal_asm::{GenericReg, Gpr, Xmm};

/// One place a value can live, or an allocation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// A general-purpose register.
    Reg(Gpr),
    /// An XMM register.
    Xmm(Xmm),
    /// An offset in bytes into the slot's scratch slab.
    Scratch(i32),
    /// An offset in bytes from the stack pointer.
    Stack(i32),
    /// Follow the pointer at `[sp + offset]`, then add `field_offset`.
    /// Only produced in decref-info records for registered owned
    /// attributes; never used as a working location.
    StackIndirect { offset: i32, field_offset: i32 },
    /// Hint: any allocatable register.
    AnyReg,
    /// No location (failed allocations report this).
    None,
    /// Hint: caller does not care (entry state).
    Uninitialized,
}

impl Location {
    /// The designated location of integer argument `argnum` under the
    /// System V calling convention.
    pub fn for_arg(argnum: usize) -> Location {
        match argnum {
            0..=5 => Location::Reg(Gpr::ARGS[argnum]),
            _ => Location::Stack(8 * (argnum as i32 - 6)),
        }
    }

    /// The location of a DWARF-numbered register.
    pub fn from_generic(reg: GenericReg) -> Location {
        match reg {
            GenericReg::Gp(r) => Location::Reg(r),
            GenericReg::Xmm(r) => Location::Xmm(r),
        }
    }

    /// The GP register this location names.
    ///
    /// Panics if the location is not a GP register.
    #[inline]
    pub fn as_reg(self) -> Gpr {
        match self {
            Location::Reg(r) => r,
            other => panic!("expected a GP register location, got {:?}", other),
        }
    }

    /// The XMM register this location names.
    #[inline]
    pub fn as_xmm(self) -> Xmm {
        match self {
            Location::Xmm(r) => r,
            other => panic!("expected an XMM register location, got {:?}", other),
        }
    }

    /// Whether a `call` destroys a value held only here.
    ///
    /// XMM registers and non-callee-save GP registers are clobbered;
    /// scratch and stack slots survive.
    pub fn is_clobbered_by_call(self) -> bool {
        match self {
            Location::Reg(r) => !r.is_callee_save(),
            Location::Xmm(_) => true,
            Location::Scratch(_) | Location::Stack(_) => false,
            other => panic!("no clobber classification for {:?}", other),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Reg(r) => write!(f, "%{}", r),
            Location::Xmm(r) => write!(f, "%{}", r),
            Location::Scratch(o) => write!(f, "scratch({})", o),
            Location::Stack(o) => write!(f, "stack({})", o),
            Location::StackIndirect { offset, field_offset } => {
                write!(f, "stack_indirect({}, {})", offset, field_offset)
            }
            Location::AnyReg => f.write_str("anyreg"),
            Location::None => f.write_str("none"),
            Location::Uninitialized => f.write_str("uninitialized"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
