//! The two-phase rewriter core.
//!
//! Public operations record virtual operations against symbolic values
//! during the **collect** phase; `commit()` switches to the **emit**
//! phase and replays them, consulting the register allocator and emitting
//! bytes through the assembler. Deferring emission lets the allocator see
//! the whole use-graph and lets the refcount bookkeeping decide which
//! consumptions are handoffs.

mod action;
mod alloc;
mod emit;
mod location;
mod rewriter;
mod var;

pub use action::{ActionKind, CmpOp, SetAttrKind};
pub use location::Location;
pub use rewriter::Rewriter;
pub use var::{RefType, VarId};

use thiserror::Error;

/// Byte offset of the reference count inside a runtime object.
pub const REFCOUNT_OFFSET: i32 = 0;
/// Byte offset of the class pointer inside a runtime object.
pub const CLASS_OFFSET: i32 = 8;
/// Byte offset of the deallocator function pointer inside a class object.
pub const DEALLOC_OFFSET: i32 = 24;

/// Why a rewrite was abandoned.
///
/// None of these are errors to the client: an abandoned rewrite leaves
/// the call site on its fallback path, exactly as if no specialization
/// had been attempted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// No allocatable register was available and no spill target worked.
    #[error("out of allocatable registers")]
    RegisterPressure,

    /// The scratch slab had no free run of the requested length.
    #[error("scratch slab exhausted")]
    ScratchExhausted,

    /// The byte emitter ran past the end of the slot.
    #[error("assembler overflowed the slot")]
    AssemblerOverflow,

    /// An owned reference had no call-surviving location at a throwing
    /// call site.
    #[error("no location eligible for decref info")]
    DecrefUnplaceable,

    /// The slot collaborator could not reserve a slot.
    #[error("no inline-cache slot available")]
    NoSlotAvailable,
}
