//! Inline-cache rewriter for the Opal runtime.
//!
//! A small, deferred-emission JIT that synthesizes straight-line x86-64
//! stubs specialized to runtime-observed operand shapes. A runtime helper
//! records virtual operations against symbolic values ("load the word at
//! offset 16 of argument 0", "guard that it equals this constant", "call
//! this function"), and `commit()` replays them through a linear register
//! allocator into a pre-reserved IC slot, maintaining the refcount
//! discipline and publishing unwind bookkeeping along the way.
//!
//! ## Components
//!
//! - `rewrite`: the two-phase rewriter core (symbolic values, action
//!   table, register allocation, constant loading, guards, calls,
//!   refcounting)
//! - `ic`: the slot collaborators (code region, slot table, back-off
//!   gate, invalidation, the decref-info registry the unwinder reads)
//! - `patchpoint`: one-shot initialization of the raw patch site around
//!   the not-yet-specialized slow-path call

pub mod ic;
pub mod patchpoint;
pub mod rewrite;

pub use ic::{GcHandle, IcInfo, IcSpec, IcSlotRewrite, Invalidator, RewriteStatsSnapshot};
pub use rewrite::{AbortReason, CmpOp, Location, RefType, Rewriter, SetAttrKind, VarId};
