//! Inline-cache slot management.
//!
//! The collaborators around a rewrite: the backing code region, the slot
//! table with its back-off gate and invalidation protocol, and the
//! process-global decref-info registry the unwinder reads.

mod decref;
mod info;
mod region;
mod slot;

pub use decref::{deregister_decref_range, lookup_decref_info, register_decref_info};
pub use info::{IcInfo, IcSpec, Invalidator, RewriteStatsSnapshot, MEGAMORPHIC_CUTOFF};
pub use region::CodeRegion;
pub use slot::{IcSlotRewrite, PickedSlot, INVALIDATION_HEADER_SIZE};

/// An address of a foreign runtime object whose reference count the
/// client bumped so that immediates embedded in the slot stay valid for
/// the slot's lifetime. Handles ride along to the slot on commit and are
/// dropped (for the embedder to release) on abort or invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHandle(pub u64);
