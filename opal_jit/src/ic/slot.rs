//! One specialization slot and the in-flight rewrite handle.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use opal_asm::{Cond, Gpr, GprSet};

use super::decref::register_decref_info;
use super::info::IcState;
use super::GcHandle;
use crate::rewrite::Location;

/// Size in bytes of the region at the start of every slot that an
/// invalidator may overwrite with a `jmp rel32`. Slots that perform
/// side effects pad their prefix to at least this size.
pub const INVALIDATION_HEADER_SIZE: usize = 5;

/// The slot a rewrite was assigned by `prepare_entry`.
#[derive(Debug, Clone, Copy)]
pub struct PickedSlot {
    /// Index into the IC's slot table.
    pub index: usize,
    /// Address the slot's first byte executes at.
    pub start: u64,
    /// Address of the slot's `num_inside` counter, for the inline
    /// increment emitted by invalidation-aware slots.
    pub num_inside_addr: u64,
}

/// An in-flight rewrite of one IC slot.
///
/// Owns the slot reservation between `prepare_entry` and `commit` /
/// `abort`. The rewriter core drives it; clients obtain one through
/// [`IcInfo::start_rewrite`](super::IcInfo::start_rewrite).
pub struct IcSlotRewrite {
    state: Arc<IcState>,
    debug_name: &'static str,
    picked: Option<PickedSlot>,
}

impl IcSlotRewrite {
    pub(super) fn new(state: Arc<IcState>, debug_name: &'static str) -> Self {
        IcSlotRewrite {
            state,
            debug_name,
            picked: None,
        }
    }

    /// The name the client gave this rewrite, for diagnostics.
    #[inline]
    pub fn debug_name(&self) -> &'static str {
        self.debug_name
    }

    /// Capacity of one slot in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.state.slot_size
    }

    /// Offset of the scratch slab from RSP while slot code runs.
    #[inline]
    pub fn scratch_rsp_offset(&self) -> i32 {
        self.state.scratch_rsp_offset
    }

    /// Size of the scratch slab in bytes.
    #[inline]
    pub fn scratch_size(&self) -> usize {
        self.state.scratch_size
    }

    /// The register the slot's value is returned in.
    #[inline]
    pub fn return_register(&self) -> Gpr {
        Gpr::Rax
    }

    /// Registers this slot's rewrites may allocate.
    #[inline]
    pub fn allocatable_regs(&self) -> GprSet {
        self.state.allocatable
    }

    /// The slot already reserved, if any.
    #[inline]
    pub fn picked_slot(&self) -> Option<PickedSlot> {
        self.picked
    }

    /// Reserve a concrete slot for this rewrite.
    ///
    /// Rotates through the slot table, skipping slots some thread is
    /// currently executing (`num_inside != 0`).
    pub fn prepare_entry(&mut self) -> Option<PickedSlot> {
        if self.picked.is_some() {
            return self.picked;
        }

        let num_slots = self.state.slots.len();
        for _ in 0..num_slots {
            let idx = self.state.next_slot.fetch_add(1, Ordering::Relaxed) % num_slots;
            let slot = &self.state.slots[idx];
            if slot.num_inside.load(Ordering::Acquire) != 0 {
                continue;
            }
            let picked = PickedSlot {
                index: idx,
                start: slot.start,
                num_inside_addr: &slot.num_inside as *const _ as u64,
            };
            self.picked = Some(picked);
            return self.picked;
        }
        None
    }

    /// Publish finished code into the reserved slot.
    ///
    /// Copies the bytes, pads the rest of the slot with `nop`, issues a
    /// release fence so the mutator and unwinder observe the code before
    /// the header is reachable, then registers the decref-info table.
    /// x86-64 needs no explicit i-cache invalidation beyond the fence.
    ///
    /// `guard_jumps` records the rewrite's slow-path exits
    /// (start offset, end offset, condition); they are kept with the slot
    /// so a later specialization can be stitched in behind the guards.
    pub fn commit(
        self,
        code: &[u8],
        gc_references: Vec<GcHandle>,
        decref_infos: Vec<(u64, Vec<Location>)>,
        guard_jumps: Vec<(usize, usize, Cond)>,
    ) {
        let picked = self.picked.expect("commit without prepare_entry");
        assert!(code.len() <= self.state.slot_size);

        {
            let mut region = self.state.region.lock();
            let offset = (picked.start - region.base()) as usize;
            region.write(offset, code);
            region.fill(offset + code.len(), self.state.slot_size - code.len(), 0x90);
        }
        fence(Ordering::Release);

        for (ip, locations) in decref_infos {
            register_decref_info(ip, locations);
        }

        let slot = &self.state.slots[picked.index];
        *slot.gc_refs.lock() = gc_references;
        *slot.guard_jumps.lock() = guard_jumps;
        slot.committed.store(true, Ordering::Release);

        self.state.note_committed(code.len());
    }

    /// Discard the rewrite and leave the slot as it was.
    pub fn abort(self) {
        self.state.note_aborted();
    }
}
