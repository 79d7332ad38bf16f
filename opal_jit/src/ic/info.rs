//! Per-IC bookkeeping: the slot table, the attempt gate, statistics and
//! invalidation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use opal_asm::GprSet;
use parking_lot::Mutex;

use super::decref::deregister_decref_range;
use super::region::CodeRegion;
use super::slot::{IcSlotRewrite, INVALIDATION_HEADER_SIZE};
use super::GcHandle;

/// Rewrite count at which an IC is considered megamorphic and further
/// specialization attempts are refused.
pub const MEGAMORPHIC_CUTOFF: u32 = 100;

/// Cap on the doubling retry back-off.
const MAX_RETRY_BACKOFF: u32 = 1 << 20;

// =============================================================================
// Statistics
// =============================================================================

#[derive(Default)]
pub(super) struct RewriteStats {
    pub attempts: AtomicU64,
    pub attempts_skipped: AtomicU64,
    pub started: AtomicU64,
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    pub total_bytes: AtomicU64,
    pub invalidations: AtomicU64,
}

/// Point-in-time copy of an IC's rewrite counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStatsSnapshot {
    pub attempts: u64,
    pub attempts_skipped: u64,
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub total_bytes: u64,
    pub invalidations: u64,
}

// =============================================================================
// IC State
// =============================================================================

pub(super) struct SlotState {
    pub start: u64,
    /// Threads currently executing this slot. Incremented by the slot's
    /// own entry code when invalidation support is on; gates slot reuse.
    pub num_inside: AtomicU32,
    pub committed: AtomicBool,
    pub gc_refs: Mutex<Vec<GcHandle>>,
    /// Slow-path exits of the committed code, for cold-path stitching:
    /// (start offset, end offset, condition).
    pub guard_jumps: Mutex<Vec<(usize, usize, opal_asm::Cond)>>,
}

pub(super) struct IcState {
    pub region: Mutex<CodeRegion>,
    pub slots: Box<[SlotState]>,
    pub slot_size: usize,
    pub scratch_rsp_offset: i32,
    pub scratch_size: usize,
    pub live_outs: Vec<u16>,
    pub allocatable: GprSet,
    pub next_slot: AtomicUsize,
    retry_in: AtomicU32,
    retry_backoff: AtomicU32,
    times_rewritten: AtomicU32,
    stats: RewriteStats,
}

impl IcState {
    pub fn note_committed(&self, bytes: usize) {
        self.times_rewritten.fetch_add(1, Ordering::Relaxed);
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn note_aborted(&self) {
        self.stats.aborted.fetch_add(1, Ordering::Relaxed);
        // Back off before trying this site again; failures tend to repeat.
        let backoff = self.retry_backoff.load(Ordering::Relaxed);
        self.retry_in.store(backoff, Ordering::Relaxed);
        self.retry_backoff
            .store((backoff * 2).min(MAX_RETRY_BACKOFF), Ordering::Relaxed);
    }
}

// =============================================================================
// IC Spec
// =============================================================================

/// Static description of an inline-cache site.
#[derive(Debug, Clone)]
pub struct IcSpec {
    /// Number of specialization slots.
    pub num_slots: usize,
    /// Capacity of each slot in bytes.
    pub slot_size: usize,
    /// Offset of the scratch slab from RSP while slot code runs.
    pub scratch_rsp_offset: i32,
    /// Size of the scratch slab in bytes (a multiple of 8).
    pub scratch_size: usize,
    /// DWARF numbers of the registers the caller expects preserved.
    pub live_outs: Vec<u16>,
    /// Registers rewrites of this site may allocate.
    pub allocatable: GprSet,
}

impl IcSpec {
    pub fn new(num_slots: usize, slot_size: usize) -> Self {
        IcSpec {
            num_slots,
            slot_size,
            scratch_rsp_offset: 0x40,
            scratch_size: 64,
            live_outs: Vec::new(),
            allocatable: GprSet::ALLOCATABLE,
        }
    }
}

// =============================================================================
// IC Info
// =============================================================================

/// Handle on one inline-cache site.
///
/// Clones share the site (the handle is an `Arc`).
#[derive(Clone)]
pub struct IcInfo {
    state: Arc<IcState>,
}

impl IcInfo {
    /// Create a site backed by a fresh nop-filled region.
    pub fn new(spec: IcSpec) -> Self {
        let region = CodeRegion::new(spec.num_slots * spec.slot_size);
        Self::over_region(spec, region)
    }

    /// Create a site whose region is based at an explicit address.
    pub fn with_base(spec: IcSpec, base: u64) -> Self {
        let region = CodeRegion::with_base(spec.num_slots * spec.slot_size, base);
        Self::over_region(spec, region)
    }

    fn over_region(spec: IcSpec, region: CodeRegion) -> Self {
        assert!(spec.num_slots > 0);
        assert!(spec.scratch_size % 8 == 0);
        let base = region.base();
        let slots: Box<[SlotState]> = (0..spec.num_slots)
            .map(|i| SlotState {
                start: base + (i * spec.slot_size) as u64,
                num_inside: AtomicU32::new(0),
                committed: AtomicBool::new(false),
                gc_refs: Mutex::new(Vec::new()),
                guard_jumps: Mutex::new(Vec::new()),
            })
            .collect();

        IcInfo {
            state: Arc::new(IcState {
                region: Mutex::new(region),
                slots,
                slot_size: spec.slot_size,
                scratch_rsp_offset: spec.scratch_rsp_offset,
                scratch_size: spec.scratch_size,
                live_outs: spec.live_outs,
                allocatable: spec.allocatable,
                next_slot: AtomicUsize::new(0),
                retry_in: AtomicU32::new(0),
                retry_backoff: AtomicU32::new(1),
                times_rewritten: AtomicU32::new(0),
                stats: RewriteStats::default(),
            }),
        }
    }

    /// Whether specialization should be attempted right now. Counts down
    /// the retry back-off and refuses megamorphic sites.
    pub fn should_attempt(&self) -> bool {
        self.state.stats.attempts.fetch_add(1, Ordering::Relaxed);
        let waiting = self.state.retry_in.load(Ordering::Relaxed);
        if waiting > 0 {
            self.state.retry_in.store(waiting - 1, Ordering::Relaxed);
            self.state.stats.attempts_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.is_megamorphic() {
            self.state.stats.attempts_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Whether this site has been respecialized past the cut-off.
    pub fn is_megamorphic(&self) -> bool {
        self.state.times_rewritten.load(Ordering::Relaxed) >= MEGAMORPHIC_CUTOFF
    }

    /// Begin a rewrite of this site.
    pub fn start_rewrite(&self, debug_name: &'static str) -> Option<IcSlotRewrite> {
        self.state.stats.started.fetch_add(1, Ordering::Relaxed);
        Some(IcSlotRewrite::new(Arc::clone(&self.state), debug_name))
    }

    /// DWARF numbers of the registers the caller expects preserved.
    pub fn live_outs(&self) -> &[u16] {
        &self.state.live_outs
    }

    /// Registers rewrites of this site may allocate.
    pub fn allocatable_regs(&self) -> GprSet {
        self.state.allocatable
    }

    /// The address the region's first byte executes at.
    pub fn base(&self) -> u64 {
        self.state.region.lock().base()
    }

    /// Address of slot `index`.
    pub fn slot_start(&self, index: usize) -> u64 {
        self.state.slots[index].start
    }

    /// Whether slot `index` currently holds committed code.
    pub fn slot_committed(&self, index: usize) -> bool {
        self.state.slots[index].committed.load(Ordering::Acquire)
    }

    /// A copy of the current region bytes.
    pub fn code_snapshot(&self) -> Vec<u8> {
        self.state.region.lock().as_slice().to_vec()
    }

    /// Point-in-time copy of the rewrite counters.
    pub fn stats(&self) -> RewriteStatsSnapshot {
        let s = &self.state.stats;
        RewriteStatsSnapshot {
            attempts: s.attempts.load(Ordering::Relaxed),
            attempts_skipped: s.attempts_skipped.load(Ordering::Relaxed),
            started: s.started.load(Ordering::Relaxed),
            committed: s.committed.load(Ordering::Relaxed),
            aborted: s.aborted.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            invalidations: s.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Overwrite slot `index`'s invalidation header with a `jmp` past the
    /// slot, drop its pinned references and retract its decref info.
    ///
    /// The slot stays reserved until `num_inside` drains to zero; only
    /// then will `prepare_entry` hand it out again.
    pub fn invalidate_slot(&self, index: usize) {
        let slot = &self.state.slots[index];
        if !slot.committed.swap(false, Ordering::AcqRel) {
            return;
        }

        let slot_size = self.state.slot_size;
        {
            let mut region = self.state.region.lock();
            let offset = (slot.start - region.base()) as usize;
            // jmp rel32 to the slot end; rel is measured from the end of
            // the 5-byte instruction.
            let rel = (slot_size - INVALIDATION_HEADER_SIZE) as i32;
            let mut header = [0u8; INVALIDATION_HEADER_SIZE];
            header[0] = 0xE9;
            header[1..5].copy_from_slice(&rel.to_le_bytes());
            region.write(offset, &header);
        }
        std::sync::atomic::fence(Ordering::Release);

        deregister_decref_range(slot.start, slot.start + slot_size as u64);
        slot.gc_refs.lock().clear();
        slot.guard_jumps.lock().clear();
        self.state.stats.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Invalidator
// =============================================================================

/// A dependency list from some runtime assumption (a class version, a
/// hidden-class transition) to the slots specialized against it.
///
/// When the assumption breaks, `invalidate_all` retracts every dependent
/// slot in one batch.
#[derive(Default)]
pub struct Invalidator {
    deps: Mutex<Vec<(IcInfo, usize)>>,
}

impl Invalidator {
    pub fn new() -> Self {
        Invalidator::default()
    }

    /// Record that `slot` of `ic` depends on this assumption.
    pub fn add_dependent(&self, ic: &IcInfo, slot: usize) {
        self.deps.lock().push((ic.clone(), slot));
    }

    /// Number of dependent slots currently recorded.
    pub fn dependent_count(&self) -> usize {
        self.deps.lock().len()
    }

    /// Invalidate every dependent slot. Returns how many were live.
    pub fn invalidate_all(&self) -> usize {
        let deps: Vec<_> = self.deps.lock().drain(..).collect();
        let mut live = 0;
        for (ic, slot) in deps {
            if ic.slot_committed(slot) {
                live += 1;
            }
            ic.invalidate_slot(slot);
        }
        live
    }
}

// =============================================================================
// Tests
// =============================================================================
