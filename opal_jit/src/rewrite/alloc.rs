//! Register allocation, spilling and the scratch slab.
//!
//! The allocator is deliberately simple: `vars_by_location` is the single
//! source of truth for what lives where, victims are chosen by farthest
//! next use, and spills prefer re-dropping (multi-homed values,
//! constants, scratch-allocation owners are all re-materializable) over
//! moving to a callee-save register over storing to scratch.

use opal_asm::{Gpr, GprSet, Mem, Xmm};
use smallvec::SmallVec;

use super::location::Location;
use super::var::{Occupant, VarId};
use super::AbortReason;
use super::Rewriter;

impl Rewriter {
    /// The RSP-relative operand of a scratch or stack location.
    pub(super) fn indirect_for(&self, l: Location) -> Mem {
        match l {
            Location::Scratch(offset) => {
                Mem::new(Gpr::Rsp, self.rewrite.scratch_rsp_offset() + offset)
            }
            Location::Stack(offset) => Mem::new(Gpr::Rsp, offset),
            other => panic!("{} is not addressable", other),
        }
    }

    /// First free 8-byte scratch slot, or fail the rewrite.
    pub(super) fn alloc_scratch(&mut self) -> Option<Location> {
        debug_assert!(self.phase_emitting);
        let scratch_size = self.rewrite.scratch_size() as i32;
        let mut offset = 0;
        while offset < scratch_size {
            let l = Location::Scratch(offset);
            if !self.vars_by_location.contains_key(&l) {
                return Some(l);
            }
            offset += 8;
        }
        self.fail(AbortReason::ScratchExhausted);
        None
    }

    /// Evict the occupant of `reg`.
    ///
    /// Values that survive somewhere else, constants, and scratch
    /// allocation owners just drop the register. Otherwise the value
    /// moves to a free allocatable callee-save register if there is one
    /// (there is none with the standard allocatable set), else to a
    /// scratch slot. `preserve` is never picked as the new home.
    pub(super) fn spill_register(&mut self, reg: Gpr, preserve: Location) {
        debug_assert!(matches!(preserve, Location::Reg(_) | Location::AnyReg));

        let v = match self.vars_by_location.get(&Location::Reg(reg)) {
            Some(Occupant::Var(v)) => *v,
            other => panic!("spill of {} holding {:?}", reg, other),
        };

        let rematerializable = {
            let var = self.var(v);
            var.locations.len() > 1 || var.is_constant || var.is_scratch_allocation()
        };
        if rematerializable {
            self.remove_location_from_var(v, Location::Reg(reg));
            return;
        }

        let callee_save = self.allocatable_regs.intersection(GprSet::CALLEE_SAVE);
        for new_reg in callee_save.iter() {
            if self.vars_by_location.contains_key(&Location::Reg(new_reg)) {
                continue;
            }
            if Location::Reg(new_reg) == preserve {
                continue;
            }
            self.asm.mov_rr(new_reg, reg);
            self.add_location_to_var(v, Location::Reg(new_reg));
            self.remove_location_from_var(v, Location::Reg(reg));
            return;
        }

        let Some(scratch) = self.alloc_scratch() else {
            return;
        };
        let mem = self.indirect_for(scratch);
        self.asm.mov_store(mem, reg);
        self.add_location_to_var(v, scratch);
        self.remove_location_from_var(v, Location::Reg(reg));
    }

    /// Evict the occupant of an XMM register into scratch.
    pub(super) fn spill_xmm(&mut self, reg: Xmm) {
        debug_assert!(self.phase_emitting);
        let v = match self.vars_by_location.get(&Location::Xmm(reg)) {
            Some(Occupant::Var(v)) => *v,
            other => panic!("spill of {} holding {:?}", reg, other),
        };
        debug_assert_eq!(self.var(v).locations.len(), 1);

        let Some(scratch) = self.alloc_scratch() else {
            return;
        };
        let mem = self.indirect_for(scratch);
        self.asm.movsd_store(mem, reg);
        self.add_location_to_var(v, scratch);
        self.remove_location_from_var(v, Location::Xmm(reg));
    }

    pub(super) fn alloc_reg(&mut self, dest: Location, other_than: Location) -> Gpr {
        self.alloc_reg_from(dest, other_than, self.allocatable_regs)
    }

    /// Allocate a GP register.
    ///
    /// A specific destination evicts its occupant. `AnyReg` prefers a
    /// free register and otherwise spills the occupied register whose
    /// value's next use lies farthest in the future, skipping pinned
    /// entry args during the guard prefix and values mid-release.
    pub(super) fn alloc_reg_from(
        &mut self,
        dest: Location,
        other_than: Location,
        valid: GprSet,
    ) -> Gpr {
        debug_assert!(self.phase_emitting);

        match dest {
            Location::AnyReg => {
                let mut best: Option<(usize, Gpr)> = None;
                for reg in valid.iter() {
                    if Location::Reg(reg) == other_than {
                        continue;
                    }
                    let v = match self.vars_by_location.get(&Location::Reg(reg)) {
                        None => return reg,
                        Some(Occupant::Var(v)) => *v,
                        Some(Occupant::Reserved) => unreachable!("reserved register"),
                    };
                    let var = self.var(v);
                    if !self.done_guarding && var.is_arg && var.arg_loc == Location::Reg(reg) {
                        continue;
                    }
                    if var.is_done_using() {
                        // A dead value still occupying a register is one
                        // we are mid-way through releasing; leave it.
                        continue;
                    }
                    let next = var.uses[var.next_use];
                    if best.map_or(true, |(b, _)| next > b) {
                        best = Some((next, reg));
                    }
                }

                let Some((_, reg)) = best else {
                    self.fail(AbortReason::RegisterPressure);
                    return Gpr::Rax;
                };
                self.spill_register(reg, other_than);
                debug_assert!(
                    self.failed.is_some()
                        || !self.vars_by_location.contains_key(&Location::Reg(reg))
                );
                reg
            }
            Location::Reg(reg) => {
                debug_assert!(valid.contains(reg));
                if self.vars_by_location.contains_key(&Location::Reg(reg)) {
                    self.spill_register(reg, other_than);
                }
                debug_assert!(
                    self.failed.is_some()
                        || !self.vars_by_location.contains_key(&Location::Reg(reg))
                );
                reg
            }
            other => panic!("cannot allocate {}", other),
        }
    }

    /// Allocate an XMM register.
    pub(super) fn alloc_xmm(&mut self, dest: Location, other_than: Location) -> Xmm {
        debug_assert!(self.phase_emitting);

        match dest {
            Location::AnyReg => {
                for reg in Xmm::ALL {
                    if Location::Xmm(reg) == other_than {
                        continue;
                    }
                    if !self.vars_by_location.contains_key(&Location::Xmm(reg)) {
                        return reg;
                    }
                }
                // All occupied; evict a fixed victim that is not the
                // exclusion.
                let victim = if other_than == Location::Xmm(Xmm::Xmm1) {
                    Xmm::Xmm2
                } else {
                    Xmm::Xmm1
                };
                self.alloc_xmm(Location::Xmm(victim), other_than)
            }
            Location::Xmm(reg) => {
                if self.vars_by_location.contains_key(&Location::Xmm(reg)) {
                    self.spill_xmm(reg);
                }
                debug_assert!(
                    self.failed.is_some()
                        || !self.vars_by_location.contains_key(&Location::Xmm(reg))
                );
                reg
            }
            other => panic!("cannot allocate {}", other),
        }
    }

    // =========================================================================
    // Location Bookkeeping
    // =========================================================================

    pub(super) fn add_location_to_var(&mut self, v: VarId, l: Location) {
        if self.failed.is_some() {
            return;
        }
        debug_assert!(!self.var(v).is_in_location(l));
        debug_assert!(!self.vars_by_location.contains_key(&l));
        debug_assert!(matches!(
            l,
            Location::Reg(_) | Location::Xmm(_) | Location::Scratch(_) | Location::Stack(_)
        ));

        self.vars[v.index()].locations.push(l);
        self.vars_by_location.insert(l, Occupant::Var(v));

        // A value never needs more than one memory-like home: at most
        // one of small-constant, scratch, stack.
        #[cfg(debug_assertions)]
        {
            let var = self.var(v);
            let mut homes = 0;
            if var.is_constant && !super::rewriter::is_large_constant(var.constant_value) {
                homes += 1;
            }
            for loc in &var.locations {
                if matches!(loc, Location::Scratch(_) | Location::Stack(_)) {
                    homes += 1;
                }
            }
            debug_assert!(homes <= 1, "redundant memory homes for a value");
        }
    }

    pub(super) fn remove_location_from_var(&mut self, v: VarId, l: Location) {
        debug_assert!(self.var(v).is_in_location(l));
        debug_assert_eq!(self.vars_by_location.get(&l), Some(&Occupant::Var(v)));
        self.vars_by_location.remove(&l);
        self.vars[v.index()].locations.retain(|loc| *loc != l);
    }

    /// Check the location bijection: every entry of `vars_by_location`
    /// appears in its var's location set and vice versa. Debug builds
    /// only.
    pub(super) fn assert_consistent(&self) {
        #[cfg(debug_assertions)]
        {
            for (l, occ) in &self.vars_by_location {
                if let Occupant::Var(v) = occ {
                    debug_assert!(
                        self.var(*v).is_in_location(*l),
                        "map has {} for a var that disowns it",
                        l
                    );
                }
            }
            for (idx, var) in self.vars.iter().enumerate() {
                for l in &var.locations {
                    debug_assert_eq!(
                        self.vars_by_location.get(l),
                        Some(&Occupant::Var(VarId(idx as u32))),
                        "var location {} missing from the map",
                        l
                    );
                }
            }
        }
    }

    // =========================================================================
    // Use Tracking
    // =========================================================================

    /// Advance a var's use cursor; on exhaustion, release it (args stay
    /// pinned until guarding is done).
    pub(super) fn bump_use(&mut self, v: VarId) {
        debug_assert!(self.phase_emitting);
        {
            let var = self.var_mut(v);
            var.next_use += 1;
            debug_assert!(var.next_use <= var.uses.len());
            if var.next_use < var.uses.len() {
                return;
            }
        }
        if !self.done_guarding && self.var(v).is_arg {
            return;
        }
        self.release(v);
    }

    /// Bump early when releasing the var cannot emit code, freeing its
    /// registers for the rest of the action.
    pub(super) fn bump_use_early_if_possible(&mut self, v: VarId) {
        if self.var(v).reftype != super::RefType::Owned {
            self.bump_use(v);
        }
    }

    /// The paired late bump for owned values, whose release may emit a
    /// decref and so must come after the action's own emission.
    pub(super) fn bump_use_late_if_necessary(&mut self, v: VarId) {
        if self.var(v).reftype == super::RefType::Owned {
            self.bump_use(v);
        }
    }

    /// Release a var that was created with no uses at all.
    pub(super) fn release_if_no_uses(&mut self, v: VarId) {
        debug_assert!(self.phase_emitting);
        if self.var(v).uses.is_empty() {
            debug_assert_eq!(self.var(v).next_use, 0);
            self.release(v);
        }
    }

    /// Drop a var from the allocator, emitting the decref its ownership
    /// still owes (unless handed off), and freeing any scratch run it
    /// owns.
    pub(super) fn release(&mut self, v: VarId) {
        let owes_decref = {
            let var = self.var(v);
            var.reftype == super::RefType::Owned && !var.ref_handed_off()
        };
        if owes_decref {
            if self.var(v).nullable {
                self.emit_xdecref(v, &[]);
            } else {
                self.emit_decref(v, &[]);
            }
        }

        let locations: SmallVec<[Location; 4]> = self.vars[v.index()].locations.clone();
        for l in locations {
            self.vars_by_location.remove(&l);
        }

        if let Some((first, count)) = self.vars[v.index()].scratch_allocation {
            for slot in first..first + count {
                let l = Location::Scratch((slot * 8) as i32);
                debug_assert_eq!(self.vars_by_location.get(&l), Some(&Occupant::Reserved));
                self.vars_by_location.remove(&l);
            }
            self.vars[v.index()].scratch_allocation = None;
        }

        self.vars[v.index()].locations.clear();
    }
}
