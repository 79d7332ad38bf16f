//! Emit-phase execution of the action table.
//!
//! Everything here runs under `commit()`: materializing vars into
//! registers, the constant loader, guard emission with trampoline reuse,
//! attribute and arithmetic lowering, call setup with caller-save
//! spilling, and the refcount primitives with their decref-info
//! publication.

use opal_asm::{Cond, GenericReg, Gpr, GprSet, JumpDest, Mem, MovWidth, Xmm};
use smallvec::SmallVec;

use crate::ic::INVALIDATION_HEADER_SIZE;

use super::action::{ActionData, CmpOp};
use super::location::Location;
use super::rewriter::is_large_constant;
use super::var::{Occupant, VarId};
use super::AbortReason;
use super::Rewriter;
use super::{CLASS_OFFSET, DEALLOC_OFFSET, REFCOUNT_OFFSET};

/// Spill order at call sites: every caller-clobbered location.
const CALLER_SAVE_GPRS: [Gpr; 9] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
];

impl Rewriter {
    // =========================================================================
    // Materialization
    // =========================================================================

    /// A small immediate usable directly in an instruction, if the var is
    /// a small constant.
    pub(super) fn try_get_as_immediate(&self, v: VarId) -> Option<u64> {
        let var = self.var(v);
        if var.is_constant && !is_large_constant(var.constant_value) {
            Some(var.constant_value)
        } else {
            None
        }
    }

    /// Get `v` into a GP register, materializing or moving as needed.
    ///
    /// `dest` is a specific register or `AnyReg`; `other_than` excludes
    /// one register from any allocation this triggers.
    pub(super) fn var_get_in_reg(
        &mut self,
        v: VarId,
        dest: Location,
        allow_const_in_reg: bool,
        other_than: Location,
    ) -> Gpr {
        debug_assert!(matches!(dest, Location::Reg(_) | Location::AnyReg));
        #[cfg(debug_assertions)]
        if !allow_const_in_reg {
            let var = self.var(v);
            debug_assert!(!var.is_constant || is_large_constant(var.constant_value));
        }

        // A constant with no home yet: materialize it.
        if self.var(v).locations.is_empty() && self.var(v).is_constant {
            let reg = self.alloc_reg(dest, other_than);
            if self.failed.is_some() {
                return reg;
            }
            let val = self.var(v).constant_value;
            self.load_const_into_reg(val, reg);
            self.add_location_to_var(v, Location::Reg(reg));
            return reg;
        }

        // A scratch-allocation owner with no home: recompute its address.
        if self.var(v).locations.is_empty() && self.var(v).is_scratch_allocation() {
            let reg = self.alloc_reg(dest, other_than);
            if self.failed.is_some() {
                return reg;
            }
            let mem = self.indirect_for(self.var(v).scratch_location(0));
            self.asm.lea(reg, mem);
            self.add_location_to_var(v, Location::Reg(reg));
            return reg;
        }

        let locations: SmallVec<[Location; 4]> = self.var(v).locations.clone();
        assert!(!locations.is_empty());

        // Already exactly where it was asked for?
        for &l in &locations {
            if l == dest {
                return l.as_reg();
            }
        }

        // In some other register?
        for &l in &locations {
            if let Location::Reg(reg) = l {
                if let Location::Reg(dest_reg) = dest {
                    debug_assert!(dest_reg != reg);
                    self.alloc_reg(dest, other_than);
                    if self.failed.is_some() {
                        return dest_reg;
                    }
                    self.asm.mov_rr(dest_reg, reg);
                    self.add_location_to_var(v, dest);
                    return dest_reg;
                }
                debug_assert!(Location::Reg(reg) != other_than);
                return reg;
            }
        }

        // Reload from its single memory home.
        debug_assert_eq!(locations.len(), 1);
        let l = locations[0];
        let reg = self.alloc_reg(dest, other_than);
        if self.failed.is_some() {
            return reg;
        }
        debug_assert!(!self.vars_by_location.contains_key(&Location::Reg(reg)));
        let mem = self.indirect_for(l);
        self.asm.mov_load(reg, mem);
        self.add_location_to_var(v, Location::Reg(reg));
        reg
    }

    /// Get `v` into an XMM register.
    pub(super) fn var_get_in_xmm(&mut self, v: VarId, dest: Location) -> Xmm {
        debug_assert!(matches!(dest, Location::Xmm(_) | Location::AnyReg));
        debug_assert!(!self.var(v).is_constant);

        let locations: SmallVec<[Location; 4]> = self.var(v).locations.clone();
        assert!(!locations.is_empty());

        for &l in &locations {
            if l == dest {
                return l.as_xmm();
            }
        }

        for &l in &locations {
            if let Location::Xmm(reg) = l {
                if let Location::Xmm(dest_reg) = dest {
                    debug_assert!(dest_reg != reg);
                    self.alloc_xmm(dest, Location::AnyReg);
                    self.asm.movsd_rr(dest_reg, reg);
                    self.add_location_to_var(v, dest);
                    return dest_reg;
                }
                return reg;
            }
        }

        debug_assert_eq!(locations.len(), 1);
        let l = locations[0];
        debug_assert!(matches!(l, Location::Scratch(_)));
        let reg = self.alloc_xmm(dest, Location::AnyReg);
        let mem = self.indirect_for(l);
        self.asm.movsd_load(reg, mem);
        self.add_location_to_var(v, Location::Xmm(reg));
        reg
    }

    /// Claim a register for a freshly produced value.
    ///
    /// During the guard prefix a pinned entry arg never gets evicted for
    /// a result; the request falls back to `AnyReg`.
    pub(super) fn var_initialize_in_reg(&mut self, v: VarId, mut dest: Location) -> Gpr {
        debug_assert!(self.phase_emitting);

        if let Location::Reg(_) = dest {
            if !self.done_guarding {
                if let Some(Occupant::Var(occ)) = self.vars_by_location.get(&dest) {
                    if self.var(*occ).is_arg {
                        dest = Location::AnyReg;
                    }
                }
            }
        }

        let reg = self.alloc_reg(dest, Location::AnyReg);
        if self.failed.is_some() {
            return reg;
        }
        self.add_location_to_var(v, Location::Reg(reg));
        reg
    }

    pub(super) fn var_initialize_in_xmm(&mut self, v: VarId, dest: Location) -> Xmm {
        debug_assert!(self.phase_emitting);
        let reg = self.alloc_xmm(dest, Location::AnyReg);
        self.add_location_to_var(v, Location::Xmm(reg));
        reg
    }

    // =========================================================================
    // Constant Loading
    // =========================================================================

    /// A register already holding `val` through the constant dedup table.
    fn find_const_in_reg(&self, val: u64) -> Option<Gpr> {
        for &(known, v) in &self.consts {
            if known != val {
                continue;
            }
            for &l in &self.var(v).locations {
                if let Location::Reg(reg) = l {
                    return Some(reg);
                }
            }
        }
        None
    }

    /// Rebase off some register-held constant with a small delta.
    fn try_lea_const(&mut self, val: u64, dest: Gpr) -> bool {
        if !is_large_constant(val) {
            return false;
        }
        for reg in Gpr::ALL {
            let v = match self.vars_by_location.get(&Location::Reg(reg)) {
                Some(Occupant::Var(v)) => *v,
                _ => continue,
            };
            if !self.var(v).is_constant {
                continue;
            }
            let delta = val.wrapping_sub(self.var(v).constant_value) as i64;
            if is_large_constant(delta as u64) {
                continue;
            }
            self.asm.lea(dest, Mem::new(reg, delta as i32));
            return true;
        }
        false
    }

    /// Materialize a constant into `dest` by the cheapest route: the
    /// zero idiom, a reg-reg copy of an already-loaded constant, a `lea`
    /// off a nearby one, or the plain immediate.
    pub(super) fn load_const_into_reg(&mut self, val: u64, dest: Gpr) {
        debug_assert!(self.phase_emitting);

        if val == 0 {
            self.asm.clear_reg(dest);
            return;
        }
        if let Some(src) = self.find_const_in_reg(val) {
            if src != dest {
                self.asm.mov_rr(dest, src);
            }
            return;
        }
        if self.try_lea_const(val, dest) {
            return;
        }
        self.asm.mov_imm(dest, val);
    }

    // =========================================================================
    // Arg Restoration (guard prefix)
    // =========================================================================

    /// Put every entry arg (and GP live-out) back into its canonical
    /// register. Only `mov` family instructions may be emitted here: a
    /// guard's conditional jump reads the flags set before this runs.
    pub(super) fn restore_args(&mut self) {
        debug_assert!(!self.done_guarding);

        for i in 0..self.args.len() {
            let arg = self.args[i];
            self.bump_use(arg);

            let l = Location::for_arg(i);
            if matches!(l, Location::Stack(_)) {
                continue;
            }
            // Entry args are never constants or scratch owners, so
            // re-pinning them moves words and touches no flags.
            debug_assert!(!self.var(arg).is_constant);
            debug_assert!(!self.var(arg).is_scratch_allocation());
            if !self.var(arg).is_in_location(l) {
                self.var_get_in_reg(arg, l, false, Location::AnyReg);
            }
        }

        for i in 0..self.live_outs.len() {
            if let Some(GenericReg::Gp(reg)) = GenericReg::from_dwarf(self.live_out_regs[i]) {
                let lo = self.live_outs[i];
                let l = Location::Reg(reg);
                if !self.var(lo).is_in_location(l) {
                    self.var_get_in_reg(lo, l, false, Location::AnyReg);
                }
            }
        }

        self.assert_args_in_place();
    }

    pub(super) fn assert_args_in_place(&self) {
        #[cfg(debug_assertions)]
        {
            for i in 0..self.args.len() {
                let arg = self.args[i];
                debug_assert!(self.var(arg).is_in_location(self.var(arg).arg_loc));
            }
            for i in 0..self.live_outs.len() {
                let gr = GenericReg::from_dwarf(self.live_out_regs[i]).unwrap();
                debug_assert!(self.var(self.live_outs[i]).is_in_location(Location::from_generic(gr)));
            }
        }
    }

    // =========================================================================
    // Guard Emission
    // =========================================================================

    /// Jump to the slow path on `condition`.
    ///
    /// A `jcc` to the slot end costs 6 bytes once the displacement
    /// exceeds ±128; chains of guards add up. If an earlier slow-path
    /// jump with the same condition is still within short range, emit a
    /// 2-byte jump onto it and let it relay. Measured as a small net win
    /// despite the extra hop.
    pub(super) fn next_slot_jump(&mut self, condition: Cond) {
        let mut prior = None;
        for &(start, _, cond) in self.next_slot_jumps.iter().rev() {
            if cond == condition {
                prior = Some(start);
                break;
            }
        }

        match prior {
            Some(start) if self.asm.bytes_written() - start < 0x80 => {
                self.asm.jcc(condition, JumpDest::from_start(start));
            }
            _ => {
                let start = self.asm.bytes_written();
                self.asm
                    .jcc(condition, JumpDest::from_start(self.rewrite.slot_size()));
                self.next_slot_jumps
                    .push((start, self.asm.bytes_written(), condition));
            }
        }
    }

    fn emit_guard(&mut self, var: VarId, val_var: VarId, negate: bool) {
        self.asm.comment("guard");
        debug_assert!(self.var(val_var).is_constant);
        let val = self.var(val_var).constant_value;

        let var_reg = self.var_get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
        if is_large_constant(val) {
            let reg = self.var_get_in_reg(val_var, Location::AnyReg, true, Location::Reg(var_reg));
            self.asm.cmp_rr(var_reg, reg);
        } else if val == 0 {
            self.asm.test_rr(var_reg, var_reg);
        } else {
            self.asm.cmp_imm(var_reg, val as i32);
        }

        // Moves only; the flags must survive to the jump.
        self.restore_args();
        self.next_slot_jump(if negate { Cond::Equal } else { Cond::NotEqual });

        self.bump_use(var);
        self.bump_use(val_var);
        self.assert_consistent();
    }

    fn emit_guard_not_lt0(&mut self, var: VarId) {
        self.asm.comment("guard_not_lt0");
        let var_reg = self.var_get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
        self.asm.test_rr(var_reg, var_reg);

        self.restore_args();
        self.next_slot_jump(Cond::Sign);

        self.bump_use(var);
        self.assert_consistent();
    }

    fn emit_attr_guard(&mut self, var: VarId, offset: i32, val_var: VarId, negate: bool) {
        self.asm.comment("attr_guard");
        debug_assert!(self.var(val_var).is_constant);
        let val = self.var(val_var).constant_value;

        let var_reg = self.var_get_in_reg(var, Location::AnyReg, true, Location::AnyReg);
        if is_large_constant(val) {
            // Guarding an attribute of a constant against itself shows up
            // for self-referential class objects; reuse the register.
            let reg = if val_var == var {
                var_reg
            } else {
                self.var_get_in_reg(val_var, Location::AnyReg, true, Location::Reg(var_reg))
            };
            self.asm.cmp_mem_reg(Mem::new(var_reg, offset), reg);
        } else {
            self.asm.cmp_mem_imm(Mem::new(var_reg, offset), val as i32);
        }

        self.restore_args();
        self.next_slot_jump(if negate { Cond::Equal } else { Cond::NotEqual });

        self.bump_use(var);
        self.bump_use(val_var);
        self.assert_consistent();
    }

    // =========================================================================
    // Attribute / Arithmetic Emission
    // =========================================================================

    fn emit_get_attr(
        &mut self,
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
        width: MovWidth,
    ) {
        self.asm.comment("get_attr");
        let ptr_reg = self.var_get_in_reg(ptr, Location::AnyReg, true, Location::AnyReg);

        self.bump_use_early_if_possible(ptr);

        if self.failed.is_none() {
            let new_reg = self.var_initialize_in_reg(result, dest);
            self.asm
                .mov_load_width(new_reg, Mem::new(ptr_reg, offset), width);
        }

        self.release_if_no_uses(result);
        self.bump_use_late_if_necessary(ptr);
        self.assert_consistent();
    }

    fn emit_get_attr_fp(
        &mut self,
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
        single_precision: bool,
    ) {
        self.asm.comment("get_attr_fp");
        let ptr_reg = self.var_get_in_reg(ptr, Location::AnyReg, false, Location::AnyReg);

        self.bump_use_early_if_possible(ptr);

        let new_reg = self.var_initialize_in_xmm(result, dest);
        if single_precision {
            self.asm.movss_load(new_reg, Mem::new(ptr_reg, offset));
            self.asm.cvtss2sd(new_reg, new_reg);
        } else {
            self.asm.movsd_load(new_reg, Mem::new(ptr_reg, offset));
        }

        self.bump_use_late_if_necessary(ptr);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_set_attr(&mut self, ptr: VarId, offset: i32, val: VarId, width: MovWidth) {
        self.asm.comment("set_attr");

        if self.var(ptr).is_scratch_allocation() {
            let dest_loc = self.var(ptr).scratch_location(offset);
            let mem = self.indirect_for(dest_loc);
            if let Some(imm) = self.try_get_as_immediate(val) {
                self.asm.mov_store_imm(mem, imm as i32, width);
            } else {
                let val_reg = self.var_get_in_reg(val, Location::AnyReg, false, Location::AnyReg);
                self.asm.mov_store_width(mem, val_reg, width);
            }
        } else {
            let ptr_reg = self.var_get_in_reg(ptr, Location::AnyReg, false, Location::AnyReg);
            if let Some(imm) = self.try_get_as_immediate(val) {
                self.asm
                    .mov_store_imm(Mem::new(ptr_reg, offset), imm as i32, width);
            } else {
                let val_reg =
                    self.var_get_in_reg(val, Location::AnyReg, false, Location::Reg(ptr_reg));
                debug_assert_ne!(ptr_reg, val_reg);
                self.asm
                    .mov_store_width(Mem::new(ptr_reg, offset), val_reg, width);
            }
        }

        self.bump_use(ptr);

        // The store published a pointer into the value's scratch run; the
        // use tracker cannot see reads through that pointer, so the run
        // must not be reclaimed when the var dies.
        if self.var(val).is_scratch_allocation() {
            self.vars[val.index()].scratch_allocation = None;
        }
        self.bump_use(val);

        self.assert_consistent();
    }

    fn emit_cmp(&mut self, result: VarId, op: CmpOp, lhs: VarId, rhs: VarId, dest: Location) {
        self.asm.comment("cmp");
        let lhs_reg = self.var_get_in_reg(lhs, Location::AnyReg, false, dest);
        let rhs_reg = self.var_get_in_reg(rhs, Location::AnyReg, false, dest);
        debug_assert_ne!(lhs_reg, rhs_reg);

        self.bump_use_early_if_possible(lhs);
        self.bump_use_early_if_possible(rhs);

        // setcc writes a byte register; stay within the non-REX set.
        let valid = GprSet::SETCC.intersection(self.allocatable_regs);
        let new_reg = self.alloc_reg_from(dest, Location::AnyReg, valid);
        if self.failed.is_some() {
            return;
        }
        self.add_location_to_var(result, Location::Reg(new_reg));

        self.asm.cmp_rr(lhs_reg, rhs_reg);
        match op {
            CmpOp::Eq => self.asm.setcc(Cond::Equal, new_reg),
            CmpOp::Ne => self.asm.setcc(Cond::NotEqual, new_reg),
        }

        self.bump_use_late_if_necessary(lhs);
        self.bump_use_late_if_necessary(rhs);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_to_bool(&mut self, result: VarId, var: VarId, dest: Location) {
        self.asm.comment("to_bool");
        let var_reg = self.var_get_in_reg(var, Location::AnyReg, false, Location::AnyReg);

        self.bump_use_early_if_possible(var);

        let valid = GprSet::SETCC.intersection(self.allocatable_regs);
        let result_reg = self.alloc_reg_from(dest, Location::AnyReg, valid);
        if self.failed.is_some() {
            return;
        }
        self.add_location_to_var(result, Location::Reg(result_reg));

        self.asm.test_rr(var_reg, var_reg);
        self.asm.setcc(Cond::NOT_ZERO, result_reg);

        self.bump_use_late_if_necessary(var);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_add(&mut self, result: VarId, a: VarId, imm: i64, dest: Location) {
        self.asm.comment("add");
        let new_reg = self.alloc_reg(dest, Location::AnyReg);
        if self.failed.is_some() {
            return;
        }
        let a_reg = self.var_get_in_reg(a, Location::AnyReg, true, Location::Reg(new_reg));
        debug_assert_ne!(a_reg, new_reg);

        self.add_location_to_var(result, Location::Reg(new_reg));
        self.asm.mov_rr(new_reg, a_reg);
        assert!(!is_large_constant(imm as u64), "large addend unsupported");
        self.asm.add_imm(new_reg, imm as i32);

        self.bump_use(a);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    // =========================================================================
    // Scratch Allocation Emission
    // =========================================================================

    /// Reserve a run of scratch slots for `result`. Returns the first
    /// slot index.
    fn emit_allocate(&mut self, result: VarId, slots: usize) -> usize {
        self.asm.comment("allocate");
        debug_assert!(slots >= 1);

        let scratch_size = self.rewrite.scratch_size();
        let mut consecutive = 0;
        let mut offset = 0;
        while offset < scratch_size {
            let l = Location::Scratch(offset as i32);
            if self.vars_by_location.contains_key(&l) {
                consecutive = 0;
            } else {
                consecutive += 1;
                if consecutive == slots {
                    let last = offset / 8;
                    let first = last + 1 - slots;
                    // Reserve the run so nothing else lands in it; the
                    // placeholders outlive any register copy of the
                    // address.
                    for slot in first..=last {
                        let l = Location::Scratch((slot * 8) as i32);
                        debug_assert!(!self.vars_by_location.contains_key(&l));
                        self.vars_by_location.insert(l, Occupant::Reserved);
                    }
                    debug_assert!(self.var(result).scratch_allocation.is_none());
                    self.vars[result.index()].scratch_allocation = Some((first, slots));
                    self.assert_consistent();
                    self.release_if_no_uses(result);
                    return first;
                }
            }
            offset += 8;
        }

        self.fail(AbortReason::ScratchExhausted);
        0
    }

    fn emit_allocate_and_copy(&mut self, result: VarId, array_ptr: VarId, slots: usize) {
        self.asm.comment("allocate_and_copy");
        let first = self.emit_allocate(result, slots);
        if self.failed.is_some() {
            return;
        }

        let src = self.var_get_in_reg(array_ptr, Location::AnyReg, false, Location::AnyReg);
        let tmp = self.alloc_reg(Location::AnyReg, Location::Reg(src));
        if self.failed.is_some() {
            return;
        }
        debug_assert_ne!(tmp, src);

        let scratch_base = self.rewrite.scratch_rsp_offset();
        for i in 0..slots {
            self.asm.mov_load(tmp, Mem::new(src, (8 * i) as i32));
            self.asm.mov_store(
                Mem::new(Gpr::Rsp, scratch_base + ((first + i) * 8) as i32),
                tmp,
            );
        }

        self.bump_use(array_ptr);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_allocate_and_copy_plus1(
        &mut self,
        result: VarId,
        first_elem: VarId,
        rest_ptr: Option<VarId>,
        n_rest: usize,
    ) {
        self.asm.comment("allocate_and_copy_plus1");
        let first = self.emit_allocate(result, n_rest + 1);
        if self.failed.is_some() {
            return;
        }

        let scratch_base = self.rewrite.scratch_rsp_offset();
        let first_reg = self.var_get_in_reg(first_elem, Location::AnyReg, false, Location::AnyReg);
        self.asm.mov_store(
            Mem::new(Gpr::Rsp, scratch_base + (first * 8) as i32),
            first_reg,
        );

        if let Some(rest) = rest_ptr {
            debug_assert!(n_rest > 0);
            let src = self.var_get_in_reg(rest, Location::AnyReg, false, Location::AnyReg);
            let tmp = self.alloc_reg(Location::AnyReg, Location::Reg(src));
            if self.failed.is_some() {
                return;
            }
            debug_assert_ne!(tmp, src);
            for i in 0..n_rest {
                self.asm.mov_load(tmp, Mem::new(src, (8 * i) as i32));
                self.asm.mov_store(
                    Mem::new(Gpr::Rsp, scratch_base + ((first + i + 1) * 8) as i32),
                    tmp,
                );
            }
            self.bump_use(rest);
        }

        self.bump_use(first_elem);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    // =========================================================================
    // Call Emission
    // =========================================================================

    /// Ready the machine for a call: pad and mark the invalidation
    /// header, place the arguments, and clear every caller-clobbered
    /// location.
    pub(super) fn setup_call(
        &mut self,
        has_side_effects: bool,
        gp_args: &[VarId],
        xmm_args: &[VarId],
        preserve: Location,
        bump_if_possible: &[VarId],
    ) {
        if has_side_effects {
            debug_assert!(self.done_guarding);

            // The invalidator overwrites the slot prefix with a jmp; no
            // observable side effect may happen before that region ends.
            while self.asm.bytes_written() < INVALIDATION_HEADER_SIZE {
                self.asm.nop();
            }

            if self.needs_invalidation_support && !self.marked_inside_ic {
                let counter_addr = self.picked.unwrap().num_inside_addr;
                if is_large_constant(counter_addr) {
                    let reg = self.alloc_reg(Location::AnyReg, preserve);
                    if self.failed.is_some() {
                        return;
                    }
                    self.load_const_into_reg(counter_addr, reg);
                    self.asm.incl(Mem::new(reg, 0));
                } else {
                    self.asm.incl_abs(counter_addr as u32);
                }
                self.assert_consistent();
                self.marked_inside_ic = true;
            }
        }

        for (i, &v) in gp_args.iter().enumerate() {
            let l = Location::for_arg(i);
            let reg = l.as_reg(); // stack-passed call args are not supported here

            if !self.var(v).is_in_location(l) {
                // Evict whatever holds the arg register now.
                self.alloc_reg(l, preserve);
                if self.failed.is_some() {
                    return;
                }
                debug_assert!(!self.vars_by_location.contains_key(&l));

                if let Some(imm) = self.try_get_as_immediate(v) {
                    if imm == 0 {
                        self.asm.clear_reg(reg);
                    } else {
                        self.asm.mov_imm(reg, imm);
                    }
                    self.add_location_to_var(v, l);
                } else {
                    let got = self.var_get_in_reg(v, l, false, Location::AnyReg);
                    debug_assert_eq!(got, reg);
                }
            }
            debug_assert!(self.failed.is_some() || self.var(v).is_in_location(l));
        }

        self.assert_consistent();

        for (i, &v) in xmm_args.iter().enumerate() {
            let l = Location::Xmm(Xmm::from_encoding(i as u8).unwrap());
            assert!(
                self.var(v).is_in_location(l),
                "xmm argument {} not pre-placed",
                i
            );
        }

        for &v in bump_if_possible {
            self.bump_use_early_if_possible(v);
        }

        // Clear the caller-clobbered register file. Values with a
        // surviving home just forget the register; the rest are spilled,
        // except an argument the call itself is consuming.
        let clobbered: SmallVec<[Location; 25]> = CALLER_SAVE_GPRS
            .iter()
            .map(|&r| Location::Reg(r))
            .chain(Xmm::ALL.iter().map(|&x| Location::Xmm(x)))
            .collect();

        for &check in &clobbered {
            debug_assert!(check.is_clobbered_by_call());
            let v = match self.vars_by_location.get(&check) {
                Some(Occupant::Var(v)) => *v,
                _ => continue,
            };

            let mut need_spill = self
                .var(v)
                .locations
                .iter()
                .all(|l| l.is_clobbered_by_call());
            if need_spill && gp_args.contains(&v) && self.var(v).is_done_using() {
                // The only thing left reading this arg is the call; its
                // register dies with it.
                need_spill = false;
            }

            if need_spill {
                match check {
                    Location::Reg(r) => self.spill_register(r, preserve),
                    Location::Xmm(x) => {
                        debug_assert_eq!(self.var(v).locations.len(), 1);
                        self.spill_xmm(x);
                    }
                    _ => unreachable!(),
                }
                if self.failed.is_some() {
                    return;
                }
            } else {
                self.remove_location_from_var(v, check);
            }
        }

        self.assert_consistent();

        #[cfg(debug_assertions)]
        for (l, _) in &self.vars_by_location {
            if matches!(l, Location::Reg(_) | Location::Xmm(_)) {
                debug_assert!(!l.is_clobbered_by_call(), "{} live across call", l);
            }
        }
    }

    /// Emit the call itself: `call rel32` when the target is within
    /// ±2 GiB of the next instruction, else indirect through `tmp`.
    pub(super) fn emit_call_optimal(&mut self, tmp: Gpr, func: u64) {
        debug_assert!(!self.vars_by_location.contains_key(&Location::Reg(tmp)));
        let next_ip = self.picked.unwrap().start + self.asm.bytes_written() as u64 + 5;
        let disp = func.wrapping_sub(next_ip) as i64;
        if opal_asm::encoder::fits_i32(disp) {
            self.asm.call_rel(disp as i32);
        } else {
            self.load_const_into_reg(func, tmp);
            self.asm.call_reg(tmp);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_call(
        &mut self,
        result: VarId,
        func: u64,
        has_side_effects: bool,
        can_throw: bool,
        gp_args: &[VarId],
        xmm_args: &[VarId],
        all_uses: &[VarId],
    ) {
        self.asm.comment("call");

        let tmp = self.alloc_reg(Location::Reg(Gpr::R11), Location::AnyReg);
        if self.failed.is_some() {
            return;
        }

        self.setup_call(
            has_side_effects,
            gp_args,
            xmm_args,
            Location::Reg(Gpr::R11),
            all_uses,
        );
        if self.failed.is_some() {
            return;
        }
        self.assert_consistent();

        self.emit_call_optimal(tmp, func);

        if can_throw {
            self.register_decref_info_here(None);
        }

        if self.failed.is_none() {
            debug_assert!(!self
                .vars_by_location
                .contains_key(&Location::Reg(Gpr::Rax)));
            self.add_location_to_var(result, Location::Reg(Gpr::Rax));
            self.assert_consistent();
        }

        self.release_if_no_uses(result);
        for &v in all_uses {
            self.bump_use_late_if_necessary(v);
        }
    }

    fn emit_check_and_call_on_match(&mut self, var: VarId, sentinel: i64, handler: u64) {
        self.asm.comment("check_and_call_on_match");
        let var_reg = self.var_get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
        if sentinel == 0 {
            self.asm.test_rr(var_reg, var_reg);
        } else {
            assert!(!is_large_constant(sentinel as u64));
            self.asm.cmp_imm(var_reg, sentinel as i32);
        }

        // Spills are moves; the flags survive to the branch.
        self.setup_call(false, &[], &[], Location::Reg(Gpr::Rax), &[]);
        if self.failed.is_some() {
            return;
        }

        let skip = self.asm.forward_jcc(Cond::NOT_ZERO);
        self.emit_call_optimal(Gpr::R11, handler);
        self.register_decref_info_here(None);
        self.asm.patch_jump(skip);

        self.bump_use(var);
        self.assert_consistent();
    }

    // =========================================================================
    // Refcount Emission
    // =========================================================================

    /// Increment `v`'s reference count `num` times.
    pub(super) fn emit_incref(&mut self, v: VarId, num: i32) {
        debug_assert!(num > 0);
        self.asm.comment("incref");

        // incref of a known NULL is a no-op.
        if self.var(v).is_constant && self.var(v).constant_value == 0 {
            return;
        }
        assert!(!self.var(v).nullable);

        let small_const = self
            .try_get_as_immediate(v)
            .filter(|&imm| imm != 0);

        if let Some(imm) = small_const {
            let addr = (imm as i64 + REFCOUNT_OFFSET as i64) as u32;
            for _ in 0..num {
                self.asm.incq_abs(addr);
            }
        } else {
            let reg = self.var_get_in_reg(v, Location::AnyReg, true, Location::AnyReg);
            if num == 1 {
                self.asm.incq(Mem::new(reg, REFCOUNT_OFFSET));
            } else {
                self.asm.add_mem_imm(Mem::new(reg, REFCOUNT_OFFSET), num);
            }
        }
        // The caller bumps uses; this is reachable from other emit paths.
    }

    /// The inline decref primitive: decrement, and on zero call the
    /// class deallocator. Publishes decref info at the deallocator call,
    /// including the dying value's own spilled location.
    pub(super) fn emit_decref(&mut self, v: VarId, vars_to_bump: &[VarId]) {
        debug_assert!(!self.var(v).nullable);
        self.asm.comment("decref");

        self.setup_call(true, &[v], &[], Location::Reg(Gpr::Rax), vars_to_bump);
        if self.failed.is_some() {
            return;
        }

        self.asm.decq(Mem::new(Gpr::Rdi, REFCOUNT_OFFSET));
        let not_zero = self.asm.forward_jcc(Cond::NOT_ZERO);
        self.asm.mov_load(Gpr::Rax, Mem::new(Gpr::Rdi, CLASS_OFFSET));
        self.asm.call_mem(Mem::new(Gpr::Rax, DEALLOC_OFFSET));
        self.register_decref_info_here(Some(v));
        self.asm.patch_jump(not_zero);

        for &u in vars_to_bump {
            self.bump_use_late_if_necessary(u);
        }
    }

    /// Null-tolerant decref.
    pub(super) fn emit_xdecref(&mut self, v: VarId, vars_to_bump: &[VarId]) {
        debug_assert!(self.var(v).nullable);
        self.asm.comment("xdecref");

        self.setup_call(true, &[v], &[], Location::Reg(Gpr::Rax), vars_to_bump);
        if self.failed.is_some() {
            return;
        }

        self.asm.test_rr(Gpr::Rdi, Gpr::Rdi);
        let is_null = self.asm.forward_jcc(Cond::ZERO);
        self.asm.decq(Mem::new(Gpr::Rdi, REFCOUNT_OFFSET));
        let not_zero = self.asm.forward_jcc(Cond::NOT_ZERO);
        self.asm.mov_load(Gpr::Rax, Mem::new(Gpr::Rdi, CLASS_OFFSET));
        self.asm.call_mem(Mem::new(Gpr::Rax, DEALLOC_OFFSET));
        self.register_decref_info_here(Some(v));
        self.asm.patch_jump(not_zero);
        self.asm.patch_jump(is_null);

        for &u in vars_to_bump {
            self.bump_use_late_if_necessary(u);
        }
    }

    // =========================================================================
    // Decref Info
    // =========================================================================

    /// The best unwinder-visible location of `v`: a scratch slot
    /// (converted to a plain stack offset, since the unwinder does not
    /// know the scratch base) or a call-surviving register.
    fn decref_location_for(&self, v: VarId) -> Option<Location> {
        for &l in &self.var(v).locations {
            match l {
                Location::Scratch(_) => {
                    return Some(Location::Stack(self.indirect_for(l).disp));
                }
                Location::Reg(_) if !l.is_clobbered_by_call() => return Some(l),
                _ => continue,
            }
        }
        None
    }

    /// The owned-reference locations an unwinder passing through the
    /// current action must release.
    pub(super) fn collect_decref_locations(&mut self) -> Vec<Location> {
        let mut out = Vec::new();

        for idx in 0..self.vars.len() {
            let v = VarId(idx as u32);
            if self.var(v).locations.is_empty() || !self.var(v).needs_decref(self.current_action)
            {
                continue;
            }
            match self.decref_location_for(v) {
                Some(l) => out.push(l),
                None => {
                    // Only caller-clobbered homes: the call would destroy
                    // them before the unwinder looks. Rare; give up on
                    // this rewrite.
                    self.fail(AbortReason::DecrefUnplaceable);
                    return out;
                }
            }
        }

        for i in 0..self.owned_attrs.len() {
            let (v, field_offset) = self.owned_attrs[i];
            let var = self.var(v);
            // A registered owned attr that lost all its homes means the
            // balancing deregister_owned_attr call is missing.
            assert!(
                !var.locations.is_empty() || var.is_scratch_allocation(),
                "owned attr no longer reachable; deregister_owned_attr missing?"
            );
            let l = if let Some(&l) = var.locations.first() {
                debug_assert!(matches!(l, Location::Scratch(_) | Location::Stack(_)));
                l
            } else {
                var.scratch_location(0)
            };
            let offset = self.indirect_for(l).disp;
            out.push(Location::StackIndirect { offset, field_offset });
        }

        out
    }

    /// Publish a decref-info entry keyed by the current byte offset (a
    /// call's return address). `include` adds a value the generic scan
    /// would consider already consumed: the operand of an in-flight
    /// decref, live until its deallocator returns. A var released before
    /// the decref has no surviving location and contributes nothing.
    pub(super) fn register_decref_info_here(&mut self, include: Option<VarId>) {
        let mut locations = self.collect_decref_locations();
        if self.failed.is_some() {
            return;
        }
        if let Some(v) = include {
            if let Some(l) = self.decref_location_for(v) {
                locations.push(l);
            }
        }
        let ip = self.picked.unwrap().start + self.asm.bytes_written() as u64;
        self.decref_infos.push((ip, locations));
    }

    // =========================================================================
    // Action Dispatch
    // =========================================================================

    pub(super) fn execute_action(&mut self, index: usize) {
        let data = self.actions[index].data.clone();
        match data {
            ActionData::Guard { var, val, negate } => self.emit_guard(var, val, negate),
            ActionData::GuardNotLt0 { var } => self.emit_guard_not_lt0(var),
            ActionData::AttrGuard { var, offset, val, negate } => {
                self.emit_attr_guard(var, offset, val, negate)
            }
            ActionData::GetAttr { result, ptr, offset, dest, width } => {
                self.emit_get_attr(result, ptr, offset, dest, width)
            }
            ActionData::GetAttrFp { result, ptr, offset, dest, single_precision } => {
                self.emit_get_attr_fp(result, ptr, offset, dest, single_precision)
            }
            ActionData::SetAttr { ptr, offset, val, width } => {
                self.emit_set_attr(ptr, offset, val, width)
            }
            ActionData::Cmp { result, op, lhs, rhs, dest } => {
                self.emit_cmp(result, op, lhs, rhs, dest)
            }
            ActionData::ToBool { result, var, dest } => self.emit_to_bool(result, var, dest),
            ActionData::Add { result, a, imm, dest } => self.emit_add(result, a, imm, dest),
            ActionData::Allocate { result, slots } => {
                self.emit_allocate(result, slots);
            }
            ActionData::AllocateAndCopy { result, array_ptr, slots } => {
                self.emit_allocate_and_copy(result, array_ptr, slots)
            }
            ActionData::AllocateAndCopyPlus1 { result, first, rest_ptr, n_rest } => {
                self.emit_allocate_and_copy_plus1(result, first, rest_ptr, n_rest)
            }
            ActionData::Incref { var } => {
                self.emit_incref(var, 1);
                self.bump_use(var);
            }
            ActionData::Decref { var } => self.emit_decref(var, &[var]),
            ActionData::Xdecref { var } => self.emit_xdecref(var, &[var]),
            ActionData::Call {
                result,
                func,
                has_side_effects,
                can_throw,
                args,
                args_xmm,
                extra_uses,
            } => {
                let mut all: SmallVec<[VarId; 8]> = SmallVec::new();
                all.extend_from_slice(&args);
                all.extend_from_slice(&args_xmm);
                all.extend_from_slice(&extra_uses);
                self.emit_call(
                    result,
                    func,
                    has_side_effects,
                    can_throw,
                    &args,
                    &args_xmm,
                    &all,
                );
            }
            ActionData::CheckAndCallOnMatch { var, sentinel, handler } => {
                self.emit_check_and_call_on_match(var, sentinel, handler)
            }
            ActionData::RegisterOwnedAttr { var, byte_offset } => {
                assert!(!self.owned_attrs.contains(&(var, byte_offset)));
                self.owned_attrs.push((var, byte_offset));
                self.bump_use(var);
            }
            ActionData::DeregisterOwnedAttr { var, byte_offset } => {
                let before = self.owned_attrs.len();
                self.owned_attrs.retain(|&entry| entry != (var, byte_offset));
                assert!(self.owned_attrs.len() + 1 == before, "owned attr not registered");
                self.bump_use(var);
            }
            ActionData::MoveToReturn { var } => {
                self.asm.comment("return value");
                let dest = self.return_location;
                self.var_get_in_reg(var, dest, true, Location::AnyReg);
                self.bump_use(var);
            }
            ActionData::Trap => self.asm.trap(),
            #[cfg(debug_assertions)]
            ActionData::Comment { text } => self.asm.comment(&text),
        }
    }
}
