//! The rewriter: public virtual-operation API and the commit driver.
//!
//! Construction and every public operation run in the collect phase and
//! only append to the action table. `commit()` flips to the emit phase,
//! reserves a slot, replays the actions through the allocator and the
//! assembler, settles live-outs, and publishes the result.

use opal_asm::{Assembler, GenericReg, GprSet, JumpDest, MovWidth};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ic::{GcHandle, IcInfo, IcSlotRewrite, PickedSlot};

use super::action::{Action, ActionData, ActionKind, CmpOp, SetAttrKind};
use super::location::Location;
use super::var::{Occupant, RefType, RewriterVar, VarId};
use super::AbortReason;

/// Whether a constant is too wide for a sign-extended 32-bit immediate.
pub(super) fn is_large_constant(val: u64) -> bool {
    !opal_asm::encoder::fits_i32(val as i64)
}

pub struct Rewriter {
    pub(super) rewrite: IcSlotRewrite,
    pub(super) asm: Assembler,

    pub(super) vars: Vec<RewriterVar>,
    pub(super) actions: Vec<Action>,
    pub(super) args: Vec<VarId>,
    pub(super) live_outs: Vec<VarId>,
    pub(super) live_out_regs: Vec<u16>,

    /// The allocator's reverse map; a bijection with the union of the
    /// vars' location sets, modulo `Reserved` scratch slots.
    pub(super) vars_by_location: FxHashMap<Location, Occupant>,

    /// Constant dedup table, in creation order. The lea path of the
    /// constant loader scans these through the register file.
    pub(super) consts: Vec<(u64, VarId)>,

    pub(super) return_location: Location,
    pub(super) allocatable_regs: GprSet,

    pub(super) phase_emitting: bool,
    pub(super) failed: Option<AbortReason>,
    pub(super) needs_invalidation_support: bool,
    pub(super) added_changing_action: bool,
    pub(super) marked_inside_ic: bool,
    pub(super) done_guarding: bool,
    pub(super) last_guard_action: Option<usize>,
    pub(super) current_action: usize,

    /// Guard jumps already emitted: (start offset, end offset, condition).
    pub(super) next_slot_jumps: Vec<(usize, usize, opal_asm::Cond)>,
    /// Published decref table: (return address, owned locations).
    pub(super) decref_infos: Vec<(u64, Vec<Location>)>,
    /// Scratch-held structures whose field holds an owned reference.
    pub(super) owned_attrs: Vec<(VarId, i32)>,

    pub(super) gc_references: Vec<GcHandle>,
    pub(super) picked: Option<PickedSlot>,
}

impl Rewriter {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Start a rewrite of `ic` if its gate allows one.
    pub fn for_ic(ic: &IcInfo, num_args: usize, debug_name: &'static str) -> Option<Rewriter> {
        if !ic.should_attempt() {
            return None;
        }
        let rewrite = ic.start_rewrite(debug_name)?;
        let live_outs: Vec<u16> = ic.live_outs().to_vec();
        Some(Rewriter::new(rewrite, num_args, &live_outs, true))
    }

    pub fn new(
        rewrite: IcSlotRewrite,
        num_args: usize,
        live_outs: &[u16],
        needs_invalidation_support: bool,
    ) -> Rewriter {
        let asm = Assembler::new(rewrite.slot_size());
        let return_location = Location::Reg(rewrite.return_register());
        let allocatable_regs = rewrite.allocatable_regs();

        let mut rw = Rewriter {
            rewrite,
            asm,
            vars: Vec::new(),
            actions: Vec::new(),
            args: Vec::new(),
            live_outs: Vec::new(),
            live_out_regs: Vec::new(),
            vars_by_location: FxHashMap::default(),
            consts: Vec::new(),
            return_location,
            allocatable_regs,
            phase_emitting: false,
            failed: None,
            needs_invalidation_support,
            added_changing_action: false,
            marked_inside_ic: false,
            done_guarding: false,
            last_guard_action: None,
            current_action: 0,
            next_slot_jumps: Vec::new(),
            decref_infos: Vec::new(),
            owned_attrs: Vec::new(),
            gc_references: Vec::new(),
            picked: None,
        };

        for i in 0..num_args {
            let l = Location::for_arg(i);
            let v = rw.create_var();
            rw.vars[v.index()].locations.push(l);
            rw.vars_by_location.insert(l, Occupant::Var(v));
            rw.vars[v.index()].is_arg = true;
            rw.vars[v.index()].arg_loc = l;
            rw.args.push(v);
        }

        // The live-ins are exactly the live-outs; give each a var pinned
        // to its register so it gets preserved.
        for &dwarf_regnum in live_outs {
            let gr = GenericReg::from_dwarf(dwarf_regnum)
                .unwrap_or_else(|| panic!("bad dwarf register {}", dwarf_regnum));
            let l = Location::from_generic(gr);

            // The return destination must have been removed from the
            // live-out set before it got handed to us.
            assert!(l != rw.return_location);
            assert!(
                !rw.live_out_regs.contains(&dwarf_regnum),
                "duplicate live-out {}",
                dwarf_regnum
            );

            let v = match rw.vars_by_location.get(&l) {
                Some(Occupant::Var(v)) => *v,
                Some(Occupant::Reserved) => unreachable!(),
                None => {
                    let v = rw.create_var();
                    rw.vars[v.index()].locations.push(l);
                    rw.vars_by_location.insert(l, Occupant::Var(v));
                    v
                }
            };
            rw.live_outs.push(v);
            rw.live_out_regs.push(dwarf_regnum);
        }

        rw
    }

    // =========================================================================
    // Var and Action Plumbing
    // =========================================================================

    pub(super) fn create_var(&mut self) -> VarId {
        debug_assert!(!self.phase_emitting);
        let id = VarId(self.vars.len() as u32);
        self.vars.push(RewriterVar::new());
        id
    }

    fn create_constant_var(&mut self, val: u64) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(RewriterVar::new_constant(val));
        id
    }

    fn add_action(&mut self, data: ActionData, inputs: &[VarId], kind: ActionKind) -> usize {
        debug_assert!(!self.phase_emitting);
        let idx = self.actions.len();
        for &v in inputs {
            self.vars[v.index()].uses.push(idx);
        }
        match kind {
            ActionKind::Mutation => self.added_changing_action = true,
            ActionKind::Guard => {
                // The guard re-pins every entry arg before its jump, so
                // each arg is read once more by this action.
                for i in 0..self.args.len() {
                    let arg = self.args[i];
                    self.vars[arg.index()].uses.push(idx);
                }
                self.last_guard_action = Some(idx);
            }
            ActionKind::Normal => {}
        }
        self.actions.push(Action::new(data, kind));
        idx
    }

    /// Entry argument `i`.
    pub fn get_arg(&self, i: usize) -> VarId {
        self.args[i]
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// The register the committed slot returns its value in.
    pub fn get_return_destination(&self) -> Location {
        self.return_location
    }

    /// Whether this rewrite has already been abandoned internally.
    pub fn has_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// The first failure recorded, if any.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.failed
    }

    pub(super) fn fail(&mut self, reason: AbortReason) {
        if self.failed.is_none() {
            self.failed = Some(reason);
        }
    }

    // =========================================================================
    // Reference Classification
    // =========================================================================

    /// Classify a value's reference type. A value may be classified once;
    /// re-classifying with the same type is a no-op.
    pub fn set_type(&mut self, v: VarId, reftype: RefType) -> VarId {
        assert!(reftype != RefType::Unknown);
        let var = &mut self.vars[v.index()];
        assert!(var.reftype == RefType::Unknown || var.reftype == reftype);
        var.reftype = reftype;
        v
    }

    pub fn set_nullable(&mut self, v: VarId, nullable: bool) -> VarId {
        self.vars[v.index()].nullable = nullable;
        v
    }

    pub fn reftype(&self, v: VarId) -> RefType {
        self.vars[v.index()].reftype
    }

    /// Record that the most recently enqueued action consumes one owned
    /// reference of `v`.
    pub fn ref_consumed(&mut self, v: VarId) {
        let var = &mut self.vars[v.index()];
        assert!(
            var.reftype != RefType::Unknown || (var.is_constant && var.constant_value == 0),
            "consuming a reference of an unclassified value"
        );
        var.num_refs_consumed += 1;
        var.last_refconsumed_numuses = var.uses.len();
        let last = self.actions.len() - 1;
        self.actions[last].consumed_refs.push(v);
    }

    // =========================================================================
    // Constants
    // =========================================================================

    /// A var holding a 64-bit constant. Loading the same value twice
    /// returns the same var, so one materialization is shared.
    pub fn load_const(&mut self, val: u64) -> VarId {
        for &(existing, v) in &self.consts {
            if existing == val {
                return v;
            }
        }
        let v = self.create_constant_var(val);
        self.consts.push((val, v));
        v
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Guard that `v == val`, exiting to the slow path otherwise.
    pub fn add_guard(&mut self, v: VarId, val: u64) {
        let var = &self.vars[v.index()];
        if var.is_constant {
            assert!(var.constant_value == val, "guard can never pass");
            return;
        }
        let val_var = self.load_const(val);
        self.add_action(
            ActionData::Guard { var: v, val: val_var, negate: false },
            &[v, val_var],
            ActionKind::Guard,
        );
    }

    /// Guard that `v != val`.
    pub fn add_guard_not_eq(&mut self, v: VarId, val: u64) {
        let val_var = self.load_const(val);
        self.add_action(
            ActionData::Guard { var: v, val: val_var, negate: true },
            &[v, val_var],
            ActionKind::Guard,
        );
    }

    /// Guard that `v`, as a signed value, is not negative.
    pub fn add_guard_not_lt0(&mut self, v: VarId) {
        self.add_action(ActionData::GuardNotLt0 { var: v }, &[v], ActionKind::Guard);
    }

    /// Guard on the qword at `[v + offset]`. Duplicate guards on the same
    /// (offset, value, negate) triple are dropped.
    pub fn add_attr_guard(&mut self, v: VarId, offset: i32, val: u64, negate: bool) {
        if !self.vars[v.index()].attr_guards.insert((offset, val, negate)) {
            return;
        }
        let val_var = self.load_const(val);
        self.add_action(
            ActionData::AttrGuard { var: v, offset, val: val_var, negate },
            &[v, val_var],
            ActionKind::Guard,
        );
    }

    // =========================================================================
    // Attribute Access
    // =========================================================================

    /// Load the qword at `[v + offset]`.
    pub fn get_attr(&mut self, v: VarId, offset: i32) -> VarId {
        self.get_attr_width(v, offset, MovWidth::Q, Location::AnyReg)
    }

    /// Width- and destination-controlled attribute load.
    ///
    /// Until a mutating action is recorded, repeated loads of the same
    /// `(offset, width)` return the memoized var. The memo only applies
    /// to unconstrained destinations.
    pub fn get_attr_width(
        &mut self,
        v: VarId,
        offset: i32,
        width: MovWidth,
        dest: Location,
    ) -> VarId {
        if !self.added_changing_action && dest == Location::AnyReg {
            if let Some(&memo) = self.vars[v.index()].getattrs.get(&(offset, width)) {
                return memo;
            }
            let result = self.create_var();
            self.add_action(
                ActionData::GetAttr { result, ptr: v, offset, dest, width },
                &[v],
                ActionKind::Normal,
            );
            self.vars[v.index()].getattrs.insert((offset, width), result);
            return result;
        }

        let result = self.create_var();
        self.add_action(
            ActionData::GetAttr { result, ptr: v, offset, dest, width },
            &[v],
            ActionKind::Normal,
        );
        result
    }

    /// Load the double at `[v + offset]` into an XMM register.
    pub fn get_attr_double(&mut self, v: VarId, offset: i32) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionData::GetAttrFp {
                result,
                ptr: v,
                offset,
                dest: Location::AnyReg,
                single_precision: false,
            },
            &[v],
            ActionKind::Normal,
        );
        result
    }

    /// Load the float at `[v + offset]`, widened to a double.
    pub fn get_attr_float(&mut self, v: VarId, offset: i32) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionData::GetAttrFp {
                result,
                ptr: v,
                offset,
                dest: Location::AnyReg,
                single_precision: true,
            },
            &[v],
            ActionKind::Normal,
        );
        result
    }

    /// Store `val` to `[ptr + offset]`.
    ///
    /// The caller states the ownership contract of the store: an owned
    /// value must not be stored with `SetAttrKind::Unknown`, and narrow
    /// stores are only legal for reference-free values.
    pub fn set_attr(
        &mut self,
        ptr: VarId,
        offset: i32,
        val: VarId,
        kind: SetAttrKind,
        width: MovWidth,
    ) {
        if self.vars[val.index()].reftype == RefType::Owned {
            assert!(kind != SetAttrKind::Unknown);
        }
        assert!(width == MovWidth::Q || kind == SetAttrKind::Unknown);
        self.add_action(
            ActionData::SetAttr { ptr, offset, val, width },
            &[ptr, val],
            ActionKind::Mutation,
        );
    }

    /// Replace the owned reference at `[ptr + offset]` with `val`,
    /// handing `val`'s reference into the field and releasing the old
    /// value.
    pub fn replace_attr(&mut self, ptr: VarId, offset: i32, val: VarId, prev_nullable: bool) {
        let prev = self.get_attr(ptr, offset);
        // The old field reference transfers to `prev` when we overwrite
        // the slot.
        self.set_type(prev, RefType::Owned);

        self.set_attr(ptr, offset, val, SetAttrKind::HandedOff, MovWidth::Q);
        self.ref_consumed(val);

        if prev_nullable {
            self.set_nullable(prev, true);
            self.xdecref(prev);
        } else {
            self.decref(prev);
        }
    }

    // =========================================================================
    // Arithmetic / Predicates
    // =========================================================================

    /// Compare two values, producing 0 or 1.
    pub fn cmp(&mut self, op: CmpOp, lhs: VarId, rhs: VarId, dest: Location) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionData::Cmp { result, op, lhs, rhs, dest },
            &[lhs, rhs],
            ActionKind::Normal,
        );
        result
    }

    /// Produce 1 if `v` is non-zero, else 0.
    pub fn to_bool(&mut self, v: VarId, dest: Location) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionData::ToBool { result, var: v, dest },
            &[v],
            ActionKind::Normal,
        );
        result
    }

    /// `a + imm` into a fresh var.
    pub fn add(&mut self, a: VarId, imm: i64, dest: Location) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionData::Add { result, a, imm, dest },
            &[a],
            ActionKind::Normal,
        );
        result
    }

    // =========================================================================
    // Scratch Allocation
    // =========================================================================

    /// Reserve `slots` consecutive 8-byte scratch slots. The result var
    /// re-materializes the slab address with `lea` on demand.
    pub fn allocate(&mut self, slots: usize) -> VarId {
        let result = self.create_var();
        self.add_action(ActionData::Allocate { result, slots }, &[], ActionKind::Normal);
        result
    }

    /// Reserve `slots` scratch slots and copy that many qwords from
    /// `[array_ptr]` into them.
    pub fn allocate_and_copy(&mut self, array_ptr: VarId, slots: usize) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionData::AllocateAndCopy { result, array_ptr, slots },
            &[array_ptr],
            ActionKind::Normal,
        );
        result
    }

    /// Reserve `n_rest + 1` scratch slots; store `first` into slot 0 and
    /// copy `n_rest` qwords from `[rest_ptr]` after it.
    pub fn allocate_and_copy_plus1(
        &mut self,
        first: VarId,
        rest_ptr: Option<VarId>,
        n_rest: usize,
    ) -> VarId {
        assert!(rest_ptr.is_some() == (n_rest > 0));
        let result = self.create_var();
        let mut inputs: SmallVec<[VarId; 2]> = SmallVec::new();
        inputs.push(first);
        if let Some(rest) = rest_ptr {
            inputs.push(rest);
        }
        self.add_action(
            ActionData::AllocateAndCopyPlus1 { result, first, rest_ptr, n_rest },
            &inputs,
            ActionKind::Normal,
        );
        result
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Emit an increment of `v`'s reference count.
    pub fn incref(&mut self, v: VarId) {
        self.add_action(ActionData::Incref { var: v }, &[v], ActionKind::Mutation);
    }

    /// Release `v`'s owned reference: decrement, and call the deallocator
    /// when the count hits zero.
    pub fn decref(&mut self, v: VarId) {
        {
            let var = &self.vars[v.index()];
            assert!(var.reftype == RefType::Owned, "decref of a non-owned value");
            assert!(!var.nullable, "use xdecref for nullable values");
        }
        self.add_action(ActionData::Decref { var: v }, &[v], ActionKind::Mutation);
        self.ref_consumed(v);
    }

    /// Like `decref`, but tolerates null.
    pub fn xdecref(&mut self, v: VarId) {
        {
            let var = &self.vars[v.index()];
            assert!(var.reftype == RefType::Owned, "xdecref of a non-owned value");
            assert!(var.nullable, "use decref for non-nullable values");
        }
        self.add_action(ActionData::Xdecref { var: v }, &[v], ActionKind::Mutation);
        self.ref_consumed(v);
    }

    /// Declare that the field at `byte_offset` inside `v`'s scratch
    /// allocation holds an owned reference, so unwind info covers it.
    /// Must be balanced by `deregister_owned_attr` before commit.
    pub fn register_owned_attr(&mut self, v: VarId, byte_offset: i32) {
        self.add_action(
            ActionData::RegisterOwnedAttr { var: v, byte_offset },
            &[v],
            ActionKind::Normal,
        );
    }

    pub fn deregister_owned_attr(&mut self, v: VarId, byte_offset: i32) {
        self.add_action(
            ActionData::DeregisterOwnedAttr { var: v, byte_offset },
            &[v],
            ActionKind::Normal,
        );
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call `func` with the given integer and XMM arguments. `extra_uses`
    /// are kept alive across the call without being passed.
    pub fn call(
        &mut self,
        has_side_effects: bool,
        func: u64,
        gp_args: &[VarId],
        xmm_args: &[VarId],
        extra_uses: &[VarId],
    ) -> VarId {
        let result = self.create_var();
        let kind = if has_side_effects {
            ActionKind::Mutation
        } else {
            ActionKind::Normal
        };

        let mut inputs: SmallVec<[VarId; 8]> = SmallVec::new();
        inputs.extend_from_slice(gp_args);
        inputs.extend_from_slice(xmm_args);
        inputs.extend_from_slice(extra_uses);

        self.add_action(
            ActionData::Call {
                result,
                func,
                has_side_effects,
                // TODO: let clients mark calls that cannot throw and skip
                // their decref info.
                can_throw: true,
                args: SmallVec::from_slice(gp_args),
                args_xmm: SmallVec::from_slice(xmm_args),
                extra_uses: SmallVec::from_slice(extra_uses),
            },
            &inputs,
            kind,
        );
        result
    }

    /// Compare `v` against an error sentinel and call `handler` on match.
    pub fn check_and_call_on_match(&mut self, v: VarId, sentinel: i64, handler: u64) {
        self.add_action(
            ActionData::CheckAndCallOnMatch { var: v, sentinel, handler },
            &[v],
            ActionKind::Mutation,
        );
    }

    // =========================================================================
    // Misc
    // =========================================================================

    /// Emit a breakpoint at this point of the slot.
    pub fn trap(&mut self) {
        self.add_action(ActionData::Trap, &[], ActionKind::Normal);
    }

    /// Attach a comment to the emitted code. Debug builds only.
    #[allow(unused_variables)]
    pub fn comment(&mut self, text: &str) {
        #[cfg(debug_assertions)]
        self.add_action(
            ActionData::Comment { text: text.to_string() },
            &[],
            ActionKind::Normal,
        );
    }

    /// Pin a foreign reference for the slot's lifetime.
    pub fn add_gc_reference(&mut self, handle: GcHandle) {
        self.gc_references.push(handle);
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit, returning `v` from the slot. The value must have a known
    /// reference classification.
    pub fn commit_returning(mut self, v: VarId) -> Option<usize> {
        assert!(
            self.vars[v.index()].reftype != RefType::Unknown,
            "returned value must be classified"
        );
        self.add_action(ActionData::MoveToReturn { var: v }, &[v], ActionKind::Normal);
        self.ref_consumed(v);
        self.commit()
    }

    /// Commit, returning a non-refcounted value (a raw word).
    pub fn commit_returning_raw(mut self, v: VarId) -> Option<usize> {
        assert!(self.vars[v.index()].reftype == RefType::Unknown);
        self.add_action(ActionData::MoveToReturn { var: v }, &[v], ActionKind::Normal);
        self.commit()
    }

    /// Abandon the rewrite; the slot keeps its previous contents.
    pub fn abort(self) {
        self.rewrite.abort();
    }

    fn abandon(self) -> Option<usize> {
        self.rewrite.abort();
        None
    }

    /// Switch to the emit phase, replay the action table, settle
    /// live-outs, and publish into the reserved slot.
    ///
    /// Returns the committed slot index, or `None` if the rewrite was
    /// abandoned. Abandonment is not an error: the call site simply keeps
    /// using its fallback path.
    pub fn commit(mut self) -> Option<usize> {
        self.phase_emitting = true;

        if self.failed.is_some() {
            return self.abandon();
        }

        // Terminal uses: live-outs are read at the very end, and every
        // constant gets an end use so it stays available for reg-reg
        // moves and lea rebasing. Spilling a constant is free, so this
        // adds no real register pressure.
        let end = self.actions.len();
        for i in 0..self.live_outs.len() {
            let lo = self.live_outs[i];
            self.vars[lo.index()].uses.push(end);
        }
        for var in &mut self.vars {
            if var.is_constant {
                var.uses.push(end);
            }
        }

        self.assert_consistent();

        if self.last_guard_action.is_none() {
            self.on_done_guarding();
        }

        match self.rewrite.prepare_entry() {
            Some(picked) => self.picked = Some(picked),
            None => {
                self.fail(AbortReason::NoSlotAvailable);
                return self.abandon();
            }
        }

        for i in 0..self.actions.len() {
            // Insert increfs for consumed references, unless this action
            // is the var's final consumed use (the handoff case).
            let consumed: SmallVec<[VarId; 2]> = self.actions[i].consumed_refs.clone();
            for v in consumed {
                if self.vars[v.index()].is_final_consumed_use(i) {
                    continue;
                }
                assert!(self.done_guarding);
                self.emit_incref(v, 1);
            }

            self.current_action = i;
            self.execute_action(i);

            if self.failed.is_some() {
                return self.abandon();
            }
            self.assert_consistent();
            if Some(i) == self.last_guard_action {
                self.on_done_guarding();
            }
        }

        // Owned attributes must be explicitly deregistered: making the
        // release path implicit would hide bugs that only show up while
        // unwinding.
        assert!(
            self.owned_attrs.is_empty(),
            "missing a deregister_owned_attr call"
        );

        // Leave the slot's in-use counter before the live-out reshuffle.
        if self.marked_inside_ic {
            self.asm.comment("leave ic");
            assert!(self.needs_invalidation_support);
            let counter_addr = self.picked.unwrap().num_inside_addr;
            if is_large_constant(counter_addr) {
                let reg = self.alloc_reg(Location::AnyReg, self.return_location);
                if self.failed.is_some() {
                    return self.abandon();
                }
                self.load_const_into_reg(counter_addr, reg);
                self.asm.decl(opal_asm::Mem::new(reg, 0));
            } else {
                self.asm.decl_abs(counter_addr as u32);
            }
        }

        self.asm.comment("live outs");

        // Every use should have been bumped by now except the terminal
        // ones added above.
        #[cfg(debug_assertions)]
        for (idx, var) in self.vars.iter().enumerate() {
            let as_live_out = self
                .live_outs
                .iter()
                .filter(|lo| lo.index() == idx)
                .count();
            let as_const = if var.is_constant { 1 } else { 0 };
            debug_assert_eq!(var.next_use + as_live_out + as_const, var.uses.len());
        }

        for i in 0..self.vars.len() {
            if self.vars[i].is_constant {
                self.bump_use(VarId(i as u32));
            }
        }

        self.shuffle_live_outs();
        if self.failed.is_some() {
            return self.abandon();
        }

        for i in 0..self.live_outs.len() {
            let lo = self.live_outs[i];
            // Automatic refcounting of a live-out would be wrong; they
            // are opaque caller state.
            assert!(self.vars[lo.index()].reftype == RefType::Unknown);
            self.bump_use(lo);
        }

        #[cfg(debug_assertions)]
        {
            for var in &self.vars {
                debug_assert_eq!(var.next_use, var.uses.len());
            }
            // Only reserved scratch slots may outlive their vars.
            for (l, occ) in &self.vars_by_location {
                debug_assert!(
                    matches!(occ, Occupant::Reserved),
                    "location {} still occupied at commit",
                    l
                );
            }
        }

        if self.asm.has_failed() {
            self.fail(AbortReason::AssemblerOverflow);
            return self.abandon();
        }

        // Jump to the continuation point at the slot end; the slot fill
        // pads whatever room is left with nops.
        self.asm.jmp(JumpDest::from_start(self.rewrite.slot_size()));
        if self.asm.has_failed() {
            self.fail(AbortReason::AssemblerOverflow);
            return self.abandon();
        }

        let Rewriter {
            rewrite,
            asm,
            gc_references,
            decref_infos,
            next_slot_jumps,
            picked,
            ..
        } = self;
        let slot = picked.unwrap().index;
        rewrite.commit(asm.code(), gc_references, decref_infos, next_slot_jumps);
        Some(slot)
    }

    pub(super) fn on_done_guarding(&mut self) {
        self.done_guarding = true;
        // Args whose uses ran out during the guard prefix were kept
        // pinned; release them now.
        for i in 0..self.args.len() {
            let arg = self.args[i];
            if self.vars[arg.index()].is_done_using() {
                self.release(arg);
            }
        }
        self.assert_consistent();
    }

    fn shuffle_live_outs(&mut self) {
        // A live-out may need to move into a register occupied by a
        // different live-out. Iteratively place whichever ones have a
        // free target; a full sweep without progress would be a cycle,
        // which we have never observed being generated.
        let num = self.live_outs.len();
        let mut moved = vec![false; num];
        let mut remaining = num;
        while remaining > 0 {
            let at_start = remaining;

            for i in 0..num {
                if moved[i] {
                    continue;
                }
                let gr = GenericReg::from_dwarf(self.live_out_regs[i]).unwrap();
                let expected = Location::from_generic(gr);
                let v = self.live_outs[i];

                if self.vars[v.index()].is_in_location(expected) {
                    moved[i] = true;
                    remaining -= 1;
                    continue;
                }
                if self.vars_by_location.contains_key(&expected) {
                    continue;
                }

                match gr {
                    GenericReg::Gp(r) => {
                        let got =
                            self.var_get_in_reg(v, Location::Reg(r), false, Location::AnyReg);
                        debug_assert_eq!(got, r);
                    }
                    GenericReg::Xmm(x) => {
                        let got = self.var_get_in_xmm(v, Location::Xmm(x));
                        debug_assert_eq!(got, x);
                    }
                }
                if self.failed.is_some() {
                    return;
                }

                let locations: SmallVec<[Location; 4]> =
                    self.vars[v.index()].locations.clone();
                for l in locations {
                    if l != expected {
                        self.remove_location_from_var(v, l);
                    }
                }

                moved[i] = true;
                remaining -= 1;
            }

            assert!(remaining < at_start, "live-out placement cycle");
        }

        #[cfg(debug_assertions)]
        for i in 0..num {
            let gr = GenericReg::from_dwarf(self.live_out_regs[i]).unwrap();
            let v = self.live_outs[i];
            debug_assert!(self.vars[v.index()].is_in_location(Location::from_generic(gr)));
        }
    }
}

// Accessors used throughout the emit phase.
impl Rewriter {
    #[inline]
    pub(super) fn var(&self, v: VarId) -> &RewriterVar {
        &self.vars[v.index()]
    }

    #[inline]
    pub(super) fn var_mut(&mut self, v: VarId) -> &mut RewriterVar {
        &mut self.vars[v.index()]
    }
}

// =============================================================================
// Tests
// =============================================================================
