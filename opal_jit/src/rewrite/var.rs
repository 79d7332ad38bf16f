//! Symbolic values.
//!
//! A `RewriterVar` is one value over the lifetime of a rewrite: its
//! current location set, constant-ness, reference classification, and the
//! ordered list of actions that read it. Vars live in an arena owned by
//! the rewriter and are addressed by `VarId` handles, so the allocator's
//! reverse map is a plain `Location -> VarId` table and var comparisons
//! are integer compares.

use opal_asm::MovWidth;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::location::Location;

/// Handle of a `RewriterVar` in the rewrite's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) u32);

impl VarId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reference classification of a value.
///
/// `Unknown` values must be classified before they are returned or
/// consumed across an ownership boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
    /// This rewrite holds exactly one reference it must release.
    Owned,
    /// No release responsibility.
    Borrowed,
    /// Not yet classified.
    Unknown,
}

/// What occupies a location in the allocator's reverse map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Occupant {
    /// A live value.
    Var(VarId),
    /// A scratch slot reserved by an `allocate()` whose owner is tracked
    /// through its `scratch_allocation` instead of its location set.
    Reserved,
}

/// One symbolic value.
pub(crate) struct RewriterVar {
    /// Everywhere this value currently lives. May be empty for a pure
    /// constant or a scratch-allocation owner, both re-materializable.
    pub locations: SmallVec<[Location; 4]>,

    pub is_constant: bool,
    pub constant_value: u64,

    /// Whether this is an entry argument, and its pinned location.
    pub is_arg: bool,
    pub arg_loc: Location,

    pub reftype: RefType,
    pub nullable: bool,

    /// Indices of the actions that read this value, in enqueue order.
    pub uses: Vec<usize>,
    /// Cursor into `uses` during emission.
    pub next_use: usize,

    /// How many downstream actions consume an owned reference.
    pub num_refs_consumed: u32,
    /// `uses.len()` at the time of the last consumption; identifies the
    /// action at which a handoff can happen.
    pub last_refconsumed_numuses: usize,

    /// `(first_slot, slot_count)` if this var owns a scratch run.
    pub scratch_allocation: Option<(usize, usize)>,

    /// Attribute guards already recorded, for dedup.
    pub attr_guards: FxHashSet<(i32, u64, bool)>,
    /// Get-attr memo, valid until the first mutating action.
    pub getattrs: FxHashMap<(i32, MovWidth), VarId>,
}

impl RewriterVar {
    pub fn new() -> Self {
        RewriterVar {
            locations: SmallVec::new(),
            is_constant: false,
            constant_value: 0,
            is_arg: false,
            arg_loc: Location::Uninitialized,
            reftype: RefType::Unknown,
            nullable: false,
            uses: Vec::new(),
            next_use: 0,
            num_refs_consumed: 0,
            last_refconsumed_numuses: 0,
            scratch_allocation: None,
            attr_guards: FxHashSet::default(),
            getattrs: FxHashMap::default(),
        }
    }

    pub fn new_constant(val: u64) -> Self {
        let mut var = RewriterVar::new();
        var.is_constant = true;
        var.constant_value = val;
        var
    }

    #[inline]
    pub fn is_in_location(&self, l: Location) -> bool {
        self.locations.contains(&l)
    }

    #[inline]
    pub fn is_done_using(&self) -> bool {
        self.next_use == self.uses.len()
    }

    #[inline]
    pub fn is_scratch_allocation(&self) -> bool {
        self.scratch_allocation.is_some()
    }

    /// The scratch location of this var's allocation, at an extra byte
    /// offset into it.
    pub fn scratch_location(&self, extra_bytes: i32) -> Location {
        let (first, _) = self
            .scratch_allocation
            .expect("var does not own a scratch allocation");
        Location::Scratch(first as i32 * 8 + extra_bytes)
    }

    /// Whether the last consumption of this owned reference coincides
    /// with its final use, making an incref before it unnecessary.
    pub fn ref_handed_off(&self) -> bool {
        self.reftype == RefType::Owned
            && self.num_refs_consumed > 0
            && self.last_refconsumed_numuses == self.uses.len()
    }

    /// Whether `action` is both this var's final use and the action its
    /// last recorded consumption belongs to. The incref otherwise
    /// inserted before a consuming action is skipped exactly here.
    pub fn is_final_consumed_use(&self, action: usize) -> bool {
        self.num_refs_consumed > 0
            && self.last_refconsumed_numuses == self.uses.len()
            && self.uses[self.last_refconsumed_numuses - 1] == action
    }

    /// Whether an unwinder passing through `current_action` must release
    /// this value: owned, and not handed off at or before this action.
    pub fn needs_decref(&self, current_action: usize) -> bool {
        if self.reftype != RefType::Owned {
            return false;
        }
        if self.num_refs_consumed == 0 {
            return true;
        }
        // The action receiving the handoff owns the reference from the
        // moment it executes.
        self.uses[self.last_refconsumed_numuses - 1] != current_action
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_var_is_unclassified() {
        let var = RewriterVar::new();
        assert_eq!(var.reftype, RefType::Unknown);
        assert!(!var.is_constant);
        assert!(var.locations.is_empty());
        assert!(var.is_done_using());
    }

    #[test]
    fn test_constant_var() {
        let var = RewriterVar::new_constant(42);
        assert!(var.is_constant);
        assert_eq!(var.constant_value, 42);
    }

    #[test]
    fn test_ref_handed_off() {
        let mut var = RewriterVar::new();
        var.reftype = RefType::Owned;
        var.uses = vec![0, 3];
        assert!(!var.ref_handed_off());

        // Consumed at the final use.
        var.num_refs_consumed = 1;
        var.last_refconsumed_numuses = 2;
        assert!(var.ref_handed_off());

        // Consumed earlier than the final use: not a handoff.
        var.last_refconsumed_numuses = 1;
        assert!(!var.ref_handed_off());
    }

    #[test]
    fn test_ref_handed_off_requires_owned() {
        let mut var = RewriterVar::new();
        var.reftype = RefType::Borrowed;
        var.uses = vec![1];
        var.num_refs_consumed = 1;
        var.last_refconsumed_numuses = 1;
        assert!(!var.ref_handed_off());
        // The incref-skip predicate applies regardless of reftype.
        assert!(var.is_final_consumed_use(1));
    }

    #[test]
    fn test_final_consumed_use_requires_final() {
        let mut var = RewriterVar::new();
        var.reftype = RefType::Owned;
        var.uses = vec![2, 7];
        var.num_refs_consumed = 1;
        // Consumed at action 2, but used again at action 7: the consumer
        // needs its own reference.
        var.last_refconsumed_numuses = 1;
        assert!(!var.is_final_consumed_use(2));
        assert!(!var.is_final_consumed_use(7));
    }

    #[test]
    fn test_needs_decref() {
        let mut var = RewriterVar::new();
        var.uses = vec![2, 5];
        assert!(!var.needs_decref(2)); // unclassified

        var.reftype = RefType::Owned;
        assert!(var.needs_decref(2)); // nothing consumes it

        var.num_refs_consumed = 1;
        var.last_refconsumed_numuses = 2;
        assert!(!var.needs_decref(5)); // handed off at action 5
        assert!(var.needs_decref(2)); // still owned here
    }

    #[test]
    fn test_scratch_location() {
        let mut var = RewriterVar::new();
        var.scratch_allocation = Some((3, 2));
        assert_eq!(var.scratch_location(0), Location::Scratch(24));
        assert_eq!(var.scratch_location(8), Location::Scratch(32));
    }
}
