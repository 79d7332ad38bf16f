//! The deferred action table.
//!
//! Every public rewriter operation enqueues one `Action` during the
//! collect phase; `commit()` replays them in order during the emit phase.
//! Actions are a closed enum dispatched in one place, so the table owns
//! no closures and serializes trivially for debugging.

use opal_asm::MovWidth;
use smallvec::SmallVec;

use super::location::Location;
use super::var::VarId;

/// Classification of an action's effect on rewrite state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Reads its inputs; no observable side effects.
    Normal,
    /// Mutates memory or refcounts; invalidates the get-attr memo.
    Mutation,
    /// May branch to the slow path; entry args must be intact.
    Guard,
}

/// Comparison operators supported by `cmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
}

/// Ownership contract of a `set_attr` store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAttrKind {
    /// The caller has not thought about the stored reference. Only legal
    /// for values that are not owned.
    Unknown,
    /// The store transfers ownership of the value into the field.
    HandedOff,
    /// The field holds a borrowed copy.
    Borrowed,
}

/// Payload of one deferred operation.
#[derive(Debug, Clone)]
pub(crate) enum ActionData {
    Guard {
        var: VarId,
        val: VarId,
        negate: bool,
    },
    GuardNotLt0 {
        var: VarId,
    },
    AttrGuard {
        var: VarId,
        offset: i32,
        val: VarId,
        negate: bool,
    },
    GetAttr {
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
        width: MovWidth,
    },
    GetAttrFp {
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
        single_precision: bool,
    },
    SetAttr {
        ptr: VarId,
        offset: i32,
        val: VarId,
        width: MovWidth,
    },
    Cmp {
        result: VarId,
        op: CmpOp,
        lhs: VarId,
        rhs: VarId,
        dest: Location,
    },
    ToBool {
        result: VarId,
        var: VarId,
        dest: Location,
    },
    Add {
        result: VarId,
        a: VarId,
        imm: i64,
        dest: Location,
    },
    Allocate {
        result: VarId,
        slots: usize,
    },
    AllocateAndCopy {
        result: VarId,
        array_ptr: VarId,
        slots: usize,
    },
    AllocateAndCopyPlus1 {
        result: VarId,
        first: VarId,
        rest_ptr: Option<VarId>,
        n_rest: usize,
    },
    Incref {
        var: VarId,
    },
    Decref {
        var: VarId,
    },
    Xdecref {
        var: VarId,
    },
    Call {
        result: VarId,
        func: u64,
        has_side_effects: bool,
        can_throw: bool,
        args: SmallVec<[VarId; 6]>,
        args_xmm: SmallVec<[VarId; 2]>,
        extra_uses: SmallVec<[VarId; 2]>,
    },
    CheckAndCallOnMatch {
        var: VarId,
        sentinel: i64,
        handler: u64,
    },
    RegisterOwnedAttr {
        var: VarId,
        byte_offset: i32,
    },
    DeregisterOwnedAttr {
        var: VarId,
        byte_offset: i32,
    },
    MoveToReturn {
        var: VarId,
    },
    Trap,
    #[cfg(debug_assertions)]
    Comment {
        text: String,
    },
}

/// One entry of the action table.
pub(crate) struct Action {
    pub data: ActionData,
    pub kind: ActionKind,
    /// Vars whose owned reference some consumer of this action takes.
    /// Before the action executes, each gets an incref unless the action
    /// is that var's final consumed use.
    pub consumed_refs: SmallVec<[VarId; 2]>,
}

impl Action {
    pub fn new(data: ActionData, kind: ActionKind) -> Self {
        Action {
            data,
            kind,
            consumed_refs: SmallVec::new(),
        }
    }
}
