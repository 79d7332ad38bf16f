//! End-to-end rewrites against pinned code regions.
//!
//! Each test builds an IC over a synthetic base address so displacement
//! arithmetic and the decref-info registry keys are deterministic, then
//! checks the committed bytes and bookkeeping.

use opal_asm::{GprSet, MovWidth};
use opal_jit::ic::lookup_decref_info;
use opal_jit::{CmpOp, IcInfo, IcSpec, Location, RefType, Rewriter, SetAttrKind};

const SCRATCH_BASE: i32 = 0x40;

fn spec(slot_size: usize) -> IcSpec {
    IcSpec {
        num_slots: 1,
        slot_size,
        scratch_rsp_offset: SCRATCH_BASE,
        scratch_size: 64,
        live_outs: Vec::new(),
        allocatable: GprSet::ALLOCATABLE,
    }
}

fn ic_at(base: u64, slot_size: usize) -> IcInfo {
    IcInfo::with_base(spec(slot_size), base)
}

fn rewriter(ic: &IcInfo, num_args: usize) -> Rewriter {
    let live_outs: Vec<u16> = ic.live_outs().to_vec();
    Rewriter::new(ic.start_rewrite("test").unwrap(), num_args, &live_outs, false)
}

fn assert_no_decref_info(base: u64, len: usize) {
    for off in 0..len {
        assert!(lookup_decref_info(base + off as u64).is_none());
    }
}

// =============================================================================
// S1: Identity
// =============================================================================

#[test]
fn identity_rewrite_is_one_mov_and_a_jump() {
    let base = 0x11_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 1);

    let arg = rw.get_arg(0);
    rw.set_type(arg, RefType::Owned);
    let slot = rw.commit_returning(arg);
    assert_eq!(slot, Some(0));

    let code = ic.code_snapshot();
    // mov rax, rdi; jmp <continuation>
    assert_eq!(&code[..3], &[0x48, 0x89, 0xF8]);
    assert_eq!(&code[3..5], &[0xEB, 59]);
    assert!(code[5..64].iter().all(|&b| b == 0x90));

    // The ownership was handed off into the return value: no incref, no
    // decref info, no guards.
    assert_no_decref_info(base, 64);
    assert_eq!(ic.stats().committed, 1);
}

// =============================================================================
// S2: Type-Guarded Attribute Load
// =============================================================================

#[test]
fn guarded_attribute_load() {
    let base = 0x12_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    let cls = rw.get_attr(obj, 16);
    rw.add_guard(cls, 0xDEAD_BEEF_00);
    let x = rw.get_attr(obj, 32);
    rw.set_type(x, RefType::Borrowed);

    // The memo returns the same child until a mutating action appears.
    assert_eq!(rw.get_attr(obj, 32), x);
    assert_eq!(rw.get_attr(obj, 16), cls);

    let slot = rw.commit_returning(x);
    assert_eq!(slot, Some(0));

    let code = ic.code_snapshot();
    let expected: Vec<u8> = [
        vec![0x48, 0x8B, 0x47, 0x10], // mov rax, [rdi+16]
        vec![0x48, 0xB9, 0x00, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, 0x00, 0x00], // movabs rcx
        vec![0x48, 0x39, 0xC8],       // cmp rax, rcx
        vec![0x0F, 0x85, 233, 0, 0, 0], // jne <slot end>
        vec![0x48, 0x8B, 0x47, 0x20], // mov rax, [rdi+32]
        vec![0xE9, 224, 0, 0, 0],     // jmp <continuation>
    ]
    .concat();
    assert_eq!(&code[..expected.len()], &expected[..]);

    // A borrowed value consumed by its final use is handed off whole:
    // no incref was inserted.
    assert!(!code[..expected.len()].windows(2).any(|w| w == [0x48, 0xFF]));
    assert_no_decref_info(base, 256);
}

// =============================================================================
// S3: Refcount Handoff
// =============================================================================

#[test]
fn replace_attr_hands_off_and_releases_old_value() {
    let base = 0x13_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 2);

    let container = rw.get_arg(0);
    let item = rw.get_arg(1);
    rw.set_type(item, RefType::Owned);
    rw.replace_attr(container, 24, item, false);

    let slot = rw.commit();
    assert_eq!(slot, Some(0));

    let code = ic.code_snapshot();
    let expected: Vec<u8> = [
        vec![0x48, 0x8B, 0x47, 0x18],       // mov rax, [rdi+24]   (old value)
        vec![0x48, 0x89, 0x77, 0x18],       // mov [rdi+24], rsi   (handoff store)
        vec![0x48, 0x89, 0xC7],             // mov rdi, rax        (decref operand)
        vec![0x48, 0x89, 0x7C, 0x24, 0x40], // mov [rsp+0x40], rdi (spill around call)
        vec![0x48, 0xFF, 0x0F],             // dec qword [rdi]
        vec![0x75, 0x07],                   // jnz past the dealloc path
        vec![0x48, 0x8B, 0x47, 0x08],       // mov rax, [rdi+8]    (class)
        vec![0xFF, 0x50, 0x18],             // call [rax+24]       (deallocator)
    ]
    .concat();
    assert_eq!(&code[..expected.len()], &expected[..]);

    // The consumed item was not incref'd: no `inc qword` before the
    // store.
    assert!(!code[..8].windows(2).any(|w| w == [0x48, 0xFF]));

    // The decref-info entry at the dealloc call lists the old value's
    // spill slot.
    let dealloc_ret = base + expected.len() as u64;
    assert_eq!(
        lookup_decref_info(dealloc_ret),
        Some(vec![Location::Stack(0x40)])
    );
}

// =============================================================================
// S4: Guard-Trampoline Reuse
// =============================================================================

#[test]
fn repeated_guard_jumps_share_a_trampoline() {
    let base = 0x14_0000;
    let ic = ic_at(base, 512);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    for i in 0..8 {
        rw.add_attr_guard(obj, 16 + 8 * i, 0x1000, false);
    }
    let slot = rw.commit();
    assert_eq!(slot, Some(0));

    let code = ic.code_snapshot();
    // Each guard: 8-byte cmp. The first jump is the long form; the seven
    // that follow are short jumps back onto it.
    let mut offset = 0;
    let mut long_jumps = 0;
    let mut short_jumps = 0;
    for i in 0..8 {
        let disp = (16 + 8 * i) as u8;
        assert_eq!(
            &code[offset..offset + 8],
            &[0x48, 0x81, 0x7F, disp, 0x00, 0x10, 0x00, 0x00],
            "guard {} compare",
            i
        );
        offset += 8;
        if code[offset] == 0x0F {
            assert_eq!(code[offset + 1], 0x85);
            long_jumps += 1;
            offset += 6;
        } else {
            assert_eq!(code[offset], 0x75);
            // Lands on the first guard's long jump.
            let target = (offset as i64 + 2) + (code[offset + 1] as i8 as i64);
            assert_eq!(target, 8);
            short_jumps += 1;
            offset += 2;
        }
    }
    assert_eq!(long_jumps, 1);
    assert_eq!(short_jumps, 7);
    // Strictly smaller than eight independent long jumps.
    assert!(offset < 8 * (8 + 6));
}

#[test]
fn duplicate_attr_guards_are_dropped() {
    let base = 0x15_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    rw.add_attr_guard(obj, 16, 0x1000, false);
    rw.add_attr_guard(obj, 16, 0x1000, false);
    rw.add_attr_guard(obj, 16, 0x1000, false);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // One cmp, one jump, then the continuation jump.
    assert_eq!(
        &code[..8],
        &[0x48, 0x81, 0x7F, 0x10, 0x00, 0x10, 0x00, 0x00]
    );
    assert_eq!(&code[8..10], &[0x0F, 0x85]);
    assert_eq!(code[14], 0xE9);
}

// =============================================================================
// S5: Register Spill Around a Call
// =============================================================================

#[test]
fn live_values_are_spilled_around_a_call() {
    let base = 0x50_0000;
    let mut s = spec(1024);
    s.scratch_size = 128;
    let ic = IcInfo::with_base(s, base);
    let mut rw = rewriter(&ic, 3);

    let a = rw.get_arg(0);
    let b = rw.get_arg(1);
    let c = rw.get_arg(2);

    // Seven computed values that must survive the call.
    let vals: Vec<_> = (0..7)
        .map(|i| rw.add(a, i as i64 + 1, Location::AnyReg))
        .collect();

    let func = base + 0xF000;
    let _ret = rw.call(true, func, &[a, b, c], &[], &vals);

    for (i, &v) in vals.iter().enumerate() {
        rw.set_attr(c, 64 + 8 * i as i32, v, SetAttrKind::Unknown, MovWidth::Q);
    }

    let slot = rw.commit();
    assert_eq!(slot, Some(0));

    // Exactly one throwing call site, with nothing owned across it.
    let mut entries = Vec::new();
    for off in 0..1024u64 {
        if let Some(locs) = lookup_decref_info(base + off) {
            entries.push((off, locs));
        }
    }
    assert_eq!(entries.len(), 1);
    assert!(entries[0].1.is_empty());

    // The call was near enough for the rel32 form.
    let call_end = entries[0].0 as usize;
    let code = ic.code_snapshot();
    assert_eq!(code[call_end - 5], 0xE8);

    // Every computed value living only in a caller-clobbered register
    // was stored to scratch before the call: 7 values plus the operand
    // the allocator had already pushed out under register pressure.
    // (REX is 0x48 for the low registers, 0x4C for R8-R11.)
    let is_rsp_store = |w: &[u8]| {
        (w[0] == 0x48 || w[0] == 0x4C) && w[1] == 0x89 && (w[2] & 0xC7) == 0x44 && w[3] == 0x24
    };
    let is_rsp_load = |w: &[u8]| {
        (w[0] == 0x48 || w[0] == 0x4C) && w[1] == 0x8B && (w[2] & 0xC7) == 0x44 && w[3] == 0x24
    };
    let stores_before_call = code[..call_end - 5]
        .windows(4)
        .filter(|w| is_rsp_store(w))
        .count();
    assert_eq!(stores_before_call, 8);

    // And they come back: everything touched after the call is reloaded.
    let loads_after_call = code[call_end..]
        .windows(4)
        .filter(|w| is_rsp_load(w))
        .count();
    assert!(loads_after_call >= 7);
}

#[test]
fn far_call_goes_through_r11() {
    let base = 0x16_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 1);

    let arg = rw.get_arg(0);
    let func = 0x70_0000_0000u64; // far outside ±2 GiB
    rw.call(true, func, &[arg], &[], &[]);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // movabs r11, func; call r11
    let pos = code
        .windows(2)
        .position(|w| w == [0x49, 0xBB])
        .expect("no movabs r11");
    assert_eq!(&code[pos + 2..pos + 10], &func.to_le_bytes());
    assert_eq!(&code[pos + 10..pos + 13], &[0x41, 0xFF, 0xD3]);
}

// =============================================================================
// S6: Failure Paths
// =============================================================================

#[test]
fn unspillable_owned_value_abandons_the_rewrite() {
    let base = 0x17_0000;
    let mut s = spec(256);
    s.scratch_size = 0; // no spill room at all
    let ic = IcInfo::with_base(s, base);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    let prev = rw.get_attr(obj, 24);
    rw.set_type(prev, RefType::Owned);
    // `prev` lives only in a caller-clobbered register across a throwing
    // call, and there is nowhere to put it.
    rw.call(true, base + 0x1000, &[obj], &[], &[prev]);
    rw.decref(prev);

    let slot = rw.commit();
    assert_eq!(slot, None);

    // Nothing was installed and nothing published.
    assert!(ic.code_snapshot().iter().all(|&b| b == 0x90));
    assert_no_decref_info(base, 256);
    assert_eq!(ic.stats().committed, 0);
    assert_eq!(ic.stats().aborted, 1);
}

#[test]
fn scratch_exhaustion_abandons_the_rewrite() {
    let base = 0x18_0000;
    let mut s = spec(256);
    s.scratch_size = 8;
    let ic = IcInfo::with_base(s, base);
    let mut rw = rewriter(&ic, 1);

    let four = rw.allocate(4); // wants 4 slots of the 1 available
    rw.call(false, base + 0x1000, &[four], &[], &[]);

    assert_eq!(rw.commit(), None);
    assert!(ic.code_snapshot().iter().all(|&b| b == 0x90));
    assert_eq!(ic.stats().aborted, 1);
}

#[test]
fn explicit_abort_leaves_the_slot_alone() {
    let base = 0x19_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.get_attr(arg, 8);
    rw.abort();

    assert!(ic.code_snapshot().iter().all(|&b| b == 0x90));
    assert_eq!(ic.stats().aborted, 1);
    // The gate backs off after a failure.
    assert!(!ic.should_attempt());
    assert!(ic.should_attempt());
}

// =============================================================================
// Guard Edge Cases
// =============================================================================

#[test]
fn guard_on_matching_constant_is_elided() {
    let base = 0x1A_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 1);

    let c = rw.load_const(7);
    rw.add_guard(c, 7); // statically true: no code
    let arg = rw.get_arg(0);
    rw.set_type(arg, RefType::Borrowed);
    rw.commit_returning(arg).unwrap();

    let code = ic.code_snapshot();
    // Just the return move and the continuation jump.
    assert_eq!(&code[..3], &[0x48, 0x89, 0xF8]);
}

#[test]
#[should_panic(expected = "guard can never pass")]
fn guard_on_mismatching_constant_is_a_client_bug() {
    let ic = ic_at(0x1B_0000, 64);
    let mut rw = rewriter(&ic, 0);
    let c = rw.load_const(7);
    rw.add_guard(c, 8);
}

#[test]
#[should_panic(expected = "must be classified")]
fn returning_an_unclassified_value_is_a_client_bug() {
    let ic = ic_at(0x1C_0000, 64);
    let mut rw = rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.commit_returning(arg);
}

#[test]
fn guard_zero_uses_test_idiom() {
    let base = 0x1D_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    let field = rw.get_attr(obj, 8);
    rw.add_guard(field, 0);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // mov rax, [rdi+8]; test rax, rax; jne ...
    assert_eq!(&code[..4], &[0x48, 0x8B, 0x47, 0x08]);
    assert_eq!(&code[4..7], &[0x48, 0x85, 0xC0]);
    assert_eq!(&code[7..9], &[0x0F, 0x85]);
}

#[test]
fn sign_guard_uses_test_and_js() {
    let base = 0x2B_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    let len = rw.get_attr(obj, 8);
    rw.add_guard_not_lt0(len);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // mov rax, [rdi+8]; test rax, rax; js <slow path>
    assert_eq!(&code[..4], &[0x48, 0x8B, 0x47, 0x08]);
    assert_eq!(&code[4..7], &[0x48, 0x85, 0xC0]);
    assert_eq!(&code[7..9], &[0x0F, 0x88]);
}

#[test]
fn nullable_replace_attr_skips_null() {
    let base = 0x2C_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 2);

    let container = rw.get_arg(0);
    let item = rw.get_arg(1);
    rw.set_type(item, RefType::Owned);
    rw.replace_attr(container, 24, item, true);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    let expected: Vec<u8> = [
        vec![0x48, 0x8B, 0x47, 0x18],       // mov rax, [rdi+24]
        vec![0x48, 0x89, 0x77, 0x18],       // mov [rdi+24], rsi
        vec![0x48, 0x89, 0xC7],             // mov rdi, rax
        vec![0x48, 0x89, 0x7C, 0x24, 0x40], // mov [rsp+0x40], rdi
        vec![0x48, 0x85, 0xFF],             // test rdi, rdi
        vec![0x74, 0x0C],                   // jz past the whole release
        vec![0x48, 0xFF, 0x0F],             // dec qword [rdi]
        vec![0x75, 0x07],                   // jnz past the dealloc path
        vec![0x48, 0x8B, 0x47, 0x08],       // mov rax, [rdi+8]
        vec![0xFF, 0x50, 0x18],             // call [rax+24]
    ]
    .concat();
    assert_eq!(&code[..expected.len()], &expected[..]);
}

#[test]
fn attribute_double_load_uses_xmm() {
    let base = 0x2D_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    let _value = rw.get_attr_double(obj, 16);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // movsd xmm0, [rdi+16]
    assert_eq!(&code[..5], &[0xF2, 0x0F, 0x10, 0x47, 0x10]);
}

#[test]
fn sentinel_check_calls_handler_on_match() {
    let base = 0x2E_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 1);

    let obj = rw.get_arg(0);
    let status = rw.get_attr(obj, 8);
    rw.check_and_call_on_match(status, 0, base + 0x1000);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    let expected: Vec<u8> = [
        vec![0x48, 0x8B, 0x47, 0x08],       // mov rax, [rdi+8]
        vec![0x48, 0x85, 0xC0],             // test rax, rax
        vec![0x48, 0x89, 0x44, 0x24, 0x40], // spill the value to scratch
        vec![0x75, 0x05],                   // jnz over the handler call
    ]
    .concat();
    assert_eq!(&code[..expected.len()], &expected[..]);
    assert_eq!(code[expected.len()], 0xE8);

    // The handler call registered unwind info.
    let call_ret = base + expected.len() as u64 + 5;
    assert_eq!(lookup_decref_info(call_ret), Some(vec![]));
}

// =============================================================================
// Constant Loading
// =============================================================================

#[test]
fn repeated_load_const_shares_one_var() {
    let ic = ic_at(0x1E_0000, 64);
    let mut rw = rewriter(&ic, 0);
    let a = rw.load_const(0x1234_5678_9ABC);
    let b = rw.load_const(0x1234_5678_9ABC);
    assert_eq!(a, b);
    rw.abort();
}

#[test]
fn nearby_large_constant_is_rebased_with_lea() {
    let base = 0x1F_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 2);

    let first = rw.get_arg(0);
    let second = rw.get_arg(1);
    rw.add_guard(first, 0xAAAA_0000_0000);
    rw.add_guard(second, 0xAAAA_0000_0010);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // One movabs for the first constant...
    let movabs = code
        .windows(2)
        .filter(|w| w[0] == 0x48 && (w[1] & 0xF8) == 0xB8)
        .count();
    assert_eq!(movabs, 1);
    // ...and a lea off it for the second.
    assert!(code
        .windows(4)
        .any(|w| w == [0x48, 0x8D, 0x48, 0x10]));
}

#[test]
fn zero_argument_uses_xor_idiom() {
    let base = 0x21_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 0);

    let zero = rw.load_const(0);
    rw.call(false, base + 0x1000, &[zero], &[], &[]);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // xor edi, edi rather than a mov of 0
    assert_eq!(&code[..2], &[0x31, 0xFF]);
    assert!(!code.windows(2).any(|w| w[0] == 0x48 && (w[1] & 0xF8) == 0xB8));
}

// =============================================================================
// Predicates and Arithmetic
// =============================================================================

#[test]
fn cmp_emits_sete_into_a_byte_register() {
    let base = 0x22_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 2);

    let a = rw.get_arg(0);
    let b = rw.get_arg(1);
    let eq = rw.cmp(CmpOp::Eq, a, b, Location::AnyReg);
    rw.commit_returning_raw(eq).unwrap();

    let code = ic.code_snapshot();
    // cmp rdi, rsi; sete al
    assert_eq!(&code[..3], &[0x48, 0x39, 0xF7]);
    assert_eq!(&code[3..6], &[0x0F, 0x94, 0xC0]);
}

#[test]
fn to_bool_emits_test_and_setnz() {
    let base = 0x23_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 1);

    let a = rw.get_arg(0);
    let t = rw.to_bool(a, Location::AnyReg);
    rw.commit_returning_raw(t).unwrap();

    let code = ic.code_snapshot();
    // test rdi, rdi; setnz al
    assert_eq!(&code[..3], &[0x48, 0x85, 0xFF]);
    assert_eq!(&code[3..6], &[0x0F, 0x95, 0xC0]);
}

#[test]
fn add_copies_then_adds() {
    let base = 0x24_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 1);

    let a = rw.get_arg(0);
    let sum = rw.add(a, 16, Location::AnyReg);
    rw.commit_returning_raw(sum).unwrap();

    let code = ic.code_snapshot();
    // mov rax, rdi; add rax, 16
    assert_eq!(&code[..3], &[0x48, 0x89, 0xF8]);
    assert_eq!(&code[3..7], &[0x48, 0x83, 0xC0, 0x10]);
}

// =============================================================================
// Scratch Arrays and Owned Attributes
// =============================================================================

#[test]
fn allocate_and_copy_builds_a_scratch_array() {
    let base = 0x25_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 1);

    let src = rw.get_arg(0);
    let arr = rw.allocate_and_copy(src, 2);
    rw.call(false, base + 0x1000, &[arr], &[], &[]);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    let expected: Vec<u8> = [
        vec![0x48, 0x8B, 0x07],             // mov rax, [rdi]
        vec![0x48, 0x89, 0x44, 0x24, 0x40], // mov [rsp+0x40], rax
        vec![0x48, 0x8B, 0x47, 0x08],       // mov rax, [rdi+8]
        vec![0x48, 0x89, 0x44, 0x24, 0x48], // mov [rsp+0x48], rax
        vec![0x48, 0x8D, 0x7C, 0x24, 0x40], // lea rdi, [rsp+0x40]
    ]
    .concat();
    assert_eq!(&code[..expected.len()], &expected[..]);
}

#[test]
fn owned_attr_is_published_as_stack_indirect() {
    let base = 0x26_0000;
    let ic = ic_at(base, 256);
    let mut rw = rewriter(&ic, 2);

    let obj = rw.get_arg(0);
    let item = rw.get_arg(1);
    rw.set_type(item, RefType::Owned);

    let arr = rw.allocate(1);
    rw.set_attr(arr, 0, item, SetAttrKind::HandedOff, MovWidth::Q);
    rw.ref_consumed(item);
    rw.register_owned_attr(arr, 0);
    rw.call(true, base + 0x1000, &[obj], &[], &[arr]);
    rw.deregister_owned_attr(arr, 0);

    rw.commit().unwrap();

    // The store went into the scratch slot without an incref.
    let code = ic.code_snapshot();
    assert_eq!(&code[..5], &[0x48, 0x89, 0x74, 0x24, 0x40]);

    // The call's decref info carries the owned field as stack-indirect.
    let mut found = None;
    for off in 0..256u64 {
        if let Some(locs) = lookup_decref_info(base + off) {
            found = Some(locs);
        }
    }
    assert_eq!(
        found,
        Some(vec![Location::StackIndirect { offset: 0x40, field_offset: 0 }])
    );
}

// =============================================================================
// Invalidation Support
// =============================================================================

#[test]
fn side_effect_call_maintains_the_in_use_counter() {
    let base = 0x27_0000;
    let ic = ic_at(base, 256);
    let live_outs: Vec<u16> = ic.live_outs().to_vec();
    let mut rw = Rewriter::new(ic.start_rewrite("inval").unwrap(), 1, &live_outs, true);

    let obj = rw.get_arg(0);
    rw.call(true, base + 0x1000, &[obj], &[], &[]);
    rw.commit().unwrap();

    // The counter is touched twice: entered (inc) before the first side
    // effect and left (dec) before the slot exit. Depending on where the
    // counter landed in memory that is either two address
    // materializations or two absolute-address inc/dec forms.
    let code = ic.code_snapshot();
    let movabs = code
        .windows(2)
        .filter(|w| w[0] == 0x48 && (w[1] & 0xF8) == 0xB8)
        .count();
    let abs_forms = code
        .windows(3)
        .filter(|w| w[0] == 0xFF && (w[1] == 0x04 || w[1] == 0x0C) && w[2] == 0x25)
        .count();
    assert!(
        movabs >= 2 || abs_forms == 2,
        "expected enter/leave counter updates"
    );
}

#[test]
fn invalidated_slot_falls_through() {
    let base = 0x28_0000;
    let ic = ic_at(base, 64);
    let mut rw = rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.set_type(arg, RefType::Borrowed);
    let slot = rw.commit_returning(arg).unwrap();

    ic.invalidate_slot(slot);
    let code = ic.code_snapshot();
    assert_eq!(&code[..5], &[0xE9, 0x3B, 0x00, 0x00, 0x00]);
    assert_no_decref_info(base, 64);
}

// =============================================================================
// Live-Outs
// =============================================================================

#[test]
fn live_outs_are_restored_after_a_call() {
    let base = 0x29_0000;
    let mut s = spec(512);
    s.live_outs = vec![1, 2]; // RDX, RCX in DWARF numbering
    let ic = IcInfo::with_base(s, base);
    let live_outs: Vec<u16> = ic.live_outs().to_vec();
    let mut rw = Rewriter::new(ic.start_rewrite("lo").unwrap(), 0, &live_outs, false);

    let c1 = rw.load_const(11);
    let c2 = rw.load_const(22);
    rw.call(true, base + 0x1000, &[c1, c2], &[], &[]);
    rw.commit().unwrap();

    let code = ic.code_snapshot();
    // The two live-in registers were spilled around the call...
    let stores = code
        .windows(4)
        .filter(|w| w[0] == 0x48 && w[1] == 0x89 && (w[2] & 0xC7) == 0x44 && w[3] == 0x24)
        .count();
    assert_eq!(stores, 2);
    // ...and are back in RDX/RCX at exit: a reload of each after the
    // call.
    let rdx_reload = code
        .windows(5)
        .any(|w| w[0] == 0x48 && w[1] == 0x8B && w[2] == 0x54 && w[3] == 0x24);
    let rcx_reload = code
        .windows(5)
        .any(|w| w[0] == 0x48 && w[1] == 0x8B && w[2] == 0x4C && w[3] == 0x24);
    assert!(rdx_reload && rcx_reload);
}

// =============================================================================
// The Attempt Gate
// =============================================================================

#[test]
fn for_ic_applies_the_backoff_gate() {
    let base = 0x2A_0000;
    let ic = ic_at(base, 64);

    let rw = Rewriter::for_ic(&ic, 1, "gate").unwrap();
    rw.abort();

    // Backed off after the failure.
    assert!(Rewriter::for_ic(&ic, 1, "gate").is_none());
    // And allowed through again afterwards.
    let rw = Rewriter::for_ic(&ic, 1, "gate").unwrap();
    rw.abort();
}
