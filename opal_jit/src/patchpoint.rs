//! One-shot patchpoint initialization.
//!
//! Before an IC site is ever specialized, its reserved byte range holds
//! only the fixed-shape slow-path call. This module lays that call out:
//! the front of the range jumps over itself (later rewrites land there),
//! the tail spills caller-clobbered live-outs, performs
//! `movabs r11, slowpath; call r11`, restores, and falls through.
//!
//! Live-out registers the surrounding frame already spilled (per its
//! stack map) are not saved again; they are reloaded RBP-relative after
//! the call, and the stack-map record is rewritten to the spill slot so
//! later consumers agree on where the value lives.

use opal_asm::{Assembler, GenericReg, Gpr, JumpDest};
use rustc_hash::FxHashMap;

/// Size of `movabs r11, imm64; call r11`.
pub const PATCHPOINT_CALL_SIZE: usize = 13;

/// DWARF number of RBP.
pub const DWARF_RBP: u16 = 6;

// Byte-size estimates for one save/restore pair around the slow-path
// call: a GP mov with a 4-byte displacement each way, a movsd each way.
const GP_SPILL_PAIR_SIZE: usize = 14;
const XMM_SPILL_PAIR_SIZE: usize = 18;
const GP_RELOAD_SIZE: usize = 7;

// Past this much dead space, jumping beats executing nops.
const JMP_OVER_NOPS_THRESHOLD: usize = 20;

// =============================================================================
// Live-Out Sets
// =============================================================================

/// A set of DWARF register numbers (GP and XMM both number below 64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveOutSet(u64);

impl LiveOutSet {
    pub const EMPTY: LiveOutSet = LiveOutSet(0);

    pub fn from_regs(regs: &[u16]) -> Self {
        let mut set = LiveOutSet::EMPTY;
        for &r in regs {
            set.insert(r);
        }
        set
    }

    #[inline]
    pub fn insert(&mut self, dwarf_regnum: u16) {
        debug_assert!(dwarf_regnum < 64);
        self.0 |= 1 << dwarf_regnum;
    }

    #[inline]
    pub fn contains(self, dwarf_regnum: u16) -> bool {
        dwarf_regnum < 64 && (self.0 & (1 << dwarf_regnum)) != 0
    }

    #[inline]
    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate DWARF numbers in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u16> {
        (0u16..64).filter(move |&i| (self.0 & (1 << i)) != 0)
    }
}

// =============================================================================
// Stack-Map Values
// =============================================================================

/// Where a stack map locates one live value, in the producer's terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameValue {
    /// Live in a DWARF-numbered register.
    Register(u16),
    /// At `reg + offset` (the address is the value).
    Direct(u16, i32),
    /// In memory at `[reg + offset]`.
    Indirect(u16, i32),
    /// A known constant.
    Constant(i64),
    /// An index into the constant table.
    ConstIndex(u32),
}

/// Registers already moved to frame scratch, and where they landed.
pub type SpillMap = FxHashMap<GenericReg, FrameValue>;

// =============================================================================
// Frame Spilling
// =============================================================================

/// Move a register-located stack-map value into the RBP-relative scratch
/// area if a call would clobber it, rewriting `value` to the spill slot.
///
/// Emits into `buf` at `*cursor`. Registers already present in `remap`
/// are not spilled twice; the record is just redirected. Returns whether
/// code was emitted.
pub fn spill_frame_value_if_necessary(
    value: &mut FrameValue,
    buf: &mut [u8],
    cursor: &mut usize,
    scratch_offset: &mut i32,
    scratch_size: &mut usize,
    remap: &mut SpillMap,
) -> bool {
    let regnum = match *value {
        FrameValue::Register(r) => r,
        _ => return false,
    };
    let reg = GenericReg::from_dwarf(regnum)
        .unwrap_or_else(|| panic!("bad dwarf register {}", regnum));
    if !reg.is_clobbered_by_call() {
        return false;
    }

    if let Some(&spilled) = remap.get(&reg) {
        *value = spilled;
        return false;
    }

    let mut asm = Assembler::new(buf.len() - *cursor);
    let slot = opal_asm::Mem::new(Gpr::Rbp, *scratch_offset);
    match reg {
        GenericReg::Gp(r) => asm.mov_store(slot, r),
        GenericReg::Xmm(x) => asm.movsd_store(slot, x),
    }
    assert!(!asm.has_failed(), "no room to spill a frame value");
    buf[*cursor..*cursor + asm.bytes_written()].copy_from_slice(asm.code());
    *cursor += asm.bytes_written();

    let spilled = FrameValue::Indirect(DWARF_RBP, *scratch_offset);
    *value = spilled;
    remap.insert(reg, spilled);

    assert!(*scratch_size >= 8);
    *scratch_offset += 8;
    *scratch_size -= 8;

    true
}

// =============================================================================
// Patchpoint Initialization
// =============================================================================

/// Addresses produced by `initialize_patchpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchpointInfo {
    /// First byte of the slow-path sequence.
    pub slowpath_start: u64,
    /// Return address of the slow-path call (what the runtime patches
    /// against).
    pub slowpath_rtn_addr: u64,
    /// Where a specialized fast path should continue to.
    pub continue_addr: u64,
    /// Live-outs the IC rewriter must preserve: the input set minus
    /// registers the reload tail restores on every exit.
    pub live_outs: LiveOutSet,
}

/// Lay out the slow-path trampoline in the raw patch site
/// `[start_addr, start_addr + buf.len())`.
pub fn initialize_patchpoint(
    buf: &mut [u8],
    start_addr: u64,
    slowpath_func: u64,
    scratch_offset: i32,
    live_outs: LiveOutSet,
    remap: &SpillMap,
) -> PatchpointInfo {
    let end_addr = start_addr + buf.len() as u64;

    let mut est_slowpath_size = PATCHPOINT_CALL_SIZE;
    let mut regs_to_spill: Vec<GenericReg> = Vec::new();
    let mut regs_to_reload: Vec<Gpr> = Vec::new();
    let mut updated = LiveOutSet::EMPTY;

    for dwarf_regnum in live_outs.iter() {
        let reg = GenericReg::from_dwarf(dwarf_regnum)
            .unwrap_or_else(|| panic!("bad dwarf register {}", dwarf_regnum));
        assert!(
            reg != GenericReg::Gp(Gpr::R11),
            "R11 is the patchpoint's own scratch register"
        );

        if let GenericReg::Gp(gp) = reg {
            if gp == Gpr::Rsp || gp.is_callee_save() {
                // Survives the call on its own.
                updated.insert(dwarf_regnum);
                continue;
            }
            if remap.contains_key(&reg) {
                // The frame already spilled it; reload after the call.
                // Every exit runs the reload tail, so the IC itself need
                // not preserve the register.
                regs_to_reload.push(gp);
                est_slowpath_size += GP_RELOAD_SIZE;
                continue;
            }
        }

        updated.insert(dwarf_regnum);
        regs_to_spill.push(reg);
        est_slowpath_size += match reg {
            GenericReg::Gp(_) => GP_SPILL_PAIR_SIZE,
            GenericReg::Xmm(_) => XMM_SPILL_PAIR_SIZE,
        };
    }

    assert!(
        est_slowpath_size <= buf.len(),
        "patch site too small for its slow path"
    );
    let slowpath_start = end_addr - est_slowpath_size as u64;
    let front_len = (slowpath_start - start_addr) as usize;

    // Fast-path landing area: jump over the dead space when it is long
    // enough to be worth it, and pad with nops either way.
    {
        let mut front = Assembler::new(front_len);
        if front_len > JMP_OVER_NOPS_THRESHOLD {
            front.jmp(JumpDest::from_start(front_len));
        }
        front.fill_with_nops();
        assert!(!front.has_failed());
        buf[..front_len].copy_from_slice(front.code());
    }

    // Slow-path tail.
    let mut tail = Assembler::new(buf.len() - front_len);
    tail.emit_batch_push(scratch_offset, &regs_to_spill);
    tail.call_abs_via(Gpr::R11, slowpath_func);
    let slowpath_rtn_addr = slowpath_start + tail.bytes_written() as u64;
    tail.emit_batch_pop(scratch_offset, &regs_to_spill);

    // If nothing needs reloading, continue past the whole patchpoint.
    let continue_addr = if regs_to_reload.is_empty() {
        end_addr
    } else {
        slowpath_start + tail.bytes_written() as u64
    };

    for reg in regs_to_reload {
        let spilled = remap[&GenericReg::Gp(reg)];
        let FrameValue::Indirect(base, offset) = spilled else {
            panic!("remapped register not RBP-indirect: {:?}", spilled);
        };
        assert_eq!(base, DWARF_RBP);
        tail.mov_load(reg, opal_asm::Mem::new(Gpr::Rbp, offset));
    }

    tail.fill_with_nops();
    assert!(!tail.has_failed());
    buf[front_len..].copy_from_slice(tail.code());

    PatchpointInfo {
        slowpath_start,
        slowpath_rtn_addr,
        continue_addr,
        live_outs: updated,
    }
}

/// Redirect an existing patchpoint's slow-path call to `func`.
///
/// The first bytes must still be the untouched 13-byte call shape,
/// followed by prefix/nop padding; anything else means the site was
/// already rewritten and must not be blindly patched.
pub fn set_slowpath_func(pp: &mut [u8], func: u64) {
    // movabs r11, imm64
    assert_eq!(pp[0], 0x49, "patchpoint shape mismatch at byte 0");
    assert_eq!(pp[1], 0xBB, "patchpoint shape mismatch at byte 1");
    // call r11
    assert_eq!(pp[10], 0x41, "patchpoint shape mismatch at byte 10");
    assert_eq!(pp[11], 0xFF, "patchpoint shape mismatch at byte 11");
    assert_eq!(pp[12], 0xD3, "patchpoint shape mismatch at byte 12");

    let mut i = PATCHPOINT_CALL_SIZE;
    while pp[i] == 0x66 || pp[i] == 0x0F || pp[i] == 0x2E {
        i += 1;
    }
    assert!(
        pp[i] == 0x90 || pp[i] == 0x1F,
        "patchpoint padding is not nops"
    );

    pp[2..10].copy_from_slice(&func.to_le_bytes());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_out_set() {
        let mut set = LiveOutSet::from_regs(&[0, 3, 12]);
        assert!(set.contains(0));
        assert!(set.contains(12));
        assert!(!set.contains(1));
        assert_eq!(set.len(), 3);
        set.insert(17);
        let regs: Vec<u16> = set.iter().collect();
        assert_eq!(regs, vec![0, 3, 12, 17]);
    }

    #[test]
    fn test_spill_frame_value_register() {
        let mut buf = [0u8; 64];
        let mut cursor = 0;
        let mut scratch_offset = -0x40;
        let mut scratch_size = 64;
        let mut remap = SpillMap::default();

        // RAX (dwarf 0) is caller-clobbered: spilled.
        let mut value = FrameValue::Register(0);
        assert!(spill_frame_value_if_necessary(
            &mut value,
            &mut buf,
            &mut cursor,
            &mut scratch_offset,
            &mut scratch_size,
            &mut remap,
        ));
        assert_eq!(value, FrameValue::Indirect(DWARF_RBP, -0x40));
        assert_eq!(scratch_offset, -0x38);
        assert_eq!(scratch_size, 56);
        // mov [rbp-0x40], rax
        assert_eq!(&buf[..cursor], &[0x48, 0x89, 0x45, 0xC0]);

        // Asking again redirects without emitting.
        let cursor_before = cursor;
        let mut again = FrameValue::Register(0);
        assert!(!spill_frame_value_if_necessary(
            &mut again,
            &mut buf,
            &mut cursor,
            &mut scratch_offset,
            &mut scratch_size,
            &mut remap,
        ));
        assert_eq!(again, FrameValue::Indirect(DWARF_RBP, -0x40));
        assert_eq!(cursor, cursor_before);
    }

    #[test]
    fn test_spill_frame_value_leaves_safe_locations() {
        let mut buf = [0u8; 16];
        let mut cursor = 0;
        let mut scratch_offset = -8;
        let mut scratch_size = 8;
        let mut remap = SpillMap::default();

        // RBX (dwarf 3) is callee-save.
        let mut value = FrameValue::Register(3);
        assert!(!spill_frame_value_if_necessary(
            &mut value,
            &mut buf,
            &mut cursor,
            &mut scratch_offset,
            &mut scratch_size,
            &mut remap,
        ));
        assert_eq!(value, FrameValue::Register(3));

        let mut constant = FrameValue::Constant(7);
        assert!(!spill_frame_value_if_necessary(
            &mut constant,
            &mut buf,
            &mut cursor,
            &mut scratch_offset,
            &mut scratch_size,
            &mut remap,
        ));
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_initialize_patchpoint_minimal() {
        let mut buf = [0u8; 64];
        let start = 0x4000_0000u64;
        let info = initialize_patchpoint(
            &mut buf,
            start,
            0x1234_5678,
            -0x40,
            LiveOutSet::EMPTY,
            &SpillMap::default(),
        );

        // Nothing live: the slow path is exactly the 13-byte call.
        assert_eq!(info.slowpath_start, start + 64 - 13);
        assert_eq!(info.slowpath_rtn_addr, start + 64);
        assert_eq!(info.continue_addr, start + 64);
        assert!(info.live_outs.is_empty());

        // Front: a jmp over the dead space, then nops.
        assert_eq!(buf[0], 0xE9);
        let rel = i32::from_le_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(rel as usize, (64 - 13) - 5);

        // Tail: movabs r11, imm64; call r11.
        let pp = &buf[64 - 13..];
        assert_eq!(pp[0], 0x49);
        assert_eq!(pp[1], 0xBB);
        assert_eq!(&pp[2..10], &0x1234_5678u64.to_le_bytes());
        assert_eq!(&pp[10..13], &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn test_initialize_patchpoint_spills_live_outs() {
        let mut buf = [0u8; 128];
        let start = 0x4000_1000u64;
        // RAX (0) caller-clobbered, RBX (3) callee-save, XMM0 (17).
        let live_outs = LiveOutSet::from_regs(&[0, 3, 17]);
        let info = initialize_patchpoint(
            &mut buf,
            start,
            0x9999_0000,
            -0x40,
            live_outs,
            &SpillMap::default(),
        );

        // All three stay live-outs; RAX and XMM0 get spilled around the
        // call, RBX rides through.
        assert!(info.live_outs.contains(0));
        assert!(info.live_outs.contains(3));
        assert!(info.live_outs.contains(17));
        assert_eq!(
            info.slowpath_start,
            start + 128 - (13 + GP_SPILL_PAIR_SIZE + XMM_SPILL_PAIR_SIZE) as u64
        );
        assert_eq!(info.continue_addr, start + 128);

        // The spill region starts with mov [rbp-0x40], rax.
        let tail = &buf[(info.slowpath_start - start) as usize..];
        assert_eq!(&tail[..4], &[0x48, 0x89, 0x45, 0xC0]);
    }

    #[test]
    fn test_initialize_patchpoint_reloads_remapped() {
        let mut buf = [0u8; 96];
        let start = 0x4000_2000u64;
        let mut remap = SpillMap::default();
        remap.insert(
            GenericReg::Gp(Gpr::Rax),
            FrameValue::Indirect(DWARF_RBP, -0x38),
        );

        let info = initialize_patchpoint(
            &mut buf,
            start,
            0x9999_0000,
            -0x40,
            LiveOutSet::from_regs(&[0]),
            &remap,
        );

        // Already spilled: reloaded after the call, and no longer the
        // IC's responsibility.
        assert!(!info.live_outs.contains(0));
        assert_eq!(
            info.slowpath_start,
            start + 96 - (13 + GP_RELOAD_SIZE) as u64
        );
        assert_eq!(info.continue_addr, info.slowpath_start + 13);

        // The reload: mov rax, [rbp-0x38].
        let reload_at = (info.continue_addr - start) as usize;
        assert_eq!(&buf[reload_at..reload_at + 4], &[0x48, 0x8B, 0x45, 0xC8]);
    }

    #[test]
    fn test_set_slowpath_func() {
        let mut buf = [0u8; 32];
        let mut asm = Assembler::new(32);
        asm.call_abs_via(Gpr::R11, 0x1111_2222);
        asm.fill_with_nops();
        buf.copy_from_slice(asm.code());

        set_slowpath_func(&mut buf, 0x3333_4444_5555_6666);
        assert_eq!(&buf[2..10], &0x3333_4444_5555_6666u64.to_le_bytes());
        assert_eq!(buf[0], 0x49);
        assert_eq!(&buf[10..13], &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    #[should_panic(expected = "shape mismatch")]
    fn test_set_slowpath_func_rejects_rewritten_site() {
        let mut buf = [0x90u8; 32];
        buf[0] = 0xE9; // a jmp, not the call shape
        set_slowpath_func(&mut buf, 0x1234);
    }

    #[test]
    fn test_batch_spill_order_is_stable() {
        // GP before XMM when both are live, in dwarf iteration order.
        let mut buf = [0u8; 160];
        let live_outs = LiveOutSet::from_regs(&[0, 17, 18]);
        let info = initialize_patchpoint(
            &mut buf,
            0x4000_3000,
            0x7777_0000,
            -0x60,
            live_outs,
            &SpillMap::default(),
        );
        assert_eq!(
            (info.slowpath_start - 0x4000_3000) as usize,
            160 - (13 + GP_SPILL_PAIR_SIZE + 2 * XMM_SPILL_PAIR_SIZE)
        );
        let tail = &buf[(info.slowpath_start - 0x4000_3000) as usize..];
        // mov [rbp-0x60], rax; movsd [rbp-0x58], xmm0; movsd [rbp-0x50], xmm1
        assert_eq!(&tail[..4], &[0x48, 0x89, 0x45, 0xA0]);
        assert_eq!(&tail[4..9], &[0xF2, 0x0F, 0x11, 0x45, 0xA8]);
        assert_eq!(&tail[9..14], &[0xF2, 0x0F, 0x11, 0x4D, 0xB0]);
    }
}
