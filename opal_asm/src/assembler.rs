//! Fixed-capacity x86-64 assembler.
//!
//! The emitter the IC rewriter drives. It differs from a general-purpose
//! assembler in two ways that match how IC slots work:
//!
//! - The buffer has a hard capacity (the slot size). Running past it does
//!   not grow the buffer; it sets a sticky failure flag the rewrite checks
//!   at commit time. Everything emitted after a failure is discarded.
//! - Jumps target byte offsets *from the start of the buffer* rather than
//!   labels, because the interesting targets (the slot end, a previous
//!   guard jump) are known offsets at emission time.

use crate::encoder::{
    self, encode_abs, encode_mem, encode_reg, fits_i32, fits_i8, Cond, EncodedOperands, Mem,
};
use crate::registers::{GenericReg, Gpr, Xmm};

// =============================================================================
// Move Widths
// =============================================================================

/// Operand width and extension mode for memory moves.
///
/// Loads narrower than 64 bits either zero- or sign-extend into the full
/// destination register; stores only support the plain 64/32-bit forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MovWidth {
    /// 64-bit move.
    Q,
    /// 32-bit move (loads zero the upper half).
    L,
    /// Byte load, zero-extended.
    ZBQ,
    /// Byte load, sign-extended.
    SBQ,
    /// Word load, zero-extended.
    ZWQ,
    /// Word load, sign-extended.
    SWQ,
    /// Dword load, sign-extended.
    SLQ,
}

// =============================================================================
// Jump Destinations
// =============================================================================

/// A jump target expressed as a byte offset from the buffer start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpDest(i64);

impl JumpDest {
    /// Target the given offset from the start of the buffer.
    #[inline]
    pub const fn from_start(offset: usize) -> Self {
        JumpDest(offset as i64)
    }

    #[inline]
    pub const fn offset(self) -> i64 {
        self.0
    }
}

/// A forward conditional jump awaiting its target.
///
/// Emitted as a short (rel8) `jcc`; `patch_jump` fills in the displacement
/// once the fall-through point is reached. The skipped range must stay
/// within 127 bytes.
#[derive(Debug)]
#[must_use = "a forward jump must be patched"]
pub struct ForwardJump {
    at: usize,
}

// =============================================================================
// Assembler
// =============================================================================

/// Byte emitter with a hard capacity and sticky overflow failure.
pub struct Assembler {
    code: Vec<u8>,
    capacity: usize,
    failed: bool,
    #[cfg(debug_assertions)]
    comments: Vec<(usize, String)>,
}

impl Assembler {
    /// Create an assembler bounded to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Assembler {
            code: Vec::with_capacity(capacity),
            capacity,
            failed: false,
            #[cfg(debug_assertions)]
            comments: Vec::new(),
        }
    }

    /// Bytes emitted so far.
    #[inline]
    pub fn bytes_written(&self) -> usize {
        self.code.len()
    }

    /// The capacity this assembler was created with.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether emission ran past the capacity at any point.
    #[inline]
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// The emitted bytes.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Attach a comment to the current offset. Debug builds only; a no-op
    /// in release builds.
    #[allow(unused_variables)]
    pub fn comment(&mut self, text: &str) {
        #[cfg(debug_assertions)]
        self.comments.push((self.code.len(), text.to_string()));
    }

    /// Render the emitted bytes with interleaved comments.
    #[cfg(debug_assertions)]
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut ci = 0;
        for (i, byte) in self.code.iter().enumerate() {
            while ci < self.comments.len() && self.comments[ci].0 == i {
                let _ = writeln!(out, "; {}", self.comments[ci].1);
                ci += 1;
            }
            let _ = writeln!(out, "{:04x}: {:02x}", i, byte);
        }
        out
    }

    // =========================================================================
    // Raw Emission
    // =========================================================================

    fn push(&mut self, bytes: &[u8]) {
        if self.failed || self.code.len() + bytes.len() > self.capacity {
            self.failed = true;
            return;
        }
        self.code.extend_from_slice(bytes);
    }

    fn emit_insn(&mut self, prefix: Option<u8>, opcode: &[u8], ops: EncodedOperands, imm: &[u8]) {
        let mut buf = [0u8; 16];
        let mut len = 0;
        if let Some(p) = prefix {
            buf[len] = p;
            len += 1;
        }
        if ops.rex != 0 {
            buf[len] = ops.rex;
            len += 1;
        }
        buf[len..len + opcode.len()].copy_from_slice(opcode);
        len += opcode.len();
        let tail = ops.tail();
        buf[len..len + tail.len()].copy_from_slice(tail);
        len += tail.len();
        buf[len..len + imm.len()].copy_from_slice(imm);
        len += imm.len();
        self.push(&buf[..len]);
    }

    // =========================================================================
    // Register Moves
    // =========================================================================

    /// `mov dst, src` (64-bit, register to register).
    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        let ops = encode_reg(true, src.low_bits(), src.is_extended(), dst);
        self.emit_insn(None, &[0x89], ops, &[]);
    }

    /// `mov dst, [mem]` (64-bit load).
    pub fn mov_load(&mut self, dst: Gpr, mem: Mem) {
        self.mov_load_width(dst, mem, MovWidth::Q);
    }

    /// Width-generic load with zero/sign extension.
    pub fn mov_load_width(&mut self, dst: Gpr, mem: Mem, width: MovWidth) {
        let (w, opcode): (bool, &[u8]) = match width {
            MovWidth::Q => (true, &[0x8B]),
            MovWidth::L => (false, &[0x8B]),
            MovWidth::ZBQ => (true, &[0x0F, 0xB6]),
            MovWidth::SBQ => (true, &[0x0F, 0xBE]),
            MovWidth::ZWQ => (true, &[0x0F, 0xB7]),
            MovWidth::SWQ => (true, &[0x0F, 0xBF]),
            MovWidth::SLQ => (true, &[0x63]),
        };
        let ops = encode_mem(w, dst.low_bits(), dst.is_extended(), mem);
        self.emit_insn(None, opcode, ops, &[]);
    }

    /// `mov [mem], src` (64-bit store).
    pub fn mov_store(&mut self, mem: Mem, src: Gpr) {
        self.mov_store_width(mem, src, MovWidth::Q);
    }

    /// Width-generic store. Only the plain 64/32-bit forms exist.
    pub fn mov_store_width(&mut self, mem: Mem, src: Gpr, width: MovWidth) {
        let w = match width {
            MovWidth::Q => true,
            MovWidth::L => false,
            _ => panic!("unsupported store width {:?}", width),
        };
        let ops = encode_mem(w, src.low_bits(), src.is_extended(), mem);
        self.emit_insn(None, &[0x89], ops, &[]);
    }

    /// `mov [mem], imm32` (sign-extended for the 64-bit form).
    pub fn mov_store_imm(&mut self, mem: Mem, imm: i32, width: MovWidth) {
        let w = match width {
            MovWidth::Q => true,
            MovWidth::L => false,
            _ => panic!("unsupported store width {:?}", width),
        };
        let ops = encode_mem(w, 0, false, mem);
        self.emit_insn(None, &[0xC7], ops, &imm.to_le_bytes());
    }

    /// Load an immediate, choosing the shortest encoding: `mov r32, imm32`
    /// when the value zero-extends, the sign-extended `mov r/m64, imm32`,
    /// or the full `movabs r64, imm64`.
    pub fn mov_imm(&mut self, dst: Gpr, val: u64) {
        if val <= u32::MAX as u64 {
            let rex = encoder::rex(false, false, false, dst.is_extended());
            let mut buf = [0u8; 7];
            let mut len = 0;
            if rex != 0 {
                buf[len] = rex;
                len += 1;
            }
            buf[len] = 0xB8 + dst.low_bits();
            len += 1;
            buf[len..len + 4].copy_from_slice(&(val as u32).to_le_bytes());
            self.push(&buf[..len + 4]);
        } else if fits_i32(val as i64) {
            let ops = encode_reg(true, 0, false, dst);
            self.emit_insn(None, &[0xC7], ops, &(val as u32).to_le_bytes());
        } else {
            let rex = encoder::rex(true, false, false, dst.is_extended());
            let mut buf = [0u8; 10];
            buf[0] = rex;
            buf[1] = 0xB8 + dst.low_bits();
            buf[2..10].copy_from_slice(&val.to_le_bytes());
            self.push(&buf);
        }
    }

    /// Zero a register with the `xor` idiom.
    pub fn clear_reg(&mut self, reg: Gpr) {
        // 32-bit xor zeroes the full register and saves the REX.W.
        let ops = encode_reg(false, reg.low_bits(), reg.is_extended(), reg);
        self.emit_insn(None, &[0x31], ops, &[]);
    }

    // =========================================================================
    // XMM Moves
    // =========================================================================

    /// `movsd dst, [mem]`.
    pub fn movsd_load(&mut self, dst: Xmm, mem: Mem) {
        let ops = encode_mem(false, dst.low_bits(), dst.is_extended(), mem);
        self.emit_insn(Some(0xF2), &[0x0F, 0x10], ops, &[]);
    }

    /// `movsd [mem], src`.
    pub fn movsd_store(&mut self, mem: Mem, src: Xmm) {
        let ops = encode_mem(false, src.low_bits(), src.is_extended(), mem);
        self.emit_insn(Some(0xF2), &[0x0F, 0x11], ops, &[]);
    }

    /// `movsd dst, src` (register to register).
    pub fn movsd_rr(&mut self, dst: Xmm, src: Xmm) {
        let rex = encoder::rex(false, dst.is_extended(), false, src.is_extended());
        let modrm = encoder::modrm(0b11, dst.low_bits(), src.low_bits());
        if rex != 0 {
            self.push(&[0xF2, rex, 0x0F, 0x10, modrm]);
        } else {
            self.push(&[0xF2, 0x0F, 0x10, modrm]);
        }
    }

    /// `movss dst, [mem]`.
    pub fn movss_load(&mut self, dst: Xmm, mem: Mem) {
        let ops = encode_mem(false, dst.low_bits(), dst.is_extended(), mem);
        self.emit_insn(Some(0xF3), &[0x0F, 0x10], ops, &[]);
    }

    /// `cvtss2sd dst, src`.
    pub fn cvtss2sd(&mut self, dst: Xmm, src: Xmm) {
        let rex = encoder::rex(false, dst.is_extended(), false, src.is_extended());
        let modrm = encoder::modrm(0b11, dst.low_bits(), src.low_bits());
        if rex != 0 {
            self.push(&[0xF3, rex, 0x0F, 0x5A, modrm]);
        } else {
            self.push(&[0xF3, 0x0F, 0x5A, modrm]);
        }
    }

    // =========================================================================
    // Address Computation / Arithmetic
    // =========================================================================

    /// `lea dst, [mem]`.
    pub fn lea(&mut self, dst: Gpr, mem: Mem) {
        let ops = encode_mem(true, dst.low_bits(), dst.is_extended(), mem);
        self.emit_insn(None, &[0x8D], ops, &[]);
    }

    /// `add reg, imm`.
    pub fn add_imm(&mut self, reg: Gpr, imm: i32) {
        let ops = encode_reg(true, 0, false, reg);
        if fits_i8(imm as i64) {
            self.emit_insn(None, &[0x83], ops, &[imm as i8 as u8]);
        } else {
            self.emit_insn(None, &[0x81], ops, &imm.to_le_bytes());
        }
    }

    /// `add qword [mem], imm`.
    pub fn add_mem_imm(&mut self, mem: Mem, imm: i32) {
        let ops = encode_mem(true, 0, false, mem);
        if fits_i8(imm as i64) {
            self.emit_insn(None, &[0x83], ops, &[imm as i8 as u8]);
        } else {
            self.emit_insn(None, &[0x81], ops, &imm.to_le_bytes());
        }
    }

    /// `inc qword [mem]`.
    pub fn incq(&mut self, mem: Mem) {
        let ops = encode_mem(true, 0, false, mem);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// `dec qword [mem]`.
    pub fn decq(&mut self, mem: Mem) {
        let ops = encode_mem(true, 1, false, mem);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// `inc dword [mem]`.
    pub fn incl(&mut self, mem: Mem) {
        let ops = encode_mem(false, 0, false, mem);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// `dec dword [mem]`.
    pub fn decl(&mut self, mem: Mem) {
        let ops = encode_mem(false, 1, false, mem);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// `inc qword [addr]` with a 32-bit absolute address.
    pub fn incq_abs(&mut self, addr: u32) {
        let ops = encode_abs(true, 0, false, addr);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// `inc dword [addr]` with a 32-bit absolute address.
    pub fn incl_abs(&mut self, addr: u32) {
        let ops = encode_abs(false, 0, false, addr);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// `dec dword [addr]` with a 32-bit absolute address.
    pub fn decl_abs(&mut self, addr: u32) {
        let ops = encode_abs(false, 1, false, addr);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    // =========================================================================
    // Compare / Test / Setcc
    // =========================================================================

    /// `cmp a, b` (flags of `a - b`).
    pub fn cmp_rr(&mut self, a: Gpr, b: Gpr) {
        let ops = encode_reg(true, b.low_bits(), b.is_extended(), a);
        self.emit_insn(None, &[0x39], ops, &[]);
    }

    /// `cmp reg, imm`.
    pub fn cmp_imm(&mut self, reg: Gpr, imm: i32) {
        let ops = encode_reg(true, 7, false, reg);
        if fits_i8(imm as i64) {
            self.emit_insn(None, &[0x83], ops, &[imm as i8 as u8]);
        } else {
            self.emit_insn(None, &[0x81], ops, &imm.to_le_bytes());
        }
    }

    /// `cmp qword [mem], imm`.
    pub fn cmp_mem_imm(&mut self, mem: Mem, imm: i32) {
        let ops = encode_mem(true, 7, false, mem);
        if fits_i8(imm as i64) {
            self.emit_insn(None, &[0x83], ops, &[imm as i8 as u8]);
        } else {
            self.emit_insn(None, &[0x81], ops, &imm.to_le_bytes());
        }
    }

    /// `cmp qword [mem], reg`.
    pub fn cmp_mem_reg(&mut self, mem: Mem, reg: Gpr) {
        let ops = encode_mem(true, reg.low_bits(), reg.is_extended(), mem);
        self.emit_insn(None, &[0x39], ops, &[]);
    }

    /// `test a, b`.
    pub fn test_rr(&mut self, a: Gpr, b: Gpr) {
        let ops = encode_reg(true, b.low_bits(), b.is_extended(), a);
        self.emit_insn(None, &[0x85], ops, &[]);
    }

    /// `setcc reg8`. The destination must be one of RAX/RCX/RDX/RBX, whose
    /// low byte is addressable without a REX prefix.
    pub fn setcc(&mut self, cond: Cond, reg: Gpr) {
        assert!(reg.encoding() < 4, "setcc destination {} needs a REX prefix", reg);
        self.push(&[0x0F, 0x90 + cond.code(), encoder::modrm(0b11, 0, reg.low_bits())]);
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// `call rel32`. `disp` is relative to the end of the call instruction.
    pub fn call_rel(&mut self, disp: i32) {
        let mut buf = [0u8; 5];
        buf[0] = 0xE8;
        buf[1..5].copy_from_slice(&disp.to_le_bytes());
        self.push(&buf);
    }

    /// `call reg` (indirect).
    pub fn call_reg(&mut self, reg: Gpr) {
        let ops = encode_reg(false, 2, false, reg);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// `call qword [mem]` (indirect through memory).
    pub fn call_mem(&mut self, mem: Mem) {
        let ops = encode_mem(false, 2, false, mem);
        self.emit_insn(None, &[0xFF], ops, &[]);
    }

    /// The fixed-shape absolute call: `movabs reg, imm64; call reg`.
    ///
    /// Always uses the full 10-byte immediate form so a patcher can later
    /// overwrite the address in place. With R11 this is the 13-byte
    /// patchpoint sequence `49 BB <imm64> 41 FF D3`.
    pub fn call_abs_via(&mut self, reg: Gpr, target: u64) {
        let rex = encoder::rex(true, false, false, reg.is_extended());
        let mut buf = [0u8; 10];
        buf[0] = rex;
        buf[1] = 0xB8 + reg.low_bits();
        buf[2..10].copy_from_slice(&target.to_le_bytes());
        self.push(&buf);
        self.call_reg(reg);
    }

    // =========================================================================
    // Jumps
    // =========================================================================

    /// Unconditional jump to an offset from the buffer start. Picks the
    /// short form when the displacement fits.
    pub fn jmp(&mut self, dest: JumpDest) {
        let pos = self.code.len() as i64;
        let short = dest.offset() - (pos + 2);
        if fits_i8(short) {
            self.push(&[0xEB, short as i8 as u8]);
        } else {
            let rel = dest.offset() - (pos + 5);
            let mut buf = [0u8; 5];
            buf[0] = 0xE9;
            buf[1..5].copy_from_slice(&(rel as i32).to_le_bytes());
            self.push(&buf);
        }
    }

    /// Conditional jump to an offset from the buffer start.
    pub fn jcc(&mut self, cond: Cond, dest: JumpDest) {
        let pos = self.code.len() as i64;
        let short = dest.offset() - (pos + 2);
        if fits_i8(short) {
            self.push(&[0x70 + cond.code(), short as i8 as u8]);
        } else {
            let rel = dest.offset() - (pos + 6);
            let mut buf = [0u8; 6];
            buf[0] = 0x0F;
            buf[1] = 0x80 + cond.code();
            buf[2..6].copy_from_slice(&(rel as i32).to_le_bytes());
            self.push(&buf);
        }
    }

    /// Emit a short forward conditional jump whose target is patched later.
    pub fn forward_jcc(&mut self, cond: Cond) -> ForwardJump {
        let at = self.code.len();
        self.push(&[0x70 + cond.code(), 0]);
        ForwardJump { at }
    }

    /// Resolve a forward jump to land at the current offset.
    pub fn patch_jump(&mut self, jump: ForwardJump) {
        if self.failed {
            return;
        }
        let disp = self.code.len() as i64 - (jump.at as i64 + 2);
        assert!(fits_i8(disp), "forward jump skips {} bytes", disp);
        self.code[jump.at + 1] = disp as i8 as u8;
    }

    // =========================================================================
    // Padding / Misc
    // =========================================================================

    /// `nop`.
    pub fn nop(&mut self) {
        self.push(&[0x90]);
    }

    /// Emit `n` single-byte nops.
    pub fn nops(&mut self, n: usize) {
        for _ in 0..n {
            self.nop();
        }
    }

    /// Pad the remainder of the buffer with nops.
    pub fn fill_with_nops(&mut self) {
        if self.failed {
            return;
        }
        let remaining = self.capacity - self.code.len();
        self.nops(remaining);
    }

    /// `int3`.
    pub fn trap(&mut self) {
        self.push(&[0xCC]);
    }

    // =========================================================================
    // Batch Spills (patchpoint slow paths)
    // =========================================================================

    /// Store each register to consecutive RBP-relative scratch slots.
    pub fn emit_batch_push(&mut self, scratch_offset: i32, regs: &[GenericReg]) {
        let mut offset = 0;
        for &reg in regs {
            let slot = Mem::new(Gpr::Rbp, scratch_offset + offset);
            match reg {
                GenericReg::Gp(r) => self.mov_store(slot, r),
                GenericReg::Xmm(r) => self.movsd_store(slot, r),
            }
            offset += 8;
        }
    }

    /// Reload each register from the slots written by `emit_batch_push`.
    pub fn emit_batch_pop(&mut self, scratch_offset: i32, regs: &[GenericReg]) {
        let mut offset = 0;
        for &reg in regs {
            let slot = Mem::new(Gpr::Rbp, scratch_offset + offset);
            match reg {
                GenericReg::Gp(r) => self.mov_load(r, slot),
                GenericReg::Xmm(r) => self.movsd_load(r, slot),
            }
            offset += 8;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn asm() -> Assembler {
        Assembler::new(256)
    }

    // -------------------------------------------------------------------------
    // Move Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_mov_rr() {
        let mut a = asm();
        a.mov_rr(Gpr::Rax, Gpr::Rdi);
        assert_eq!(a.code(), &[0x48, 0x89, 0xF8]);
    }

    #[test]
    fn test_mov_rr_extended() {
        let mut a = asm();
        a.mov_rr(Gpr::R10, Gpr::Rax);
        assert_eq!(a.code(), &[0x49, 0x89, 0xC2]);
    }

    #[test]
    fn test_mov_load_disp8() {
        let mut a = asm();
        a.mov_load(Gpr::Rax, Mem::new(Gpr::Rdi, 16));
        assert_eq!(a.code(), &[0x48, 0x8B, 0x47, 0x10]);
    }

    #[test]
    fn test_mov_load_rsp() {
        let mut a = asm();
        a.mov_load(Gpr::Rcx, Mem::new(Gpr::Rsp, 0x40));
        assert_eq!(a.code(), &[0x48, 0x8B, 0x4C, 0x24, 0x40]);
    }

    #[test]
    fn test_mov_store() {
        let mut a = asm();
        a.mov_store(Mem::new(Gpr::Rsp, 8), Gpr::Rdi);
        assert_eq!(a.code(), &[0x48, 0x89, 0x7C, 0x24, 0x08]);
    }

    #[test]
    fn test_mov_load_widths() {
        let mut a = asm();
        a.mov_load_width(Gpr::Rax, Mem::new(Gpr::Rdi, 8), MovWidth::L);
        assert_eq!(a.code(), &[0x8B, 0x47, 0x08]);

        let mut a = asm();
        a.mov_load_width(Gpr::Rax, Mem::new(Gpr::Rdi, 8), MovWidth::ZBQ);
        assert_eq!(a.code(), &[0x48, 0x0F, 0xB6, 0x47, 0x08]);

        let mut a = asm();
        a.mov_load_width(Gpr::Rax, Mem::new(Gpr::Rdi, 8), MovWidth::SLQ);
        assert_eq!(a.code(), &[0x48, 0x63, 0x47, 0x08]);
    }

    #[test]
    fn test_mov_imm_small() {
        let mut a = asm();
        a.mov_imm(Gpr::Rdi, 0x1234);
        assert_eq!(a.code(), &[0xBF, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm_extended_reg() {
        let mut a = asm();
        a.mov_imm(Gpr::R8, 1);
        assert_eq!(a.code(), &[0x41, 0xB8, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm_negative() {
        let mut a = asm();
        a.mov_imm(Gpr::Rax, -1i64 as u64);
        // sign-extended mov r/m64, imm32
        assert_eq!(a.code(), &[0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_mov_imm_large() {
        let mut a = asm();
        a.mov_imm(Gpr::Rcx, 0xDEAD_BEEF_00);
        assert_eq!(
            a.code(),
            &[0x48, 0xB9, 0x00, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_clear_reg() {
        let mut a = asm();
        a.clear_reg(Gpr::Rax);
        assert_eq!(a.code(), &[0x31, 0xC0]);

        let mut a = asm();
        a.clear_reg(Gpr::R10);
        assert_eq!(a.code(), &[0x45, 0x31, 0xD2]);
    }

    #[test]
    fn test_mov_store_imm() {
        let mut a = asm();
        a.mov_store_imm(Mem::new(Gpr::Rdi, 24), 7, MovWidth::Q);
        assert_eq!(a.code(), &[0x48, 0xC7, 0x47, 0x18, 0x07, 0x00, 0x00, 0x00]);
    }

    // -------------------------------------------------------------------------
    // XMM Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_movsd() {
        let mut a = asm();
        a.movsd_load(Xmm::Xmm0, Mem::new(Gpr::Rdi, 8));
        assert_eq!(a.code(), &[0xF2, 0x0F, 0x10, 0x47, 0x08]);

        let mut a = asm();
        a.movsd_store(Mem::new(Gpr::Rsp, 16), Xmm::Xmm1);
        assert_eq!(a.code(), &[0xF2, 0x0F, 0x11, 0x4C, 0x24, 0x10]);
    }

    #[test]
    fn test_movss_cvt() {
        let mut a = asm();
        a.movss_load(Xmm::Xmm2, Mem::new(Gpr::Rax, 4));
        a.cvtss2sd(Xmm::Xmm2, Xmm::Xmm2);
        assert_eq!(
            a.code(),
            &[0xF3, 0x0F, 0x10, 0x50, 0x04, 0xF3, 0x0F, 0x5A, 0xD2]
        );
    }

    #[test]
    fn test_movsd_extended() {
        let mut a = asm();
        a.movsd_load(Xmm::Xmm8, Mem::new(Gpr::Rdi, 0));
        assert_eq!(a.code(), &[0xF2, 0x44, 0x0F, 0x10, 0x07]);
    }

    // -------------------------------------------------------------------------
    // Arithmetic Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_lea() {
        let mut a = asm();
        a.lea(Gpr::Rcx, Mem::new(Gpr::Rsp, 0x20));
        assert_eq!(a.code(), &[0x48, 0x8D, 0x4C, 0x24, 0x20]);
    }

    #[test]
    fn test_add_imm() {
        let mut a = asm();
        a.add_imm(Gpr::Rax, 8);
        assert_eq!(a.code(), &[0x48, 0x83, 0xC0, 0x08]);

        let mut a = asm();
        a.add_imm(Gpr::Rax, 0x1000);
        assert_eq!(a.code(), &[0x48, 0x81, 0xC0, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_inc_dec() {
        let mut a = asm();
        a.incq(Mem::new(Gpr::Rax, 0));
        assert_eq!(a.code(), &[0x48, 0xFF, 0x00]);

        let mut a = asm();
        a.decq(Mem::new(Gpr::Rdi, 0));
        assert_eq!(a.code(), &[0x48, 0xFF, 0x0F]);

        let mut a = asm();
        a.incl(Mem::new(Gpr::Rax, 4));
        assert_eq!(a.code(), &[0xFF, 0x40, 0x04]);
    }

    #[test]
    fn test_inc_abs() {
        let mut a = asm();
        a.incl_abs(0x1234);
        assert_eq!(a.code(), &[0xFF, 0x04, 0x25, 0x34, 0x12, 0x00, 0x00]);

        let mut a = asm();
        a.incq_abs(0x1234);
        assert_eq!(a.code(), &[0x48, 0xFF, 0x04, 0x25, 0x34, 0x12, 0x00, 0x00]);
    }

    // -------------------------------------------------------------------------
    // Compare Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_cmp_rr() {
        let mut a = asm();
        a.cmp_rr(Gpr::Rax, Gpr::Rcx);
        assert_eq!(a.code(), &[0x48, 0x39, 0xC8]);
    }

    #[test]
    fn test_cmp_imm() {
        let mut a = asm();
        a.cmp_imm(Gpr::Rax, 5);
        assert_eq!(a.code(), &[0x48, 0x83, 0xF8, 0x05]);
    }

    #[test]
    fn test_cmp_mem_imm() {
        let mut a = asm();
        a.cmp_mem_imm(Mem::new(Gpr::Rdi, 8), 0x100);
        assert_eq!(a.code(), &[0x48, 0x81, 0x7F, 0x08, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_cmp_mem_reg() {
        let mut a = asm();
        a.cmp_mem_reg(Mem::new(Gpr::Rdi, 16), Gpr::R11);
        assert_eq!(a.code(), &[0x4C, 0x39, 0x5F, 0x10]);
    }

    #[test]
    fn test_test_rr() {
        let mut a = asm();
        a.test_rr(Gpr::Rdi, Gpr::Rdi);
        assert_eq!(a.code(), &[0x48, 0x85, 0xFF]);
    }

    #[test]
    fn test_setcc() {
        let mut a = asm();
        a.setcc(Cond::Equal, Gpr::Rax);
        assert_eq!(a.code(), &[0x0F, 0x94, 0xC0]);

        let mut a = asm();
        a.setcc(Cond::NOT_ZERO, Gpr::Rcx);
        assert_eq!(a.code(), &[0x0F, 0x95, 0xC1]);
    }

    #[test]
    #[should_panic]
    fn test_setcc_rejects_high_regs() {
        let mut a = asm();
        a.setcc(Cond::Equal, Gpr::Rsi);
    }

    // -------------------------------------------------------------------------
    // Call / Jump Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_call_rel() {
        let mut a = asm();
        a.call_rel(0x10);
        assert_eq!(a.code(), &[0xE8, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_call_indirect() {
        let mut a = asm();
        a.call_reg(Gpr::R11);
        assert_eq!(a.code(), &[0x41, 0xFF, 0xD3]);

        let mut a = asm();
        a.call_mem(Mem::new(Gpr::Rax, 24));
        assert_eq!(a.code(), &[0xFF, 0x50, 0x18]);
    }

    #[test]
    fn test_jmp_short_and_long() {
        let mut a = asm();
        a.jmp(JumpDest::from_start(0x10));
        assert_eq!(a.code(), &[0xEB, 0x0E]);

        let mut a = asm();
        a.jmp(JumpDest::from_start(0xF0));
        assert_eq!(a.code(), &[0xE9, 0xEB, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_jcc_short_backward() {
        let mut a = asm();
        a.nops(0x10);
        a.jcc(Cond::NotEqual, JumpDest::from_start(0));
        assert_eq!(&a.code()[0x10..], &[0x75, 0xEE]);
    }

    #[test]
    fn test_jcc_long() {
        let mut a = Assembler::new(512);
        a.jcc(Cond::NotEqual, JumpDest::from_start(0x100));
        assert_eq!(a.code(), &[0x0F, 0x85, 0xFA, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_forward_jump() {
        let mut a = asm();
        a.test_rr(Gpr::Rdi, Gpr::Rdi);
        let j = a.forward_jcc(Cond::NOT_ZERO);
        a.mov_load(Gpr::Rax, Mem::new(Gpr::Rdi, 8));
        a.patch_jump(j);
        // jnz skips the 4-byte load
        assert_eq!(a.code()[3..5], [0x75, 0x04]);
    }

    // -------------------------------------------------------------------------
    // Capacity Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_overflow_sets_failed() {
        let mut a = Assembler::new(4);
        a.mov_rr(Gpr::Rax, Gpr::Rdi); // 3 bytes
        assert!(!a.has_failed());
        a.mov_rr(Gpr::Rcx, Gpr::Rdx); // would exceed
        assert!(a.has_failed());
        // Nothing further is emitted once failed.
        assert_eq!(a.bytes_written(), 3);
    }

    #[test]
    fn test_fill_with_nops() {
        let mut a = Assembler::new(8);
        a.mov_rr(Gpr::Rax, Gpr::Rdi);
        a.fill_with_nops();
        assert_eq!(a.bytes_written(), 8);
        assert_eq!(&a.code()[3..], &[0x90; 5]);
    }

    // -------------------------------------------------------------------------
    // Batch Spill Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_batch_push_pop() {
        let regs = [GenericReg::Gp(Gpr::Rax), GenericReg::Xmm(Xmm::Xmm1)];
        let mut a = asm();
        a.emit_batch_push(-0x40, &regs);
        let push_len = a.bytes_written();
        a.emit_batch_pop(-0x40, &regs);
        assert_eq!(a.bytes_written(), 2 * push_len);
        // mov [rbp-0x40], rax
        assert_eq!(&a.code()[..4], &[0x48, 0x89, 0x45, 0xC0]);
        // movsd [rbp-0x38], xmm1
        assert_eq!(&a.code()[4..9], &[0xF2, 0x0F, 0x11, 0x4D, 0xC8]);
    }
}
