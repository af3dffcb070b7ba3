//! A minimal x86-64 machine code encoder.
//!
//! Only the handful of forms the translator actually needs: push/pop,
//! register-to-register and immediate-to-register `mov`, an indirect
//! `call`, `test`, a conditional jump used for early-exit, and `ret`. This
//! is intentionally not a general-purpose assembler — there is no operand
//! matching or instruction selection, just one emitter per shape the
//! translator's body generator calls.

/// x86-64 general-purpose register, numbered per its 4-bit encoding
/// (`REX.B`/`REX.R` supply the fifth bit for R8-R15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R12 = 12,
}

impl Reg {
    #[inline]
    fn low3(self) -> u8 {
        (self as u8) & 0x7
    }
    #[inline]
    fn extended(self) -> bool {
        (self as u8) >= 8
    }
}

fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// Accumulates emitted bytes for one block's native code.
pub struct CodeBuffer {
    buf: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        CodeBuffer { buf: Vec::with_capacity(256) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// `push r64`.
    pub fn push_reg(&mut self, reg: Reg) {
        if reg.extended() {
            self.buf.push(0x41);
        }
        self.buf.push(0x50 + reg.low3());
    }

    /// `pop r64`.
    pub fn pop_reg(&mut self, reg: Reg) {
        if reg.extended() {
            self.buf.push(0x41);
        }
        self.buf.push(0x58 + reg.low3());
    }

    /// `mov r64, imm64`.
    pub fn mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        let rex = 0x48 | if reg.extended() { 0x01 } else { 0x00 };
        self.buf.push(rex);
        self.buf.push(0xB8 + reg.low3());
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov dst, src` (64-bit register-to-register).
    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        let rex = 0x48
            | if src.extended() { 0x04 } else { 0x00 }
            | if dst.extended() { 0x01 } else { 0x00 };
        self.buf.push(rex);
        self.buf.push(0x89);
        self.buf.push(modrm(0b11, src.low3(), dst.low3()));
    }

    /// `call r/m64` (indirect call through a register).
    pub fn call_reg(&mut self, reg: Reg) {
        if reg.extended() {
            self.buf.push(0x41);
        }
        self.buf.push(0xFF);
        self.buf.push(modrm(0b11, 2, reg.low3()));
    }

    /// `test eax, eax`.
    pub fn test_eax_eax(&mut self) {
        self.buf.push(0x85);
        self.buf.push(0xC0);
    }

    /// `mov eax, imm32` (zero-extends into rax).
    pub fn mov_eax_imm32(&mut self, val: u32) {
        self.buf.push(0xB8);
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    /// `jnz rel32`, emitted with a zero placeholder displacement. Returns
    /// the buffer offset of the 4-byte displacement field so the caller can
    /// patch it once the target offset is known.
    pub fn jnz_rel32_placeholder(&mut self) -> usize {
        self.buf.push(0x0F);
        self.buf.push(0x85);
        let at = self.buf.len();
        self.buf.extend_from_slice(&0i32.to_le_bytes());
        at
    }

    /// Overwrite the 4-byte displacement at `at` (as returned by
    /// [`Self::jnz_rel32_placeholder`]) so the jump lands at `target_offset`
    /// within this same buffer.
    pub fn patch_rel32(&mut self, at: usize, target_offset: usize) {
        let rel = target_offset as i64 - (at as i64 + 4);
        self.buf[at..at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.buf.push(0xC3);
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite the 6-byte tail this module always emits for a block's normal
/// exit path (`mov eax, 0` + `ret`, 5+1 bytes) into a 5-byte `jmp rel32`
/// plus a 1-byte `nop` padding, so the total length — and therefore every
/// other offset in the block — is unchanged. `rel32` is relative to the
/// byte immediately after the `jmp`, per the x86 encoding.
///
/// # Safety
/// `code` must point at writable, at-least-6-byte memory belonging to a
/// block that is not concurrently executing.
pub unsafe fn patch_tail_to_jmp(code: *mut u8, rel32: i32) {
    unsafe {
        *code = 0xE9;
        let bytes = rel32.to_le_bytes();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), code.add(1), 4);
        *code.add(5) = 0x90;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_reg_imm64_encodes_rex_w_and_opcode() {
        let mut buf = CodeBuffer::new();
        buf.mov_reg_imm64(Reg::Rdi, 0x1122_3344_5566_7788);
        let code = buf.finish();
        assert_eq!(code[0], 0x48);
        assert_eq!(code[1], 0xB8 + 7); // Rdi low3 == 7
        assert_eq!(&code[2..10], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn push_pop_round_trip_extended_reg() {
        let mut buf = CodeBuffer::new();
        buf.push_reg(Reg::R12);
        buf.pop_reg(Reg::R12);
        let code = buf.finish();
        assert_eq!(code, vec![0x41, 0x50 + 4, 0x41, 0x58 + 4]);
    }

    #[test]
    fn jnz_patch_computes_forward_displacement() {
        let mut buf = CodeBuffer::new();
        let at = buf.jnz_rel32_placeholder();
        buf.ret();
        buf.ret();
        let target = buf.len();
        buf.patch_rel32(at, target);
        let code = buf.finish();
        let rel = i32::from_le_bytes(code[at..at + 4].try_into().unwrap());
        assert_eq!(at as i64 + 4 + rel as i64, target as i64);
    }
}
