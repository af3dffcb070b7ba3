//! Decoded x86-64 instruction representation.
//!
//! This is the contract the disassembler collaborator (`emu_disasm`, or any
//! other implementation of [`crate::disasm::Disassembler`]) produces and the
//! interpreter/JIT consume. Long mode only: no far pointers, no control/debug
//! register operands, no 16-bit address size.

use crate::flags::OperandSize;

/// Segment override prefix. In long mode only FS/GS carry a nonzero base,
/// so this is the only segment state the decoder needs to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegOverride {
    Fs,
    Gs,
}

/// An x86-64 instruction fully decoded from its byte encoding.
#[derive(Debug, Clone)]
pub struct DecodedInst {
    /// Length of the encoded instruction in bytes (1-15).
    pub length: u8,
    /// Mnemonic / operation identifier.
    pub op: Mnemonic,
    /// Operand size (determined by mode + prefixes + REX.W).
    pub operand_size: OperandSize,
    /// Address size for memory operands (always Qword in long mode unless
    /// the rare 0x67 prefix is present, in which case Dword).
    pub address_size: OperandSize,
    /// Decoded operands (up to 3 for x86).
    pub operands: [Operand; 3],
    /// Number of valid operands.
    pub operand_count: u8,
    /// Prefix state (segment override, size overrides, LOCK, REX, REP).
    pub prefix: PrefixState,
    /// Guest virtual address this instruction was fetched from.
    pub addr: u64,
}

impl DecodedInst {
    pub fn operands(&self) -> &[Operand] {
        &self.operands[..self.operand_count as usize]
    }
}

/// Decoded prefix state.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixState {
    /// Segment override (None = flat addressing, no FS/GS base added).
    pub seg_override: Option<SegOverride>,
    /// Operand-size override (0x66 prefix).
    pub operand_size_override: bool,
    /// Address-size override (0x67 prefix).
    pub address_size_override: bool,
    /// LOCK prefix (0xF0) — the interpreter/JIT must execute the RMW
    /// atomically with respect to other emulated threads.
    pub lock: bool,
    /// REX prefix byte (0 if absent). Bits: [3]=W [2]=R [1]=X [0]=B.
    pub rex: u8,
    /// REP/REPE/REPNE prefix, meaningful for string instructions.
    pub rep: RepPrefix,
}

impl PrefixState {
    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }
    #[inline]
    pub fn rex_r(&self) -> bool {
        self.rex & 0x04 != 0
    }
    #[inline]
    pub fn rex_x(&self) -> bool {
        self.rex & 0x02 != 0
    }
    #[inline]
    pub fn rex_b(&self) -> bool {
        self.rex & 0x01 != 0
    }
    #[inline]
    pub fn has_rex(&self) -> bool {
        self.rex != 0
    }
}

/// REP prefix type for string operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepPrefix {
    #[default]
    None,
    /// REP/REPE (0xF3) — for SCAS/CMPS, loop while ZF=1.
    Rep,
    /// REPNE (0xF2) — for SCAS/CMPS, loop while ZF=0.
    Repne,
}

/// An instruction operand.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    None,
    /// General-purpose register, already REX-extended (0-15), plus the
    /// width the decoder resolved it at (`AL`/`AX`/`EAX`/`RAX` all carry
    /// GPR index 0 but a different width here).
    Gpr(u8, OperandSize),
    /// XMM register (0-15).
    Xmm(u8),
    /// x87 register ST(i).
    St(u8),
    /// Memory operand (address from ModR/M + SIB + displacement).
    Memory(MemOperand),
    /// Immediate value (zero- or sign-extended into a u64 by the decoder
    /// per the instruction's documented semantics).
    Immediate(u64),
    /// Relative branch target, already resolved to an absolute guest
    /// address (`addr + length + rel32`).
    RelativeTarget(u64),
}

/// Memory operand (effective address components, pre-segment-base).
#[derive(Debug, Clone, Copy)]
pub struct MemOperand {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub displacement: i64,
    pub size: OperandSize,
    /// RIP-relative addressing.
    pub rip_relative: bool,
}

/// Instruction mnemonics the interpreter/JIT know how to execute.
///
/// This is intentionally a flat enum rather than a (map, opcode) pair: the
/// disassembler collaborator is responsible for opcode-map resolution and
/// hands the core an already-named operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Mov,
    Movzx,
    Movsx,
    Lea,
    Push,
    Pop,
    Xchg,
    Cmpxchg,
    CmpxchgDouble,
    Xadd,
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    Inc,
    Dec,
    Neg,
    And,
    Or,
    Xor,
    Not,
    Test,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Mul,
    Imul,
    Div,
    Idiv,
    Jmp,
    JmpIndirect,
    Jcc(u8),
    Call,
    CallIndirect,
    Ret,
    Setcc(u8),
    Cmovcc(u8),
    Nop,
    Hlt,
    Syscall,
    Cpuid,
    Rdtsc,
    MovsString,
    StosString,
    ScasString,
    CmpsString,
    LodsString,
    MovScalarSse,
    MovApsSse,
    AddScalarSse,
    SubScalarSse,
    MulScalarSse,
    DivScalarSse,
    CvtSse,
    Fld,
    Fst,
    Fstp,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fld1,
    Fldz,
    Fxch,
    ArchPrctlMarker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_rex_bits() {
        let p = PrefixState { rex: 0b1111, ..Default::default() };
        assert!(p.rex_w() && p.rex_r() && p.rex_x() && p.rex_b());
    }
}
