//! Adapts `iced-x86` to [`emu_core::disasm::Disassembler`].
//!
//! `emu-core` deliberately treats opcode-map resolution as out of scope
//! (see its module doc) and programs against the trait instead of a
//! concrete decoder. This is that decoder: it walks a byte slice with
//! `iced_x86::Decoder` in 64-bit mode and narrows each `iced_x86::Instruction`
//! down to the flat [`Mnemonic`] set the interpreter/JIT actually execute.
//!
//! Coverage is deliberately the subset a glibc/musl-linked, non-PIE-or-PIE
//! static/dynamic x86-64 program actually emits for integer, control-flow,
//! string, scalar-SSE, and basic x87 code — legacy encodings long mode
//! doesn't have (AH/BH/CH/DH, far calls, BCD, MMX) decode to `None`, which
//! the interpreter turns into `GuestTrap::UndefinedOpcode`, same as real
//! hardware executing something it genuinely does not support.

use emu_core::disasm::{DisasmBatch, Disassembler};
use emu_core::flags::OperandSize;
use emu_core::instruction::{DecodedInst, MemOperand, Mnemonic, Operand, PrefixState, SegOverride};
use iced_x86::{ConditionCode, Decoder, DecoderOptions, Instruction, MemorySize, Register};

pub struct IcedDisassembler;

impl Disassembler for IcedDisassembler {
    fn disassemble_range(&self, bytes: &[u8], addr: u64, max_instructions: Option<usize>) -> DisasmBatch {
        let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        let limit = max_instructions.unwrap_or(usize::MAX);
        let mut insn = Instruction::default();
        while decoder.can_decode() && instructions.len() < limit {
            decoder.decode_out(&mut insn);
            if insn.is_invalid() {
                break;
            }
            match convert(&insn) {
                Some(decoded) => instructions.push(decoded),
                None => break,
            }
        }
        let consumed = decoder.position();
        DisasmBatch { instructions, consumed, next_addr: addr + consumed as u64 }
    }
}

/// `iced_x86::Register` encodes width distinctly (`Eax` vs `Rax`); our
/// model only cares about the architectural index, with width carried
/// separately on the instruction. Returns `None` for the AH/BH/CH/DH
/// legacy high-byte registers, which alias a GPR index only in the
/// absence of a REX prefix and this model has no representation for.
fn gpr_index(reg: Register) -> Option<u8> {
    use Register::*;
    Some(match reg {
        RAX | EAX | AX | AL => 0,
        RCX | ECX | CX | CL => 1,
        RDX | EDX | DX | DL => 2,
        RBX | EBX | BX | BL => 3,
        RSP | ESP | SP | SPL => 4,
        RBP | EBP | BP | BPL => 5,
        RSI | ESI | SI | SIL => 6,
        RDI | EDI | DI | DIL => 7,
        R8 | R8D | R8W | R8L => 8,
        R9 | R9D | R9W | R9L => 9,
        R10 | R10D | R10W | R10L => 10,
        R11 | R11D | R11W | R11L => 11,
        R12 | R12D | R12W | R12L => 12,
        R13 | R13D | R13W | R13L => 13,
        R14 | R14D | R14W | R14L => 14,
        R15 | R15D | R15W | R15L => 15,
        AH | BH | CH | DH => return None,
        _ => return None,
    })
}

fn xmm_index(reg: Register) -> Option<u8> {
    let n = reg as u32;
    if (Register::XMM0 as u32..=Register::XMM15 as u32).contains(&n) {
        Some((n - Register::XMM0 as u32) as u8)
    } else {
        None
    }
}

fn operand_size_of(reg: Register) -> OperandSize {
    use Register::*;
    match reg {
        AL | CL | DL | BL | SPL | BPL | SIL | DIL | AH | BH | CH | DH | R8L | R9L | R10L | R11L | R12L | R13L
        | R14L | R15L => OperandSize::Byte,
        AX | CX | DX | BX | SP | BP | SI | DI | R8W | R9W | R10W | R11W | R12W | R13W | R14W | R15W => {
            OperandSize::Word
        }
        EAX | ECX | EDX | EBX | ESP | EBP | ESI | EDI | R8D | R9D | R10D | R11D | R12D | R13D | R14D | R15D => {
            OperandSize::Dword
        }
        _ => OperandSize::Qword,
    }
}

fn mem_operand(insn: &Instruction) -> Operand {
    let base = gpr_index(insn.memory_base());
    let index = gpr_index(insn.memory_index());
    let scale = if index.is_some() { insn.memory_index_scale() as u8 } else { 1 };
    let size = match insn.memory_size() {
        MemorySize::UInt8 | MemorySize::Int8 => OperandSize::Byte,
        MemorySize::UInt16 | MemorySize::Int16 => OperandSize::Word,
        MemorySize::UInt32 | MemorySize::Int32 | MemorySize::Float32 => OperandSize::Dword,
        _ => OperandSize::Qword,
    };
    Operand::Memory(MemOperand {
        base,
        index,
        scale,
        displacement: insn.memory_displacement64() as i64,
        size,
        rip_relative: insn.is_ip_rel_memory_operand(),
    })
}

fn reg_operand(reg: Register) -> Operand {
    if let Some(x) = xmm_index(reg) {
        return Operand::Xmm(x);
    }
    match gpr_index(reg) {
        Some(g) => Operand::Gpr(g, operand_size_of(reg)),
        None => Operand::None,
    }
}

fn operand_n(insn: &Instruction, n: u32) -> Operand {
    use iced_x86::OpKind;
    match insn.op_kind(n) {
        OpKind::Register => reg_operand(insn.op_register(n)),
        OpKind::Memory => mem_operand(insn),
        OpKind::Immediate8 => Operand::Immediate(insn.immediate8() as u64),
        OpKind::Immediate16 => Operand::Immediate(insn.immediate16() as u64),
        OpKind::Immediate32 => Operand::Immediate(insn.immediate32() as u64),
        OpKind::Immediate64 => Operand::Immediate(insn.immediate64()),
        OpKind::Immediate8to16 => Operand::Immediate(insn.immediate8to16() as u16 as u64),
        OpKind::Immediate8to32 => Operand::Immediate(insn.immediate8to32() as u32 as u64),
        OpKind::Immediate8to64 => Operand::Immediate(insn.immediate8to64() as u64),
        OpKind::Immediate32to64 => Operand::Immediate(insn.immediate32to64() as u64),
        OpKind::NearBranch16 => Operand::RelativeTarget(insn.near_branch16() as u64),
        OpKind::NearBranch32 => Operand::RelativeTarget(insn.near_branch32() as u64),
        OpKind::NearBranch64 => Operand::RelativeTarget(insn.near_branch64()),
        _ => Operand::None,
    }
}

fn cc_of(insn: &Instruction) -> Option<u8> {
    match insn.condition_code() {
        ConditionCode::None => None,
        cc => Some(cc as u8 - 1),
    }
}

fn seg_override(insn: &Instruction) -> Option<SegOverride> {
    match insn.segment_prefix() {
        Register::FS => Some(SegOverride::Fs),
        Register::GS => Some(SegOverride::Gs),
        _ => None,
    }
}

fn convert(insn: &Instruction) -> Option<DecodedInst> {
    use iced_x86::Mnemonic as M;

    let op = match insn.mnemonic() {
        M::Mov | M::Movabs => Mnemonic::Mov,
        M::Movzx => Mnemonic::Movzx,
        M::Movsx | M::Movsxd => Mnemonic::Movsx,
        M::Lea => Mnemonic::Lea,
        M::Push => Mnemonic::Push,
        M::Pop => Mnemonic::Pop,
        M::Xchg => Mnemonic::Xchg,
        M::Cmpxchg => Mnemonic::Cmpxchg,
        M::Cmpxchg8b | M::Cmpxchg16b => Mnemonic::CmpxchgDouble,
        M::Xadd => Mnemonic::Xadd,
        M::Add => Mnemonic::Add,
        M::Adc => Mnemonic::Adc,
        M::Sub => Mnemonic::Sub,
        M::Sbb => Mnemonic::Sbb,
        M::Cmp => Mnemonic::Cmp,
        M::Inc => Mnemonic::Inc,
        M::Dec => Mnemonic::Dec,
        M::Neg => Mnemonic::Neg,
        M::And => Mnemonic::And,
        M::Or => Mnemonic::Or,
        M::Xor => Mnemonic::Xor,
        M::Not => Mnemonic::Not,
        M::Test => Mnemonic::Test,
        M::Shl | M::Sal => Mnemonic::Shl,
        M::Shr => Mnemonic::Shr,
        M::Sar => Mnemonic::Sar,
        M::Rol => Mnemonic::Rol,
        M::Ror => Mnemonic::Ror,
        M::Mul => Mnemonic::Mul,
        M::Imul => Mnemonic::Imul,
        M::Div => Mnemonic::Div,
        M::Idiv => Mnemonic::Idiv,
        M::Jmp => {
            if insn.op0_kind() == iced_x86::OpKind::Memory || insn.op0_register() != Register::None {
                Mnemonic::JmpIndirect
            } else {
                Mnemonic::Jmp
            }
        }
        M::Call => {
            if insn.op0_kind() == iced_x86::OpKind::Memory || insn.op0_register() != Register::None {
                Mnemonic::CallIndirect
            } else {
                Mnemonic::Call
            }
        }
        M::Ret | M::Retf => Mnemonic::Ret,
        M::Nop | M::Nopw | M::Nopd | M::Nopq => Mnemonic::Nop,
        M::Hlt => Mnemonic::Hlt,
        M::Syscall => Mnemonic::Syscall,
        M::Cpuid => Mnemonic::Cpuid,
        M::Rdtsc => Mnemonic::Rdtsc,
        M::Movsb | M::Movsw | M::Movsd | M::Movsq if insn.op_count() == 0 => Mnemonic::MovsString,
        M::Stosb | M::Stosw | M::Stosd | M::Stosq => Mnemonic::StosString,
        M::Scasb | M::Scasw | M::Scasd | M::Scasq => Mnemonic::ScasString,
        M::Cmpsb | M::Cmpsw | M::Cmpsd | M::Cmpsq if insn.op_count() == 0 => Mnemonic::CmpsString,
        M::Lodsb | M::Lodsw | M::Lodsd | M::Lodsq => Mnemonic::LodsString,
        // `movsd` the SSE2 scalar-double move and `movsd` the string-move
        // share a mnemonic name; the `Movsd`/`Cmpsd` string-op arms above
        // only match when `op_count() == 0`, so reaching this unguarded
        // arm for the same discriminant means it wasn't the string form.
        M::Movss | M::Movsd => Mnemonic::MovScalarSse,
        M::Movaps | M::Movapd | M::Movups | M::Movupd => Mnemonic::MovApsSse,
        M::Addss | M::Addsd => Mnemonic::AddScalarSse,
        M::Subss | M::Subsd => Mnemonic::SubScalarSse,
        M::Mulss | M::Mulsd => Mnemonic::MulScalarSse,
        M::Divss | M::Divsd => Mnemonic::DivScalarSse,
        M::Cvtsi2sd
        | M::Cvtsi2ss
        | M::Cvttsd2si
        | M::Cvttss2si
        | M::Cvtsd2si
        | M::Cvtss2si
        | M::Cvtsd2ss
        | M::Cvtss2sd => Mnemonic::CvtSse,
        M::Fld => Mnemonic::Fld,
        M::Fst => Mnemonic::Fst,
        M::Fstp => Mnemonic::Fstp,
        M::Fadd | M::Faddp => Mnemonic::Fadd,
        M::Fsub | M::Fsubp => Mnemonic::Fsub,
        M::Fmul | M::Fmulp => Mnemonic::Fmul,
        M::Fdiv | M::Fdivp => Mnemonic::Fdiv,
        M::Fld1 => Mnemonic::Fld1,
        M::Fldz => Mnemonic::Fldz,
        M::Fxch => Mnemonic::Fxch,
        _ if insn.condition_code() != ConditionCode::None => {
            let cc = cc_of(insn)?;
            match insn.flow_control() {
                iced_x86::FlowControl::ConditionalBranch => Mnemonic::Jcc(cc),
                _ if insn.op_count() == 1 => Mnemonic::Setcc(cc),
                _ => Mnemonic::Cmovcc(cc),
            }
        }
        _ => return None,
    };

    let mut operands = [Operand::None; 3];
    let count = insn.op_count().min(3);
    for i in 0..count {
        operands[i as usize] = operand_n(insn, i);
    }

    let width = width_of(insn);

    Some(DecodedInst {
        length: insn.len() as u8,
        op,
        operand_size: width,
        // 0x67 (address-size override) is vanishingly rare in real Linux
        // x86-64 userspace code; unsupported here, matching the decoded
        // contract's long-mode-only stance on 16-bit address size.
        address_size: OperandSize::Qword,
        operands,
        operand_count: count as u8,
        prefix: PrefixState {
            seg_override: seg_override(insn),
            operand_size_override: width == OperandSize::Word,
            address_size_override: false,
            lock: insn.has_lock_prefix(),
            // Only consumed by `RegisterFile::read_gpr8`/`write_gpr8` to
            // pick SPL/BPL/SIL/DIL over AH/BH/CH/DH for a byte-width
            // register index in 4..=7 — `gpr_index` above already refuses
            // to resolve AH/BH/CH/DH, so whenever that case is reachable
            // here it is necessarily the REX form.
            rex: 0x40,
            rep: rep_of(insn),
        },
        addr: insn.ip(),
    })
}

/// Scalar float width for the scalar-SSE mnemonic families (MOVSS/MOVSD,
/// the scalar ADD/SUB/MUL/DIV, and the CVT family): `Dword` for the
/// single-precision (`*SS`) form, `Qword` for double-precision (`*SD`).
/// `crate::interpreter::sse` keys its `scalar_lane`/`with_scalar_lane`
/// width entirely off `inst.operand_size`, so this has to come from the
/// mnemonic itself — an XMM register operand carries no width of its own
/// the way a GPR does. `Movsd` is ambiguous with the string-move mnemonic
/// of the same name; callers only reach this for the scalar form (string
/// `movsd` has `op_count() == 0` and is filtered out in `convert` before
/// `width_of` ever runs on it).
fn sse_scalar_width(insn: &Instruction) -> Option<OperandSize> {
    use iced_x86::Mnemonic as M;
    match insn.mnemonic() {
        M::Movss | M::Addss | M::Subss | M::Mulss | M::Divss | M::Cvtsi2ss | M::Cvttss2si | M::Cvtss2si
        | M::Cvtsd2ss => Some(OperandSize::Dword),
        M::Movsd | M::Addsd | M::Subsd | M::Mulsd | M::Divsd | M::Cvtsi2sd | M::Cvttsd2si | M::Cvtsd2si
        | M::Cvtss2sd => Some(OperandSize::Qword),
        _ => None,
    }
}

fn width_of(insn: &Instruction) -> OperandSize {
    use iced_x86::OpKind;
    if let Some(width) = sse_scalar_width(insn) {
        return width;
    }
    for i in 0..insn.op_count() {
        if insn.op_kind(i) == OpKind::Register {
            return operand_size_of(insn.op_register(i));
        }
    }
    match insn.memory_size().size() {
        1 => OperandSize::Byte,
        2 => OperandSize::Word,
        4 => OperandSize::Dword,
        _ => OperandSize::Qword,
    }
}

fn rep_of(insn: &Instruction) -> emu_core::instruction::RepPrefix {
    use emu_core::instruction::RepPrefix;
    if insn.has_repne_prefix() {
        RepPrefix::Repne
    } else if insn.has_rep_prefix() {
        RepPrefix::Rep
    } else {
        RepPrefix::None
    }
}
