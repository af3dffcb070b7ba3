//! Instruction interpreter: straight-line execution of one [`DecodedInst`]
//! against a [`CpuState`] and [`AddressSpace`].
//!
//! [`step`] is the entry point the dispatcher (and the JIT's fallback path)
//! calls for each instruction. It dispatches on [`Mnemonic`] to the handler
//! in the matching sub-module; each handler advances `RIP` itself so that
//! control-flow instructions can set it to something other than
//! `addr + length`.

mod arith;
mod control;
mod data;
mod fpu;
mod logic;
mod setcc;
mod sse;
mod stack;
mod string;
mod system;

use crate::cpu::CpuState;
use crate::error::{GuestTrap, Result};
use crate::flags::OperandSize;
use crate::instruction::{DecodedInst, MemOperand, Mnemonic, Operand};
use crate::mmu::AddressSpace;

/// Execute one decoded instruction, mutating `cpu` and (via `mmu`) guest
/// memory. Returns `Ok(())` having advanced `RIP` past the instruction, or
/// `Err(trap)` if the instruction could not complete — `RIP` is left
/// pointing at the faulting instruction in that case so a restart/signal
/// delivery can re-decode it.
pub fn step(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    use Mnemonic::*;
    let fallthrough = inst.addr.wrapping_add(inst.length as u64);

    match inst.op {
        Add | Adc | Sub | Sbb | Cmp | Inc | Dec | Neg | Mul | Imul | Div | Idiv | Xadd => {
            arith::exec(cpu, mmu, inst)?
        }
        And | Or | Xor | Not | Test | Shl | Shr | Sar | Rol | Ror => logic::exec(cpu, mmu, inst)?,
        Mov | Movzx | Movsx | Lea | Xchg | Cmpxchg | CmpxchgDouble => data::exec(cpu, mmu, inst)?,
        Push | Pop => stack::exec(cpu, mmu, inst)?,
        Jmp | JmpIndirect | Jcc(_) | Call | CallIndirect | Ret => {
            control::exec(cpu, mmu, inst)?;
            cpu.instret += 1;
            return Ok(());
        }
        Setcc(_) | Cmovcc(_) => setcc::exec(cpu, mmu, inst)?,
        // String ops loop internally and account for each iteration in
        // `cpu.instret` themselves; don't double-count here.
        MovsString | StosString | ScasString | CmpsString | LodsString => {
            string::exec(cpu, mmu, inst, fallthrough)?;
            return Ok(());
        }
        Syscall => return Err(GuestTrap::Syscall),
        Cpuid | Rdtsc | ArchPrctlMarker => system::exec(cpu, inst)?,
        Nop => {}
        Hlt => return Err(GuestTrap::Halted),
        MovScalarSse | MovApsSse | AddScalarSse | SubScalarSse | MulScalarSse | DivScalarSse
        | CvtSse => sse::exec(cpu, mmu, inst)?,
        Fld | Fst | Fstp | Fadd | Fsub | Fmul | Fdiv | Fld1 | Fldz | Fxch => {
            fpu::exec(cpu, mmu, inst)?
        }
    }

    cpu.instret += 1;
    cpu.gpr.rip = fallthrough;
    Ok(())
}

// ── Operand access shared by every handler ──

pub(crate) fn effective_address(cpu: &CpuState, mem: &MemOperand, inst: &DecodedInst) -> u64 {
    let mut addr: u64 = 0;
    if mem.rip_relative {
        addr = inst.addr.wrapping_add(inst.length as u64);
    } else if let Some(base) = mem.base {
        addr = addr.wrapping_add(cpu.gpr.read_gpr64(base));
    }
    if let Some(index) = mem.index {
        addr = addr.wrapping_add(cpu.gpr.read_gpr64(index).wrapping_mul(mem.scale as u64));
    }
    addr = addr.wrapping_add(mem.displacement as u64);
    match inst.prefix.seg_override {
        Some(crate::instruction::SegOverride::Fs) => addr.wrapping_add(cpu.gpr.fs_base),
        Some(crate::instruction::SegOverride::Gs) => addr.wrapping_add(cpu.gpr.gs_base),
        None => addr,
    }
}

pub(crate) fn read_mem(mmu: &AddressSpace, addr: u64, width: OperandSize) -> Result<u64> {
    match width {
        OperandSize::Byte => mmu.read8(addr).map(|v| v as u64),
        OperandSize::Word => mmu.read16(addr).map(|v| v as u64),
        OperandSize::Dword => mmu.read32(addr).map(|v| v as u64),
        OperandSize::Qword => mmu.read64(addr),
    }
}

pub(crate) fn write_mem(mmu: &AddressSpace, addr: u64, width: OperandSize, val: u64) -> Result<()> {
    match width {
        OperandSize::Byte => mmu.write8(addr, val as u8),
        OperandSize::Word => mmu.write16(addr, val as u16),
        OperandSize::Dword => mmu.write32(addr, val as u32),
        OperandSize::Qword => mmu.write64(addr, val),
    }
}

/// Read an operand's value. `width` is normally `inst.operand_size`, but
/// callers pass an explicit width for instructions whose operands differ in
/// size from the instruction's nominal size (e.g. `MOVZX`).
pub(crate) fn read_operand(
    cpu: &CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    op: &Operand,
    width: OperandSize,
) -> Result<u64> {
    match *op {
        Operand::Gpr(r, _) => Ok(cpu.gpr.read_gpr(r, width, inst.prefix.has_rex())),
        Operand::Memory(mem) => read_mem(mmu, effective_address(cpu, &mem, inst), width),
        Operand::Immediate(v) => Ok(v),
        Operand::RelativeTarget(v) => Ok(v),
        Operand::Xmm(_) | Operand::St(_) | Operand::None => {
            unreachable!("not a scalar GPR/memory operand")
        }
    }
}

pub(crate) fn write_operand(
    cpu: &mut CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    op: &Operand,
    width: OperandSize,
    val: u64,
) -> Result<()> {
    match *op {
        Operand::Gpr(r, _) => {
            cpu.gpr.write_gpr(r, width, inst.prefix.has_rex(), val);
            Ok(())
        }
        Operand::Memory(mem) => write_mem(mmu, effective_address(cpu, &mem, inst), width, val),
        _ => unreachable!("not a writable operand"),
    }
}

/// Sign-extend `val`, which occupies the low `width` bits, to a full `u64`.
pub(crate) fn sign_extend(val: u64, width: OperandSize) -> u64 {
    let bits = width.bits();
    if bits == 64 {
        return val;
    }
    let shift = 64 - bits;
    (((val << shift) as i64) >> shift) as u64
}
