//! JMP/Jcc/CALL/RET, direct and indirect.
//!
//! Handlers here set `RIP` directly rather than returning a fallthrough
//! value to the caller, since a taken branch's next address has nothing to
//! do with `addr + length`.

use super::read_operand;
use crate::cpu::CpuState;
use crate::error::{ExitKind, GuestTrap, Result};
use crate::flags::{eval_cc, OperandSize};
use crate::instruction::{DecodedInst, Mnemonic, Operand};
use crate::mmu::AddressSpace;

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let fallthrough = inst.addr.wrapping_add(inst.length as u64);
    match inst.op {
        Mnemonic::Jmp => {
            cpu.gpr.rip = target(inst);
        }
        Mnemonic::JmpIndirect => {
            let target = read_operand(cpu, mmu, inst, &inst.operands()[0], OperandSize::Qword)?;
            return Err(GuestTrap::IndirectExit { kind: ExitKind::JmpIndirect, target });
        }
        Mnemonic::Jcc(cc) => {
            cpu.gpr.rip = if eval_cc(cc, cpu.gpr.rflags.as_word()) { target(inst) } else { fallthrough };
        }
        Mnemonic::Call => {
            push_return_addr(cpu, mmu, fallthrough)?;
            cpu.gpr.rip = target(inst);
        }
        Mnemonic::CallIndirect => {
            let target = read_operand(cpu, mmu, inst, &inst.operands()[0], OperandSize::Qword)?;
            push_return_addr(cpu, mmu, fallthrough)?;
            return Err(GuestTrap::IndirectExit { kind: ExitKind::CallIndirect, target });
        }
        Mnemonic::Ret => {
            let sp = cpu.gpr.sp();
            let ret = super::read_mem(mmu, sp, OperandSize::Qword)?;
            cpu.gpr.set_sp(sp.wrapping_add(8));
            if let Some(Operand::Immediate(extra)) = inst.operands().first() {
                cpu.gpr.set_sp(cpu.gpr.sp().wrapping_add(*extra));
            }
            return Err(GuestTrap::IndirectExit { kind: ExitKind::Ret, target: ret });
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn target(inst: &DecodedInst) -> u64 {
    match inst.operands()[0] {
        Operand::RelativeTarget(t) => t,
        Operand::Immediate(t) => t,
        _ => unreachable!("direct branch target must be resolved by the decoder"),
    }
}

fn push_return_addr(cpu: &mut CpuState, mmu: &AddressSpace, ret_addr: u64) -> Result<()> {
    let new_sp = cpu.gpr.sp().wrapping_sub(8);
    super::write_mem(mmu, new_sp, OperandSize::Qword, ret_addr)?;
    cpu.gpr.set_sp(new_sp);
    Ok(())
}
