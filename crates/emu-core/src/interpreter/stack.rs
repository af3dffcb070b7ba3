//! PUSH/POP. The guest stack grows down; all pushes/pops in long mode are
//! 64-bit (or 16-bit under an operand-size override) regardless of REX.W.

use super::{read_operand, write_operand};
use crate::cpu::CpuState;
use crate::error::Result;
use crate::flags::OperandSize;
use crate::instruction::{DecodedInst, Mnemonic};
use crate::mmu::AddressSpace;

fn push_width(inst: &DecodedInst) -> OperandSize {
    if inst.prefix.operand_size_override { OperandSize::Word } else { OperandSize::Qword }
}

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let width = push_width(inst);
    let ops = inst.operands();
    match inst.op {
        Mnemonic::Push => {
            let val = read_operand(cpu, mmu, inst, &ops[0], width)?;
            let new_sp = cpu.gpr.sp().wrapping_sub(width.bytes() as u64);
            super::write_mem(mmu, new_sp, width, val)?;
            cpu.gpr.set_sp(new_sp);
        }
        Mnemonic::Pop => {
            let sp = cpu.gpr.sp();
            let val = super::read_mem(mmu, sp, width)?;
            cpu.gpr.set_sp(sp.wrapping_add(width.bytes() as u64));
            write_operand(cpu, mmu, inst, &ops[0], width, val)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}
