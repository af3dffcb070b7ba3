//! SETcc/CMOVcc.

use super::{read_operand, write_operand};
use crate::cpu::CpuState;
use crate::error::Result;
use crate::flags::{eval_cc, OperandSize};
use crate::instruction::{DecodedInst, Mnemonic};
use crate::mmu::AddressSpace;

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let taken = match inst.op {
        Mnemonic::Setcc(cc) | Mnemonic::Cmovcc(cc) => eval_cc(cc, cpu.gpr.rflags.as_word()),
        _ => unreachable!(),
    };
    let ops = inst.operands();
    match inst.op {
        Mnemonic::Setcc(_) => {
            write_operand(cpu, mmu, inst, &ops[0], OperandSize::Byte, taken as u64)?;
        }
        Mnemonic::Cmovcc(_) => {
            if taken {
                let val = read_operand(cpu, mmu, inst, &ops[1], inst.operand_size)?;
                write_operand(cpu, mmu, inst, &ops[0], inst.operand_size, val)?;
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}
