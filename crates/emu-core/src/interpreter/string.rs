//! MOVS/STOS/SCAS/CMPS/LODS, with and without a REP/REPE/REPNE prefix.
//!
//! An unprefixed string op runs once. A REP-prefixed one loops while RCX is
//! nonzero (and, for SCAS/CMPS, while ZF matches the REP/REPNE sense),
//! decrementing RCX and advancing RSI/RDI by the operand width each
//! iteration, with the direction given by RFLAGS.DF. A single dispatcher
//! call processes at most [`MAX_ITERATIONS_PER_STEP`] iterations before
//! yielding back with `RIP` unchanged, so a long REP MOVSB is transparently
//! resumable across scheduler quanta instead of monopolizing one.

use crate::cpu::CpuState;
use crate::error::Result;
use crate::flags::{self, FlagOp};
use crate::instruction::{DecodedInst, Mnemonic, RepPrefix};
use crate::mmu::AddressSpace;

const MAX_ITERATIONS_PER_STEP: u64 = 4096;

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst, fallthrough: u64) -> Result<()> {
    let width = inst.operand_size;
    let step_bytes = width.bytes() as u64;
    let backward = cpu.gpr.rflags.test(flags::DF);
    let delta: i64 = if backward { -(step_bytes as i64) } else { step_bytes as i64 };

    let repeated = !matches!(inst.prefix.rep, RepPrefix::None);
    let mut remaining = if repeated { cpu.gpr.read_gpr64(1) } else { 1 };

    if repeated && remaining == 0 {
        cpu.gpr.rip = fallthrough;
        return Ok(());
    }

    let mut iterations = 0u64;
    loop {
        if remaining == 0 {
            break;
        }
        one_iteration(cpu, mmu, inst, width, delta)?;
        remaining -= 1;
        iterations += 1;
        cpu.instret += 1;

        if repeated {
            cpu.gpr.write_gpr64(1, remaining);
            let stop_on_flag = match (inst.op, inst.prefix.rep) {
                (Mnemonic::ScasString | Mnemonic::CmpsString, RepPrefix::Rep) => !cpu.gpr.rflags.test(flags::ZF),
                (Mnemonic::ScasString | Mnemonic::CmpsString, RepPrefix::Repne) => cpu.gpr.rflags.test(flags::ZF),
                _ => false,
            };
            if stop_on_flag || remaining == 0 {
                break;
            }
        } else {
            break;
        }

        if iterations >= MAX_ITERATIONS_PER_STEP {
            // Yield: leave RIP on this instruction so the dispatcher
            // re-enters and resumes with the updated RCX/RSI/RDI.
            return Ok(());
        }
    }

    cpu.gpr.rip = fallthrough;
    Ok(())
}

fn one_iteration(
    cpu: &mut CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    width: crate::flags::OperandSize,
    delta: i64,
) -> Result<()> {
    match inst.op {
        Mnemonic::MovsString => {
            let src = cpu.gpr.read_gpr64(6); // RSI
            let dst = cpu.gpr.read_gpr64(7); // RDI
            let val = super::read_mem(mmu, src, width)?;
            super::write_mem(mmu, dst, width, val)?;
            cpu.gpr.write_gpr64(6, src.wrapping_add_signed(delta));
            cpu.gpr.write_gpr64(7, dst.wrapping_add_signed(delta));
        }
        Mnemonic::StosString => {
            let dst = cpu.gpr.read_gpr64(7);
            let val = cpu.gpr.read_gpr(0, width, inst.prefix.has_rex());
            super::write_mem(mmu, dst, width, val)?;
            cpu.gpr.write_gpr64(7, dst.wrapping_add_signed(delta));
        }
        Mnemonic::LodsString => {
            let src = cpu.gpr.read_gpr64(6);
            let val = super::read_mem(mmu, src, width)?;
            cpu.gpr.write_gpr(0, width, inst.prefix.has_rex(), val);
            cpu.gpr.write_gpr64(6, src.wrapping_add_signed(delta));
        }
        Mnemonic::ScasString => {
            let dst = cpu.gpr.read_gpr64(7);
            let a = cpu.gpr.read_gpr(0, width, inst.prefix.has_rex());
            let b = super::read_mem(mmu, dst, width)?;
            let result = a.wrapping_sub(b) & width.mask();
            cpu.gpr.rflags.record(FlagOp::Sub, a, b, result, width);
            cpu.gpr.write_gpr64(7, dst.wrapping_add_signed(delta));
        }
        Mnemonic::CmpsString => {
            let src = cpu.gpr.read_gpr64(6);
            let dst = cpu.gpr.read_gpr64(7);
            let a = super::read_mem(mmu, src, width)?;
            let b = super::read_mem(mmu, dst, width)?;
            let result = a.wrapping_sub(b) & width.mask();
            cpu.gpr.rflags.record(FlagOp::Sub, a, b, result, width);
            cpu.gpr.write_gpr64(6, src.wrapping_add_signed(delta));
            cpu.gpr.write_gpr64(7, dst.wrapping_add_signed(delta));
        }
        _ => unreachable!(),
    }
    Ok(())
}
