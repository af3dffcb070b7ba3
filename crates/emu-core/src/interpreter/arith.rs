//! ADD/ADC/SUB/SBB/CMP/INC/DEC/NEG/MUL/IMUL/DIV/IDIV/XADD.

use super::{read_operand, write_operand};
use crate::cpu::CpuState;
use crate::error::{GuestTrap, Result};
use crate::flags::{self, FlagOp};
use crate::instruction::{DecodedInst, Mnemonic};
use crate::mmu::AddressSpace;

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let width = inst.operand_size;
    match inst.op {
        Mnemonic::Add | Mnemonic::Adc => {
            let [dst, src] = two_operands(inst);
            let a = read_operand(cpu, mmu, inst, dst, width)?;
            let b = read_operand(cpu, mmu, inst, src, width)?;
            let carry_in = if matches!(inst.op, Mnemonic::Adc) && cpu.gpr.rflags.test(flags::CF) {
                1
            } else {
                0
            };
            let result = a.wrapping_add(b).wrapping_add(carry_in) & width.mask();
            write_operand(cpu, mmu, inst, dst, width, result)?;
            cpu.gpr.rflags.record(FlagOp::Add, a, b.wrapping_add(carry_in), result, width);
        }
        Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
            let [dst, src] = two_operands(inst);
            let a = read_operand(cpu, mmu, inst, dst, width)?;
            let b = read_operand(cpu, mmu, inst, src, width)?;
            let borrow_in = if matches!(inst.op, Mnemonic::Sbb) && cpu.gpr.rflags.test(flags::CF) {
                1
            } else {
                0
            };
            let result = a.wrapping_sub(b).wrapping_sub(borrow_in) & width.mask();
            if !matches!(inst.op, Mnemonic::Cmp) {
                write_operand(cpu, mmu, inst, dst, width, result)?;
            }
            cpu.gpr.rflags.record(FlagOp::Sub, a, b.wrapping_add(borrow_in), result, width);
        }
        Mnemonic::Inc | Mnemonic::Dec => {
            let dst = &inst.operands()[0];
            let a = read_operand(cpu, mmu, inst, dst, width)?;
            let result = if matches!(inst.op, Mnemonic::Inc) {
                a.wrapping_add(1) & width.mask()
            } else {
                a.wrapping_sub(1) & width.mask()
            };
            write_operand(cpu, mmu, inst, dst, width, result)?;
            let op = if matches!(inst.op, Mnemonic::Inc) { FlagOp::Inc } else { FlagOp::Dec };
            cpu.gpr.rflags.record(op, a, 1, result, width);
        }
        Mnemonic::Neg => {
            let dst = &inst.operands()[0];
            let a = read_operand(cpu, mmu, inst, dst, width)?;
            let result = 0u64.wrapping_sub(a) & width.mask();
            write_operand(cpu, mmu, inst, dst, width, result)?;
            cpu.gpr.rflags.record(FlagOp::Sub, 0, a, result, width);
        }
        Mnemonic::Xadd => {
            let [dst, src] = two_operands(inst);
            let a = read_operand(cpu, mmu, inst, dst, width)?;
            let b = read_operand(cpu, mmu, inst, src, width)?;
            let result = a.wrapping_add(b) & width.mask();
            write_operand(cpu, mmu, inst, src, width, a)?;
            write_operand(cpu, mmu, inst, dst, width, result)?;
            cpu.gpr.rflags.record(FlagOp::Add, a, b, result, width);
        }
        Mnemonic::Mul | Mnemonic::Imul => {
            exec_mul(cpu, mmu, inst, width)?;
        }
        Mnemonic::Div | Mnemonic::Idiv => {
            exec_div(cpu, mmu, inst, width)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn two_operands(inst: &DecodedInst) -> [&crate::instruction::Operand; 2] {
    let ops = inst.operands();
    [&ops[0], &ops[1]]
}

/// One- and two-operand MUL/IMUL. Three-operand IMUL (`imul r, r/m, imm`)
/// is handled by treating the destination as both factors' home and the
/// accumulator, matching the decoder contract of always providing an
/// explicit destination operand.
fn exec_mul(
    cpu: &mut CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    width: crate::flags::OperandSize,
) -> Result<()> {
    use crate::flags::OperandSize::*;
    let ops = inst.operands();
    let signed = matches!(inst.op, Mnemonic::Imul);

    if ops.len() >= 2 {
        let dst = &ops[0];
        let src = &ops[1];
        let a = read_operand(cpu, mmu, inst, dst, width)?;
        let b = read_operand(cpu, mmu, inst, src, width)?;
        let (result, overflow) = if signed {
            let sa = super::sign_extend(a, width) as i64;
            let sb = super::sign_extend(b, width) as i64;
            let full = sa as i128 * sb as i128;
            let truncated = (full as i64) & width.mask() as i64;
            (truncated as u64, full != super::sign_extend(truncated as u64, width) as i128)
        } else {
            let full = (a as u128) * (b as u128);
            let truncated = full as u64 & width.mask();
            (truncated, full >> width.bits() != 0)
        };
        write_operand(cpu, mmu, inst, dst, width, result)?;
        let flags = if overflow { flags::CF | flags::OF } else { 0 };
        cpu.gpr.rflags.set_word((cpu.gpr.rflags.as_word() & !(flags::CF | flags::OF)) | flags);
        return Ok(());
    }

    // One-operand form: RAX (and RDX for the wide half) implicit.
    let src = &ops[0];
    let b = read_operand(cpu, mmu, inst, src, width)?;
    let a = cpu.gpr.read_gpr(0, width, inst.prefix.has_rex());
    match width {
        Byte => {
            let (full, cf_of) = if signed {
                let v = (a as i8 as i16) * (b as i8 as i16);
                (v as u16 as u64, v as i8 as i16 != v)
            } else {
                let v = (a as u8 as u16) * (b as u8 as u16);
                (v as u64, v >> 8 != 0)
            };
            cpu.gpr.write_gpr16(0, full as u16);
            finish_mul_flags(cpu, width, cf_of);
        }
        Word | Dword | Qword => {
            let bits = width.bits();
            let (lo, hi, cf_of) = if signed {
                let v = super::sign_extend(a, width) as i64 as i128
                    * super::sign_extend(b, width) as i64 as i128;
                let lo = (v as u128 & width.mask() as u128) as u64;
                let hi = ((v as u128) >> bits) as u64 & width.mask();
                let sext_lo = super::sign_extend(lo, width) as i128;
                (lo, hi, v != sext_lo)
            } else {
                let v = (a as u128 & width.mask() as u128) * (b as u128 & width.mask() as u128);
                let lo = (v & width.mask() as u128) as u64;
                let hi = (v >> bits) as u64 & width.mask();
                (lo, hi, hi != 0)
            };
            cpu.gpr.write_gpr(0, width, inst.prefix.has_rex(), lo);
            cpu.gpr.write_gpr(2, width, inst.prefix.has_rex(), hi);
            finish_mul_flags(cpu, width, cf_of);
        }
    }
    Ok(())
}

fn finish_mul_flags(cpu: &mut CpuState, width: crate::flags::OperandSize, cf_of: bool) {
    cpu.gpr.rflags.record(FlagOp::Mul { cf_of }, 0, 0, 0, width);
}

fn exec_div(
    cpu: &mut CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    width: crate::flags::OperandSize,
) -> Result<()> {
    use crate::flags::OperandSize::*;
    let ops = inst.operands();
    let divisor = read_operand(cpu, mmu, inst, &ops[0], width)?;
    let signed = matches!(inst.op, Mnemonic::Idiv);
    let has_rex = inst.prefix.has_rex();

    if divisor == 0 {
        return Err(GuestTrap::DivideByZero);
    }

    match width {
        Byte => {
            let ax = cpu.gpr.read_gpr16(0);
            let (q, r) = if signed {
                let n = ax as i16;
                let d = divisor as u8 as i8 as i16;
                (n / d, n % d)
            } else {
                let n = ax;
                let d = divisor as u8 as u16;
                ((n / d) as i16, (n % d) as i16)
            };
            cpu.gpr.write_gpr8(0, has_rex, q as u8);
            cpu.gpr.write_gpr8(4, has_rex, r as u8);
        }
        Word | Dword | Qword => {
            let bits = width.bits();
            let lo = cpu.gpr.read_gpr(0, width, has_rex);
            let hi = cpu.gpr.read_gpr(2, width, has_rex);
            let dividend: u128 = (hi as u128) << bits | lo as u128;
            let (q, r) = if signed {
                let n = dividend as i128;
                let d = super::sign_extend(divisor, width) as i64 as i128;
                if d == 0 {
                    return Err(GuestTrap::DivideByZero);
                }
                (n / d, n % d)
            } else {
                let d = divisor as u128;
                if d == 0 {
                    return Err(GuestTrap::DivideByZero);
                }
                ((dividend / d) as i128, (dividend % d) as i128)
            };
            cpu.gpr.write_gpr(0, width, has_rex, q as u64 & width.mask());
            cpu.gpr.write_gpr(2, width, has_rex, r as u64 & width.mask());
        }
    }
    cpu.gpr.rflags.mark_unsure();
    Ok(())
}
