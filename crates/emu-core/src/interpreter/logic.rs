//! AND/OR/XOR/NOT/TEST/SHL/SHR/SAR/ROL/ROR.

use super::{read_operand, write_operand};
use crate::cpu::CpuState;
use crate::error::Result;
use crate::flags::{self, FlagOp};
use crate::instruction::{DecodedInst, Mnemonic};
use crate::mmu::AddressSpace;

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let width = inst.operand_size;
    match inst.op {
        Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
            let ops = inst.operands();
            let (dst, src) = (&ops[0], &ops[1]);
            let a = read_operand(cpu, mmu, inst, dst, width)?;
            let b = read_operand(cpu, mmu, inst, src, width)?;
            let result = match inst.op {
                Mnemonic::And | Mnemonic::Test => a & b,
                Mnemonic::Or => a | b,
                Mnemonic::Xor => a ^ b,
                _ => unreachable!(),
            } & width.mask();
            if !matches!(inst.op, Mnemonic::Test) {
                write_operand(cpu, mmu, inst, dst, width, result)?;
            }
            cpu.gpr.rflags.record(FlagOp::Logic, 0, 0, result, width);
        }
        Mnemonic::Not => {
            let dst = &inst.operands()[0];
            let a = read_operand(cpu, mmu, inst, dst, width)?;
            write_operand(cpu, mmu, inst, dst, width, !a & width.mask())?;
        }
        Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol | Mnemonic::Ror => {
            exec_shift(cpu, mmu, inst, width)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn exec_shift(
    cpu: &mut CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    width: crate::flags::OperandSize,
) -> Result<()> {
    let ops = inst.operands();
    let dst = &ops[0];
    let count = (read_operand(cpu, mmu, inst, &ops[1], width)? & 0x3F) as u32;
    let bits = width.bits();
    let a = read_operand(cpu, mmu, inst, dst, width)?;

    if count == 0 {
        return Ok(());
    }
    // ROL/ROR wrap modulo the operand width; SHL/SHR/SAR saturate — a count
    // at or beyond the width shifts everything out.
    let n = if matches!(inst.op, Mnemonic::Rol | Mnemonic::Ror) { count % bits } else { count.min(bits) };
    if n == 0 {
        return Ok(());
    }

    let (result, cf, of) = match inst.op {
        Mnemonic::Shl => {
            let result = (a << n) & width.mask();
            let cf = n <= bits && (a >> (bits - n)) & 1 != 0;
            let of = n == 1 && ((result >> (bits - 1)) & 1) != ((a >> (bits - 1)) & 1);
            (result, cf, of)
        }
        Mnemonic::Shr => {
            let result = (a & width.mask()) >> n;
            let cf = (a >> (n - 1)) & 1 != 0;
            let of = n == 1 && (a >> (bits - 1)) & 1 != 0;
            (result, cf, of)
        }
        Mnemonic::Sar => {
            let signed = super::sign_extend(a, width) as i64;
            let result = (signed >> n) as u64 & width.mask();
            let cf = (a >> (n - 1)) & 1 != 0;
            (result, cf, false)
        }
        Mnemonic::Rol => {
            let n = n % bits;
            let result = if n == 0 { a } else { ((a << n) | (a >> (bits - n))) & width.mask() };
            let cf = result & 1 != 0;
            let of = n == 1 && ((result >> (bits - 1)) & 1) != cf as u64;
            (result, cf, of)
        }
        Mnemonic::Ror => {
            let n = n % bits;
            let result = if n == 0 { a } else { ((a >> n) | (a << (bits - n))) & width.mask() };
            let cf = (result >> (bits - 1)) & 1 != 0;
            let of = n == 1 && ((result >> (bits - 1)) & 1) != ((result >> (bits - 2)) & 1);
            (result, cf, of)
        }
        _ => unreachable!(),
    };

    write_operand(cpu, mmu, inst, dst, width, result)?;
    if matches!(inst.op, Mnemonic::Rol | Mnemonic::Ror) {
        let mut word = cpu.gpr.rflags.as_word();
        word = (word & !(flags::CF | flags::OF)) | (if cf { flags::CF } else { 0 }) | (if of { flags::OF } else { 0 });
        cpu.gpr.rflags.set_word(word);
    } else {
        cpu.gpr.rflags.record(FlagOp::Shift { cf, of }, 0, 0, result, width);
    }
    Ok(())
}
