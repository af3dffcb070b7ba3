//! x87 FPU instructions: FLD/FST/FSTP/FADD/FSUB/FMUL/FDIV/FLD1/FLDZ/FXCH.
//!
//! Memory operands carry their width in [`MemOperand::size`] (`Dword` for
//! `m32fp`, `Qword` for `m64fp`); ST(i) operands come through as
//! [`Operand::St`]. The decoder is responsible for picking the right
//! mnemonic+operand shape for each of the several opcode encodings that
//! alias onto one of these (`D8`/`D9`/`DC`/`DD` forms); the interpreter only
//! needs to know source/destination and whether the op pops the stack.

use crate::cpu::CpuState;
use crate::error::Result;
use crate::flags::OperandSize;
use crate::instruction::{DecodedInst, Mnemonic, Operand};
use crate::mmu::AddressSpace;

fn read_float_operand(cpu: &CpuState, mmu: &AddressSpace, inst: &DecodedInst, op: &Operand) -> Result<f64> {
    match *op {
        Operand::St(i) => Ok(cpu.fpu.st(i)),
        Operand::Memory(mem) => {
            let addr = super::effective_address(cpu, &mem, inst);
            match mem.size {
                OperandSize::Dword => Ok(f32::from_bits(mmu.read32(addr)?) as f64),
                _ => Ok(f64::from_bits(mmu.read64(addr)?)),
            }
        }
        _ => unreachable!("FPU source must be ST(i) or memory"),
    }
}

fn write_float_operand(
    cpu: &mut CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    op: &Operand,
    val: f64,
) -> Result<()> {
    match *op {
        Operand::St(i) => {
            cpu.fpu.set_st(i, val);
            Ok(())
        }
        Operand::Memory(mem) => {
            let addr = super::effective_address(cpu, &mem, inst);
            match mem.size {
                OperandSize::Dword => mmu.write32(addr, (val as f32).to_bits()),
                _ => mmu.write64(addr, val.to_bits()),
            }
        }
        _ => unreachable!("FPU destination must be ST(i) or memory"),
    }
}

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let ops = inst.operands();
    match inst.op {
        Mnemonic::Fld => {
            let val = read_float_operand(cpu, mmu, inst, &ops[0])?;
            cpu.fpu.push(val);
        }
        Mnemonic::Fld1 => cpu.fpu.push(1.0),
        Mnemonic::Fldz => cpu.fpu.push(0.0),
        Mnemonic::Fst | Mnemonic::Fstp => {
            let val = cpu.fpu.st(0);
            write_float_operand(cpu, mmu, inst, &ops[0], val)?;
            if matches!(inst.op, Mnemonic::Fstp) {
                cpu.fpu.pop();
            }
        }
        Mnemonic::Fadd | Mnemonic::Fsub | Mnemonic::Fmul | Mnemonic::Fdiv => {
            exec_arith(cpu, mmu, inst)?;
        }
        Mnemonic::Fxch => {
            let i = match ops[0] {
                Operand::St(i) => i,
                _ => 1,
            };
            let a = cpu.fpu.st(0);
            let b = cpu.fpu.st(i);
            cpu.fpu.set_st(0, b);
            cpu.fpu.set_st(i, a);
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// FADD/FSUB/FMUL/FDIV: the decoder always hands us an explicit destination
/// (ST(0) for the memory forms, or the addressed ST(i) for the register
/// forms) as `ops[0]` and the other operand as `ops[1]`, so the interpreter
/// never needs to special-case `FADDP`/`FSUBRP`/etc. — those differ only in
/// which physical registers the decoder names plus whether it appends a
/// pop, which it communicates by aliasing `Fstp`-style handling upstream.
fn exec_arith(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let ops = inst.operands();
    let dst = &ops[0];
    let src = &ops[1];
    let a = read_float_operand(cpu, mmu, inst, dst)?;
    let b = read_float_operand(cpu, mmu, inst, src)?;
    let result = match inst.op {
        Mnemonic::Fadd => a + b,
        Mnemonic::Fsub => a - b,
        Mnemonic::Fmul => a * b,
        Mnemonic::Fdiv => a / b,
        _ => unreachable!(),
    };
    write_float_operand(cpu, mmu, inst, dst, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{MemOperand, PrefixState};

    fn blank_inst(op: Mnemonic, operands: [Operand; 3], operand_count: u8) -> DecodedInst {
        DecodedInst {
            length: 2,
            op,
            operand_size: OperandSize::Qword,
            address_size: OperandSize::Qword,
            operands,
            operand_count,
            prefix: PrefixState::default(),
            addr: 0x1000,
        }
    }

    #[test]
    fn fld1_then_fadd_st0_st1() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mmu = AddressSpace::new(0x10_0000);
        cpu.fpu.push(41.0);
        exec(&mut cpu, &mmu, &blank_inst(Mnemonic::Fld1, [Operand::None; 3], 0)).unwrap();
        let inst = blank_inst(
            Mnemonic::Fadd,
            [Operand::St(1), Operand::St(0), Operand::None],
            2,
        );
        exec(&mut cpu, &mmu, &inst).unwrap();
        assert_eq!(cpu.fpu.st(1), 42.0);
    }

    #[test]
    fn fst_memory_round_trips_f64() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mut mmu = AddressSpace::new(0x10_0000);
        let addr = mmu
            .mmap(
                0,
                4096,
                crate::mmu::page::Prot::RW,
                crate::mmu::MapFlags { anonymous: true, ..Default::default() },
                None,
            )
            .unwrap();
        cpu.fpu.push(core::f64::consts::PI);
        let mem = MemOperand { base: None, index: None, scale: 1, displacement: addr as i64, size: OperandSize::Qword, rip_relative: false };
        let inst = blank_inst(Mnemonic::Fst, [Operand::Memory(mem), Operand::None, Operand::None], 1);
        exec(&mut cpu, &mmu, &inst).unwrap();
        assert_eq!(f64::from_bits(mmu.read64(addr).unwrap()), core::f64::consts::PI);
    }
}
