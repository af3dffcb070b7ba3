//! Scalar/packed SSE instructions: MOVSS/MOVSD/MOVAPS/MOVAPD, scalar
//! ADD/SUB/MUL/DIV, and the CVT family (int<->float, single<->double).
//!
//! `inst.operand_size` carries the scalar width for the `*Sse` mnemonics
//! (`Dword` = single precision, `Qword` = double precision); `MovApsSse`
//! always moves the full 128 bits regardless of that field.

use crate::cpu::CpuState;
use crate::error::Result;
use crate::flags::OperandSize;
use crate::instruction::{DecodedInst, Mnemonic, Operand};
use crate::mmu::AddressSpace;
use crate::sse_state::Xmm;

fn read_xmm_operand(cpu: &CpuState, mmu: &AddressSpace, inst: &DecodedInst, op: &Operand) -> Result<Xmm> {
    match *op {
        Operand::Xmm(r) => Ok(cpu.sse.xmm[r as usize]),
        Operand::Memory(mem) => {
            let addr = super::effective_address(cpu, &mem, inst);
            let lo = mmu.read64(addr)?;
            let hi = mmu.read64(addr.wrapping_add(8))?;
            Ok(Xmm { lo, hi })
        }
        _ => unreachable!("SSE source must be XMM or memory"),
    }
}

fn write_xmm_operand(
    cpu: &mut CpuState,
    mmu: &AddressSpace,
    inst: &DecodedInst,
    op: &Operand,
    val: Xmm,
) -> Result<()> {
    match *op {
        Operand::Xmm(r) => {
            cpu.sse.xmm[r as usize] = val;
            Ok(())
        }
        Operand::Memory(mem) => {
            let addr = super::effective_address(cpu, &mem, inst);
            mmu.write64(addr, val.lo)?;
            mmu.write64(addr.wrapping_add(8), val.hi)
        }
        _ => unreachable!("SSE destination must be XMM or memory"),
    }
}

/// Read the scalar float lane (lane 0) per `width`, leaving the upper lanes
/// untouched on the caller's side (merge semantics of MOVSS/MOVSD/ADDSD/...).
fn scalar_lane(xmm: Xmm, width: OperandSize) -> f64 {
    match width {
        OperandSize::Dword => f32::from_bits(xmm.lo as u32) as f64,
        _ => f64::from_bits(xmm.lo),
    }
}

fn with_scalar_lane(mut dst: Xmm, width: OperandSize, val: f64) -> Xmm {
    match width {
        OperandSize::Dword => {
            dst.lo = (dst.lo & !0xFFFF_FFFF) | (val as f32).to_bits() as u64;
        }
        _ => dst.lo = val.to_bits(),
    }
    dst
}

pub fn exec(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let ops = inst.operands();
    let width = inst.operand_size;
    match inst.op {
        Mnemonic::MovApsSse => {
            let val = read_xmm_operand(cpu, mmu, inst, &ops[1])?;
            write_xmm_operand(cpu, mmu, inst, &ops[0], val)?;
        }
        Mnemonic::MovScalarSse => {
            // Register-to-register merges into the low lane only; a memory
            // operand on either side moves just the scalar width.
            let src = read_xmm_operand(cpu, mmu, inst, &ops[1])?;
            let existing = match ops[0] {
                Operand::Xmm(_) => read_xmm_operand(cpu, mmu, inst, &ops[0])?,
                _ => Xmm::default(),
            };
            let merged = with_scalar_lane(existing, width, scalar_lane(src, width));
            write_xmm_operand(cpu, mmu, inst, &ops[0], merged)?;
        }
        Mnemonic::AddScalarSse | Mnemonic::SubScalarSse | Mnemonic::MulScalarSse | Mnemonic::DivScalarSse => {
            let dst_xmm = read_xmm_operand(cpu, mmu, inst, &ops[0])?;
            let src_xmm = read_xmm_operand(cpu, mmu, inst, &ops[1])?;
            let a = scalar_lane(dst_xmm, width);
            let b = scalar_lane(src_xmm, width);
            let result = match inst.op {
                Mnemonic::AddScalarSse => a + b,
                Mnemonic::SubScalarSse => a - b,
                Mnemonic::MulScalarSse => a * b,
                Mnemonic::DivScalarSse => a / b,
                _ => unreachable!(),
            };
            let merged = with_scalar_lane(dst_xmm, width, result);
            write_xmm_operand(cpu, mmu, inst, &ops[0], merged)?;
        }
        Mnemonic::CvtSse => exec_cvt(cpu, mmu, inst)?,
        _ => unreachable!(),
    }
    Ok(())
}

/// CVTSI2SS/CVTSI2SD/CVTTSS2SI/CVTTSD2SI/CVTSS2SD/CVTSD2SS, disambiguated by
/// operand shape: GPR destination means a float-to-int truncating
/// conversion, GPR source means int-to-float, and XMM-to-XMM means a
/// precision conversion. `width` names the *source* float width for the
/// float-to-* forms and the *destination* float width otherwise.
fn exec_cvt(cpu: &mut CpuState, mmu: &AddressSpace, inst: &DecodedInst) -> Result<()> {
    let ops = inst.operands();
    let width = inst.operand_size;
    match (&ops[0], &ops[1]) {
        (Operand::Gpr(dst, _), src) => {
            let src_xmm = read_xmm_operand(cpu, mmu, inst, src)?;
            let val = scalar_lane(src_xmm, width);
            cpu.gpr.write_gpr64(*dst, val.trunc() as i64 as u64);
        }
        (dst @ Operand::Xmm(_), Operand::Gpr(src, _)) => {
            let val = cpu.gpr.read_gpr64(*src) as i64 as f64;
            let existing = read_xmm_operand(cpu, mmu, inst, dst)?;
            let merged = with_scalar_lane(existing, width, val);
            write_xmm_operand(cpu, mmu, inst, dst, merged)?;
        }
        (dst, src) => {
            // XMM-to-XMM precision conversion: source lane is the opposite
            // width of `width` (the destination's).
            let other = if matches!(width, OperandSize::Dword) { OperandSize::Qword } else { OperandSize::Dword };
            let src_xmm = read_xmm_operand(cpu, mmu, inst, src)?;
            let val = scalar_lane(src_xmm, other);
            let existing = read_xmm_operand(cpu, mmu, inst, dst)?;
            let merged = with_scalar_lane(existing, width, val);
            write_xmm_operand(cpu, mmu, inst, dst, merged)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::PrefixState;

    fn blank_inst(op: Mnemonic, width: OperandSize, operands: [Operand; 3]) -> DecodedInst {
        DecodedInst {
            length: 4,
            op,
            operand_size: width,
            address_size: OperandSize::Qword,
            operands,
            operand_count: 2,
            prefix: PrefixState::default(),
            addr: 0x1000,
        }
    }

    #[test]
    fn addsd_adds_low_lane_only() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mmu = AddressSpace::new(0x10_0000);
        cpu.sse.xmm[0] = Xmm::from_f64x2([1.5, 9.0]);
        cpu.sse.xmm[1] = Xmm::from_f64x2([2.5, 100.0]);
        let inst = blank_inst(
            Mnemonic::AddScalarSse,
            OperandSize::Qword,
            [Operand::Xmm(0), Operand::Xmm(1), Operand::None],
        );
        exec(&mut cpu, &mmu, &inst).unwrap();
        assert_eq!(cpu.sse.xmm[0].to_f64x2(), [4.0, 9.0]);
    }

    #[test]
    fn movaps_moves_full_128_bits() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mmu = AddressSpace::new(0x10_0000);
        cpu.sse.xmm[1] = Xmm::from_u32x4([1, 2, 3, 4]);
        let inst = blank_inst(
            Mnemonic::MovApsSse,
            OperandSize::Qword,
            [Operand::Xmm(0), Operand::Xmm(1), Operand::None],
        );
        exec(&mut cpu, &mmu, &inst).unwrap();
        assert_eq!(cpu.sse.xmm[0].to_u32x4(), [1, 2, 3, 4]);
    }

    #[test]
    fn cvtsi2sd_converts_gpr_to_double() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mmu = AddressSpace::new(0x10_0000);
        cpu.gpr.write_gpr64(0, (-7i64) as u64);
        let inst = blank_inst(
            Mnemonic::CvtSse,
            OperandSize::Qword,
            [Operand::Xmm(0), Operand::Gpr(0, OperandSize::Qword), Operand::None],
        );
        exec(&mut cpu, &mmu, &inst).unwrap();
        assert_eq!(scalar_lane(cpu.sse.xmm[0], OperandSize::Qword), -7.0);
    }

    #[test]
    fn addss_adds_low_lane_only_at_single_precision() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mmu = AddressSpace::new(0x10_0000);
        cpu.sse.xmm[0] = Xmm::from_f32x4([1.5, 9.0, 0.0, 0.0]);
        cpu.sse.xmm[1] = Xmm::from_f32x4([2.5, 100.0, 0.0, 0.0]);
        let inst = blank_inst(
            Mnemonic::AddScalarSse,
            OperandSize::Dword,
            [Operand::Xmm(0), Operand::Xmm(1), Operand::None],
        );
        exec(&mut cpu, &mmu, &inst).unwrap();
        let lanes = cpu.sse.xmm[0].to_f32x4();
        assert_eq!(lanes[0], 4.0);
        assert_eq!(lanes[1], 9.0);
    }

    #[test]
    fn cvtsi2ss_converts_gpr_to_single() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mmu = AddressSpace::new(0x10_0000);
        cpu.gpr.write_gpr64(0, (-7i64) as u64);
        let inst = blank_inst(
            Mnemonic::CvtSse,
            OperandSize::Dword,
            [Operand::Xmm(0), Operand::Gpr(0, OperandSize::Qword), Operand::None],
        );
        exec(&mut cpu, &mmu, &inst).unwrap();
        assert_eq!(scalar_lane(cpu.sse.xmm[0], OperandSize::Dword), -7.0);
    }

    #[test]
    fn cvttss2si_truncates_single_precision_source() {
        let mut cpu = CpuState::new(0x1000, 0x2000);
        let mmu = AddressSpace::new(0x10_0000);
        cpu.sse.xmm[0] = Xmm::from_f32x4([3.9, 0.0, 0.0, 0.0]);
        let inst = blank_inst(
            Mnemonic::CvtSse,
            OperandSize::Dword,
            [Operand::Gpr(0, OperandSize::Dword), Operand::Xmm(0), Operand::None],
        );
        exec(&mut cpu, &mmu, &inst).unwrap();
        assert_eq!(cpu.gpr.read_gpr64(0) as i64, 3);
    }
}
