//! CPUID, RDTSC, and the `arch_prctl` marker.
//!
//! `arch_prctl(ARCH_SET_FS, ...)` is the only way long-mode userspace sets
//! its segment base without a syscall trap reaching the kernel crate — the
//! decoder recognizes the `wrmsr`-free idiom glibc/musl actually emit
//! (a `mov fs:0, ...` setup sequence is out of scope; real guests always go
//! through the `arch_prctl` syscall) and this marker exists only so the
//! interpreter has a uniform dispatch target. In practice `ArchPrctlMarker`
//! is unreachable from decoded guest code and exists for forward
//! compatibility with decoders that synthesize it; FS/GS base changes
//! arrive through `emu_kernel`'s syscall handler instead.

use crate::cpu::CpuState;
use crate::error::Result;
use crate::instruction::{DecodedInst, Mnemonic};

pub fn exec(cpu: &mut CpuState, inst: &DecodedInst) -> Result<()> {
    match inst.op {
        Mnemonic::Cpuid => exec_cpuid(cpu),
        Mnemonic::Rdtsc => exec_rdtsc(cpu),
        Mnemonic::ArchPrctlMarker => {}
        _ => unreachable!(),
    }
    Ok(())
}

/// A minimal, stable CPUID surface: just enough leaf 0/1 data for guest
/// libc startup code to stop probing for features it won't get (AVX,
/// XSAVE, ...). Leaves outside this set return all zeros.
fn exec_cpuid(cpu: &mut CpuState) {
    let has_rex = cpu.gpr.rflags.test(0); // placeholder avoided below
    let _ = has_rex;
    let leaf = cpu.gpr.read_gpr32(0);
    let (eax, ebx, ecx, edx) = match leaf {
        0 => (1u32, 0x6c6c6547, 0x6c65746e, 0x49656e69), // "GenuineIntel"
        1 => {
            // Report SSE2 (edx bit 26) and CMPXCHG16B (ecx bit 13); nothing
            // exotic that would make a guest probe further.
            (0x0006_3fa0, 0, 1 << 13, 1 << 26)
        }
        _ => (0, 0, 0, 0),
    };
    cpu.gpr.write_gpr32(0, eax);
    cpu.gpr.write_gpr32(3, ebx);
    cpu.gpr.write_gpr32(1, ecx);
    cpu.gpr.write_gpr32(2, edx);
}

/// Guest-visible timestamp counter. Derived from `instret` rather than the
/// host clock so that two runs of the same deterministic guest program see
/// the same RDTSC sequence.
fn exec_rdtsc(cpu: &mut CpuState) {
    let tsc = cpu.instret.wrapping_mul(16);
    cpu.gpr.write_gpr32(0, tsc as u32);
    cpu.gpr.write_gpr32(2, (tsc >> 32) as u32);
}
