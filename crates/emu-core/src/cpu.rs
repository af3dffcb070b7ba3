//! Per-thread CPU state: the observable register file at an instruction
//! boundary.
//!
//! One [`CpuState`] exists per emulated guest thread. It is deliberately
//! "just data" — the interpreter and JIT both operate on it through
//! `&mut CpuState`, and neither owns a thread's address space, which is
//! shared via `emu_kernel`'s process/thread bookkeeping instead.

use crate::fpu_state::FpuState;
use crate::registers::RegisterFile;
use crate::sse_state::SseState;

/// Full architectural state of one guest thread, observable between
/// instructions (the interpreter and JIT both guarantee this view is
/// faithful only at instruction boundaries, never mid-instruction).
pub struct CpuState {
    pub gpr: RegisterFile,
    pub fpu: FpuState,
    pub sse: SseState,
    /// Number of instructions retired since thread start. Drives the
    /// scheduler's quantum accounting and REP-loop cancellation checks.
    pub instret: u64,
}

impl CpuState {
    pub fn new(entry: u64, stack_top: u64) -> Self {
        let mut gpr = RegisterFile::new();
        gpr.rip = entry;
        gpr.set_sp(stack_top);
        CpuState { gpr, fpu: FpuState::new(), sse: SseState::new(), instret: 0 }
    }

    #[inline]
    pub fn rip(&self) -> u64 {
        self.gpr.rip
    }

    #[inline]
    pub fn set_rip(&mut self, addr: u64) {
        self.gpr.rip = addr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_starts_at_entry_with_stack_set() {
        let cpu = CpuState::new(0x40_0000, 0x7fff_0000);
        assert_eq!(cpu.rip(), 0x40_0000);
        assert_eq!(cpu.gpr.sp(), 0x7fff_0000);
        assert_eq!(cpu.instret, 0);
    }
}
