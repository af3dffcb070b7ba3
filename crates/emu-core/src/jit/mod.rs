//! Basic-block JIT translator.
//!
//! The translator does not generate native arithmetic/memory-access code
//! per instruction. Instead each compiled block is a short sequence of
//! native `call`s back into [`interpreter::step`], one per instruction,
//! wrapped in a prologue/epilogue that keeps the guest CPU and address
//! space pointers live across the whole block in callee-saved registers.
//! This is a deliberate simplification ("call-threaded" code): it buys
//! real executable-memory management, block caching, and chaining — the
//! parts of a JIT whose behavior is observable from outside — while
//! guaranteeing by construction that translated execution is identical to
//! interpretation, since it *is* interpretation, just with the per-block
//! dispatch overhead compiled away. A later pass can replace individual
//! `step` calls with inlined native code for the common arithmetic/data
//! mnemonics without touching the block cache, chaining, or invalidation
//! logic below.
//!
//! Only unconditional direct `jmp`/`call` get chained: their target is
//! known at compile time, so the block's fallthrough tail can be rewritten
//! in place to jump straight at the callee block once it exists.
//! Conditional branches and indirect control transfers always return to
//! the dispatcher, which does its own block-cache lookup before falling
//! back to interpretation or triggering a fresh translation.

pub mod arena;
mod emit;

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};

use crate::cpu::CpuState;
use crate::error::{ExitKind, GuestTrap};
use crate::instruction::{DecodedInst, Mnemonic, Operand};
use crate::mmu::AddressSpace;
use arena::{ExecutableMemoryArena, MemoryBlock};
use emit::{CodeBuffer, Reg};

thread_local! {
    /// Set by [`trampoline`] when `interpreter::step` faults; read back by
    /// [`JitTranslator::run`] after a block signals a nonzero exit. A plain
    /// `Cell` suffices because `GuestTrap` is `Copy` and each worker thread
    /// only ever runs one block at a time.
    static LAST_TRAP: Cell<Option<GuestTrap>> = Cell::new(None);
}

type BlockEntry = extern "C" fn(*mut CpuState, *const AddressSpace) -> i64;

/// The function every per-instruction `call` in a compiled block targets.
/// Returns `0` on a normal (non-trapping) step, `1` if `interpreter::step`
/// returned `Err`, with the trap stashed in [`LAST_TRAP`].
extern "C" fn trampoline(cpu: *mut CpuState, mmu: *const AddressSpace, inst: *const DecodedInst) -> i64 {
    let outcome = unsafe {
        let cpu = &mut *cpu;
        let mmu = &*mmu;
        let inst = &*inst;
        crate::interpreter::step(cpu, mmu, inst)
    };
    match outcome {
        Ok(()) => 0,
        Err(trap) => {
            LAST_TRAP.with(|cell| cell.set(Some(trap)));
            1
        }
    }
}

/// Offset, within a compiled block's code, of the 6-byte sequence
/// (`mov eax, 0` + `ret`) that chaining rewrites into a `jmp rel32` plus a
/// one-byte `nop`. Kept as a named constant since both the emitter and the
/// patcher need to agree on the length.
const CHAIN_TAIL_LEN: usize = 6;

struct CompiledBlock {
    /// First guest byte this block covers.
    start: u64,
    /// One past the last guest byte this block covers.
    end: u64,
    block: MemoryBlock,
    /// Owns the `DecodedInst`s the block's code holds raw pointers to.
    /// Never mutated after [`JitTranslator::compile`] returns, so the heap
    /// addresses taken during code generation stay valid for the block's
    /// whole lifetime.
    #[allow(dead_code)]
    insts: Box<[DecodedInst]>,
    /// `(offset of the chain tail, statically known successor address)`,
    /// present only when the block's terminal instruction is an
    /// unconditional direct `jmp`/`call`.
    chain_patch: Option<(usize, u64)>,
}

/// Running counters of why translated blocks handed control back to the
/// dispatcher, broken out by [`ExitKind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub jit_exits: u64,
    /// Exits that chaining could have avoided had the target already been
    /// compiled at the time this block was built.
    pub chained_exits: u64,
    pub exit_ret: u64,
    pub exit_call_indirect: u64,
    pub exit_jmp_indirect: u64,
    pub exit_syscall: u64,
    pub exit_fault: u64,
}

impl JitStats {
    fn record_exit(&mut self, kind: ExitKind) {
        self.jit_exits += 1;
        match kind {
            ExitKind::Ret => self.exit_ret += 1,
            ExitKind::CallIndirect => self.exit_call_indirect += 1,
            ExitKind::JmpIndirect => self.exit_jmp_indirect += 1,
            ExitKind::Syscall => self.exit_syscall += 1,
            ExitKind::Fault | ExitKind::Interpreted => self.exit_fault += 1,
        }
    }
}

fn exit_kind_of(trap: &GuestTrap) -> ExitKind {
    match trap {
        GuestTrap::IndirectExit { kind, .. } => *kind,
        GuestTrap::Syscall => ExitKind::Syscall,
        _ => ExitKind::Fault,
    }
}

/// Where control went after [`JitTranslator::run`] returned.
pub enum BlockOutcome {
    /// The block ran to its end without trapping; `CpuState::rip` already
    /// holds the next address to execute (which may or may not have a
    /// compiled block of its own yet).
    Fallthrough(u64),
    /// The block (or, rather, the interpreter call inside it) raised a
    /// trap. `CpuState::rip` points at the instruction the trap occurred
    /// on, same as a pure interpreter would leave it.
    Trap(GuestTrap),
}

/// The terminal instruction's statically-known successor, if any. Only
/// `Jmp`/`Call` qualify — `JmpIndirect`/`CallIndirect`/`Jcc`/`Ret` all
/// either depend on runtime state or (for `Jcc`) have two successors, so
/// none of them get the chaining fast path.
fn unconditional_target(insts: &[DecodedInst]) -> Option<u64> {
    let last = insts.last()?;
    match last.op {
        Mnemonic::Jmp | Mnemonic::Call => match last.operands()[0] {
            Operand::RelativeTarget(t) | Operand::Immediate(t) => Some(t),
            _ => None,
        },
        _ => None,
    }
}

/// Compiles basic blocks to call-threaded native code, caches them by
/// entry address, and rewrites direct unconditional branches into real
/// jumps between blocks as their targets become available.
pub struct JitTranslator {
    arena: ExecutableMemoryArena,
    blocks: BTreeMap<u64, CompiledBlock>,
    /// Target address -> list of `(owner block start, chain tail offset)`
    /// waiting for a block at that address to exist.
    pending: HashMap<u64, Vec<(u64, usize)>>,
    pub chaining_enabled: bool,
    pub stats: JitStats,
}

impl JitTranslator {
    pub fn new(chaining_enabled: bool) -> Self {
        JitTranslator {
            arena: ExecutableMemoryArena::new(),
            blocks: BTreeMap::new(),
            pending: HashMap::new(),
            chaining_enabled,
            stats: JitStats::default(),
        }
    }

    pub fn is_compiled(&self, addr: u64) -> bool {
        self.blocks.contains_key(&addr)
    }

    /// Compile a basic block of `insts`, spanning guest bytes
    /// `[addr, end_addr)`, and insert it into the cache keyed by `addr`.
    /// The caller (the dispatcher) is responsible for having already
    /// split the instruction stream at block boundaries — branches,
    /// syscalls, and the `MAX_ITERATIONS_PER_STEP` cutoff for REP strings
    /// all end a block one level up.
    pub fn compile(&mut self, addr: u64, insts: Vec<DecodedInst>, end_addr: u64) {
        let insts = insts.into_boxed_slice();
        let mut buf = CodeBuffer::new();

        buf.push_reg(Reg::Rbx);
        buf.push_reg(Reg::R12);
        buf.mov_reg_reg(Reg::Rbx, Reg::Rdi);
        buf.mov_reg_reg(Reg::R12, Reg::Rsi);

        let trampoline_addr = trampoline as usize as u64;
        let mut trap_jumps = Vec::with_capacity(insts.len());

        for inst in insts.iter() {
            let inst_ptr = inst as *const DecodedInst as u64;
            buf.mov_reg_reg(Reg::Rdi, Reg::Rbx);
            buf.mov_reg_reg(Reg::Rsi, Reg::R12);
            buf.mov_reg_imm64(Reg::Rdx, inst_ptr);
            buf.mov_reg_imm64(Reg::Rax, trampoline_addr);
            buf.call_reg(Reg::Rax);
            buf.test_eax_eax();
            trap_jumps.push(buf.jnz_rel32_placeholder());
        }

        buf.pop_reg(Reg::R12);
        buf.pop_reg(Reg::Rbx);
        let chain_tail_offset = buf.len();
        buf.mov_eax_imm32(0);
        buf.ret();
        assert_eq!(buf.len() - chain_tail_offset, CHAIN_TAIL_LEN);

        let trap_exit_offset = buf.len();
        buf.pop_reg(Reg::R12);
        buf.pop_reg(Reg::Rbx);
        buf.mov_eax_imm32(1);
        buf.ret();

        for at in trap_jumps {
            buf.patch_rel32(at, trap_exit_offset);
        }

        let code = buf.finish();
        let mem_block = self
            .arena
            .allocate(code.len() as u32)
            .expect("executable memory arena exhausted");
        self.arena.install(&mem_block, &code);

        let chain_patch = unconditional_target(&insts).map(|target| (chain_tail_offset, target));

        self.blocks.insert(
            addr,
            CompiledBlock { start: addr, end: end_addr, block: mem_block, insts, chain_patch },
        );
        self.stats.blocks_compiled += 1;

        if let Some(waiters) = self.pending.remove(&addr) {
            let target_ptr = self.blocks[&addr].block.ptr;
            for (owner, offset) in waiters {
                self.patch_chain_site(owner, offset, target_ptr);
            }
        }

        if self.chaining_enabled {
            if let Some((offset, target)) = self.blocks[&addr].chain_patch {
                if let Some(existing) = self.blocks.get(&target) {
                    let target_ptr = existing.block.ptr;
                    self.patch_chain_site(addr, offset, target_ptr);
                } else {
                    self.pending.entry(target).or_default().push((addr, offset));
                }
            }
        }
    }

    fn patch_chain_site(&mut self, owner_start: u64, offset: usize, target_ptr: *mut u8) {
        let Some(owner) = self.blocks.get(&owner_start) else { return };
        let patch_addr = unsafe { owner.block.ptr.add(offset) };
        let rel = target_ptr as i64 - (patch_addr as i64 + 5);
        unsafe { emit::patch_tail_to_jmp(patch_addr, rel as i32) };
    }

    /// Run the compiled block at `addr`. Panics if no such block exists —
    /// callers must `compile` first, same contract as the interpreter's
    /// `step` expecting an already-decoded instruction.
    pub fn run(&mut self, cpu: &mut CpuState, mmu: &AddressSpace) -> BlockOutcome {
        let addr = cpu.rip();
        let entry_ptr = self.blocks.get(&addr).expect("block not compiled").block.ptr;
        let entry: BlockEntry = unsafe { std::mem::transmute(entry_ptr as *const ()) };
        let code = entry(cpu as *mut CpuState, mmu as *const AddressSpace);
        if code == 0 {
            BlockOutcome::Fallthrough(cpu.rip())
        } else {
            let trap = LAST_TRAP
                .with(|cell| cell.take())
                .expect("trampoline signalled a trap without recording one");
            self.stats.record_exit(exit_kind_of(&trap));
            BlockOutcome::Trap(trap)
        }
    }

    /// Drop every compiled block overlapping `[start, start+len)`,
    /// reclaiming its memory. Called whenever the MMU removes executable
    /// permission from guest pages (`munmap`, `mprotect` dropping `X`) so a
    /// stale translation can never run against changed guest code.
    pub fn invalidate_range(&mut self, start: u64, len: u64) {
        let end = start.saturating_add(len);
        let stale: Vec<u64> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.start < end && start < b.end)
            .map(|(&addr, _)| addr)
            .collect();
        for addr in stale {
            if let Some(b) = self.blocks.remove(&addr) {
                self.arena.free(b.block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::OperandSize;
    use crate::instruction::PrefixState;

    fn nop_at(addr: u64) -> DecodedInst {
        DecodedInst {
            length: 1,
            op: Mnemonic::Nop,
            operand_size: OperandSize::Qword,
            address_size: OperandSize::Qword,
            operands: [Operand::None; 3],
            operand_count: 0,
            prefix: PrefixState::default(),
            addr,
        }
    }

    fn jmp_at(addr: u64, target: u64) -> DecodedInst {
        DecodedInst {
            length: 5,
            op: Mnemonic::Jmp,
            operand_size: OperandSize::Qword,
            address_size: OperandSize::Qword,
            operands: [Operand::RelativeTarget(target), Operand::None, Operand::None],
            operand_count: 1,
            prefix: PrefixState::default(),
            addr,
        }
    }

    #[test]
    fn compiling_a_block_populates_the_cache() {
        let mut jit = JitTranslator::new(true);
        jit.compile(0x1000, vec![nop_at(0x1000)], 0x1001);
        assert!(jit.is_compiled(0x1000));
        assert_eq!(jit.stats.blocks_compiled, 1);
    }

    #[test]
    fn nop_block_runs_and_falls_through() {
        let mut jit = JitTranslator::new(false);
        jit.compile(0x1000, vec![nop_at(0x1000)], 0x1001);
        let mut cpu = CpuState::new(0x1000, 0x20000);
        let mmu = AddressSpace::new(0x10_0000);
        match jit.run(&mut cpu, &mmu) {
            BlockOutcome::Fallthrough(next) => assert_eq!(next, 0x1001),
            BlockOutcome::Trap(t) => panic!("unexpected trap: {t:?}"),
        }
    }

    #[test]
    fn syscall_block_traps_with_rip_unchanged() {
        let inst = DecodedInst {
            length: 2,
            op: Mnemonic::Syscall,
            operand_size: OperandSize::Qword,
            address_size: OperandSize::Qword,
            operands: [Operand::None; 3],
            operand_count: 0,
            prefix: PrefixState::default(),
            addr: 0x2000,
        };
        let mut jit = JitTranslator::new(false);
        jit.compile(0x2000, vec![inst], 0x2002);
        let mut cpu = CpuState::new(0x2000, 0x20000);
        let mmu = AddressSpace::new(0x10_0000);
        match jit.run(&mut cpu, &mmu) {
            BlockOutcome::Trap(GuestTrap::Syscall) => {}
            BlockOutcome::Trap(other) => panic!("expected Syscall trap, got {other:?}"),
            BlockOutcome::Fallthrough(_) => panic!("expected a trap"),
        }
    }

    #[test]
    fn unconditional_jmp_chains_once_target_exists() {
        let mut jit = JitTranslator::new(true);
        jit.compile(0x3000, vec![jmp_at(0x3000, 0x4000)], 0x3005);
        assert!(jit.pending.contains_key(&0x4000));
        jit.compile(0x4000, vec![nop_at(0x4000)], 0x4001);
        assert!(jit.pending.get(&0x4000).map_or(true, |v| v.is_empty()));
    }

    #[test]
    fn invalidate_range_drops_overlapping_blocks() {
        let mut jit = JitTranslator::new(false);
        jit.compile(0x1000, vec![nop_at(0x1000)], 0x1001);
        jit.invalidate_range(0x1000, 0x10);
        assert!(!jit.is_compiled(0x1000));
    }
}
