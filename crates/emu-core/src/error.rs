//! Guest trap types for the CPU core.
//!
//! A `GuestTrap` is raised by the interpreter, the JIT's exit stubs, or the
//! MMU when guest execution hits something the emulator can't just compute
//! through: an illegal opcode, a faulting memory access, a divide by zero,
//! or a normal `syscall`/`ret`-to-nothing control exit. The scheduler turns
//! these into guest-visible signals (or thread termination); they are never
//! a host-side bug by themselves. See `emu_kernel::verify` for the separate
//! "this should be unreachable" tier that *does* abort the process.

use std::fmt;

/// Something the CPU core could not continue past without help from the
/// kernel (signal delivery, syscall dispatch, or thread teardown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestTrap {
    /// Attempted to execute an undefined or unsupported opcode (SIGILL).
    UndefinedOpcode(u8),
    /// Guest accessed memory with insufficient permission, or a wholly
    /// unmapped page (SIGSEGV).
    Segv { addr: u64, write: bool },
    /// Integer division by zero or division overflow (SIGFPE).
    DivideByZero,
    /// `RIP` is outside the canonical 48-bit range after a branch (SIGSEGV).
    NonCanonicalRip(u64),
    /// Guest executed the `syscall` instruction; RAX holds the number.
    Syscall,
    /// Guest executed `int3` (SIGTRAP).
    Breakpoint,
    /// The basic block ended in an indirect control transfer the JIT could
    /// not resolve statically; control returns to the interpreter/dispatcher.
    IndirectExit { kind: ExitKind, target: u64 },
    /// Guest executed `hlt` with no pending event — terminates the thread.
    Halted,
}

/// Why a translated block (or the interpreter, treated uniformly) handed
/// control back to the dispatcher instead of chaining to another block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKind {
    Ret,
    CallIndirect,
    JmpIndirect,
    Syscall,
    Fault,
    Interpreted,
}

impl fmt::Display for GuestTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestTrap::UndefinedOpcode(op) => write!(f, "SIGILL: undefined opcode 0x{op:02x}"),
            GuestTrap::Segv { addr, write } => write!(
                f,
                "SIGSEGV: {} at 0x{addr:016x}",
                if *write { "write" } else { "read/fetch" }
            ),
            GuestTrap::DivideByZero => write!(f, "SIGFPE: divide by zero"),
            GuestTrap::NonCanonicalRip(rip) => write!(f, "SIGSEGV: non-canonical RIP 0x{rip:016x}"),
            GuestTrap::Syscall => write!(f, "syscall trap"),
            GuestTrap::Breakpoint => write!(f, "SIGTRAP: breakpoint"),
            GuestTrap::IndirectExit { kind, target } => {
                write!(f, "indirect exit ({kind:?}) to 0x{target:016x}")
            }
            GuestTrap::Halted => write!(f, "CPU halted"),
        }
    }
}

impl std::error::Error for GuestTrap {}

pub type Result<T> = std::result::Result<T, GuestTrap>;
