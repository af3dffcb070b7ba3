//! The disassembler collaborator's interface.
//!
//! Decoding x86-64 byte streams into [`DecodedInst`] values is explicitly
//! out of scope for this crate (see the top-level design notes) — the core
//! only specifies what it consumes. `emu_disasm` ships a concrete
//! implementation of this trait; tests and the JIT translator program
//! against the trait so any conforming decoder can be swapped in.

use crate::instruction::DecodedInst;

/// Result of decoding as much of `bytes` as forms complete instructions.
pub struct DisasmBatch {
    /// Successfully decoded instructions, in address order.
    pub instructions: Vec<DecodedInst>,
    /// Number of leading bytes of `bytes` actually consumed.
    pub consumed: usize,
    /// Guest address immediately following the last decoded instruction.
    pub next_addr: u64,
}

/// Decodes a byte range into a stream of instructions.
pub trait Disassembler {
    /// Decode instructions starting at `addr` from `bytes`.
    ///
    /// Implementations should decode greedily until either `bytes` is
    /// exhausted, an undecodable byte sequence is hit, or `max_instructions`
    /// (if `Some`) is reached — whichever comes first. Returning zero
    /// instructions with `consumed == 0` signals an undecodable prefix at
    /// `addr`; the caller (interpreter) turns that into `GuestTrap::UndefinedOpcode`.
    fn disassemble_range(
        &self,
        bytes: &[u8],
        addr: u64,
        max_instructions: Option<usize>,
    ) -> DisasmBatch;

    /// Decode exactly one instruction at `addr`, or `None` if `bytes` does
    /// not contain a complete, valid encoding.
    fn disassemble_one(&self, bytes: &[u8], addr: u64) -> Option<DecodedInst> {
        let batch = self.disassemble_range(bytes, addr, Some(1));
        batch.instructions.into_iter().next()
    }
}
