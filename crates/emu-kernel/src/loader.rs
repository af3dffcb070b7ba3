//! The ELF-loader collaborator interface.
//!
//! Parsing an ELF image and building its initial mappings is explicitly out
//! of scope for this crate (the disassembler gets the same treatment in
//! `emu_core::disasm`): `emu-cli` ships a concrete implementation backed by
//! a real ELF parser, and `execve` programs against this trait so the
//! kernel layer never has to know what an ELF header looks like.

use std::sync::Arc;

use emu_core::mmu::AddressSpace;

use crate::error::Errno;

/// Where the newly loaded image left the guest ready to run.
pub struct ExecImage {
    pub entry: u64,
    /// Top of the brk-growable heap established just past the image.
    pub initial_brk: u64,
    /// Top of the stack, with argv/envp/auxv already pushed per the ELF
    /// ABI's initial-stack contract.
    pub stack_top: u64,
}

/// Resolves a guest path plus argv/envp into mappings installed in `mmu`
/// and the resulting entry/stack state, standing in for the out-of-scope
/// ELF loader + auxiliary-vector builder (§6 "Consumes from collaborators").
pub trait ProgramLoader: Send + Sync {
    fn load(&self, path: &str, argv: &[String], envp: &[String], mmu: &mut AddressSpace) -> Result<ExecImage, Errno>;

    /// Where `brk` starts for `path`, without touching an `AddressSpace`.
    ///
    /// `AddressSpace::new` fixes `brk_start` at construction, but the
    /// correct value is only knowable after walking the image's program
    /// headers — a circular dependency both the initial exec (in `emu-cli`)
    /// and `execve` (here) resolve the same way: call this first to size
    /// the fresh `AddressSpace`, then `load` into it.
    fn plan_brk(&self, path: &str) -> Result<u64, Errno>;
}

/// A loader that always fails with `ENOEXEC`; the default when no real
/// loader has been wired in (e.g. in kernel-layer unit tests that never
/// reach `execve`).
pub struct UnsupportedLoader;

impl ProgramLoader for UnsupportedLoader {
    fn load(&self, _path: &str, _argv: &[String], _envp: &[String], _mmu: &mut AddressSpace) -> Result<ExecImage, Errno> {
        Err(Errno(-libc::ENOEXEC))
    }

    fn plan_brk(&self, _path: &str) -> Result<u64, Errno> {
        Err(Errno(-libc::ENOEXEC))
    }
}

pub fn unsupported() -> Arc<dyn ProgramLoader> {
    Arc::new(UnsupportedLoader)
}
