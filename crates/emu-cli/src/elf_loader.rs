//! Concrete [`ProgramLoader`]: parses an ELF64 executable with `goblin`,
//! installs its `PT_LOAD` segments into the guest address space, and
//! builds the initial stack (argv/envp/auxv) per the System V x86-64 ABI.
//!
//! Out of scope, same as the interpreter treats opcode decoding: a dynamic
//! loader (PT_INTERP / resolving shared objects) is not implemented —
//! every program this loader runs must be statically linked, matching the
//! "dynamic linking is out of scope" non-goal. `PT_DYNAMIC`/`PT_INTERP`
//! segments are simply ignored rather than rejected, so a statically
//! linked PIE still loads.

use std::sync::Arc;

use emu_core::mmu::page::Prot;
use emu_core::mmu::{AddressSpace, MapFlags};
use goblin::elf::{program_header::PT_LOAD, Elf};

use emu_kernel::loader::{ExecImage, ProgramLoader};
use emu_kernel::Errno;

/// Base address a statically linked PIE (`ET_DYN`) gets relocated to.
/// Mirrors the fixed, ASLR-free base real `qemu-user` and similar
/// emulators use for a non-randomized "personality(ADDR_NO_RANDOMIZE)".
const PIE_BASE: u64 = 0x0000_5555_5555_0000;
const STACK_TOP: u64 = 0x0000_7fff_fff0_0000;
const STACK_SIZE: u64 = 8 * 1024 * 1024;
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;
const AT_SECURE: u64 = 23;
const AT_RANDOM: u64 = 25;
const AT_EXECFN: u64 = 31;
const AT_PLATFORM: u64 = 15;

pub struct ElfLoader;

impl ProgramLoader for ElfLoader {
    /// Highest mapped address across a binary's `PT_LOAD` segments, one page
    /// past which `brk` starts. Needed before an `AddressSpace` exists (it
    /// is constructed with `brk_start` fixed up front), so this is a pure
    /// header walk with no `AddressSpace` to write into — [`Self::load`]
    /// below redoes the same walk once the real mappings are installed,
    /// trading a second small parse of the same file for not needing a
    /// second, throwaway `AddressSpace`.
    fn plan_brk(&self, path: &str) -> Result<u64, Errno> {
        let bytes = std::fs::read(path).map_err(|_| Errno::ENOENT)?;
        let elf = Elf::parse(&bytes).map_err(|_| Errno::EINVAL)?;
        let base = if elf.header.e_type == goblin::elf::header::ET_DYN { PIE_BASE } else { 0 };
        let highest = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| {
                let vaddr = base + ph.p_vaddr;
                let page_off = vaddr & (PAGE_SIZE - 1);
                vaddr - page_off + (ph.p_memsz + page_off).div_ceil(PAGE_SIZE) * PAGE_SIZE
            })
            .max()
            .unwrap_or(base);
        Ok(highest.div_ceil(PAGE_SIZE) * PAGE_SIZE + PAGE_SIZE)
    }

    fn load(&self, path: &str, argv: &[String], envp: &[String], mmu: &mut AddressSpace) -> Result<ExecImage, Errno> {
        let bytes = std::fs::read(path).map_err(|_| Errno::ENOENT)?;
        let elf = Elf::parse(&bytes).map_err(|_| Errno::EINVAL)?;
        if !elf.is_64 || elf.header.e_machine != goblin::elf::header::EM_X86_64 {
            return Err(Errno(-libc::ENOEXEC));
        }

        let base = if elf.header.e_type == goblin::elf::header::ET_DYN { PIE_BASE } else { 0 };
        let mut highest = 0u64;

        for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
            let vaddr = base + ph.p_vaddr;
            let page_off = vaddr & (PAGE_SIZE - 1);
            let map_addr = vaddr - page_off;
            let map_len = (ph.p_memsz + page_off).div_ceil(PAGE_SIZE) * PAGE_SIZE;
            let prot = Prot {
                r: ph.p_flags & goblin::elf::program_header::PF_R != 0,
                w: ph.p_flags & goblin::elf::program_header::PF_W != 0,
                x: ph.p_flags & goblin::elf::program_header::PF_X != 0,
            };
            // Always map RW first so the file contents (and the zero-fill
            // tail for .bss, when p_memsz > p_filesz) can be written
            // through before dropping to the segment's real permissions —
            // mirrors how a host `mmap` + `mprotect` pair would load it.
            mmu.mmap(map_addr, map_len, Prot::RW, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None)
                .map_err(|_| Errno::ENOMEM)?;

            if ph.p_filesz > 0 {
                let range = ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize;
                let data = bytes.get(range).ok_or(Errno::EINVAL)?;
                mmu.write_bytes(vaddr, data).map_err(|_| Errno::EFAULT)?;
            }

            if !prot.w {
                mmu.mprotect(map_addr, map_len, prot).map_err(|_| Errno::EACCES)?;
            }

            highest = highest.max(map_addr + map_len);
        }

        let entry = base + elf.header.e_entry;
        let initial_brk = highest.div_ceil(PAGE_SIZE) * PAGE_SIZE + PAGE_SIZE;

        let phdr_addr = elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == goblin::elf::program_header::PT_PHDR)
            .map(|ph| base + ph.p_vaddr)
            .unwrap_or(base + elf.header.e_phoff);

        let stack_top = build_stack(
            mmu,
            path,
            argv,
            envp,
            &[
                (AT_PHDR, phdr_addr),
                (AT_PHENT, elf.header.e_phentsize as u64),
                (AT_PHNUM, elf.header.e_phnum as u64),
                (AT_PAGESZ, PAGE_SIZE),
                (AT_BASE, if base != 0 { base } else { 0 }),
                (AT_ENTRY, entry),
                (AT_UID, 0),
                (AT_EUID, 0),
                (AT_GID, 0),
                (AT_EGID, 0),
                (AT_SECURE, 0),
            ],
        )?;

        Ok(ExecImage { entry, initial_brk, stack_top })
    }
}

const PAGE_SIZE: u64 = emu_core::mmu::page::PAGE_SIZE;

/// Lays out the initial stack per the x86-64 System V ABI: string data
/// (argv/envp/platform name/16 "random" bytes) at the bottom, then argc,
/// argv[]="NULL", envp[]="NULL", auxv pairs, terminated by `AT_NULL`, with
/// the final `rsp` 16-byte aligned as `_start` expects.
fn build_stack(
    mmu: &mut AddressSpace,
    execfn: &str,
    argv: &[String],
    envp: &[String],
    auxv_fixed: &[(u64, u64)],
) -> Result<u64, Errno> {
    let stack_base = STACK_TOP - STACK_SIZE;
    mmu.mmap(stack_base, STACK_SIZE, Prot::RW, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None)
        .map_err(|_| Errno::ENOMEM)?;

    let mut sp = STACK_TOP;
    let mut write_str = |mmu: &mut AddressSpace, s: &[u8]| -> Result<u64, Errno> {
        sp -= (s.len() + 1) as u64;
        mmu.write_bytes(sp, s).map_err(|_| Errno::EFAULT)?;
        mmu.write8(sp + s.len() as u64, 0).map_err(|_| Errno::EFAULT)?;
        Ok(sp)
    };

    let random_bytes = [0x42u8; 16];
    let random_addr = { sp -= 16; mmu.write_bytes(sp, &random_bytes).map_err(|_| Errno::EFAULT)?; sp };
    let platform_addr = write_str(mmu, b"x86_64")?;
    let execfn_addr = write_str(mmu, execfn.as_bytes())?;
    let argv_addrs: Vec<u64> = argv.iter().map(|s| write_str(mmu, s.as_bytes())).collect::<Result<_, _>>()?;
    let envp_addrs: Vec<u64> = envp.iter().map(|s| write_str(mmu, s.as_bytes())).collect::<Result<_, _>>()?;

    let mut auxv: Vec<(u64, u64)> = auxv_fixed.to_vec();
    auxv.push((AT_RANDOM, random_addr));
    auxv.push((AT_PLATFORM, platform_addr));
    auxv.push((AT_EXECFN, execfn_addr));
    auxv.push((AT_NULL, 0));

    // Total pushed words: argc, argv ptrs, NULL, envp ptrs, NULL, auxv
    // pairs (2 words each). Pad so the final entry point sees a 16-byte
    // aligned rsp, matching _start's `and rsp, -16` expectation removed
    // by one pushed return address (there is none here, so align to 16).
    let word_count = 1 + argv_addrs.len() + 1 + envp_addrs.len() + 1 + auxv.len() * 2;
    sp &= !0xF;
    if (word_count % 2) == 1 {
        sp -= 8;
    }

    let mut push = |mmu: &mut AddressSpace, val: u64| -> Result<(), Errno> {
        sp -= 8;
        mmu.write64(sp, val).map_err(|_| Errno::EFAULT)
    };

    for (key, val) in auxv.into_iter().rev() {
        push(mmu, val)?;
        push(mmu, key)?;
    }
    push(mmu, 0)?;
    for addr in envp_addrs.iter().rev() {
        push(mmu, *addr)?;
    }
    push(mmu, 0)?;
    for addr in argv_addrs.iter().rev() {
        push(mmu, *addr)?;
    }
    push(mmu, argv_addrs.len() as u64)?;

    Ok(sp)
}

pub fn loader() -> Arc<dyn ProgramLoader> {
    Arc::new(ElfLoader)
}
