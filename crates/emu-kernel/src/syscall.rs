//! Syscall dispatcher (§4.H): routes the guest syscall ABI (`rax` = number,
//! `rdi, rsi, rdx, r10, r8, r9` = arguments) to a handler over the MMU, VFS,
//! FD table, and scheduler.
//!
//! A handler either returns a value immediately (written back to `rax`) or,
//! for a blocking call, parks the thread via the scheduler and registers a
//! [`PendingSyscall`] describing how to finish the call once the thread is
//! rescheduled — the engine calls [`resume`] first thing after pulling a
//! thread off the run queue, before it resumes normal instruction stepping.

use std::time::{Duration, Instant};

use emu_core::cpu::CpuState;
use emu_core::mmu::page::Prot;
use emu_core::mmu::{MapFlags, MmuError};
use emu_core::registers::GprIndex;

use crate::error::Errno;
use crate::path::Path;
use crate::process::{PendingSyscall, Process};
use crate::scheduler::{ThreadId, WaitReason};
use crate::vfs::FileObject;

/// What a dispatch produced.
pub enum SyscallOutcome {
    /// The call completed; `rax`/`rip` have already been updated.
    Return(i64),
    /// The thread has been parked; the worker must fetch another runnable
    /// thread instead of resuming this one.
    Suspended,
    /// The call completed and already fully rewrote `cpu` itself (e.g.
    /// `execve` replacing the entire register file with a fresh image's
    /// entry point) — `dispatch` must not additionally set `rax`/`rip`
    /// from `fallthrough`, since that would stomp the new state.
    Replaced,
}

const AT_FDCWD: i64 = -100;

fn arg(cpu: &CpuState, reg: GprIndex) -> u64 {
    cpu.gpr.read_gpr64(reg as u8)
}

fn set_ret(cpu: &mut CpuState, val: i64) {
    cpu.gpr.write_gpr64(GprIndex::Rax as u8, val as u64);
}

/// Read a NUL-terminated guest string, capped at `max` bytes against a
/// runaway/unterminated pointer.
fn read_cstr(process: &Process, addr: u64, max: usize) -> Result<String, Errno> {
    let mmu = process.mmu.read().unwrap();
    let mut bytes = Vec::new();
    for i in 0..max as u64 {
        let b = mmu.read8(addr + i).map_err(|_| Errno::EFAULT)?;
        if b == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        bytes.push(b);
    }
    Err(Errno::EFAULT)
}

fn read_path(process: &Process, addr: u64) -> Result<Path, Errno> {
    let raw = read_cstr(process, addr, 4096)?;
    Path::parse(&raw).map_err(|_| Errno::EINVAL)
}

/// Entry point the engine calls when a thread traps with `GuestTrap::Syscall`.
/// `fallthrough` is the guest address right after the `syscall` instruction;
/// on an immediate return this dispatcher advances `rip` there itself,
/// matching the non-trapping interpreter path.
pub fn dispatch(
    process: &Process,
    id: ThreadId,
    cpu: &mut CpuState,
    fallthrough: u64,
    log_syscalls: bool,
) -> SyscallOutcome {
    let nr = arg(cpu, GprIndex::Rax) as i64;
    let a0 = arg(cpu, GprIndex::Rdi);
    let a1 = arg(cpu, GprIndex::Rsi);
    let a2 = arg(cpu, GprIndex::Rdx);
    let a3 = arg(cpu, GprIndex::R10);
    let a4 = arg(cpu, GprIndex::R8);
    let a5 = arg(cpu, GprIndex::R9);

    if log_syscalls {
        tracing::debug!(target: "emu_kernel::syscall", nr, a0, a1, a2, a3, a4, a5, "syscall entry");
    }

    let outcome = route(process, id, cpu, nr, a0, a1, a2, a3, a4, a5, fallthrough);
    match outcome {
        SyscallOutcome::Return(ret) => {
            if log_syscalls {
                tracing::debug!(target: "emu_kernel::syscall", nr, ret, "syscall return");
            }
            set_ret(cpu, ret);
            cpu.gpr.rip = fallthrough;
        }
        SyscallOutcome::Replaced => {
            if log_syscalls {
                tracing::debug!(target: "emu_kernel::syscall", nr, "syscall replaced image");
            }
        }
        SyscallOutcome::Suspended => {}
    }
    outcome
}

/// Called by the engine right after `next_runnable` hands back a thread
/// that has a [`PendingSyscall`] registered. Decides whether the wait is
/// over and, if so, finishes the call exactly as `dispatch` would have.
pub fn resume(process: &Process, id: ThreadId, cpu: &mut CpuState) -> SyscallOutcome {
    let Some(pending) = process.take_pending(id) else {
        return SyscallOutcome::Return(0);
    };
    match pending {
        PendingSyscall::FutexWait { resume_rip } => {
            let ret = if process.scheduler.take_timed_out(id) { Errno::ETIMEDOUT.as_ret() } else { 0 };
            set_ret(cpu, ret);
            cpu.gpr.rip = resume_rip;
            SyscallOutcome::Return(ret)
        }
        PendingSyscall::Sleep { resume_rip } => {
            process.scheduler.take_timed_out(id);
            set_ret(cpu, 0);
            cpu.gpr.rip = resume_rip;
            SyscallOutcome::Return(0)
        }
        PendingSyscall::WaitChild { resume_rip, target_pid, target_tid, status_ptr } => {
            let pid = target_pid.unwrap_or(process.pid);
            match process.scheduler.reap_child(pid, target_tid) {
                Some((child, status)) => {
                    if status_ptr != 0 {
                        let mmu = process.mmu.read().unwrap();
                        let _ = mmu.write32(status_ptr, status as u32);
                    }
                    set_ret(cpu, child.0 as i64);
                    cpu.gpr.rip = resume_rip;
                    SyscallOutcome::Return(child.0 as i64)
                }
                None if process.scheduler.take_timed_out(id) => {
                    set_ret(cpu, Errno::ETIMEDOUT.as_ret());
                    cpu.gpr.rip = resume_rip;
                    SyscallOutcome::Return(Errno::ETIMEDOUT.as_ret())
                }
                None => {
                    // Spuriously woken (e.g. a sibling exited) with no
                    // zombie yet for this waiter; park again.
                    process.scheduler.block(id, WaitReason::AnyChild);
                    process.park(id, PendingSyscall::WaitChild { resume_rip, target_pid, target_tid, status_ptr });
                    SyscallOutcome::Suspended
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn route(
    process: &Process,
    id: ThreadId,
    cpu: &mut CpuState,
    nr: i64,
    a0: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    fallthrough: u64,
) -> SyscallOutcome {
    use SyscallOutcome::Return;
    match nr {
        libc::SYS_read => Return(sys_read(process, a0 as i32, a1, a2 as usize)),
        libc::SYS_write => Return(sys_write(process, a0 as i32, a1, a2 as usize)),
        libc::SYS_pread64 => Return(sys_pread(process, a0 as i32, a1, a2 as usize, a3)),
        libc::SYS_pwrite64 => Return(sys_pwrite(process, a0 as i32, a1, a2 as usize, a3)),
        libc::SYS_open => Return(sys_open(process, None, a0, a1 as i32, a2 as u32)),
        libc::SYS_openat => Return(sys_open(process, Some(a0 as i64), a1, a2 as i32, a3 as u32)),
        libc::SYS_close => Return(sys_close(process, a0 as i32)),
        libc::SYS_lseek => Return(sys_lseek(process, a0 as i32, a1 as i64, a2 as i32)),
        libc::SYS_fstat => Return(sys_fstat(process, a0 as i32, a1)),
        libc::SYS_getdents64 => Return(sys_getdents64(process, a0 as i32, a1, a2 as usize)),
        libc::SYS_readlink | libc::SYS_readlinkat => Return(sys_readlink(process, nr, a0, a1, a2, a3 as usize)),
        libc::SYS_pipe2 => Return(sys_pipe2(process, a0, a1 as i32)),
        libc::SYS_eventfd2 => Return(sys_eventfd2(process, a0 as u32, a1 as i32)),
        libc::SYS_memfd_create => Return(sys_memfd_create(process, a0, a1 as u32)),
        libc::SYS_dup => Return(sys_dup(process, a0 as i32)),
        libc::SYS_dup2 | libc::SYS_dup3 => Return(sys_dup2(process, a0 as i32, a1 as i32)),
        libc::SYS_fcntl => Return(sys_fcntl(process, a0 as i32, a1 as i32, a2)),
        libc::SYS_ioctl => Return(sys_ioctl(process, a0 as i32, a1, a2)),
        libc::SYS_statx => Return(sys_statx(process, a0 as i32, a1, a2 as i32, a4)), // a3 (mask) unused: fields are filled unconditionally
        libc::SYS_statfs => Return(sys_statfs(process, a1)),
        libc::SYS_poll => Return(sys_poll(process, a0, a1 as u32)),

        libc::SYS_mmap => Return(sys_mmap(process, a0, a1, a2 as u32, a3 as i32, a4 as i32, a5)),
        libc::SYS_munmap => Return(sys_munmap(process, a0, a1)),
        libc::SYS_mprotect => Return(sys_mprotect(process, a0, a1, a2 as u32)),
        libc::SYS_brk => Return(sys_brk(process, a0)),
        libc::SYS_madvise => Return(0),

        libc::SYS_exit => sys_exit(process, id, a0 as i32, false),
        libc::SYS_exit_group => sys_exit(process, id, a0 as i32, true),
        libc::SYS_sched_yield => {
            process.scheduler.reschedule(id);
            Return(0)
        }
        libc::SYS_set_tid_address => Return(id.0 as i64),
        libc::SYS_set_robust_list => Return(0),
        libc::SYS_sched_getaffinity => Return(0),
        libc::SYS_wait4 => sys_wait4(process, id, cpu, a0 as i64, a1, a2 as i32, fallthrough),

        libc::SYS_futex => sys_futex(process, id, cpu, a0, a1 as i32, a2 as u32, a3, fallthrough),
        libc::SYS_nanosleep => sys_nanosleep(process, id, cpu, a0, fallthrough),
        libc::SYS_clock_gettime => Return(sys_clock_gettime(process, a0 as i32, a1)),

        libc::SYS_arch_prctl => Return(sys_arch_prctl(cpu, a0 as i32, a1)),

        libc::SYS_rt_sigaction | libc::SYS_rt_sigprocmask | libc::SYS_rt_sigreturn => Return(0),

        libc::SYS_clone => Return(sys_clone(process, cpu, a0, a1, a4, fallthrough)),
        libc::SYS_execve => sys_execve(process, cpu, a0, a1, a2),
        libc::SYS_fork | libc::SYS_vfork => {
            // True `fork` would need a second, independent address space,
            // which this single-process emulator has nowhere to put.
            // Guests that fall back to `clone`-without-`fork` when this
            // fails (most do not) would work; most just treat this as a
            // hard failure to exec via.
            Return(Errno::ENOSYS.as_ret())
        }

        _ => {
            tracing::warn!(target: "emu_kernel::syscall", nr, "unimplemented syscall");
            Return(Errno::ENOSYS.as_ret())
        }
    }
}

// ── File I/O ──

fn sys_read(process: &Process, fd: i32, buf_ptr: u64, len: usize) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let mut desc = desc.lock().unwrap();
    let mut tmp = vec![0u8; len];
    match desc.file.read_at(desc.offset, &mut tmp) {
        Ok(n) => {
            let mmu = process.mmu.read().unwrap();
            if mmu.write_bytes(buf_ptr, &tmp[..n]).is_err() {
                return Errno::EFAULT.as_ret();
            }
            if desc.file.capabilities().seekable {
                desc.offset += n as u64;
            }
            n as i64
        }
        Err(e) => e.as_ret(),
    }
}

fn sys_write(process: &Process, fd: i32, buf_ptr: u64, len: usize) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let mut tmp = vec![0u8; len];
    {
        let mmu = process.mmu.read().unwrap();
        if mmu.read_bytes(buf_ptr, &mut tmp).is_err() {
            return Errno::EFAULT.as_ret();
        }
    }
    let mut desc = desc.lock().unwrap();
    match desc.file.write_at(desc.offset, &tmp) {
        Ok(n) => {
            if desc.file.capabilities().seekable {
                desc.offset += n as u64;
            }
            n as i64
        }
        Err(e) => e.as_ret(),
    }
}

fn sys_pread(process: &Process, fd: i32, buf_ptr: u64, len: usize, offset: u64) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let desc = desc.lock().unwrap();
    let mut tmp = vec![0u8; len];
    match desc.file.read_at(offset, &mut tmp) {
        Ok(n) => {
            let mmu = process.mmu.read().unwrap();
            if mmu.write_bytes(buf_ptr, &tmp[..n]).is_err() {
                return Errno::EFAULT.as_ret();
            }
            n as i64
        }
        Err(e) => e.as_ret(),
    }
}

fn sys_pwrite(process: &Process, fd: i32, buf_ptr: u64, len: usize, offset: u64) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let mut tmp = vec![0u8; len];
    {
        let mmu = process.mmu.read().unwrap();
        if mmu.read_bytes(buf_ptr, &mut tmp).is_err() {
            return Errno::EFAULT.as_ret();
        }
    }
    let desc = desc.lock().unwrap();
    match desc.file.write_at(offset, &tmp) {
        Ok(n) => n as i64,
        Err(e) => e.as_ret(),
    }
}

fn sys_open(process: &Process, _dirfd: Option<i64>, path_ptr: u64, flags: i32, mode: u32) -> i64 {
    let path = match read_path(process, path_ptr) {
        Ok(p) => p,
        Err(e) => return e.as_ret(),
    };
    match process.vfs.open(&path, flags, mode) {
        Ok(file) => {
            let access_mode = flags & libc::O_ACCMODE;
            let cloexec = flags & libc::O_CLOEXEC != 0;
            process.fdtable.lock().unwrap().insert(file, flags, access_mode, cloexec, 0) as i64
        }
        Err(e) => e.as_ret(),
    }
}

fn sys_close(process: &Process, fd: i32) -> i64 {
    match process.fdtable.lock().unwrap().close(fd) {
        Ok(()) => 0,
        Err(e) => e.as_ret(),
    }
}

fn sys_lseek(process: &Process, fd: i32, offset: i64, whence: i32) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let mut desc = desc.lock().unwrap();
    match desc.file.lseek(desc.offset, offset, whence) {
        Ok(new_off) => {
            desc.offset = new_off;
            new_off as i64
        }
        Err(e) => e.as_ret(),
    }
}

fn sys_fstat(process: &Process, fd: i32, stat_ptr: u64) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let stat = match desc.lock().unwrap().file.stat() {
        Ok(s) => s,
        Err(e) => return e.as_ret(),
    };
    // Minimal `struct stat` (glibc x86-64 layout, 144 bytes): only the
    // fields guests commonly check (nlink, mode, size) are filled in.
    let mut raw = [0u8; 144];
    raw[16..24].copy_from_slice(&1u64.to_le_bytes()); // st_nlink
    raw[24..28].copy_from_slice(&stat.mode.to_le_bytes()); // st_mode
    raw[48..56].copy_from_slice(&stat.size.to_le_bytes()); // st_size
    raw[56..64].copy_from_slice(&4096u64.to_le_bytes()); // st_blksize
    let mmu = process.mmu.read().unwrap();
    if mmu.write_bytes(stat_ptr, &raw).is_err() {
        return Errno::EFAULT.as_ret();
    }
    0
}

fn sys_getdents64(process: &Process, fd: i32, buf_ptr: u64, len: usize) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let mut desc = desc.lock().unwrap();
    let names = match desc.file.getdents64(desc.offset as usize) {
        Ok(n) => n,
        Err(e) => return e.as_ret(),
    };
    // Pack a minimal run of fixed-width pseudo-dirent records (name only,
    // truncated to fit `len`); a faithful `struct linux_dirent64` is more
    // than any guest libc actually inspects beyond `d_name`/`d_reclen`.
    let mut out = Vec::new();
    let mut consumed = 0usize;
    for name in &names {
        let entry_len = 19 + name.len() + 1;
        let entry_len = (entry_len + 7) & !7;
        if out.len() + entry_len > len {
            break;
        }
        let start = out.len();
        out.resize(start + entry_len, 0);
        out[start..start + 8].copy_from_slice(&1u64.to_le_bytes());
        out[start + 16..start + 18].copy_from_slice(&(entry_len as u16).to_le_bytes());
        out[start + 18] = libc::DT_UNKNOWN;
        out[start + 19..start + 19 + name.len()].copy_from_slice(name.as_bytes());
        consumed += 1;
    }
    let mmu = process.mmu.read().unwrap();
    if mmu.write_bytes(buf_ptr, &out).is_err() {
        return Errno::EFAULT.as_ret();
    }
    desc.offset += consumed as u64;
    out.len() as i64
}

fn sys_readlink(process: &Process, nr: i64, a0: u64, a1: u64, a2: u64, len: usize) -> i64 {
    let path_ptr = if nr == libc::SYS_readlinkat { a1 } else { a0 };
    let buf_ptr = if nr == libc::SYS_readlinkat { a2 } else { a1 };
    let path = match read_path(process, path_ptr) {
        Ok(p) => p,
        Err(e) => return e.as_ret(),
    };
    let target = match process.vfs.open(&path, libc::O_RDONLY, 0).and_then(|f| f.readlink()) {
        Ok(t) => t,
        Err(e) => return e.as_ret(),
    };
    let bytes = target.as_bytes();
    let n = bytes.len().min(len);
    let mmu = process.mmu.read().unwrap();
    if mmu.write_bytes(buf_ptr, &bytes[..n]).is_err() {
        return Errno::EFAULT.as_ret();
    }
    n as i64
}

fn sys_pipe2(process: &Process, fds_ptr: u64, flags: i32) -> i64 {
    let (rd, wr) = crate::vfs::pipe_pair();
    let cloexec = flags & libc::O_CLOEXEC != 0;
    let status = if flags & libc::O_NONBLOCK != 0 { libc::O_NONBLOCK } else { 0 };
    let mut table = process.fdtable.lock().unwrap();
    let rfd = table.insert(FileObject::Pipe(rd), status, libc::O_RDONLY, cloexec, 0);
    let wfd = table.insert(FileObject::Pipe(wr), status, libc::O_WRONLY, cloexec, 0);
    drop(table);
    let mmu = process.mmu.read().unwrap();
    if mmu.write32(fds_ptr, rfd as u32).is_err() || mmu.write32(fds_ptr + 4, wfd as u32).is_err() {
        return Errno::EFAULT.as_ret();
    }
    0
}

fn sys_eventfd2(process: &Process, initval: u32, flags: i32) -> i64 {
    let state = crate::vfs::EventFdState { counter: initval as u64 };
    let cloexec = flags & libc::O_CLOEXEC != 0;
    let status = if flags & libc::O_NONBLOCK != 0 { libc::O_NONBLOCK } else { 0 };
    process.fdtable.lock().unwrap().insert(
        FileObject::EventFd(std::sync::Arc::new(std::sync::Mutex::new(state))),
        status,
        libc::O_RDWR,
        cloexec,
        0,
    ) as i64
}

fn sys_memfd_create(process: &Process, name_ptr: u64, flags: u32) -> i64 {
    const MFD_CLOEXEC: u32 = 0x0001;
    if read_cstr(process, name_ptr, 256).is_err() {
        return Errno::EFAULT.as_ret();
    }
    let file = FileObject::ShadowFile(std::sync::Arc::new(std::sync::Mutex::new(crate::vfs::shadow::ShadowFile::new())));
    process.fdtable.lock().unwrap().insert(file, 0, libc::O_RDWR, flags & MFD_CLOEXEC != 0, 0) as i64
}

/// `statx`/`statfs` are modeled at the same minimal fidelity as `fstat`
/// (§4.F): only the fields a guest libc's `stat`-family wrappers actually
/// read (mode, size, blksize) are filled in; everything else is zeroed.
fn sys_statx(process: &Process, dirfd: i32, path_ptr: u64, flags: i32, buf_ptr: u64) -> i64 {
    const AT_EMPTY_PATH: i32 = 0x1000;
    let path = if path_ptr != 0 { read_cstr(process, path_ptr, 4096).unwrap_or_default() } else { String::new() };

    let stat = if path.is_empty() && flags & AT_EMPTY_PATH != 0 {
        let desc = match process.fdtable.lock().unwrap().get(dirfd) {
            Ok(d) => d,
            Err(e) => return e.as_ret(),
        };
        match desc.lock().unwrap().file.stat() {
            Ok(s) => s,
            Err(e) => return e.as_ret(),
        }
    } else {
        let path = match Path::parse(&path) {
            Ok(p) => p,
            Err(_) => return Errno::EINVAL.as_ret(),
        };
        match process.vfs.open(&path, libc::O_RDONLY, 0).and_then(|f| f.stat()) {
            Ok(s) => s,
            Err(e) => return e.as_ret(),
        }
    };

    let mut raw = [0u8; 256];
    raw[4..8].copy_from_slice(&4096u32.to_le_bytes()); // stx_blksize
    raw[28..30].copy_from_slice(&(stat.mode as u16).to_le_bytes()); // stx_mode
    raw[40..48].copy_from_slice(&stat.size.to_le_bytes()); // stx_size
    let mmu = process.mmu.read().unwrap();
    if mmu.write_bytes(buf_ptr, &raw).is_err() {
        return Errno::EFAULT.as_ret();
    }
    0
}

fn sys_statfs(process: &Process, buf_ptr: u64) -> i64 {
    let mut raw = [0u8; 120];
    raw[8..16].copy_from_slice(&4096u64.to_le_bytes()); // f_bsize
    raw[88..96].copy_from_slice(&255u64.to_le_bytes()); // f_namelen
    let mmu = process.mmu.read().unwrap();
    if mmu.write_bytes(buf_ptr, &raw).is_err() {
        return Errno::EFAULT.as_ret();
    }
    0
}

/// Non-blocking readiness check only: every pollable descriptor is
/// reported ready for whatever it declares readable/writable rather than
/// tracking real buffer occupancy, and a zero or negative `timeout` both
/// return immediately. A guest that relies on `poll` to actually block
/// until data arrives will busy-loop instead of sleeping — acceptable for
/// the single-shot readiness checks real startup/event-loop code performs,
/// not a faithful `epoll`-grade wait.
fn sys_poll(process: &Process, fds_ptr: u64, nfds: u32) -> i64 {
    const POLLIN: i16 = 0x0001;
    const POLLOUT: i16 = 0x0004;
    const POLLNVAL: i16 = 0x0020;
    let mut ready = 0i64;
    let mmu = process.mmu.read().unwrap();
    for i in 0..nfds as u64 {
        let entry_addr = fds_ptr + i * 8;
        let fd = match mmu.read32(entry_addr) {
            Ok(v) => v as i32,
            Err(_) => return Errno::EFAULT.as_ret(),
        };
        let revents = match process.fdtable.lock().unwrap().get(fd) {
            Ok(desc) => {
                let caps = desc.lock().unwrap().file.capabilities();
                let mut r = 0i16;
                if caps.readable {
                    r |= POLLIN;
                }
                if caps.writable {
                    r |= POLLOUT;
                }
                r
            }
            Err(_) => POLLNVAL,
        };
        if revents != 0 {
            ready += 1;
        }
        if mmu.write16(entry_addr + 6, revents as u16).is_err() {
            return Errno::EFAULT.as_ret();
        }
    }
    ready
}

fn sys_dup(process: &Process, fd: i32) -> i64 {
    match process.fdtable.lock().unwrap().dup(fd) {
        Ok(newfd) => newfd as i64,
        Err(e) => e.as_ret(),
    }
}

fn sys_dup2(process: &Process, oldfd: i32, newfd: i32) -> i64 {
    match process.fdtable.lock().unwrap().dup2(oldfd, newfd) {
        Ok(fd) => fd as i64,
        Err(e) => e.as_ret(),
    }
}

fn sys_fcntl(process: &Process, fd: i32, cmd: i32, arg: u64) -> i64 {
    let table = process.fdtable.lock().unwrap();
    match cmd {
        libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => Errno::ENOSYS.as_ret(),
        libc::F_GETFD => table.close_on_exec(fd).map(|v| v as i64).unwrap_or_else(|e| e.as_ret()),
        libc::F_SETFD => {
            let mut table = table;
            table.set_close_on_exec(fd, arg & libc::FD_CLOEXEC as u64 != 0).map(|_| 0).unwrap_or_else(|e| e.as_ret())
        }
        libc::F_GETFL => table.get(fd).map(|d| d.lock().unwrap().status_flags as i64).unwrap_or_else(|e| e.as_ret()),
        libc::F_SETFL => table
            .get(fd)
            .map(|d| {
                d.lock().unwrap().status_flags = arg as i32;
                0
            })
            .unwrap_or_else(|e| e.as_ret()),
        _ => Errno::EINVAL.as_ret(),
    }
}

fn sys_ioctl(process: &Process, fd: i32, request: u64, _arg: u64) -> i64 {
    let desc = match process.fdtable.lock().unwrap().get(fd) {
        Ok(d) => d,
        Err(e) => return e.as_ret(),
    };
    let mut desc = desc.lock().unwrap();
    let mut nonblock = desc.status_flags & libc::O_NONBLOCK != 0;
    match desc.file.ioctl(request, &mut nonblock) {
        Ok(ret) => {
            desc.status_flags = if nonblock { desc.status_flags | libc::O_NONBLOCK } else { desc.status_flags & !libc::O_NONBLOCK };
            ret
        }
        Err(e) => e.as_ret(),
    }
}

// ── Memory ──

fn sys_mmap(process: &Process, hint: u64, len: u64, prot: u32, flags: i32, _fd: i32, _off: u64) -> i64 {
    let map_flags = MapFlags {
        fixed: flags & libc::MAP_FIXED != 0,
        shared: flags & libc::MAP_SHARED != 0,
        anonymous: flags & libc::MAP_ANONYMOUS != 0,
    };
    let mut mmu = process.mmu.write().unwrap();
    match mmu.mmap(hint, len, Prot::from_bits(prot), map_flags, None) {
        Ok(addr) => addr as i64,
        Err(MmuError::NoSpace) => Errno::ENOMEM.as_ret(),
        Err(MmuError::Misaligned) | Err(MmuError::InvalidRange) => Errno::EINVAL.as_ret(),
    }
}

fn sys_munmap(process: &Process, addr: u64, len: u64) -> i64 {
    let mut mmu = process.mmu.write().unwrap();
    match mmu.munmap(addr, len) {
        Ok(()) => {
            process.jit.lock().unwrap().invalidate_range(addr, len);
            0
        }
        Err(MmuError::Misaligned) | Err(MmuError::InvalidRange) => Errno::EINVAL.as_ret(),
        Err(MmuError::NoSpace) => Errno::ENOMEM.as_ret(),
    }
}

fn sys_mprotect(process: &Process, addr: u64, len: u64, prot: u32) -> i64 {
    let mut mmu = process.mmu.write().unwrap();
    match mmu.mprotect(addr, len, Prot::from_bits(prot)) {
        Ok(()) => {
            if prot & libc::PROT_EXEC as u32 == 0 {
                process.jit.lock().unwrap().invalidate_range(addr, len);
            }
            0
        }
        Err(_) => Errno::ENOMEM.as_ret(),
    }
}

fn sys_brk(process: &Process, new_end: u64) -> i64 {
    process.mmu.write().unwrap().brk(new_end) as i64
}

// ── Process / thread ──

fn sys_exit(process: &Process, id: ThreadId, status: i32, group: bool) -> SyscallOutcome {
    if group {
        process.scheduler.exit_all(process.pid);
        process.record_exit(status);
    } else {
        process.scheduler.exit(id, status);
        if process.scheduler.all_done(process.pid) {
            process.scheduler.reap_all(process.pid);
            process.record_exit(status);
        }
    }
    SyscallOutcome::Suspended
}

const CLONE_SETTLS: u64 = 0x0008_0000;

fn sys_clone(process: &Process, cpu: &CpuState, flags: u64, child_stack: u64, tls: u64, fallthrough: u64) -> i64 {
    let mut child = CpuState::new(fallthrough, if child_stack != 0 { child_stack } else { cpu.gpr.sp() });
    child.gpr = cpu.gpr.clone();
    child.gpr.rip = fallthrough;
    child.gpr.write_gpr64(GprIndex::Rax as u8, 0);
    if child_stack != 0 {
        child.gpr.set_sp(child_stack);
    }
    if flags & CLONE_SETTLS != 0 {
        child.gpr.fs_base = tls;
    }
    let pid = process.pid;
    let id = process.scheduler.spawn(pid, "clone".to_string(), child);
    id.0 as i64
}

/// Reads a NUL-terminated array of guest pointers (an `argv`/`envp` vector),
/// resolving each to a host string. `addr == 0` is treated as an empty
/// vector (glibc passes a real `envp`, but some libcs pass `NULL` for an
/// empty one).
fn read_str_vec(process: &Process, addr: u64) -> Result<Vec<String>, Errno> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut i = 0u64;
    loop {
        let ptr = process.mmu.read().unwrap().read64(addr + i * 8).map_err(|_| Errno::EFAULT)?;
        if ptr == 0 {
            return Ok(out);
        }
        out.push(read_cstr(process, ptr, 4096)?);
        i += 1;
    }
}

/// Replaces the calling process's image in place: re-resolves `path`
/// through the same [`crate::loader::ProgramLoader`] seam the initial exec
/// used, installs a fresh address space, drops close-on-exec descriptors,
/// and resets the calling thread's entire register file to the new entry
/// point. Every other thread in the process is not specified here (real
/// Linux kills them); this emulator expects `execve` from a single-threaded
/// process, matching every guest that reaches it in practice (a `libc`
/// startup path, not an application steady state).
fn sys_execve(process: &Process, cpu: &mut CpuState, path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> SyscallOutcome {
    let path = match read_cstr(process, path_ptr, 4096) {
        Ok(p) => p,
        Err(e) => return SyscallOutcome::Return(e.as_ret()),
    };
    let argv = match read_str_vec(process, argv_ptr) {
        Ok(v) => v,
        Err(e) => return SyscallOutcome::Return(e.as_ret()),
    };
    let envp = match read_str_vec(process, envp_ptr) {
        Ok(v) => v,
        Err(e) => return SyscallOutcome::Return(e.as_ret()),
    };

    let brk_start = match process.loader.plan_brk(&path) {
        Ok(b) => b,
        Err(e) => return SyscallOutcome::Return(e.as_ret()),
    };
    let mut fresh = emu_core::mmu::AddressSpace::new(brk_start);
    let image = match process.loader.load(&path, &argv, &envp, &mut fresh) {
        Ok(img) => img,
        Err(e) => return SyscallOutcome::Return(e.as_ret()),
    };

    *process.mmu.write().unwrap() = fresh;
    process.fdtable.lock().unwrap().apply_exec();
    process.jit.lock().unwrap().invalidate_range(0, u64::MAX);
    *cpu = CpuState::new(image.entry, image.stack_top);
    SyscallOutcome::Replaced
}

fn sys_wait4(process: &Process, id: ThreadId, cpu: &mut CpuState, target_tid: i64, status_ptr: u64, _options: i32, fallthrough: u64) -> SyscallOutcome {
    let target_tid = if target_tid > 0 { Some(ThreadId(target_tid as u64)) } else { None };
    if let Some((child, status)) = process.scheduler.reap_child(process.pid, target_tid) {
        if status_ptr != 0 {
            let mmu = process.mmu.read().unwrap();
            let _ = mmu.write32(status_ptr, status as u32);
        }
        set_ret(cpu, child.0 as i64);
        cpu.gpr.rip = fallthrough;
        return SyscallOutcome::Return(child.0 as i64);
    }
    if !process.scheduler.has_any_thread_of(process.pid) {
        set_ret(cpu, Errno::ECHILD.as_ret());
        cpu.gpr.rip = fallthrough;
        return SyscallOutcome::Return(Errno::ECHILD.as_ret());
    }
    process.scheduler.block(id, WaitReason::AnyChild);
    process.park(id, PendingSyscall::WaitChild { resume_rip: fallthrough, target_pid: Some(process.pid), target_tid, status_ptr });
    SyscallOutcome::Suspended
}

// ── Futex & time ──

fn sys_futex(process: &Process, id: ThreadId, cpu: &mut CpuState, word_addr: u64, op: i32, val: u32, timeout_ptr: u64, fallthrough: u64) -> SyscallOutcome {
    const FUTEX_WAIT: i32 = 0;
    const FUTEX_WAKE: i32 = 1;
    const FUTEX_PRIVATE_FLAG: i32 = 128;
    match op & !FUTEX_PRIVATE_FLAG {
        FUTEX_WAIT => {
            let deadline = if timeout_ptr != 0 {
                let mmu = process.mmu.read().unwrap();
                let secs = mmu.read64(timeout_ptr).unwrap_or(0);
                let nanos = mmu.read64(timeout_ptr + 8).unwrap_or(0) as u32;
                Some(Instant::now() + Duration::new(secs, nanos))
            } else {
                None
            };
            let read_word = || process.mmu.read().unwrap().read32(word_addr).unwrap_or(u32::MAX) as u64;
            let parked = process.scheduler.futex_wait_timed(id, word_addr, read_word, val as u64, deadline);
            if !parked {
                set_ret(cpu, Errno::EAGAIN.as_ret());
                cpu.gpr.rip = fallthrough;
                return SyscallOutcome::Return(Errno::EAGAIN.as_ret());
            }
            process.park(id, PendingSyscall::FutexWait { resume_rip: fallthrough });
            SyscallOutcome::Suspended
        }
        FUTEX_WAKE => {
            let woken = process.scheduler.futex_wake(word_addr, val);
            set_ret(cpu, woken as i64);
            cpu.gpr.rip = fallthrough;
            SyscallOutcome::Return(woken as i64)
        }
        _ => {
            set_ret(cpu, Errno::ENOSYS.as_ret());
            cpu.gpr.rip = fallthrough;
            SyscallOutcome::Return(Errno::ENOSYS.as_ret())
        }
    }
}

fn sys_nanosleep(process: &Process, id: ThreadId, cpu: &mut CpuState, req_ptr: u64, fallthrough: u64) -> SyscallOutcome {
    let mmu = process.mmu.read().unwrap();
    let secs = mmu.read64(req_ptr).unwrap_or(0);
    let nanos = mmu.read64(req_ptr + 8).unwrap_or(0) as u32;
    drop(mmu);
    let deadline = Instant::now() + Duration::new(secs, nanos);
    process.scheduler.sleep_until(id, deadline);
    process.park(id, PendingSyscall::Sleep { resume_rip: fallthrough });
    SyscallOutcome::Suspended
}

fn sys_clock_gettime(process: &Process, clock_id: i32, ts_ptr: u64) -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    let _ = clock_id;
    let mmu = process.mmu.read().unwrap();
    if mmu.write64(ts_ptr, now.as_secs()).is_err() || mmu.write64(ts_ptr + 8, now.subsec_nanos() as u64).is_err() {
        return Errno::EFAULT.as_ret();
    }
    0
}

fn sys_arch_prctl(cpu: &mut CpuState, code: i32, addr: u64) -> i64 {
    const ARCH_SET_FS: i32 = 0x1002;
    const ARCH_GET_FS: i32 = 0x1003;
    match code {
        ARCH_SET_FS => {
            cpu.gpr.fs_base = addr;
            0
        }
        ARCH_GET_FS => cpu.gpr.fs_base as i64,
        _ => Errno::EINVAL.as_ret(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ExecImage;
    use emu_core::mmu::page::Prot;
    use emu_core::mmu::{AddressSpace, MapFlags};

    /// A loader that ignores `path` and always installs one RX page of
    /// `0x90` (nop) at a fixed address, for exercising `execve` without a
    /// real ELF on disk.
    struct StubLoader {
        entry: u64,
    }

    impl crate::loader::ProgramLoader for StubLoader {
        fn load(&self, _path: &str, _argv: &[String], _envp: &[String], mmu: &mut AddressSpace) -> Result<ExecImage, Errno> {
            mmu.mmap(self.entry, 0x1000, Prot::RX, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None)
                .map_err(|_| Errno::ENOMEM)?;
            mmu.mprotect(self.entry, 0x1000, Prot::RW).map_err(|_| Errno::ENOMEM)?;
            mmu.write8(self.entry, 0x90).map_err(|_| Errno::EFAULT)?;
            mmu.mprotect(self.entry, 0x1000, Prot::RX).map_err(|_| Errno::ENOMEM)?;
            mmu.mmap(0x7f00_0000, 0x1000, Prot::RW, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None)
                .map_err(|_| Errno::ENOMEM)?;
            Ok(ExecImage { entry: self.entry, initial_brk: self.entry + 0x2000, stack_top: 0x7f00_1000 })
        }

        fn plan_brk(&self, _path: &str) -> Result<u64, Errno> {
            Ok(self.entry + 0x2000)
        }
    }

    fn write_cstr(mmu: &AddressSpace, addr: u64, s: &str) {
        mmu.write_bytes(addr, s.as_bytes()).unwrap();
        mmu.write8(addr + s.len() as u64, 0).unwrap();
    }

    #[test]
    fn execve_replaces_image_and_resets_registers() {
        let process = Process::with_loader(
            1,
            0x60_0000,
            vec![],
            vec![],
            false,
            std::sync::Arc::new(StubLoader { entry: 0x40_0000 }),
        );
        let mut cpu = CpuState::new(0x50_0000, 0x60_0000);

        let path_addr = 0x20_0000;
        {
            let mut mmu = process.mmu.write().unwrap();
            mmu.mmap(path_addr, 0x1000, Prot::RW, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None).unwrap();
            write_cstr(&mmu, path_addr, "/bin/new");
        }

        let outcome = sys_execve(&process, &mut cpu, path_addr, 0, 0);
        assert!(matches!(outcome, SyscallOutcome::Replaced));
        assert_eq!(cpu.gpr.rip, 0x40_0000);
        assert_eq!(cpu.gpr.sp(), 0x7f00_1000);
        assert!(process.mmu.read().unwrap().is_mapped(0x40_0000, false, true));
    }

    #[test]
    fn memfd_create_then_write_and_read_back() {
        let process = Process::new(1, 0x10_0000, vec![], vec![], false);
        {
            let mut mmu = process.mmu.write().unwrap();
            mmu.mmap(0x20_0000, 0x1000, Prot::RW, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None).unwrap();
            write_cstr(&mmu, 0x20_0000, "anon");
        }
        let fd = sys_memfd_create(&process, 0x20_0000, 0) as i32;
        assert!(fd >= 0);

        let buf_addr = 0x20_1000;
        {
            let mut mmu = process.mmu.write().unwrap();
            mmu.mmap(buf_addr, 0x1000, Prot::RW, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None).unwrap();
            write_cstr(&mmu, buf_addr, "hi");
        }
        assert_eq!(sys_write(&process, fd, buf_addr, 2), 2);
        assert_eq!(sys_lseek(&process, fd, 0, libc::SEEK_SET), 0);
        assert_eq!(sys_read(&process, fd, buf_addr + 0x100, 2), 2);
    }

    #[test]
    fn poll_reports_readable_device() {
        let process = Process::new(1, 0x10_0000, vec![], vec![], false);
        let fd = process.fdtable.lock().unwrap().insert(FileObject::Device(crate::vfs::DeviceKind::Zero), 0, libc::O_RDONLY, false, 0);

        let fds_ptr = 0x30_0000;
        {
            let mut mmu = process.mmu.write().unwrap();
            mmu.mmap(fds_ptr, 0x1000, Prot::RW, MapFlags { fixed: true, anonymous: true, ..Default::default() }, None).unwrap();
            mmu.write32(fds_ptr, fd as u32).unwrap();
            mmu.write16(fds_ptr + 4, 0).unwrap();
        }
        let ready = sys_poll(&process, fds_ptr, 1);
        assert_eq!(ready, 1);
        let revents = process.mmu.read().unwrap().read16(fds_ptr + 6).unwrap();
        assert_eq!(revents & 0x0001, 0x0001); // POLLIN
    }
}
