//! The process-wide resources a guest shares across every one of its
//! threads: address space, open files, scheduler, and JIT cache.
//!
//! Lock granularity follows §5 of the design directly: the MMU gets its own
//! reader-writer lock (reads are the common case — interpreter/JIT memory
//! access — structural mmap/munmap/mprotect calls are rarer and take the
//! write side), the FD table gets its own mutex, the JIT translator gets a
//! mutex held only while compiling, and the scheduler is internally
//! synchronized already.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use emu_core::mmu::AddressSpace;
use emu_core::jit::JitTranslator;

use crate::fdtable::FdTable;
use crate::loader::{self, ProgramLoader};
use crate::scheduler::{Scheduler, ThreadId};
use crate::vfs::Vfs;

/// What a blocked thread is waiting to have completed for it once it is
/// rescheduled. The syscall dispatcher registers one of these instead of
/// writing a return value when it parks a thread, and
/// [`syscall::resume`](crate::syscall::resume) (called by the engine right
/// after `next_runnable` hands the thread back) consumes it to finish the
/// call.
pub enum PendingSyscall {
    /// A timed or untimed futex wait; resumed either by a real `wake` or by
    /// the scheduler's own deadline sweep.
    FutexWait { resume_rip: u64 },
    /// `nanosleep`; always resumed by the deadline sweep.
    Sleep { resume_rip: u64 },
    /// `wait4`; resumed by a child's `exit` (via `AnyChild`/`Join`) or the
    /// deadline sweep if a timeout was requested.
    WaitChild { resume_rip: u64, target_pid: Option<u64>, target_tid: Option<ThreadId>, status_ptr: u64 },
}

/// Everything one guest process owns, shared by every thread it spawns.
pub struct Process {
    pub pid: u64,
    pub mmu: RwLock<AddressSpace>,
    pub fdtable: Mutex<FdTable>,
    pub vfs: Vfs,
    pub scheduler: Arc<Scheduler>,
    pub jit: Mutex<JitTranslator>,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub loader: Arc<dyn ProgramLoader>,
    pending: Mutex<HashMap<ThreadId, PendingSyscall>>,
    /// Set once by whichever exit path (`exit_group`, or a plain `exit`
    /// that turns out to be the last thread standing) decides the process
    /// as a whole is finished. [`run_to_completion`](crate::run_to_completion)
    /// reads this back once every worker has drained.
    exit_status: Mutex<Option<i32>>,
}

impl Process {
    pub fn new(pid: u64, brk_start: u64, argv: Vec<String>, envp: Vec<String>, jit_chaining: bool) -> Arc<Process> {
        Process::with_loader(pid, brk_start, argv, envp, jit_chaining, loader::unsupported())
    }

    pub fn with_loader(
        pid: u64,
        brk_start: u64,
        argv: Vec<String>,
        envp: Vec<String>,
        jit_chaining: bool,
        loader: Arc<dyn ProgramLoader>,
    ) -> Arc<Process> {
        Arc::new(Process {
            pid,
            mmu: RwLock::new(AddressSpace::new(brk_start)),
            fdtable: Mutex::new(FdTable::new()),
            vfs: Vfs::new(),
            scheduler: Scheduler::new(),
            jit: Mutex::new(JitTranslator::new(jit_chaining)),
            argv,
            envp,
            loader,
            pending: Mutex::new(HashMap::new()),
            exit_status: Mutex::new(None),
        })
    }

    pub fn park(&self, id: ThreadId, pending: PendingSyscall) {
        self.pending.lock().unwrap().insert(id, pending);
    }

    pub fn take_pending(&self, id: ThreadId) -> Option<PendingSyscall> {
        self.pending.lock().unwrap().remove(&id)
    }

    pub fn has_pending(&self, id: ThreadId) -> bool {
        self.pending.lock().unwrap().contains_key(&id)
    }

    /// Record the process-wide exit status, if nothing has already.
    pub fn record_exit(&self, status: i32) {
        self.exit_status.lock().unwrap().get_or_insert(status);
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap()
    }
}
