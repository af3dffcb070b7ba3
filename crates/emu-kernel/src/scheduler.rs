//! Thread table and run queue: a fixed-size worker pool pulling runnable
//! threads off a mutex/condvar-guarded queue, exactly the pattern most of
//! the rest of this crate's synchronization already assumes (the embedded
//! [`FutexTable`] is only ever touched while this module's own queue mutex
//! is held).
//!
//! Deadlines (a timed futex wait, `nanosleep`) live in the same `Inner`
//! behind the same mutex: a worker parked in [`Scheduler::next_runnable`]
//! with nothing runnable bounds its condvar wait by the earliest pending
//! deadline instead of sleeping forever, so a timeout fires even when no
//! other thread ever calls `wake`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use emu_core::CpuState;

use crate::futex::FutexTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    pub fn fresh() -> ThreadId {
        ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Running,
    Blocked,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Futex(u64),
    Join(ThreadId),
    /// Parent waiting on any child via `wait4`.
    AnyChild,
    /// `nanosleep`; woken only by its deadline, never by an external event.
    Sleep,
}

pub struct Thread {
    pub id: ThreadId,
    pub pid: u64,
    pub tid: u64,
    pub name: String,
    pub cpu: CpuState,
    pub state: ThreadState,
    pub exit_status: Option<i32>,
    pub wait_reason: Option<WaitReason>,
    /// Set by [`Scheduler::next_runnable`]'s deadline sweep when this
    /// thread's wait expired before anything woke it; cleared the first
    /// time a syscall handler reads it via [`Scheduler::take_timed_out`].
    pub timed_out: bool,
    /// "Kill" is not asynchronous cancellation: this flag is only ever
    /// observed by the thread itself at its next suspension point.
    pub kill_requested: bool,
}

impl Thread {
    pub fn new(id: ThreadId, pid: u64, name: String, cpu: CpuState) -> Self {
        Thread {
            id,
            pid,
            tid: id.0,
            name,
            cpu,
            state: ThreadState::Runnable,
            exit_status: None,
            wait_reason: None,
            timed_out: false,
            kill_requested: false,
        }
    }
}

struct Inner {
    threads: HashMap<ThreadId, Thread>,
    runnable: VecDeque<ThreadId>,
    futex: FutexTable,
    /// Earliest-first index of pending deadlines, keyed so a thread can
    /// only ever occupy one slot (`deadline_of` is the reverse lookup used
    /// to remove it when woken some other way).
    deadlines: BTreeMap<(Instant, ThreadId), ()>,
    deadline_of: HashMap<ThreadId, Instant>,
}

impl Inner {
    fn clear_deadline(&mut self, id: ThreadId) {
        if let Some(at) = self.deadline_of.remove(&id) {
            self.deadlines.remove(&(at, id));
        }
    }

    fn set_deadline(&mut self, id: ThreadId, at: Instant) {
        self.clear_deadline(id);
        self.deadline_of.insert(id, at);
        self.deadlines.insert((at, id), ());
    }

    /// Move every thread whose deadline has passed back to runnable,
    /// marking it timed out. Returns whether any thread was woken this way.
    fn expire_due(&mut self, now: Instant) -> bool {
        let mut woke_any = false;
        loop {
            let Some((&(at, id), _)) = self.deadlines.iter().next() else { break };
            if at > now {
                break;
            }
            self.deadlines.remove(&(at, id));
            self.deadline_of.remove(&id);
            self.futex.remove_thread(id);
            if let Some(thread) = self.threads.get_mut(&id) {
                if thread.state == ThreadState::Blocked {
                    thread.state = ThreadState::Runnable;
                    thread.wait_reason = None;
                    thread.timed_out = true;
                    self.runnable.push_back(id);
                    woke_any = true;
                }
            }
        }
        woke_any
    }
}

/// The shared run state a fixed-size pool of OS worker threads pulls from.
/// `condvar` is signaled whenever a thread transitions into `runnable` or
/// whenever the table becomes fully drained, so both a worker looking for
/// work and `join`/`wait4` callers block on the one condition variable.
pub struct Scheduler {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl Scheduler {
    pub fn new() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            inner: Mutex::new(Inner {
                threads: HashMap::new(),
                runnable: VecDeque::new(),
                futex: FutexTable::new(),
                deadlines: BTreeMap::new(),
                deadline_of: HashMap::new(),
            }),
            condvar: Condvar::new(),
        })
    }

    pub fn spawn(&self, pid: u64, name: String, cpu: CpuState) -> ThreadId {
        let id = ThreadId::fresh();
        let thread = Thread::new(id, pid, name, cpu);
        let mut inner = self.inner.lock().unwrap();
        inner.threads.insert(id, thread);
        inner.runnable.push_back(id);
        drop(inner);
        self.condvar.notify_all();
        id
    }

    /// Pop the next runnable thread id, blocking the calling worker until
    /// one is available, a pending deadline expires into runnable, or
    /// `shutdown` has emptied the table for good.
    pub fn next_runnable(&self) -> Option<ThreadId> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(id) = inner.runnable.pop_front() {
                if let Some(thread) = inner.threads.get_mut(&id) {
                    thread.state = ThreadState::Running;
                }
                return Some(id);
            }
            if inner.threads.is_empty() {
                return None;
            }
            let now = Instant::now();
            if inner.expire_due(now) {
                continue;
            }
            inner = match inner.deadlines.keys().next().copied() {
                Some((at, _)) => {
                    let wait_for = at.saturating_duration_since(now);
                    self.condvar.wait_timeout(inner, wait_for).unwrap().0
                }
                None => self.condvar.wait(inner).unwrap(),
            };
        }
    }

    pub fn reschedule(&self, id: ThreadId) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear_deadline(id);
        if let Some(thread) = inner.threads.get_mut(&id) {
            thread.state = ThreadState::Runnable;
            inner.runnable.push_back(id);
        }
        drop(inner);
        self.condvar.notify_all();
    }

    pub fn block(&self, id: ThreadId, reason: WaitReason) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get_mut(&id) {
            thread.state = ThreadState::Blocked;
            thread.wait_reason = Some(reason);
        }
    }

    /// Block `id` until `deadline`, waking only from the scheduler's own
    /// deadline sweep (used by `nanosleep`; unlike a futex wait there is no
    /// external wake path).
    pub fn sleep_until(&self, id: ThreadId, deadline: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.set_deadline(id, deadline);
        if let Some(thread) = inner.threads.get_mut(&id) {
            thread.state = ThreadState::Blocked;
            thread.wait_reason = Some(WaitReason::Sleep);
            thread.timed_out = false;
        }
        drop(inner);
        self.condvar.notify_all();
    }

    pub fn exit(&self, id: ThreadId, status: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.futex.remove_thread(id);
        inner.clear_deadline(id);
        if let Some(thread) = inner.threads.get_mut(&id) {
            thread.state = ThreadState::Zombie;
            thread.exit_status = Some(status);
        }
        let pid = inner.threads.get(&id).map(|t| t.pid);
        let waiters: Vec<ThreadId> = inner
            .threads
            .values()
            .filter(|t| {
                t.wait_reason == Some(WaitReason::Join(id))
                    || (t.wait_reason == Some(WaitReason::AnyChild) && pid == Some(t.pid))
            })
            .map(|t| t.id)
            .collect();
        for waiter in waiters {
            inner.clear_deadline(waiter);
            if let Some(t) = inner.threads.get_mut(&waiter) {
                t.state = ThreadState::Runnable;
                t.wait_reason = None;
                inner.runnable.push_back(waiter);
            }
        }
        drop(inner);
        self.condvar.notify_all();
    }

    /// Fully remove a zombie's bookkeeping once its exit status has been
    /// reaped by `wait4`.
    pub fn reap(&self, id: ThreadId) -> Option<i32> {
        let mut inner = self.inner.lock().unwrap();
        let status = inner.threads.get(&id).and_then(|t| t.exit_status);
        if status.is_some() {
            inner.threads.remove(&id);
        }
        status
    }

    /// `wait4`: find a zombie child of `pid` (optionally narrowed to one
    /// `target` tid), reap it, and return `(its id, exit status)`.
    pub fn reap_child(&self, pid: u64, target: Option<ThreadId>) -> Option<(ThreadId, i32)> {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner
            .threads
            .values()
            .find(|t| {
                t.pid == pid
                    && t.state == ThreadState::Zombie
                    && target.map_or(true, |want| want == t.id)
            })
            .map(|t| (t.id, t.exit_status.unwrap_or(0)));
        if let Some((id, _)) = hit {
            inner.threads.remove(&id);
        }
        hit
    }

    /// Whether `pid` currently owns any thread at all (running, blocked, or
    /// not yet reaped) — used by `wait4` to distinguish "no zombie yet,
    /// keep blocking" from `-ECHILD`.
    pub fn has_any_thread_of(&self, pid: u64) -> bool {
        self.inner.lock().unwrap().threads.values().any(|t| t.pid == pid)
    }

    pub fn request_kill(&self, id: ThreadId) {
        if let Some(thread) = self.inner.lock().unwrap().threads.get_mut(&id) {
            thread.kill_requested = true;
        }
    }

    pub fn take_kill_requested(&self, id: ThreadId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.threads.get_mut(&id).map(|t| std::mem::take(&mut t.kill_requested)).unwrap_or(false)
    }

    /// `wait(thread, wordPtr, expected [, deadline])`: under the scheduler
    /// mutex, park iff the guest word still equals `expected`. A `deadline`
    /// is registered in the same critical section so the wake-wait ordering
    /// guarantee holds even for timed waits.
    pub fn futex_wait_timed(
        &self,
        id: ThreadId,
        word_addr: u64,
        read_word: impl Fn() -> u64,
        expected: u64,
        deadline: Option<Instant>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if read_word() != expected {
            return false;
        }
        inner.futex.park(word_addr, id);
        if let Some(at) = deadline {
            inner.set_deadline(id, at);
        }
        if let Some(thread) = inner.threads.get_mut(&id) {
            thread.state = ThreadState::Blocked;
            thread.wait_reason = Some(WaitReason::Futex(word_addr));
            thread.timed_out = false;
        }
        let has_deadline = deadline.is_some();
        drop(inner);
        if has_deadline {
            // Nudge any worker already parked in `next_runnable` so it
            // re-evaluates its wait bound against the new earliest deadline.
            self.condvar.notify_all();
        }
        true
    }

    pub fn futex_wait(&self, id: ThreadId, word_addr: u64, read_word: impl Fn() -> u64, expected: u64) -> bool {
        self.futex_wait_timed(id, word_addr, read_word, expected, None)
    }

    /// `wake(wordPtr, n)`: under the scheduler mutex, requeue up to `n`
    /// waiters on `wordPtr` and return the count actually woken.
    pub fn futex_wake(&self, word_addr: u64, max_waiters: u32) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let woken = inner.futex.wake(word_addr, max_waiters);
        let count = woken.len() as u32;
        for id in woken {
            inner.clear_deadline(id);
            if let Some(thread) = inner.threads.get_mut(&id) {
                thread.state = ThreadState::Runnable;
                thread.wait_reason = None;
            }
            inner.runnable.push_back(id);
        }
        drop(inner);
        if count > 0 {
            self.condvar.notify_all();
        }
        count
    }

    /// Read-and-clear whether `id`'s most recent block ended via deadline
    /// expiry rather than an explicit wake — the syscall handler uses this
    /// right after being rescheduled to choose between success and
    /// `-ETIMEDOUT`.
    pub fn take_timed_out(&self, id: ThreadId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.threads.get_mut(&id).map(|t| std::mem::take(&mut t.timed_out)).unwrap_or(false)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().unwrap().threads.len()
    }

    /// `exit_group`: every thread of `pid` is torn down at once, with no
    /// zombie left for a later `wait4` to collect — the caller has already
    /// decided the process-wide exit status itself.
    pub fn exit_all(&self, pid: u64) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<ThreadId> = inner.threads.values().filter(|t| t.pid == pid).map(|t| t.id).collect();
        for id in ids {
            inner.futex.remove_thread(id);
            inner.clear_deadline(id);
            inner.threads.remove(&id);
        }
        drop(inner);
        self.condvar.notify_all();
    }

    /// Whether `pid` has nothing left that could ever run again — every
    /// thread it still owns (if any) is already a zombie.
    pub fn all_done(&self, pid: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.threads.values().any(|t| t.pid == pid && t.state != ThreadState::Zombie)
    }

    /// Drop every remaining (necessarily zombie, per [`Scheduler::all_done`])
    /// thread of `pid` without requiring a `wait4` to collect each one —
    /// used once the engine has decided the process as a whole is finished.
    pub fn reap_all(&self, pid: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.threads.retain(|_, t| t.pid != pid);
        drop(inner);
        self.condvar.notify_all();
    }

    pub fn with_cpu<R>(&self, id: ThreadId, f: impl FnOnce(&mut CpuState) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.threads.get_mut(&id).map(|t| f(&mut t.cpu))
    }

    /// Take exclusive ownership of `id`'s `CpuState` for the duration of a
    /// run quantum, leaving a placeholder behind. Safe because a thread in
    /// `Running` state is never touched by another worker except through
    /// the fields this leaves alone (`state`, `wait_reason`, `exit_status`);
    /// lets the engine step hundreds of thousands of instructions without
    /// holding the scheduler mutex the whole time. Must be paired with
    /// [`Scheduler::checkin_cpu`] before the id is ever handed to
    /// `next_runnable`/`reschedule`/`exit` again.
    pub fn checkout_cpu(&self, id: ThreadId) -> Option<CpuState> {
        let mut inner = self.inner.lock().unwrap();
        inner.threads.get_mut(&id).map(|t| std::mem::replace(&mut t.cpu, CpuState::new(0, 0)))
    }

    pub fn checkin_cpu(&self, id: ThreadId, cpu: CpuState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.threads.get_mut(&id) {
            t.cpu = cpu;
        }
    }

    pub fn thread_name(&self, id: ThreadId) -> Option<String> {
        self.inner.lock().unwrap().threads.get(&id).map(|t| t.name.clone())
    }

    pub fn pid_of(&self, id: ThreadId) -> Option<u64> {
        self.inner.lock().unwrap().threads.get(&id).map(|t| t.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::CpuState;
    use std::time::Duration;

    fn test_cpu() -> CpuState {
        CpuState::new(0x40_0000, 0x7fff_0000)
    }

    #[test]
    fn spawned_thread_is_immediately_runnable() {
        let sched = Scheduler::new();
        let id = sched.spawn(1, "main".into(), test_cpu());
        assert_eq!(sched.next_runnable(), Some(id));
        assert_eq!(sched.thread_count(), 1);
    }

    #[test]
    fn exit_then_reap_returns_status_once() {
        let sched = Scheduler::new();
        let id = sched.spawn(1, "main".into(), test_cpu());
        sched.next_runnable();
        sched.exit(id, 7);
        assert_eq!(sched.reap(id), Some(7));
        assert_eq!(sched.thread_count(), 0);
    }

    #[test]
    fn futex_wake_requeues_parked_thread() {
        let sched = Scheduler::new();
        let id = sched.spawn(1, "t".into(), test_cpu());
        sched.next_runnable();
        assert!(sched.futex_wait(id, 0x4000, || 5, 5));
        assert_eq!(sched.futex_wake(0x4000, 1), 1);
        assert_eq!(sched.next_runnable(), Some(id));
    }

    #[test]
    fn futex_wait_refuses_to_park_on_stale_expectation() {
        let sched = Scheduler::new();
        let id = sched.spawn(1, "t".into(), test_cpu());
        sched.next_runnable();
        assert!(!sched.futex_wait(id, 0x4000, || 9, 5));
    }

    #[test]
    fn exit_of_last_thread_unblocks_next_runnable() {
        let sched = Scheduler::new();
        let id = sched.spawn(1, "t".into(), test_cpu());
        sched.next_runnable();
        sched.exit(id, 0);
        sched.reap(id);
        assert_eq!(sched.next_runnable(), None);
    }

    #[test]
    fn timed_futex_wait_expires_on_its_own() {
        let sched = Scheduler::new();
        let id = sched.spawn(1, "t".into(), test_cpu());
        sched.next_runnable();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(sched.futex_wait_timed(id, 0x8000, || 1, 1, Some(deadline)));
        // Another thread keeps the table non-empty and does the actual
        // blocking wait that the deadline sweep runs inside of.
        assert_eq!(sched.next_runnable(), Some(id));
        assert!(sched.take_timed_out(id));
    }

    #[test]
    fn real_wake_beats_the_deadline_and_is_not_a_timeout() {
        let sched = Scheduler::new();
        let id = sched.spawn(1, "t".into(), test_cpu());
        sched.next_runnable();
        let deadline = Instant::now() + Duration::from_secs(30);
        assert!(sched.futex_wait_timed(id, 0x9000, || 1, 1, Some(deadline)));
        assert_eq!(sched.futex_wake(0x9000, 1), 1);
        assert_eq!(sched.next_runnable(), Some(id));
        assert!(!sched.take_timed_out(id));
    }
}
