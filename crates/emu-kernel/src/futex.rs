//! Futex wait/wake table.
//!
//! Pure bookkeeping: every method here assumes the caller already holds the
//! scheduler's queue mutex, since the ordering guarantee (`wait` parks iff
//! the guest word still equals `expected` at the moment the mutex was held)
//! only holds if the word read and the table mutation are one atomic step
//! from the scheduler's point of view.

use std::collections::HashMap;

use crate::scheduler::ThreadId;

#[derive(Default)]
pub struct FutexTable {
    waiters: HashMap<u64, Vec<ThreadId>>,
}

impl FutexTable {
    pub fn new() -> Self {
        FutexTable::default()
    }

    /// Register `thread` as waiting on `word`. Caller has already verified
    /// the guest word equals the expected value.
    pub fn park(&mut self, word: u64, thread: ThreadId) {
        self.waiters.entry(word).or_default().push(thread);
    }

    /// Wake up to `n` waiters on `word`, returning their thread ids in FIFO
    /// order. Returns fewer than `n` (possibly zero) if there weren't that
    /// many waiters.
    pub fn wake(&mut self, word: u64, n: u32) -> Vec<ThreadId> {
        let Some(list) = self.waiters.get_mut(&word) else {
            return Vec::new();
        };
        let count = (n as usize).min(list.len());
        let woken: Vec<ThreadId> = list.drain(..count).collect();
        if list.is_empty() {
            self.waiters.remove(&word);
        }
        woken
    }

    /// Drop every entry belonging to `thread` regardless of which word it
    /// was parked on. Used by `terminate` to make sure a killed thread
    /// never gets woken into dead state.
    pub fn remove_thread(&mut self, thread: ThreadId) {
        self.waiters.retain(|_, list| {
            list.retain(|&t| t != thread);
            !list.is_empty()
        });
    }

    pub fn waiter_count(&self, word: u64) -> usize {
        self.waiters.get(&word).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_returns_fifo_order_up_to_n() {
        let mut table = FutexTable::new();
        table.park(0x1000, ThreadId(1));
        table.park(0x1000, ThreadId(2));
        table.park(0x1000, ThreadId(3));
        let woken = table.wake(0x1000, 2);
        assert_eq!(woken, vec![ThreadId(1), ThreadId(2)]);
        assert_eq!(table.waiter_count(0x1000), 1);
    }

    #[test]
    fn waking_more_than_present_returns_all() {
        let mut table = FutexTable::new();
        table.park(0x2000, ThreadId(5));
        let woken = table.wake(0x2000, 10);
        assert_eq!(woken, vec![ThreadId(5)]);
        assert_eq!(table.waiter_count(0x2000), 0);
    }

    #[test]
    fn remove_thread_drops_it_from_every_word() {
        let mut table = FutexTable::new();
        table.park(0x1000, ThreadId(1));
        table.park(0x2000, ThreadId(1));
        table.remove_thread(ThreadId(1));
        assert_eq!(table.waiter_count(0x1000), 0);
        assert_eq!(table.waiter_count(0x2000), 0);
    }
}
