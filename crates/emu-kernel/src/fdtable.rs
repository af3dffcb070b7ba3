//! Per-process open file descriptor table.
//!
//! A guest fd is an index into this table, not the `FileObject` itself:
//! `dup`/`dup2` create a second entry sharing the same
//! [`OpenFileDescription`] (and therefore the same file offset), while
//! `open` called twice on the same path produces two independent
//! descriptions over one `FileObject`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Errno;
use crate::vfs::FileObject;

/// The state shared by every fd that `dup`s from a common ancestor: file
/// object, byte offset, and per-open-instance flags. Close-on-exec lives
/// on the [`FdTable`] entry instead, since `dup2` resets it on the new fd
/// while everything here stays shared.
pub struct OpenFileDescription {
    pub file: FileObject,
    pub offset: u64,
    pub status_flags: i32,
    pub access_mode: i32,
}

struct Entry {
    description: Arc<Mutex<OpenFileDescription>>,
    close_on_exec: bool,
}

#[derive(Default)]
pub struct FdTable {
    entries: HashMap<i32, Entry>,
    next_candidate: i32,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { entries: HashMap::new(), next_candidate: 0 }
    }

    fn lowest_free_fd(&self, from: i32) -> i32 {
        let mut fd = from.max(0);
        while self.entries.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    /// Install `file` as a fresh open description at the lowest available
    /// fd `>= min_fd`.
    pub fn insert(&mut self, file: FileObject, status_flags: i32, access_mode: i32, close_on_exec: bool, min_fd: i32) -> i32 {
        let fd = self.lowest_free_fd(min_fd.max(self.next_candidate));
        let description = Arc::new(Mutex::new(OpenFileDescription { file, offset: 0, status_flags, access_mode }));
        self.entries.insert(fd, Entry { description, close_on_exec });
        fd
    }

    pub fn get(&self, fd: i32) -> Result<Arc<Mutex<OpenFileDescription>>, Errno> {
        self.entries.get(&fd).map(|e| Arc::clone(&e.description)).ok_or(Errno::EBADF)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), Errno> {
        self.entries.remove(&fd).map(|_| ()).ok_or(Errno::EBADF)
    }

    /// `dup(oldfd)`: lowest free fd shares `oldfd`'s description, never
    /// close-on-exec.
    pub fn dup(&mut self, oldfd: i32) -> Result<i32, Errno> {
        let description = Arc::clone(&self.entries.get(&oldfd).ok_or(Errno::EBADF)?.description);
        let newfd = self.lowest_free_fd(0);
        self.entries.insert(newfd, Entry { description, close_on_exec: false });
        Ok(newfd)
    }

    /// `dup2(oldfd, newfd)`: if `newfd` is already open it is silently
    /// closed first (its own `Arc` drops once no other fd shares it); a
    /// call with `oldfd == newfd` is a no-op that clears close-on-exec.
    pub fn dup2(&mut self, oldfd: i32, newfd: i32) -> Result<i32, Errno> {
        if oldfd == newfd {
            if !self.entries.contains_key(&oldfd) {
                return Err(Errno::EBADF);
            }
            if let Some(entry) = self.entries.get_mut(&oldfd) {
                entry.close_on_exec = false;
            }
            return Ok(newfd);
        }
        let description = Arc::clone(&self.entries.get(&oldfd).ok_or(Errno::EBADF)?.description);
        self.entries.insert(newfd, Entry { description, close_on_exec: false });
        Ok(newfd)
    }

    pub fn set_close_on_exec(&mut self, fd: i32, value: bool) -> Result<(), Errno> {
        self.entries.get_mut(&fd).map(|e| e.close_on_exec = value).ok_or(Errno::EBADF)
    }

    pub fn close_on_exec(&self, fd: i32) -> Result<bool, Errno> {
        self.entries.get(&fd).map(|e| e.close_on_exec).ok_or(Errno::EBADF)
    }

    /// Drop every close-on-exec entry, called after a guest `execve`
    /// succeeds and replaces the address space.
    pub fn apply_exec(&mut self) {
        self.entries.retain(|_, e| !e.close_on_exec);
    }

    /// Produce a fresh table sharing every surviving description, used by
    /// `fork`/`clone` without `CLONE_FILES`.
    pub fn fork(&self) -> FdTable {
        let entries = self
            .entries
            .iter()
            .map(|(&fd, e)| (fd, Entry { description: Arc::clone(&e.description), close_on_exec: e.close_on_exec }))
            .collect();
        FdTable { entries, next_candidate: self.next_candidate }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::DeviceKind;

    fn null_file() -> FileObject {
        FileObject::Device(DeviceKind::Null)
    }

    #[test]
    fn insert_picks_lowest_free_fd() {
        let mut table = FdTable::new();
        assert_eq!(table.insert(null_file(), 0, 0, false, 0), 0);
        assert_eq!(table.insert(null_file(), 0, 0, false, 0), 1);
        table.close(0).unwrap();
        assert_eq!(table.insert(null_file(), 0, 0, false, 0), 0);
    }

    #[test]
    fn dup_shares_the_description() {
        let mut table = FdTable::new();
        let fd = table.insert(null_file(), 0, 0, false, 0);
        let dupped = table.dup(fd).unwrap();
        assert_ne!(fd, dupped);
        table.get(dupped).unwrap().lock().unwrap().offset = 42;
        assert_eq!(table.get(fd).unwrap().lock().unwrap().offset, 42);
    }

    #[test]
    fn dup2_onto_self_clears_close_on_exec() {
        let mut table = FdTable::new();
        let fd = table.insert(null_file(), 0, 0, true, 0);
        assert!(table.close_on_exec(fd).unwrap());
        table.dup2(fd, fd).unwrap();
        assert!(!table.close_on_exec(fd).unwrap());
    }

    #[test]
    fn exec_drops_close_on_exec_descriptors() {
        let mut table = FdTable::new();
        let keep = table.insert(null_file(), 0, 0, false, 0);
        let drop_me = table.insert(null_file(), 0, 0, true, 0);
        table.apply_exec();
        assert!(table.get(keep).is_ok());
        assert_eq!(table.get(drop_me).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn closing_an_unknown_fd_is_ebadf() {
        let mut table = FdTable::new();
        assert_eq!(table.close(7).unwrap_err(), Errno::EBADF);
    }
}
