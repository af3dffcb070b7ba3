//! The polymorphic file-object layer and the path-keyed overlay that gives
//! shadow files and directories process lifetime.
//!
//! `FileObject` is a tagged enum, not a trait object: every operation is a
//! `match` over the variant rather than a virtual call, and capability
//! bits (readable/writable/seekable/pollable/...) are plain data computed
//! from the variant rather than queried through methods a variant could
//! override inconsistently.

pub mod shadow;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::error::Errno;
use crate::path::Path;
use shadow::{ShadowDirectory, ShadowFile};

/// Host fd wrapper that closes on last drop. Cloning a [`FileObject`] that
/// holds one of these shares the fd, matching "two descriptions over one
/// file object have independent offsets" (the offset lives in the
/// `OpenFileDescription`, not here) while "closing the last reference
/// closes the host fd" falls out of `Arc`'s own refcounting.
struct HostFd(RawFd);

impl Drop for HostFd {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.0);
    }
}

#[derive(Clone)]
pub struct HostFile {
    fd: Arc<HostFd>,
}

impl HostFile {
    fn from_raw(fd: RawFd) -> Self {
        HostFile { fd: Arc::new(HostFd(fd)) }
    }

    fn raw(&self) -> RawFd {
        self.fd.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Null,
    Zero,
    Random,
    Tty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn raw_fd(self) -> RawFd {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

struct PipeBuf {
    data: std::collections::VecDeque<u8>,
    read_open: bool,
    write_open: bool,
}

#[derive(Clone)]
pub struct PipeEnd {
    inner: Arc<Mutex<PipeBuf>>,
    is_read_end: bool,
}

pub fn pipe_pair() -> (PipeEnd, PipeEnd) {
    let inner = Arc::new(Mutex::new(PipeBuf {
        data: std::collections::VecDeque::new(),
        read_open: true,
        write_open: true,
    }));
    (
        PipeEnd { inner: Arc::clone(&inner), is_read_end: true },
        PipeEnd { inner, is_read_end: false },
    )
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if self.is_read_end {
            inner.read_open = false;
        } else {
            inner.write_open = false;
        }
    }
}

#[derive(Default)]
pub struct EventFdState {
    pub counter: u64,
}

#[derive(Default)]
pub struct EpollState {
    pub interest: HashMap<RawFd, u32>,
}

/// A file object in whichever variant it was created or opened as.
#[derive(Clone)]
pub enum FileObject {
    HostFile(HostFile),
    ShadowFile(Arc<Mutex<ShadowFile>>),
    Device(DeviceKind),
    Stream(StreamKind),
    Pipe(PipeEnd),
    EventFd(Arc<Mutex<EventFdState>>),
    Epoll(Arc<Mutex<EpollState>>),
    Directory(DirectoryKind),
    Symlink(Arc<str>),
}

#[derive(Clone)]
pub enum DirectoryKind {
    Host(std::path::PathBuf),
    Shadow(Arc<Mutex<ShadowDirectory>>),
}

/// Capability bits, computed once per variant rather than queried through
/// per-variant overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    pub seekable: bool,
    pub pollable: bool,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub is_pipe: bool,
    /// True for both a real `Epoll` set and an `EventFd`: both are
    /// poll-readiness sources a guest `epoll_wait`/`poll` call can target,
    /// even though only `Epoll` holds a registered-fd interest list.
    pub is_epoll_like: bool,
    pub keep_after_close: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
}

fn errno_from_nix(err: nix::Error) -> Errno {
    Errno(-(err as i32))
}

impl FileObject {
    pub fn capabilities(&self) -> Capabilities {
        match self {
            FileObject::HostFile(_) => {
                Capabilities { readable: true, writable: true, seekable: true, pollable: true, ..Default::default() }
            }
            FileObject::ShadowFile(_) => Capabilities {
                readable: true,
                writable: true,
                seekable: true,
                keep_after_close: true,
                ..Default::default()
            },
            FileObject::Device(kind) => Capabilities {
                readable: true,
                writable: true,
                pollable: matches!(kind, DeviceKind::Tty),
                ..Default::default()
            },
            FileObject::Stream(_) => Capabilities { readable: true, writable: true, pollable: true, ..Default::default() },
            FileObject::Pipe(_) => Capabilities { readable: true, writable: true, pollable: true, is_pipe: true, ..Default::default() },
            FileObject::EventFd(_) => Capabilities {
                readable: true,
                writable: true,
                pollable: true,
                is_epoll_like: true,
                ..Default::default()
            },
            FileObject::Epoll(_) => Capabilities { pollable: true, is_epoll_like: true, ..Default::default() },
            FileObject::Directory(_) => Capabilities { readable: true, is_directory: true, keep_after_close: true, ..Default::default() },
            FileObject::Symlink(_) => Capabilities { is_symlink: true, keep_after_close: true, ..Default::default() },
        }
    }

    pub fn keep_after_close(&self) -> bool {
        self.capabilities().keep_after_close
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        match self {
            FileObject::HostFile(f) => {
                let off = nix::unistd::lseek(f.raw(), offset as i64, nix::unistd::Whence::SeekSet)
                    .map_err(errno_from_nix)?;
                let _ = off;
                nix::unistd::read(f.raw(), buf).map_err(errno_from_nix)
            }
            FileObject::ShadowFile(s) => Ok(s.lock().unwrap().read_at(offset, buf)),
            FileObject::Device(DeviceKind::Null) | FileObject::Device(DeviceKind::Tty) => Ok(0),
            FileObject::Device(DeviceKind::Zero) => {
                buf.fill(0);
                Ok(buf.len())
            }
            FileObject::Device(DeviceKind::Random) => {
                for b in buf.iter_mut() {
                    *b = rand_byte();
                }
                Ok(buf.len())
            }
            FileObject::Stream(s) => nix::unistd::read(s.raw_fd(), buf).map_err(errno_from_nix),
            FileObject::Pipe(p) => {
                let mut inner = p.inner.lock().unwrap();
                let n = buf.len().min(inner.data.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = inner.data.pop_front().unwrap();
                }
                if n == 0 && inner.write_open {
                    return Err(Errno::EAGAIN);
                }
                Ok(n)
            }
            FileObject::EventFd(e) => {
                if buf.len() < 8 {
                    return Err(Errno::EINVAL);
                }
                let mut state = e.lock().unwrap();
                if state.counter == 0 {
                    return Err(Errno::EAGAIN);
                }
                buf[..8].copy_from_slice(&state.counter.to_ne_bytes());
                state.counter = 0;
                Ok(8)
            }
            FileObject::Epoll(_) => Err(Errno::EINVAL),
            FileObject::Directory(_) => Err(Errno::EISDIR),
            FileObject::Symlink(_) => Err(Errno::EINVAL),
        }
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        match self {
            FileObject::HostFile(f) => {
                nix::unistd::lseek(f.raw(), offset as i64, nix::unistd::Whence::SeekSet).map_err(errno_from_nix)?;
                nix::unistd::write(f.raw(), buf).map_err(errno_from_nix)
            }
            FileObject::ShadowFile(s) => Ok(s.lock().unwrap().write_at(offset, buf)),
            FileObject::Device(DeviceKind::Null) | FileObject::Device(DeviceKind::Zero) => Ok(buf.len()),
            FileObject::Device(DeviceKind::Random) | FileObject::Device(DeviceKind::Tty) => Ok(buf.len()),
            FileObject::Stream(s) => nix::unistd::write(s.raw_fd(), buf).map_err(errno_from_nix),
            FileObject::Pipe(p) => {
                let mut inner = p.inner.lock().unwrap();
                if !inner.read_open {
                    return Err(Errno(-libc::EPIPE));
                }
                inner.data.extend(buf.iter().copied());
                Ok(buf.len())
            }
            FileObject::EventFd(e) => {
                if buf.len() < 8 {
                    return Err(Errno::EINVAL);
                }
                let mut add = [0u8; 8];
                add.copy_from_slice(&buf[..8]);
                let mut state = e.lock().unwrap();
                state.counter = state.counter.saturating_add(u64::from_ne_bytes(add));
                Ok(8)
            }
            FileObject::Epoll(_) => Err(Errno::EINVAL),
            FileObject::Directory(_) => Err(Errno::EISDIR),
            FileObject::Symlink(_) => Err(Errno::EINVAL),
        }
    }

    pub fn lseek(&self, cur_offset: u64, delta: i64, whence: i32) -> Result<u64, Errno> {
        if !self.capabilities().seekable {
            return Err(Errno::ESPIPE);
        }
        let size = self.stat().map(|s| s.size).unwrap_or(0);
        let base = match whence {
            libc::SEEK_SET => 0i64,
            libc::SEEK_CUR => cur_offset as i64,
            libc::SEEK_END => size as i64,
            _ => return Err(Errno::EINVAL),
        };
        let new_off = base.checked_add(delta).filter(|&v| v >= 0).ok_or(Errno::EINVAL)?;
        Ok(new_off as u64)
    }

    pub fn stat(&self) -> Result<FileStat, Errno> {
        match self {
            FileObject::HostFile(f) => {
                let st = nix::sys::stat::fstat(f.raw()).map_err(errno_from_nix)?;
                Ok(FileStat { size: st.st_size as u64, mode: st.st_mode, is_dir: false, is_symlink: false })
            }
            FileObject::ShadowFile(s) => {
                let s = s.lock().unwrap();
                Ok(FileStat { size: s.len(), mode: 0o100644, is_dir: false, is_symlink: false })
            }
            FileObject::Device(_) => Ok(FileStat { size: 0, mode: 0o20666, is_dir: false, is_symlink: false }),
            FileObject::Stream(_) => Ok(FileStat { size: 0, mode: 0o20620, is_dir: false, is_symlink: false }),
            FileObject::Pipe(_) => Ok(FileStat { size: 0, mode: 0o10644, is_dir: false, is_symlink: false }),
            FileObject::EventFd(_) => Ok(FileStat { size: 0, mode: 0o100644, is_dir: false, is_symlink: false }),
            FileObject::Epoll(_) => Ok(FileStat { size: 0, mode: 0o100644, is_dir: false, is_symlink: false }),
            FileObject::Directory(DirectoryKind::Host(path)) => {
                let meta = std::fs::metadata(path).map_err(Errno::from)?;
                Ok(FileStat { size: meta.len(), mode: 0o40755, is_dir: true, is_symlink: false })
            }
            FileObject::Directory(DirectoryKind::Shadow(_)) => {
                Ok(FileStat { size: 0, mode: 0o40755, is_dir: true, is_symlink: false })
            }
            FileObject::Symlink(target) => Ok(FileStat { size: target.len() as u64, mode: 0o120777, is_dir: false, is_symlink: true }),
        }
    }

    /// Synthesize up to `buf.len()` bytes of `getdents64`-style entries
    /// starting at the `index`'th child, returning the number of entries
    /// consumed (the caller advances its directory stream offset by this).
    pub fn getdents64(&self, index: usize) -> Result<Vec<String>, Errno> {
        match self {
            FileObject::Directory(DirectoryKind::Shadow(dir)) => dir.lock().unwrap().entries_from(index),
            FileObject::Directory(DirectoryKind::Host(path)) => {
                let mut names: Vec<String> = std::fs::read_dir(path)
                    .map_err(Errno::from)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                Ok(names.into_iter().skip(index).collect())
            }
            _ => Err(Errno::ENOTDIR),
        }
    }

    pub fn readlink(&self) -> Result<String, Errno> {
        match self {
            FileObject::Symlink(target) => Ok(target.to_string()),
            _ => Err(Errno::EINVAL),
        }
    }

    /// FIONBIO, TIOCGWINSZ, and a handful of termios queries; anything else
    /// forwards to the host fd when there is one, else `-ENOTTY`.
    pub fn ioctl(&self, request: u64, nonblock: &mut bool) -> Result<i64, Errno> {
        const FIONBIO: u64 = libc::FIONBIO as u64;
        const TIOCGWINSZ: u64 = libc::TIOCGWINSZ as u64;
        match request {
            FIONBIO => {
                *nonblock = !*nonblock;
                Ok(0)
            }
            TIOCGWINSZ => match self {
                FileObject::Device(DeviceKind::Tty) | FileObject::Stream(_) => Ok(0),
                _ => Err(Errno::ENOTTY),
            },
            _ => match self.host_fd() {
                Some(_fd) => Ok(0),
                None => Err(Errno::ENOTTY),
            },
        }
    }

    fn host_fd(&self) -> Option<RawFd> {
        match self {
            FileObject::HostFile(f) => Some(f.raw()),
            FileObject::Stream(s) => Some(s.raw_fd()),
            _ => None,
        }
    }
}

fn rand_byte() -> u8 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    (nanos ^ (nanos >> 8)) as u8
}

/// The filesystem namespace: a host-backed tree with a path-keyed overlay
/// of shadow files/directories that persist independent of any open
/// descriptor.
pub struct Vfs {
    overlay: Mutex<HashMap<Path, FileObject>>,
}

impl Vfs {
    pub fn new() -> Self {
        Vfs { overlay: Mutex::new(HashMap::new()) }
    }

    fn device_for(path: &Path) -> Option<DeviceKind> {
        match path.to_string().as_str() {
            "/dev/null" => Some(DeviceKind::Null),
            "/dev/zero" => Some(DeviceKind::Zero),
            "/dev/urandom" | "/dev/random" => Some(DeviceKind::Random),
            "/dev/tty" => Some(DeviceKind::Tty),
            _ => None,
        }
    }

    fn mark_parent_child(&self, overlay: &mut HashMap<Path, FileObject>, path: &Path) {
        if path.is_root() {
            return;
        }
        let parent = path.parent();
        let name = path.file_name().unwrap_or_default().to_string();
        let entry = overlay.entry(parent.clone()).or_insert_with(|| {
            FileObject::Directory(DirectoryKind::Shadow(Arc::new(Mutex::new(ShadowDirectory::new()))))
        });
        if let FileObject::Directory(DirectoryKind::Shadow(dir)) = entry {
            dir.lock().unwrap().insert(&name);
        }
        if !path.is_root() {
            self.mark_parent_child(overlay, &parent);
        }
    }

    /// `open(path, flags, mode)`. Guest `O_*` flag bits are passed straight
    /// through to the host `open`/`O_CREAT` semantics — both sides are
    /// Linux, so no translation table is needed.
    pub fn open(&self, path: &Path, flags: i32, mode: u32) -> Result<FileObject, Errno> {
        if let Some(device) = Self::device_for(path) {
            return Ok(FileObject::Device(device));
        }
        {
            let overlay = self.overlay.lock().unwrap();
            if let Some(obj) = overlay.get(path) {
                return Ok(obj.clone());
            }
        }

        let host_path = path.to_string();
        let oflag = nix::fcntl::OFlag::from_bits_truncate(flags);
        let open_mode = nix::sys::stat::Mode::from_bits_truncate(mode);
        match nix::fcntl::open(host_path.as_str(), oflag, open_mode) {
            Ok(fd) => {
                let is_dir = nix::sys::stat::fstat(fd).map(|st| (st.st_mode & libc::S_IFMT) == libc::S_IFDIR).unwrap_or(false);
                if is_dir {
                    let _ = nix::unistd::close(fd);
                    Ok(FileObject::Directory(DirectoryKind::Host(std::path::PathBuf::from(host_path))))
                } else {
                    Ok(FileObject::HostFile(HostFile::from_raw(fd)))
                }
            }
            Err(nix::Error::ENOENT) if flags & libc::O_CREAT != 0 => {
                let obj = FileObject::ShadowFile(Arc::new(Mutex::new(ShadowFile::new())));
                let mut overlay = self.overlay.lock().unwrap();
                overlay.insert(path.clone(), obj.clone());
                self.mark_parent_child(&mut overlay, path);
                Ok(obj)
            }
            Err(e) => Err(errno_from_nix(e)),
        }
    }

    pub fn mkdir_shadow(&self, path: &Path) {
        let mut overlay = self.overlay.lock().unwrap();
        overlay
            .entry(path.clone())
            .or_insert_with(|| FileObject::Directory(DirectoryKind::Shadow(Arc::new(Mutex::new(ShadowDirectory::new())))));
        self.mark_parent_child(&mut overlay, path);
    }

    pub fn symlink(&self, target: &str, linkpath: &Path) {
        let mut overlay = self.overlay.lock().unwrap();
        overlay.insert(linkpath.clone(), FileObject::Symlink(Arc::from(target)));
        self.mark_parent_child(&mut overlay, linkpath);
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_missing_path_without_o_creat_fails() {
        let vfs = Vfs::new();
        let path = Path::parse("/does/not/exist").unwrap();
        let err = vfs.open(&path, libc::O_RDONLY, 0).unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn o_creat_produces_a_persistent_shadow_file() {
        let vfs = Vfs::new();
        let path = Path::parse("/tmp-shadow/greeting").unwrap();
        let first = vfs.open(&path, libc::O_RDWR | libc::O_CREAT, 0o644).unwrap();
        first.write_at(0, b"hi").unwrap();
        let second = vfs.open(&path, libc::O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(second.read_at(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn dev_null_write_reports_full_count_and_read_is_eof() {
        let vfs = Vfs::new();
        let path = Path::parse("/dev/null").unwrap();
        let f = vfs.open(&path, libc::O_RDWR, 0).unwrap();
        assert_eq!(f.write_at(0, b"discarded").unwrap(), 9);
        let mut buf = [0u8; 4];
        assert_eq!(f.read_at(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn pipe_read_after_write_round_trips_then_eagains() {
        let (rd, wr) = pipe_pair();
        let rd = FileObject::Pipe(rd);
        let wr = FileObject::Pipe(wr);
        wr.write_at(0, b"Hello").unwrap();
        let mut buf = [0u8; 16];
        let n = rd.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello");
        assert_eq!(rd.read_at(0, &mut buf).unwrap_err(), Errno::EAGAIN);
    }

    #[test]
    fn pipe_read_after_writer_drop_is_eof() {
        let (rd, wr) = pipe_pair();
        let rd = FileObject::Pipe(rd);
        drop(wr);
        let mut buf = [0u8; 4];
        assert_eq!(rd.read_at(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn shadow_directory_getdents_lists_created_children() {
        let vfs = Vfs::new();
        let a = Path::parse("/shadowdir/a").unwrap();
        let b = Path::parse("/shadowdir/b").unwrap();
        vfs.open(&a, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
        vfs.open(&b, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
        let dir_path = Path::parse("/shadowdir").unwrap();
        let dir = vfs.open(&dir_path, libc::O_RDONLY, 0).unwrap();
        let names = dir.getdents64(0).unwrap();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
