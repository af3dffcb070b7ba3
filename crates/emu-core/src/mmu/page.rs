//! Per-page state: permissions, backing, and lazy materialization.
//!
//! Each page owns a small internal mutex around its byte buffer so that
//! `AddressSpace::read*`/`write*` can take the address space's reader-writer
//! lock on the *read* side (per §5 of the design) while still materializing
//! a page's backing store lazily on first touch.

use std::sync::{Arc, Mutex};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Read/write/execute permission triple for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prot {
    pub r: bool,
    pub w: bool,
    pub x: bool,
}

impl Prot {
    pub const NONE: Prot = Prot { r: false, w: false, x: false };
    pub const RW: Prot = Prot { r: true, w: true, x: false };
    pub const RX: Prot = Prot { r: true, w: false, x: true };
    pub const R: Prot = Prot { r: true, w: false, x: false };

    /// Decode from the Linux `PROT_*` bitmask (`PROT_READ=1, PROT_WRITE=2,
    /// PROT_EXEC=4`).
    pub fn from_bits(bits: u32) -> Self {
        Prot { r: bits & 1 != 0, w: bits & 2 != 0, x: bits & 4 != 0 }
    }
}

/// The minimal surface the MMU needs from a VFS file object to satisfy a
/// file-backed mapping, without the MMU depending on the VFS crate.
pub trait FileBacking: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> std::io::Result<usize>;
}

/// Where a page's bytes come from.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled on first touch, not backed by any file.
    Anonymous,
    /// Backed by a host file object at `(source, offset)`.
    /// `shared=false` (`MAP_PRIVATE`) detaches into a private copy on first
    /// write; `shared=true` (`MAP_SHARED`) writes straight back through.
    File { source: Arc<dyn FileBacking>, offset: u64, shared: bool },
}

enum PageBuf {
    /// Never touched: reads are zero (or, for file backings, not yet pulled
    /// from the file).
    Untouched,
    Materialized(Box<[u8; PAGE_SIZE as usize]>),
}

/// One mapped 4 KiB page. Lives in the two-level page directory.
pub struct Page {
    pub prot: Prot,
    pub backing: Backing,
    buf: Mutex<PageBuf>,
    dirty: std::sync::atomic::AtomicBool,
}

impl Page {
    pub fn anonymous(prot: Prot) -> Self {
        Page { prot, backing: Backing::Anonymous, buf: Mutex::new(PageBuf::Untouched), dirty: false.into() }
    }

    pub fn file_backed(prot: Prot, source: Arc<dyn FileBacking>, offset: u64, shared: bool) -> Self {
        Page {
            prot,
            backing: Backing::File { source, offset, shared },
            buf: Mutex::new(PageBuf::Untouched),
            dirty: false.into(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn materialize<'a>(&self, guard: &'a mut PageBuf) -> &'a mut [u8; PAGE_SIZE as usize] {
        if matches!(guard, PageBuf::Untouched) {
            let mut data = Box::new([0u8; PAGE_SIZE as usize]);
            if let Backing::File { source, offset, .. } = &self.backing {
                let _ = source.read_at(*offset, data.as_mut_slice());
            }
            *guard = PageBuf::Materialized(data);
        }
        match guard {
            PageBuf::Materialized(b) => b.as_mut(),
            PageBuf::Untouched => unreachable!(),
        }
    }

    /// Read `out.len()` bytes starting at byte offset `off` within the page.
    pub fn read_slice(&self, off: usize, out: &mut [u8]) {
        let mut guard = self.buf.lock().unwrap();
        let data = self.materialize(&mut guard);
        out.copy_from_slice(&data[off..off + out.len()]);
    }

    /// Write `data` starting at byte offset `off` within the page.
    /// `MAP_SHARED` file-backed pages write through to the source file.
    pub fn write_slice(&self, off: usize, data: &[u8]) {
        let mut guard = self.buf.lock().unwrap();
        let buf = self.materialize(&mut guard);
        buf[off..off + data.len()].copy_from_slice(data);
        self.dirty.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Backing::File { source, offset, shared: true } = &self.backing {
            let _ = source.write_at(offset + off as u64, data);
        }
    }
}
