//! Guest virtual address space: the two-level page directory and the
//! mmap/munmap/mprotect/brk/read*/write* contract built on top of it.
//!
//! The directory is "two-level" in the sense the design calls for: the top
//! bits of a guest address select a chunk, and within a chunk pages are
//! addressed directly. We realize this as a `BTreeMap<u64, Page>` keyed by
//! page index rather than a literal nested array — the ordered map gives us
//! the same O(log n) point lookup plus the range queries mmap/munmap need to
//! find holes and touch contiguous runs, without preallocating the upper
//! directory for a 48-bit space that is almost always sparse.
//!
//! Permission is authoritative per page (`Page::prot`); there is no separate
//! region table duplicating it. A small set of named regions is kept only
//! for bookkeeping that genuinely needs a range view: the growable `brk`
//! heap and hole-finding for hint-less `mmap`.

pub mod page;

use std::sync::Arc;

use page::{Backing, FileBacking, Page, Prot, PAGE_SHIFT, PAGE_SIZE};

/// Lowest address handed out for hint-less mmaps, chosen to sit well above
/// a typical ELF image and its brk heap, mirroring the Linux mmap_min_addr
/// / mmap_base convention for a flat, ASLR-free layout.
pub const MMAP_BASE: u64 = 0x0000_7f00_0000_0000;
/// One past the highest canonical user address (2^47).
pub const USER_ADDR_END: u64 = 0x0000_8000_0000_0000;

fn page_index(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

fn is_canonical_user(addr: u64) -> bool {
    addr < USER_ADDR_END
}

/// Administrative failure from an MMU operation — these map to a guest
/// errno at the syscall boundary, distinct from a `GuestTrap::Segv` raised
/// by an in-flight instruction's memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// No free range of the requested size (or the MAP_FIXED range
    /// collides with an existing mapping and MAP_FIXED_NOREPLACE was set).
    NoSpace,
    /// Address, length, or offset was not page-aligned.
    Misaligned,
    /// `addr`/`len` described a reserved or out-of-range region.
    InvalidRange,
}

/// Flags governing how the requested range participates in the mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapFlags {
    /// MAP_FIXED: place exactly at `hint`, unmapping anything already there.
    pub fixed: bool,
    /// MAP_SHARED (vs MAP_PRIVATE): writes to a file backing go through.
    pub shared: bool,
    /// MAP_ANONYMOUS: ignore `fd`/`offset`, zero-fill backing.
    pub anonymous: bool,
}

/// A guest process's virtual address space.
pub struct AddressSpace {
    pages: std::collections::BTreeMap<u64, Arc<Page>>,
    brk_start: u64,
    brk_cur: u64,
    next_mmap_hint: u64,
}

impl AddressSpace {
    pub fn new(brk_start: u64) -> Self {
        AddressSpace {
            pages: std::collections::BTreeMap::new(),
            brk_start,
            brk_cur: brk_start,
            next_mmap_hint: MMAP_BASE,
        }
    }

    fn page_exists(&self, idx: u64) -> bool {
        self.pages.contains_key(&idx)
    }

    /// Find `count` contiguous free page indices at or above `from`.
    fn find_hole(&self, from: u64, count: u64) -> Option<u64> {
        let mut candidate = from.max(page_index(MMAP_BASE));
        loop {
            if candidate + count > page_index(USER_ADDR_END) {
                return None;
            }
            match self
                .pages
                .range(candidate..candidate + count)
                .next()
            {
                None => return Some(candidate),
                Some((&hit, _)) => candidate = hit + 1,
            }
        }
    }

    fn insert_anon_range(&mut self, start_idx: u64, count: u64, prot: Prot) {
        for i in 0..count {
            self.pages.insert(start_idx + i, Arc::new(Page::anonymous(prot)));
        }
    }

    fn insert_file_range(
        &mut self,
        start_idx: u64,
        count: u64,
        prot: Prot,
        source: Arc<dyn FileBacking>,
        file_offset: u64,
        shared: bool,
    ) {
        for i in 0..count {
            let page = Page::file_backed(prot, Arc::clone(&source), file_offset + i * PAGE_SIZE, shared);
            self.pages.insert(start_idx + i, Arc::new(page));
        }
    }

    /// `mmap(hint, len, prot, flags, fd, off)`. `len` need not be
    /// page-aligned; it is rounded up. Returns the base address of the
    /// mapping, or an error mapping to a guest errno.
    pub fn mmap(
        &mut self,
        hint: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        file: Option<(Arc<dyn FileBacking>, u64)>,
    ) -> Result<u64, MmuError> {
        if len == 0 {
            return Err(MmuError::InvalidRange);
        }
        let count = len.div_ceil(PAGE_SIZE);

        let base_idx = if flags.fixed {
            if hint % PAGE_SIZE != 0 {
                return Err(MmuError::Misaligned);
            }
            let idx = page_index(hint);
            if !is_canonical_user(hint) || !is_canonical_user(hint + count * PAGE_SIZE - 1) {
                return Err(MmuError::InvalidRange);
            }
            for i in 0..count {
                self.pages.remove(&(idx + i));
            }
            idx
        } else {
            let from = if hint != 0 { page_index(hint) } else { self.next_mmap_hint >> PAGE_SHIFT };
            self.find_hole(from, count).ok_or(MmuError::NoSpace)?
        };

        if flags.anonymous || file.is_none() {
            self.insert_anon_range(base_idx, count, prot);
        } else {
            let (source, offset) = file.unwrap();
            if offset % PAGE_SIZE != 0 {
                return Err(MmuError::Misaligned);
            }
            self.insert_file_range(base_idx, count, prot, source, offset, flags.shared);
        }

        let base_addr = base_idx << PAGE_SHIFT;
        self.next_mmap_hint = (base_idx + count) << PAGE_SHIFT;
        Ok(base_addr)
    }

    /// `munmap(addr, len)`: unmap every page whose index falls in the
    /// covered range. Matches the real syscall's contract: unmapping a hole,
    /// or a range that is only partially mapped, is not an error — only a
    /// misaligned `addr`/`len` or a range reaching outside the canonical
    /// user half of the address space is rejected.
    pub fn munmap(&mut self, addr: u64, len: u64) -> Result<(), MmuError> {
        if addr % PAGE_SIZE != 0 || len == 0 {
            return Err(MmuError::Misaligned);
        }
        let count = len.div_ceil(PAGE_SIZE);
        if !is_canonical_user(addr) || !is_canonical_user(addr + count * PAGE_SIZE - 1) {
            return Err(MmuError::InvalidRange);
        }
        let start = page_index(addr);
        for i in 0..count {
            self.pages.remove(&(start + i));
        }
        Ok(())
    }

    /// `mprotect(addr, len, prot)`: change permission on an existing range.
    /// Every page in the range must already be mapped.
    pub fn mprotect(&mut self, addr: u64, len: u64, prot: Prot) -> Result<(), MmuError> {
        if addr % PAGE_SIZE != 0 || len == 0 {
            return Err(MmuError::Misaligned);
        }
        let start = page_index(addr);
        let count = len.div_ceil(PAGE_SIZE);
        for i in 0..count {
            let idx = start + i;
            let old = self.pages.get(&idx).ok_or(MmuError::InvalidRange)?;
            let replacement = match &old.backing {
                Backing::Anonymous => Page::anonymous(prot),
                Backing::File { source, offset, shared } => {
                    Page::file_backed(prot, Arc::clone(source), *offset, *shared)
                }
            };
            self.pages.insert(idx, Arc::new(replacement));
        }
        Ok(())
    }

    /// `brk(new_end)`: grow or shrink the heap region that starts at
    /// `brk_start`. Growing maps fresh RW anonymous pages; shrinking unmaps
    /// them. Returns the new break.
    pub fn brk(&mut self, new_end: u64) -> u64 {
        if new_end == 0 || new_end < self.brk_start {
            return self.brk_cur;
        }
        let old_top = self.brk_cur.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let new_top = new_end.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        if new_top > old_top {
            let start = page_index(old_top);
            let count = (new_top - old_top) / PAGE_SIZE;
            self.insert_anon_range(start, count, Prot::RW);
        } else if new_top < old_top {
            let start = page_index(new_top);
            let count = (old_top - new_top) / PAGE_SIZE;
            for i in 0..count {
                self.pages.remove(&(start + i));
            }
        }
        self.brk_cur = new_end;
        new_end
    }

    fn page_for(&self, addr: u64, need_write: bool, need_exec: bool) -> Result<(&Arc<Page>, usize), crate::error::GuestTrap> {
        let idx = page_index(addr);
        let off = (addr & (PAGE_SIZE - 1)) as usize;
        let page = self.pages.get(&idx).ok_or(crate::error::GuestTrap::Segv { addr, write: need_write })?;
        let ok = if need_exec { page.prot.x } else if need_write { page.prot.w } else { page.prot.r };
        if !ok {
            return Err(crate::error::GuestTrap::Segv { addr, write: need_write });
        }
        Ok((page, off))
    }

    /// Read `out.len()` bytes starting at `addr`, honoring read permission
    /// and splitting the read across a page boundary if it straddles one.
    pub fn read_bytes(&self, addr: u64, out: &mut [u8]) -> crate::error::Result<()> {
        let mut done = 0usize;
        while done < out.len() {
            let cur = addr + done as u64;
            let (page, off) = self.page_for(cur, false, false)?;
            let chunk = (PAGE_SIZE as usize - off).min(out.len() - done);
            page.read_slice(off, &mut out[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Write `data` starting at `addr`, honoring write permission and
    /// splitting the write across a page boundary if it straddles one.
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> crate::error::Result<()> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr + done as u64;
            let (page, off) = self.page_for(cur, true, false)?;
            let chunk = (PAGE_SIZE as usize - off).min(data.len() - done);
            page.write_slice(off, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Fetch `len` bytes for instruction decoding, honoring X permission
    /// instead of R (a page can be mapped `r--` and unreadable as data
    /// while still fetchable, or vice versa, matching Linux's NX handling).
    pub fn fetch_code(&self, addr: u64, len: usize) -> crate::error::Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut done = 0usize;
        while done < len {
            let cur = addr + done as u64;
            let (page, off) = self.page_for(cur, false, true)?;
            let chunk = (PAGE_SIZE as usize - off).min(len - done);
            page.read_slice(off, &mut out[done..done + chunk]);
            done += chunk;
        }
        Ok(out)
    }

    pub fn read8(&self, addr: u64) -> crate::error::Result<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(addr, &mut b)?;
        Ok(b[0])
    }
    pub fn read16(&self, addr: u64) -> crate::error::Result<u16> {
        let mut b = [0u8; 2];
        self.read_bytes(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }
    pub fn read32(&self, addr: u64) -> crate::error::Result<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }
    pub fn read64(&self, addr: u64) -> crate::error::Result<u64> {
        let mut b = [0u8; 8];
        self.read_bytes(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }
    pub fn write8(&self, addr: u64, val: u8) -> crate::error::Result<()> {
        self.write_bytes(addr, &[val])
    }
    pub fn write16(&self, addr: u64, val: u16) -> crate::error::Result<()> {
        self.write_bytes(addr, &val.to_le_bytes())
    }
    pub fn write32(&self, addr: u64, val: u32) -> crate::error::Result<()> {
        self.write_bytes(addr, &val.to_le_bytes())
    }
    pub fn write64(&self, addr: u64, val: u64) -> crate::error::Result<()> {
        self.write_bytes(addr, &val.to_le_bytes())
    }

    /// Whether `addr` is currently mapped with at least the given access.
    pub fn is_mapped(&self, addr: u64, need_write: bool, need_exec: bool) -> bool {
        self.page_for(addr, need_write, need_exec).is_ok()
    }

    pub fn brk_current(&self) -> u64 {
        self.brk_cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_anon_then_read_is_zero() {
        let mut space = AddressSpace::new(0x10_0000);
        let addr = space.mmap(0, 4096, Prot::RW, MapFlags { anonymous: true, ..Default::default() }, None).unwrap();
        assert_eq!(space.read64(addr).unwrap(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut space = AddressSpace::new(0x10_0000);
        let addr = space.mmap(0, 4096, Prot::RW, MapFlags { anonymous: true, ..Default::default() }, None).unwrap();
        space.write64(addr + 8, 0xDEAD_BEEF_CAFE_BABE).unwrap();
        assert_eq!(space.read64(addr + 8).unwrap(), 0xDEAD_BEEF_CAFE_BABE);
    }

    #[test]
    fn unmapped_read_segvs() {
        let space = AddressSpace::new(0x10_0000);
        let err = space.read8(0x4000_0000).unwrap_err();
        assert!(matches!(err, crate::error::GuestTrap::Segv { write: false, .. }));
    }

    #[test]
    fn write_without_prot_w_segvs() {
        let mut space = AddressSpace::new(0x10_0000);
        let addr = space.mmap(0, 4096, Prot::R, MapFlags { anonymous: true, ..Default::default() }, None).unwrap();
        let err = space.write8(addr, 1).unwrap_err();
        assert!(matches!(err, crate::error::GuestTrap::Segv { write: true, .. }));
    }

    #[test]
    fn munmap_then_access_segvs() {
        let mut space = AddressSpace::new(0x10_0000);
        let addr = space.mmap(0, 4096, Prot::RW, MapFlags { anonymous: true, ..Default::default() }, None).unwrap();
        space.munmap(addr, 4096).unwrap();
        assert!(space.read8(addr).is_err());
    }

    #[test]
    fn munmap_of_an_unmapped_hole_succeeds() {
        let mut space = AddressSpace::new(0x10_0000);
        assert!(space.munmap(0x5000_0000, 4096).is_ok());
    }

    #[test]
    fn munmap_past_canonical_range_is_invalid() {
        let mut space = AddressSpace::new(0x10_0000);
        let err = space.munmap(USER_ADDR_END, 4096).unwrap_err();
        assert_eq!(err, MmuError::InvalidRange);
    }

    #[test]
    fn mprotect_removes_write_permission() {
        let mut space = AddressSpace::new(0x10_0000);
        let addr = space.mmap(0, 4096, Prot::RW, MapFlags { anonymous: true, ..Default::default() }, None).unwrap();
        space.write8(addr, 5).unwrap();
        space.mprotect(addr, 4096, Prot::R).unwrap();
        assert!(space.write8(addr, 6).is_err());
        assert_eq!(space.read8(addr).unwrap(), 5);
    }

    #[test]
    fn brk_grows_and_shrinks() {
        let mut space = AddressSpace::new(0x10_0000);
        let new_brk = space.brk(0x10_0000 + 8192);
        assert_eq!(new_brk, 0x10_0000 + 8192);
        space.write64(0x10_0000 + 4096, 42).unwrap();
        space.brk(0x10_0000);
        assert!(space.read8(0x10_0000 + 4096).is_err());
    }

    #[test]
    fn cross_page_read_spans_two_pages() {
        let mut space = AddressSpace::new(0x10_0000);
        let addr = space
            .mmap(0, 8192, Prot::RW, MapFlags { anonymous: true, ..Default::default() }, None)
            .unwrap();
        space.write64(addr + 4092, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(space.read64(addr + 4092).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn fixed_mmap_overwrites_existing_mapping() {
        let mut space = AddressSpace::new(0x10_0000);
        let addr = space.mmap(0, 4096, Prot::RW, MapFlags { anonymous: true, ..Default::default() }, None).unwrap();
        space.write8(addr, 9).unwrap();
        let addr2 = space
            .mmap(addr, 4096, Prot::R, MapFlags { anonymous: true, fixed: true, ..Default::default() }, None)
            .unwrap();
        assert_eq!(addr2, addr);
        assert_eq!(space.read8(addr).unwrap(), 0);
    }
}
