//! Page pinning
//!
//! The buffer mapper never touches memory-management primitives directly;
//! it goes through a [`PageSource`], which hands out one [`PageRef`] per page
//! it pins and takes each back through [`PageSource::put_page`].

use std::sync::atomic::{AtomicUsize, Ordering};

use common::page::{PAGE_MASK, PAGE_SIZE};
use log::{debug, warn};

/// Reference to one pinned page, identified by its page-aligned address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageRef(usize);

impl PageRef {
    pub fn containing(addr: usize) -> Self {
        PageRef(addr & PAGE_MASK)
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

/// Collaborator that pins and releases pages of the caller's memory.
pub trait PageSource: Send + Sync {
    /// Pin `nr` pages starting at the page-aligned address `start`, pushing
    /// one reference per pinned page onto `pages`.
    ///
    /// Returns how many were pinned, which may be fewer than `nr`, or a
    /// positive errno when nothing could be pinned. References pushed before
    /// a failure are still owned by the caller and must be put back.
    fn pin_pages(
        &self,
        start: usize,
        nr: usize,
        write: bool,
        pages: &mut Vec<PageRef>,
    ) -> Result<usize, i32>;

    /// Mark a page modified before it is released.
    fn set_page_dirty(&self, page: PageRef);

    /// Release one pinned page.
    fn put_page(&self, page: PageRef);

    /// Make CPU cache lines of `page` coherent with the device.
    fn flush_dcache_page(&self, _page: PageRef) {}
}

/// Pins by reference only, counting what is outstanding.
///
/// Suitable for cache-coherent targets where the process's own memory is
/// what the engine reads and writes.
#[derive(Debug, Default)]
pub struct HostPages {
    pinned: AtomicUsize,
    dirtied: AtomicUsize,
}

impl HostPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages pinned and not yet put back.
    pub fn pinned(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    /// Pages marked dirty since creation.
    pub fn dirtied(&self) -> usize {
        self.dirtied.load(Ordering::Acquire)
    }
}

impl PageSource for HostPages {
    fn pin_pages(
        &self,
        start: usize,
        nr: usize,
        _write: bool,
        pages: &mut Vec<PageRef>,
    ) -> Result<usize, i32> {
        if start == 0 {
            return Err(libc::EFAULT);
        }
        for i in 0..nr {
            pages.push(PageRef(start + i * PAGE_SIZE));
        }
        self.pinned.fetch_add(nr, Ordering::AcqRel);
        Ok(nr)
    }

    fn set_page_dirty(&self, _page: PageRef) {
        self.dirtied.fetch_add(1, Ordering::AcqRel);
    }

    fn put_page(&self, _page: PageRef) {
        self.pinned.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pins with `mlock(2)` so the pages stay resident for the transfer.
///
/// Locks do not nest: releasing a page unlocks it even when another request
/// still holds a reference to the same page.
#[derive(Debug, Default)]
pub struct LockedPages {
    pinned: AtomicUsize,
}

impl LockedPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }
}

impl PageSource for LockedPages {
    fn pin_pages(
        &self,
        start: usize,
        nr: usize,
        _write: bool,
        pages: &mut Vec<PageRef>,
    ) -> Result<usize, i32> {
        let mut locked = 0;
        for i in 0..nr {
            let page = start + i * PAGE_SIZE;
            let rv = unsafe { libc::mlock(page as *const libc::c_void, PAGE_SIZE) };
            if rv != 0 {
                let errno = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EFAULT);
                warn!("mlock {:#x} failed, errno {}", page, errno);
                if locked == 0 {
                    return Err(errno);
                }
                break;
            }
            pages.push(PageRef(page));
            locked += 1;
        }
        self.pinned.fetch_add(locked, Ordering::AcqRel);
        Ok(locked)
    }

    fn set_page_dirty(&self, _page: PageRef) {}

    fn put_page(&self, page: PageRef) {
        let rv = unsafe { libc::munlock(page.addr() as *const libc::c_void, PAGE_SIZE) };
        if rv != 0 {
            debug!("munlock {:#x} failed", page.addr());
        }
        self.pinned.fetch_sub(1, Ordering::AcqRel);
    }
}
