//! User buffer to scatter-gather mapping
//!
//! A [`BufferMapper`] lives for exactly one transfer. `map` pins every page
//! the buffer touches and describes it as a list of `(page, offset, len)`
//! entries; `unmap` (or drop) releases everything again. Every failure inside
//! `map` goes through the same release path, so a failed `map` leaves nothing
//! pinned.

use std::cmp;

use common::page::{offset_in_page, pages_spanned, PAGE_MASK, PAGE_SIZE};
use log::{error, info, trace};

use crate::error::{Error, Result};
use crate::page::{PageRef, PageSource};
use crate::request::Direction;

/// One contiguous run within a pinned page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub page: PageRef,
    pub offset: usize,
    pub len: usize,
}

impl SgEntry {
    /// Address of the first byte of the run.
    pub fn addr(&self) -> usize {
        self.page.addr() + self.offset
    }
}

/// Pins one user buffer and owns the pins until unmapped.
pub struct BufferMapper<'a> {
    source: &'a dyn PageSource,
    dir: Direction,
    pages: Vec<PageRef>,
    sgl: Vec<SgEntry>,
}

impl<'a> BufferMapper<'a> {
    pub fn new(source: &'a dyn PageSource, dir: Direction) -> Self {
        BufferMapper {
            source,
            dir,
            pages: Vec::new(),
            sgl: Vec::new(),
        }
    }

    /// Pin `[addr, addr + len)` and build its scatter-gather list.
    pub fn map(&mut self, addr: usize, len: usize) -> Result<&[SgEntry]> {
        if !self.pages.is_empty() {
            return Err(Error::invalid("buffer already mapped"));
        }
        let pages_nr = match pages_spanned(addr, len) {
            Some(nr) if nr > 0 && len > 0 => nr,
            _ => return Err(Error::invalid(format!("buffer {:#x},{}", addr, len))),
        };

        if self.sgl.try_reserve_exact(pages_nr).is_err() {
            info!("sgl OOM, {} entries", pages_nr);
            return Err(Error::OutOfMemory);
        }
        if self.pages.try_reserve_exact(pages_nr).is_err() {
            info!("pages OOM, {} entries", pages_nr);
            self.release(false);
            return Err(Error::OutOfMemory);
        }

        let pinned = match self.source.pin_pages(
            addr & PAGE_MASK,
            pages_nr,
            self.dir.writes_host(),
            &mut self.pages,
        ) {
            Ok(n) => n,
            Err(errno) => {
                info!("unable to pin down {} user pages, {}", pages_nr, errno);
                self.release(false);
                return Err(Error::PinFailed(errno));
            }
        };
        if pinned != pages_nr || self.pages.len() != pages_nr {
            info!("unable to pin down all {} user pages, {}", pages_nr, pinned);
            self.release(false);
            return Err(Error::PartialPin {
                pinned,
                requested: pages_nr,
            });
        }

        if let Some(i) = self.pages.windows(2).position(|w| w[0] == w[1]) {
            error!("duplicate pages, {}, {}", i, i + 1);
            self.release(false);
            return Err(Error::DuplicatePage(i + 1));
        }

        let mut offset = offset_in_page(addr);
        let mut remaining = len;
        for &page in &self.pages {
            let nbytes = cmp::min(PAGE_SIZE - offset, remaining);
            self.source.flush_dcache_page(page);
            self.sgl.push(SgEntry {
                page,
                offset,
                len: nbytes,
            });
            remaining -= nbytes;
            offset = 0;
        }

        trace!("mapped {:#x},{} into {} entries", addr, len, pages_nr);
        Ok(&self.sgl)
    }

    /// Scatter-gather list of the mapped buffer; empty when nothing is mapped.
    pub fn sgl(&self) -> &[SgEntry] {
        &self.sgl
    }

    /// Pages currently pinned by this mapper.
    pub fn pages_nr(&self) -> usize {
        self.pages.len()
    }

    /// Release every pin. Pages the device wrote into are marked dirty
    /// first. No-op on a mapper holding nothing.
    pub fn unmap(&mut self) {
        self.release(self.dir.writes_host());
    }

    fn release(&mut self, dirty: bool) {
        self.sgl = Vec::new();
        for page in self.pages.drain(..) {
            if dirty {
                self.source.set_page_dirty(page);
            }
            self.source.put_page(page);
        }
        self.pages = Vec::new();
    }
}

impl Drop for BufferMapper<'_> {
    fn drop(&mut self) {
        self.unmap();
    }
}
