use std::sync::atomic::{AtomicUsize, Ordering};

use common::page::{PAGE_MASK, PAGE_SIZE};
use qdma_core::{BufferMapper, Direction, Error, PageRef, PageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    /// Fail outright with this errno
    Refuse(i32),
    /// Pin only this many pages
    Short(usize),
    /// Hand out the same page twice at this index
    Alias(usize),
}

struct FaultyPages {
    fault: Fault,
    pinned: AtomicUsize,
    dirtied: AtomicUsize,
    flushed: AtomicUsize,
}

impl FaultyPages {
    fn new(fault: Fault) -> Self {
        FaultyPages {
            fault,
            pinned: AtomicUsize::new(0),
            dirtied: AtomicUsize::new(0),
            flushed: AtomicUsize::new(0),
        }
    }

    fn pinned(&self) -> usize {
        self.pinned.load(Ordering::SeqCst)
    }

    fn dirtied(&self) -> usize {
        self.dirtied.load(Ordering::SeqCst)
    }
}

impl PageSource for FaultyPages {
    fn pin_pages(
        &self,
        start: usize,
        nr: usize,
        _write: bool,
        pages: &mut Vec<PageRef>,
    ) -> Result<usize, i32> {
        assert_eq!(start & !PAGE_MASK, 0);
        let n = match self.fault {
            Fault::Refuse(errno) => return Err(errno),
            Fault::Short(n) => n.min(nr),
            _ => nr,
        };
        for i in 0..n {
            let page = match self.fault {
                Fault::Alias(at) if i == at => start + (i - 1) * PAGE_SIZE,
                _ => start + i * PAGE_SIZE,
            };
            pages.push(PageRef::containing(page));
        }
        self.pinned.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }

    fn set_page_dirty(&self, _page: PageRef) {
        self.dirtied.fetch_add(1, Ordering::SeqCst);
    }

    fn put_page(&self, _page: PageRef) {
        self.pinned.fetch_sub(1, Ordering::SeqCst);
    }

    fn flush_dcache_page(&self, _page: PageRef) {
        self.flushed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_sgl_covers_buffer_exactly() {
    let src = FaultyPages::new(Fault::None);
    let base = 0x40_0000;
    for offset in [0, 1, 0x7ff, PAGE_SIZE - 1] {
        for len in [1, 2, PAGE_SIZE - 1, PAGE_SIZE, PAGE_SIZE + 1, 5 * PAGE_SIZE + 3] {
            let addr = base + offset;
            let mut mapper = BufferMapper::new(&src, Direction::H2C);
            let sgl = mapper.map(addr, len).unwrap().to_vec();

            let expect_pages = ((addr + len - 1) >> 12) - (addr >> 12) + 1;
            assert_eq!(sgl.len(), expect_pages, "{:#x},{}", addr, len);
            assert_eq!(sgl.iter().map(|e| e.len).sum::<usize>(), len);
            assert_eq!(sgl[0].addr(), addr);
            for e in &sgl[1..] {
                assert_eq!(e.offset, 0);
            }
            for pair in sgl.windows(2) {
                assert_eq!(pair[0].addr() + pair[0].len, pair[1].addr());
            }
            assert_eq!(src.pinned(), expect_pages);

            mapper.unmap();
            assert_eq!(src.pinned(), 0);
        }
    }
    assert_eq!(src.dirtied(), 0);
    assert!(src.flushed.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_zero_length_rejected() {
    let src = FaultyPages::new(Fault::None);
    let mut mapper = BufferMapper::new(&src, Direction::C2H);
    assert!(matches!(
        mapper.map(0x40_0123, 0),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(src.pinned(), 0);
}

#[test]
fn test_refused_pin_releases_nothing() {
    let src = FaultyPages::new(Fault::Refuse(libc::EFAULT));
    let mut mapper = BufferMapper::new(&src, Direction::C2H);
    assert_eq!(
        mapper.map(0x40_0000, 3 * PAGE_SIZE).unwrap_err(),
        Error::PinFailed(libc::EFAULT)
    );
    assert_eq!(src.pinned(), 0);
    assert_eq!(mapper.pages_nr(), 0);
}

#[test]
fn test_partial_pin_released() {
    let src = FaultyPages::new(Fault::Short(2));
    let mut mapper = BufferMapper::new(&src, Direction::C2H);
    assert_eq!(
        mapper.map(0x40_0000, 4 * PAGE_SIZE).unwrap_err(),
        Error::PartialPin {
            pinned: 2,
            requested: 4
        }
    );
    assert_eq!(src.pinned(), 0);
    // Failed maps never dirty, even for C2H.
    assert_eq!(src.dirtied(), 0);
}

#[test]
fn test_duplicate_page_released() {
    let src = FaultyPages::new(Fault::Alias(2));
    let mut mapper = BufferMapper::new(&src, Direction::H2C);
    assert_eq!(
        mapper.map(0x40_0010, 4 * PAGE_SIZE).unwrap_err(),
        Error::DuplicatePage(2)
    );
    assert_eq!(src.pinned(), 0);
    assert!(mapper.sgl().is_empty());
}

#[test]
fn test_c2h_unmap_dirties_every_page() {
    let src = FaultyPages::new(Fault::None);
    {
        let mut mapper = BufferMapper::new(&src, Direction::C2H);
        mapper.map(0x40_0800, 2 * PAGE_SIZE).unwrap();
        assert_eq!(src.pinned(), 3);
    }
    assert_eq!(src.pinned(), 0);
    assert_eq!(src.dirtied(), 3);
}

#[test]
fn test_remap_refused_while_mapped() {
    let src = FaultyPages::new(Fault::None);
    let mut mapper = BufferMapper::new(&src, Direction::H2C);
    mapper.map(0x40_0000, PAGE_SIZE).unwrap();
    assert!(mapper.map(0x50_0000, PAGE_SIZE).is_err());
    assert_eq!(src.pinned(), 1);
    mapper.unmap();
    mapper.map(0x50_0000, PAGE_SIZE).unwrap();
    assert_eq!(src.pinned(), 1);
}
