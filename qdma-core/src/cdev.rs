//! Character devices
//!
//! Every configured queue is reachable from user space through a node in the
//! `qdma` device class. A node resolves to an [`Endpoint`]; opening it yields
//! a [`CdevFile`] whose read/write each pin the caller's buffer, submit one
//! transfer to the engine and unpin again.
//!
//! The owning queue slot holds the only strong reference to an endpoint. The
//! class and open files hold weak ones, so once the slot lets go, the node is
//! gone and I/O on files still open fails with `NotSupported`.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info};
use parking_lot::Mutex;

use crate::engine::{DeviceHandle, Engine, QueueHandle, QueueMode};
use crate::error::{Error, Result};
use crate::page::PageSource;
use crate::request::{Direction, TransferRequest};
use crate::sg::BufferMapper;

/// Name of the device class all queue nodes live in.
pub const CLASS_NAME: &str = "qdma";

/// Minor numbers per device.
pub const MINOR_MAX: u32 = 255;

/// Position reported by `SeekFrom::End(0)`.
pub const SEEK_END_BASE: u64 = u32::MAX as u64;

const FIRST_MAJOR: u32 = 240;

/// Device-number range owned by one device: a major and its minors.
#[derive(Debug)]
pub struct CdevRegion {
    major: u32,
    used: [u64; 4],
}

impl CdevRegion {
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Lowest free minor.
    pub fn alloc(&mut self) -> Result<u32> {
        for minor in 0..MINOR_MAX {
            let (word, bit) = ((minor / 64) as usize, minor % 64);
            if self.used[word] & (1 << bit) == 0 {
                self.used[word] |= 1 << bit;
                return Ok(minor);
            }
        }
        Err(Error::NoSpace)
    }

    pub fn free(&mut self, minor: u32) {
        if minor < MINOR_MAX {
            self.used[(minor / 64) as usize] &= !(1 << (minor % 64));
        }
    }

    pub fn in_use(&self) -> u32 {
        self.used.iter().map(|w| w.count_ones()).sum()
    }
}

/// Class-wide namespace of device nodes.
pub struct DeviceClass {
    name: &'static str,
    next_major: AtomicU32,
    nodes: Mutex<BTreeMap<String, Weak<Endpoint>>>,
}

impl Default for DeviceClass {
    fn default() -> Self {
        Self::new(CLASS_NAME)
    }
}

impl DeviceClass {
    pub fn new(name: &'static str) -> Self {
        DeviceClass {
            name,
            next_major: AtomicU32::new(FIRST_MAJOR),
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocate a fresh major for a device.
    pub fn alloc_region(&self) -> CdevRegion {
        CdevRegion {
            major: self.next_major.fetch_add(1, Ordering::Relaxed),
            used: [0; 4],
        }
    }

    pub(crate) fn add_node(&self, ep: &Arc<Endpoint>) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if nodes.get(&ep.name).is_some_and(|w| w.strong_count() > 0) {
            info!("{}: device node exists", ep.name);
            return Err(Error::invalid(format!("{} device node exists", ep.name)));
        }
        nodes.insert(ep.name.clone(), Arc::downgrade(ep));
        debug!("{}/{} created, {}:{}", self.name, ep.name, ep.major, ep.minor);
        Ok(())
    }

    pub(crate) fn remove_node(&self, name: &str) {
        if self.nodes.lock().remove(name).is_some() {
            debug!("{}/{} destroyed", self.name, name);
        }
    }

    /// Node names currently present, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, ep)| ep.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.nodes.lock().get(name).and_then(Weak::upgrade)
    }

    /// Open a node by name.
    pub fn open(&self, name: &str) -> Result<CdevFile> {
        let ep = self
            .lookup(name)
            .ok_or_else(|| Error::NoSuchNode(name.to_owned()))?;
        ep.mode.open(&ep)?;
        Ok(CdevFile {
            ep: Arc::downgrade(&ep),
            name: ep.name.clone(),
            pos: 0,
        })
    }
}

/// Mode-specific hooks of an endpoint.
pub trait CdevOps {
    fn open(&self, _ep: &Endpoint) -> Result<()> {
        Ok(())
    }

    fn close(&self, _ep: &Endpoint) {}

    fn ioctl(&self, ep: &Endpoint, cmd: u32, _arg: usize) -> Result<i64> {
        info!("{} ioctl {:#x} NOT supported", ep.name, cmd);
        Err(Error::NotSupported)
    }

    /// Move `len` bytes between the buffer at `buf` and the queue. `pos` is
    /// the file position.
    fn read_write(
        &self,
        ep: &Endpoint,
        buf: usize,
        len: usize,
        pos: u64,
        write: bool,
    ) -> Result<usize>;
}

impl CdevOps for QueueMode {
    fn read_write(
        &self,
        ep: &Endpoint,
        buf: usize,
        len: usize,
        pos: u64,
        write: bool,
    ) -> Result<usize> {
        let ep_addr = match self {
            QueueMode::MemoryMapped => pos,
            QueueMode::Streaming => 0,
        };
        ep.submit(buf, len, ep_addr, write)
    }
}

/// User-visible handle of one configured queue.
pub struct Endpoint {
    name: String,
    major: u32,
    minor: u32,
    qidx: u32,
    dir: Direction,
    mode: QueueMode,
    dev: DeviceHandle,
    queue: QueueHandle,
    engine: Arc<dyn Engine>,
    pages: Arc<dyn PageSource>,
}

impl Endpoint {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        major: u32,
        minor: u32,
        qidx: u32,
        dir: Direction,
        mode: QueueMode,
        dev: DeviceHandle,
        queue: QueueHandle,
        engine: Arc<dyn Engine>,
        pages: Arc<dyn PageSource>,
    ) -> Self {
        Endpoint {
            name,
            major,
            minor,
            qidx,
            dir,
            mode,
            dev,
            queue,
            engine,
            pages,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn qidx(&self) -> u32 {
        self.qidx
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    /// Pin, submit one request, unpin.
    fn submit(&self, buf: usize, len: usize, ep_addr: u64, write: bool) -> Result<usize> {
        debug!(
            "{}, hndl {:#x}: buf {:#x},{}, pos {}, W {}",
            self.name, self.queue, buf, len, ep_addr, write
        );
        let dir = if write { Direction::H2C } else { Direction::C2H };
        let mut mapper = BufferMapper::new(self.pages.as_ref(), dir);
        let sgl = mapper.map(buf, len)?;
        let req = TransferRequest::new(dir, ep_addr, sgl);
        let rv = self.engine.submit(self.dev, self.queue, &req);
        mapper.unmap();
        rv.map_err(Error::from)
    }
}

/// An open node.
///
/// Reads and writes do not advance the position; MM callers seek to the
/// card address before every transfer.
pub struct CdevFile {
    ep: Weak<Endpoint>,
    name: String,
    pos: u64,
}

impl CdevFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn endpoint(&self) -> Result<Arc<Endpoint>> {
        self.ep.upgrade().ok_or_else(|| {
            info!("{}: endpoint gone, no rw", self.name);
            Error::NotSupported
        })
    }

    /// Card to host into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let ep = self.endpoint()?;
        ep.mode
            .read_write(&ep, buf.as_mut_ptr() as usize, buf.len(), self.pos, false)
    }

    /// Host to card from `buf`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let ep = self.endpoint()?;
        ep.mode
            .read_write(&ep, buf.as_ptr() as usize, buf.len(), self.pos, true)
    }

    pub fn ioctl(&mut self, cmd: u32, arg: usize) -> Result<i64> {
        let ep = self.endpoint()?;
        ep.mode.ioctl(&ep, cmd, arg)
    }

    /// `End` counts from the top of a 32-bit card address space.
    pub fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        let newpos = match to {
            SeekFrom::Start(off) => i128::from(off),
            SeekFrom::Current(off) => i128::from(self.pos) + i128::from(off),
            SeekFrom::End(off) => i128::from(SEEK_END_BASE) + i128::from(off),
        };
        if newpos < 0 || newpos > i128::from(i64::MAX) {
            return Err(Error::invalid(format!("{}: seek to {}", self.name, newpos)));
        }
        self.pos = newpos as u64;
        debug!("{}: pos={}", self.name, self.pos);
        Ok(self.pos)
    }
}

impl Drop for CdevFile {
    fn drop(&mut self) {
        if let Some(ep) = self.ep.upgrade() {
            ep.mode.close(&ep);
        }
    }
}
