//! Software loopback engine
//!
//! Stands in for the hardware engine in the daemon and in tests. Each device
//! has a sparse register file per BAR and a block of card memory. MM queues
//! copy between the request's pages and card memory at `ep_addr`; a write on
//! an ST H2C queue becomes a packet that the next read on the ST C2H queue
//! with the same index receives.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write;

use log::{debug, info, warn};
use parking_lot::Mutex;
use qdma_nl::WrbDescSize;

use crate::engine::{
    DeviceConfig, DeviceHandle, Engine, EngineResult, QueueConfig, QueueHandle, QueueMode,
};
use crate::error::EngineError;
use crate::request::{Direction, TransferRequest};
use crate::sg::SgEntry;

/// Bytes of register space decoded per BAR.
pub const BAR_SPAN: u32 = 0x10000;

const CFG_BLK_IDENTIFIER: u32 = 0x0;
const GLBL_RNGSZ: u32 = 0x204;

/// Ring sizes programmed into `GLBL_RNGSZ_0..15` at reset, one slot each
/// for the ring and the status entry.
const RING_SIZES: [u32; 16] = [
    2049, 65, 129, 193, 257, 385, 513, 769, 1025, 1537, 3073, 4097, 6145, 8193, 12289, 16385,
];
const RING_SIZE_MAX: u32 = 16384;
const C2H_BUF_SIZE_DEFAULT: u32 = 4096;

#[derive(Debug, Clone, Copy, Default)]
struct Descriptor {
    addr: u64,
    len: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct WriteBack {
    len: u32,
    pidx: u32,
}

struct SoftQueue {
    name: String,
    conf: QueueConfig,
    started: bool,
    pidx: u32,
    ring: Vec<Descriptor>,
    wrb: Vec<WriteBack>,
    wrb_pidx: u32,
}

impl SoftQueue {
    fn post(&mut self, sgl: &[SgEntry]) {
        for e in sgl {
            let slot = self.pidx as usize % self.ring.len();
            self.ring[slot] = Descriptor {
                addr: e.addr() as u64,
                len: e.len as u32,
            };
            self.pidx = (self.pidx + 1) % self.conf.ring_size;
        }
    }

    fn complete(&mut self, len: usize) {
        if self.wrb.is_empty() {
            return;
        }
        let slot = self.wrb_pidx as usize % self.wrb.len();
        self.wrb[slot] = WriteBack {
            len: len as u32,
            pidx: self.pidx,
        };
        self.wrb_pidx = (self.wrb_pidx + 1) % self.wrb.len() as u32;
    }
}

struct SoftDevice {
    conf: DeviceConfig,
    regs: BTreeMap<(u8, u32), u32>,
    card: Vec<u8>,
    queues: BTreeMap<QueueHandle, SoftQueue>,
    packets: BTreeMap<u32, VecDeque<Vec<u8>>>,
}

impl SoftDevice {
    fn new(conf: DeviceConfig) -> Self {
        let mut regs = BTreeMap::new();
        regs.insert(
            (conf.config_bar, CFG_BLK_IDENTIFIER),
            0x1fd3_0000 | conf.pci_func as u32,
        );
        for (i, size) in RING_SIZES.iter().enumerate() {
            regs.insert((conf.config_bar, GLBL_RNGSZ + 4 * i as u32), *size);
        }
        let card = vec![0u8; conf.card_mem_size];
        SoftDevice {
            conf,
            regs,
            card,
            queues: BTreeMap::new(),
            packets: BTreeMap::new(),
        }
    }

    fn check_reg(&self, bar: u8, addr: u32) -> EngineResult<()> {
        if bar != self.conf.config_bar && bar != self.conf.user_bar {
            return Err(EngineError::new(libc::EINVAL, format!("bar {} not mapped", bar)));
        }
        if addr % 4 != 0 || addr >= BAR_SPAN {
            return Err(EngineError::new(
                libc::EINVAL,
                format!("bar {} reg {:#x} out of range", bar, addr),
            ));
        }
        Ok(())
    }

    fn queue(&self, q: QueueHandle) -> EngineResult<&SoftQueue> {
        self.queues
            .get(&q)
            .ok_or_else(|| EngineError::new(libc::EINVAL, format!("bad queue handle {:#x}", q)))
    }

    fn queue_mut(&mut self, q: QueueHandle) -> EngineResult<&mut SoftQueue> {
        self.queues
            .get_mut(&q)
            .ok_or_else(|| EngineError::new(libc::EINVAL, format!("bad queue handle {:#x}", q)))
    }
}

#[derive(Default)]
struct Inner {
    next_idx: u32,
    next_dev: u64,
    next_queue: u64,
    devices: BTreeMap<DeviceHandle, SoftDevice>,
}

impl Inner {
    fn device(&self, dev: DeviceHandle) -> EngineResult<&SoftDevice> {
        self.devices
            .get(&dev)
            .ok_or_else(|| EngineError::new(libc::ENODEV, format!("bad device handle {}", dev.0)))
    }

    fn device_mut(&mut self, dev: DeviceHandle) -> EngineResult<&mut SoftDevice> {
        self.devices
            .get_mut(&dev)
            .ok_or_else(|| EngineError::new(libc::ENODEV, format!("bad device handle {}", dev.0)))
    }
}

/// In-process loopback engine.
#[derive(Default)]
pub struct SoftEngine {
    inner: Mutex<Inner>,
}

impl SoftEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hardware queues currently allocated across all devices.
    pub fn queue_count(&self) -> usize {
        self.inner.lock().devices.values().map(|d| d.queues.len()).sum()
    }

    /// Devices currently open.
    pub fn device_count(&self) -> usize {
        self.inner.lock().devices.len()
    }
}

/// Copy the bytes described by `sgl` into `out`.
fn gather(sgl: &[SgEntry], out: &mut [u8]) {
    let mut off = 0;
    for e in sgl {
        let n = e.len.min(out.len() - off);
        if n == 0 {
            break;
        }
        // Entries describe pinned memory of the submitting caller, live for
        // the duration of the submit call.
        let src = unsafe { std::slice::from_raw_parts(e.addr() as *const u8, n) };
        out[off..off + n].copy_from_slice(src);
        off += n;
    }
}

/// Copy `data` into the memory described by `sgl`; returns bytes copied.
fn scatter(sgl: &[SgEntry], data: &[u8]) -> usize {
    let mut off = 0;
    for e in sgl {
        let n = e.len.min(data.len() - off);
        if n == 0 {
            break;
        }
        let dst = unsafe { std::slice::from_raw_parts_mut(e.addr() as *mut u8, n) };
        dst.copy_from_slice(&data[off..off + n]);
        off += n;
    }
    off
}

fn dump_range<T>(
    name: &str,
    what: &str,
    ring: &[T],
    start: u32,
    end: u32,
    mut line: impl FnMut(&mut String, usize, &T),
) -> EngineResult<String> {
    if ring.is_empty() {
        return Err(EngineError::new(libc::EINVAL, format!("{} has no {} ring", name, what)));
    }
    let last = (end as usize).min(ring.len() - 1);
    let mut out = String::new();
    let _ = writeln!(out, "{} {} ring {}..{}:", name, what, start, last);
    for i in start as usize..=last {
        line(&mut out, i, &ring[i]);
    }
    Ok(out)
}

impl Engine for SoftEngine {
    fn open(&self, name: &str, conf: &DeviceConfig) -> EngineResult<(DeviceHandle, DeviceConfig)> {
        if conf.qsets_max == 0 {
            return Err(EngineError::new(libc::EINVAL, format!("{}: no queue sets", name)));
        }
        if conf.config_bar > 5 || conf.user_bar > 5 {
            return Err(EngineError::new(libc::EINVAL, format!("{}: bad BAR number", name)));
        }

        let mut inner = self.inner.lock();
        let mut resolved = conf.clone();
        resolved.idx = inner.next_idx;
        let handle = DeviceHandle(inner.next_dev);
        inner.next_idx += 1;
        inner.next_dev += 1;

        info!(
            "{}: {} opened as {}, max QP {}",
            name,
            resolved.bdf(),
            resolved.name(),
            resolved.qsets_max
        );
        inner.devices.insert(handle, SoftDevice::new(resolved.clone()));
        Ok((handle, resolved))
    }

    fn close(&self, dev: DeviceHandle) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let device = inner
            .devices
            .remove(&dev)
            .ok_or_else(|| EngineError::new(libc::ENODEV, format!("bad device handle {}", dev.0)))?;
        if !device.queues.is_empty() {
            debug!(
                "{}: released {} queues on close",
                device.conf.name(),
                device.queues.len()
            );
        }
        Ok(())
    }

    fn get_config(&self, dev: DeviceHandle) -> EngineResult<DeviceConfig> {
        Ok(self.inner.lock().device(dev)?.conf.clone())
    }

    fn queue_add(&self, dev: DeviceHandle, conf: &QueueConfig) -> EngineResult<QueueHandle> {
        let mut inner = self.inner.lock();
        let handle = QueueHandle(inner.next_queue);
        let device = inner.device_mut(dev)?;
        let dev_name = device.conf.name();

        if conf.qidx >= device.conf.qsets_max {
            return Err(EngineError::new(
                libc::EINVAL,
                format!("{}: qidx {} >= {}", dev_name, conf.qidx, device.conf.qsets_max),
            ));
        }
        if device
            .queues
            .values()
            .any(|q| q.conf.qidx == conf.qidx && q.conf.dir == conf.dir)
        {
            return Err(EngineError::new(
                libc::EBUSY,
                format!("{}: q {} {} already added", dev_name, conf.qidx, conf.dir),
            ));
        }

        let mut resolved = conf.clone();
        if resolved.ring_size == 0 {
            resolved.ring_size = RING_SIZES[0] - 1;
        }
        if resolved.ring_size > RING_SIZE_MAX {
            return Err(EngineError::new(
                libc::EINVAL,
                format!("{}: ring size {} too big", dev_name, resolved.ring_size),
            ));
        }
        let st_c2h = resolved.mode == QueueMode::Streaming && resolved.dir == Direction::C2H;
        if st_c2h {
            if resolved.buf_size == 0 {
                resolved.buf_size = C2H_BUF_SIZE_DEFAULT;
            }
            if resolved.wrb_desc_size.is_none() {
                resolved.wrb_desc_size = Some(WrbDescSize::Bytes8);
            }
        }

        let name = resolved.name(&dev_name);
        let ring = vec![Descriptor::default(); resolved.ring_size as usize];
        let wrb = if st_c2h {
            vec![WriteBack::default(); resolved.ring_size as usize]
        } else {
            Vec::new()
        };
        debug!("{} added, hndl {:#x}", name, handle);
        device.queues.insert(
            handle,
            SoftQueue {
                name,
                conf: resolved,
                started: false,
                pidx: 0,
                ring,
                wrb,
                wrb_pidx: 0,
            },
        );
        inner.next_queue += 1;
        Ok(handle)
    }

    fn queue_start(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let queue = inner.device_mut(dev)?.queue_mut(q)?;
        if queue.started {
            return Err(EngineError::new(libc::EINVAL, format!("{} already started", queue.name)));
        }
        queue.started = true;
        Ok(())
    }

    fn queue_stop(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let queue = inner.device_mut(dev)?.queue_mut(q)?;
        if !queue.started {
            return Err(EngineError::new(libc::EINVAL, format!("{} not started", queue.name)));
        }
        queue.started = false;
        Ok(())
    }

    fn queue_remove(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let device = inner.device_mut(dev)?;
        let queue = device
            .queues
            .remove(&q)
            .ok_or_else(|| EngineError::new(libc::EINVAL, format!("bad queue handle {:#x}", q)))?;
        if queue.conf.mode == QueueMode::Streaming && queue.conf.dir == Direction::C2H {
            device.packets.remove(&queue.conf.qidx);
        }
        debug!("{} removed", queue.name);
        Ok(())
    }

    fn queue_dump(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<String> {
        let inner = self.inner.lock();
        let queue = inner.device(dev)?.queue(q)?;
        let conf = &queue.conf;
        let mut out = String::new();
        let _ = write!(
            out,
            "{}: hndl {:#x}, ring {}, pidx {}, {}",
            queue.name,
            q,
            conf.ring_size,
            queue.pidx,
            if queue.started { "started" } else { "stopped" }
        );
        if let Some(wrbsz) = conf.wrb_desc_size {
            let _ = write!(
                out,
                ", buf {}, wrbsz {}, wrb pidx {}",
                conf.buf_size, wrbsz as u32, queue.wrb_pidx
            );
        }
        out.push('\n');
        Ok(out)
    }

    fn queue_dump_desc(
        &self,
        dev: DeviceHandle,
        q: QueueHandle,
        start: u32,
        end: u32,
    ) -> EngineResult<String> {
        let inner = self.inner.lock();
        let queue = inner.device(dev)?.queue(q)?;
        dump_range(&queue.name, "desc", &queue.ring, start, end, |out, i, d| {
            let _ = writeln!(out, "{:5}: 0x{:016x} {:#x}", i, d.addr, d.len);
        })
    }

    fn queue_dump_wrb(
        &self,
        dev: DeviceHandle,
        q: QueueHandle,
        start: u32,
        end: u32,
    ) -> EngineResult<String> {
        let inner = self.inner.lock();
        let queue = inner.device(dev)?.queue(q)?;
        dump_range(&queue.name, "wrb", &queue.wrb, start, end, |out, i, w| {
            let _ = writeln!(out, "{:5}: len {:#x} pidx {}", i, w.len, w.pidx);
        })
    }

    fn submit(
        &self,
        dev: DeviceHandle,
        q: QueueHandle,
        req: &TransferRequest<'_>,
    ) -> EngineResult<usize> {
        let mut inner = self.inner.lock();
        let device = inner.device_mut(dev)?;
        let queue = device.queue(q)?;
        let name = queue.name.clone();
        let (mode, dir, qidx) = (queue.conf.mode, queue.conf.dir, queue.conf.qidx);

        if !queue.started {
            return Err(EngineError::new(libc::EINVAL, format!("{} not started", name)));
        }
        if req.dir != dir {
            return Err(EngineError::new(
                libc::EINVAL,
                format!("{}: {} request on {} queue", name, req.dir, dir),
            ));
        }
        if req.timeout.is_zero() {
            return Err(EngineError::timeout(format!("{} timed out", name)));
        }

        let done = match (mode, dir) {
            (QueueMode::MemoryMapped, _) => {
                let start = usize::try_from(req.ep_addr).unwrap_or(usize::MAX);
                let end = start.checked_add(req.count).filter(|end| *end <= device.card.len());
                let Some(end) = end else {
                    return Err(EngineError::new(
                        libc::EINVAL,
                        format!("{}: {:#x},{} beyond card memory", name, req.ep_addr, req.count),
                    ));
                };
                if dir == Direction::H2C {
                    gather(req.sgl, &mut device.card[start..end]);
                    req.count
                } else {
                    scatter(req.sgl, &device.card[start..end])
                }
            }
            (QueueMode::Streaming, Direction::H2C) => {
                let mut pkt = vec![0u8; req.count];
                gather(req.sgl, &mut pkt);
                device.packets.entry(qidx).or_default().push_back(pkt);
                req.count
            }
            (QueueMode::Streaming, Direction::C2H) => {
                let Some(pkt) = device.packets.get_mut(&qidx).and_then(|q| q.pop_front()) else {
                    return Err(EngineError::timeout(format!("{}: no packet", name)));
                };
                if pkt.len() > req.count {
                    warn!("{}: packet {} truncated to {}", name, pkt.len(), req.count);
                }
                let n = pkt.len().min(req.count);
                scatter(req.sgl, &pkt[..n])
            }
        };

        let queue = device.queue_mut(q)?;
        queue.post(req.sgl);
        queue.complete(done);
        Ok(done)
    }

    fn register_read(&self, dev: DeviceHandle, bar: u8, addr: u32) -> EngineResult<u32> {
        let inner = self.inner.lock();
        let device = inner.device(dev)?;
        device.check_reg(bar, addr)?;
        Ok(device.regs.get(&(bar, addr)).copied().unwrap_or(0))
    }

    fn register_write(&self, dev: DeviceHandle, bar: u8, addr: u32, val: u32) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let device = inner.device_mut(dev)?;
        device.check_reg(bar, addr)?;
        device.regs.insert((bar, addr), val);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::HostPages;
    use crate::sg::BufferMapper;

    fn open_one(engine: &SoftEngine) -> (DeviceHandle, DeviceConfig) {
        engine.open("test", &DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_indices_increase() {
        let engine = SoftEngine::new();
        let (_, a) = open_one(&engine);
        let (_, b) = open_one(&engine);
        assert_eq!(a.idx, 0);
        assert_eq!(b.idx, 1);
    }

    #[test]
    fn test_double_queue_add() {
        let engine = SoftEngine::new();
        let (dev, _) = open_one(&engine);
        let conf = QueueConfig::new(1, QueueMode::MemoryMapped, Direction::H2C);
        engine.queue_add(dev, &conf).unwrap();
        let err = engine.queue_add(dev, &conf).unwrap_err();
        assert_eq!(err.errno, libc::EBUSY);
    }

    #[test]
    fn test_registers() {
        let engine = SoftEngine::new();
        let (dev, conf) = open_one(&engine);
        assert_eq!(engine.register_read(dev, conf.config_bar, GLBL_RNGSZ).unwrap(), 2049);
        engine.register_write(dev, conf.user_bar, 0x60, 0xabcd).unwrap();
        assert_eq!(engine.register_read(dev, conf.user_bar, 0x60).unwrap(), 0xabcd);
        assert!(engine.register_read(dev, 4, 0).is_err());
        assert!(engine.register_read(dev, conf.user_bar, 0x61).is_err());
    }

    #[test]
    fn test_mm_loopback() {
        let engine = SoftEngine::new();
        let pages = HostPages::new();
        let (dev, _) = open_one(&engine);
        let h2c = engine
            .queue_add(dev, &QueueConfig::new(0, QueueMode::MemoryMapped, Direction::H2C))
            .unwrap();
        let c2h = engine
            .queue_add(dev, &QueueConfig::new(0, QueueMode::MemoryMapped, Direction::C2H))
            .unwrap();
        engine.queue_start(dev, h2c).unwrap();
        engine.queue_start(dev, c2h).unwrap();

        let src: Vec<u8> = (0..6000u32).map(|i| i as u8).collect();
        let mut mapper = BufferMapper::new(&pages, Direction::H2C);
        let sgl = mapper.map(src.as_ptr() as usize, src.len()).unwrap();
        let req = TransferRequest::new(Direction::H2C, 0x100, sgl);
        assert_eq!(engine.submit(dev, h2c, &req).unwrap(), 6000);
        mapper.unmap();

        let mut dst = vec![0u8; 6000];
        let mut mapper = BufferMapper::new(&pages, Direction::C2H);
        let sgl = mapper.map(dst.as_mut_ptr() as usize, dst.len()).unwrap();
        let req = TransferRequest::new(Direction::C2H, 0x100, sgl);
        assert_eq!(engine.submit(dev, c2h, &req).unwrap(), 6000);
        mapper.unmap();

        assert_eq!(src, dst);
        assert_eq!(pages.pinned(), 0);
    }

    #[test]
    fn test_submit_requires_start() {
        let engine = SoftEngine::new();
        let pages = HostPages::new();
        let (dev, _) = open_one(&engine);
        let q = engine
            .queue_add(dev, &QueueConfig::new(0, QueueMode::MemoryMapped, Direction::H2C))
            .unwrap();
        let buf = [0u8; 16];
        let mut mapper = BufferMapper::new(&pages, Direction::H2C);
        let sgl = mapper.map(buf.as_ptr() as usize, buf.len()).unwrap();
        let err = engine
            .submit(dev, q, &TransferRequest::new(Direction::H2C, 0, sgl))
            .unwrap_err();
        assert_eq!(err.errno, libc::EINVAL);
    }

    #[test]
    fn test_st_c2h_empty_times_out() {
        let engine = SoftEngine::new();
        let pages = HostPages::new();
        let (dev, _) = open_one(&engine);
        let q = engine
            .queue_add(dev, &QueueConfig::new(2, QueueMode::Streaming, Direction::C2H))
            .unwrap();
        engine.queue_start(dev, q).unwrap();
        let mut buf = [0u8; 16];
        let mut mapper = BufferMapper::new(&pages, Direction::C2H);
        let sgl = mapper.map(buf.as_mut_ptr() as usize, buf.len()).unwrap();
        let err = engine
            .submit(dev, q, &TransferRequest::new(Direction::C2H, 0, sgl))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_desc_dump_clamps() {
        let engine = SoftEngine::new();
        let (dev, _) = open_one(&engine);
        let mut conf = QueueConfig::new(0, QueueMode::MemoryMapped, Direction::H2C);
        conf.ring_size = 4;
        let q = engine.queue_add(dev, &conf).unwrap();
        let text = engine.queue_dump_desc(dev, q, 2, 100).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(engine.queue_dump_wrb(dev, q, 0, 1).is_err());
    }
}
