//! Queue registry
//!
//! [`DriverRegistry`] tracks attached devices by index under one global lock.
//! Each [`Device`] owns a fixed table of `2 * qmax` queue slots (the H2C
//! block, then the C2H block) under its own lock. A slot goes
//! `Empty -> Configured (+ endpoint) -> Empty`; adding onto a configured slot
//! is refused.
//!
//! Lock order: the global lock is never held while a device lock is taken.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::mem;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::cdev::{CdevRegion, DeviceClass, Endpoint};
use crate::engine::{DeviceConfig, DeviceHandle, Engine, QueueConfig, QueueHandle};
use crate::error::{Error, Result};
use crate::page::PageSource;
use crate::regs::{self, RegisterSpace};
use crate::request::Direction;

/// One `(queue index, direction)` slot.
#[derive(Default)]
pub struct QueueSlot {
    handle: QueueHandle,
    endpoint: Option<Arc<Endpoint>>,
    conf: Option<QueueConfig>,
    started: bool,
}

impl QueueSlot {
    pub fn is_configured(&self) -> bool {
        self.handle.is_valid() || self.endpoint.is_some()
    }
}

/// Snapshot of a slot, safe to hand out without the device lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub qidx: u32,
    pub dir: Direction,
    pub handle: QueueHandle,
    /// Character-device node, when bound
    pub node: Option<String>,
    pub started: bool,
}

impl SlotInfo {
    pub fn is_configured(&self) -> bool {
        self.handle.is_valid() || self.node.is_some()
    }
}

struct DeviceState {
    slots: Vec<QueueSlot>,
    region: CdevRegion,
    detached: bool,
}

/// An attached device and its queue table.
pub struct Device {
    name: String,
    handle: DeviceHandle,
    conf: DeviceConfig,
    qmax: u32,
    engine: Arc<dyn Engine>,
    pages: Arc<dyn PageSource>,
    class: Arc<DeviceClass>,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn idx(&self) -> u32 {
        self.conf.idx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.conf
    }

    pub fn qmax(&self) -> u32 {
        self.qmax
    }

    fn slot_index(&self, qidx: u32, dir: Direction) -> Result<usize> {
        if qidx >= self.qmax {
            info!("{} QID {} too big, {}", self.name, qidx, self.qmax);
            return Err(Error::IndexOutOfRange {
                qidx,
                qmax: self.qmax,
            });
        }
        Ok(match dir {
            Direction::H2C => qidx as usize,
            Direction::C2H => (self.qmax + qidx) as usize,
        })
    }

    fn check_attached(&self, state: &DeviceState) -> Result<()> {
        if state.detached {
            return Err(Error::NoSuchDevice(self.conf.idx));
        }
        Ok(())
    }

    fn slot<'a>(
        &self,
        state: &'a mut DeviceState,
        qidx: u32,
        dir: Direction,
        require_configured: bool,
    ) -> Result<&'a mut QueueSlot> {
        self.check_attached(state)?;
        let i = self.slot_index(qidx, dir)?;
        let slot = &mut state.slots[i];
        if require_configured && !slot.is_configured() {
            info!("{} QID {} {} NOT configured", self.name, qidx, dir);
            return Err(Error::NotConfigured(qidx));
        }
        Ok(slot)
    }

    fn info(qidx: u32, dir: Direction, slot: &QueueSlot) -> SlotInfo {
        SlotInfo {
            qidx,
            dir,
            handle: slot.handle,
            node: slot.endpoint.as_ref().map(|ep| ep.name().to_owned()),
            started: slot.started,
        }
    }

    /// Look a slot up, optionally insisting that it is configured.
    pub fn lookup(&self, qidx: u32, dir: Direction, require_configured: bool) -> Result<SlotInfo> {
        let mut state = self.state.lock();
        let slot = self.slot(&mut state, qidx, dir, require_configured)?;
        Ok(Self::info(qidx, dir, slot))
    }

    /// Allocate a hardware queue and bind a character device to it.
    ///
    /// If the endpoint cannot be created the hardware queue is released
    /// again and the slot stays empty.
    pub fn add(&self, conf: &QueueConfig) -> Result<SlotInfo> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if self.slot(state, conf.qidx, conf.dir, false)?.is_configured() {
            info!("{} QID {} {} already configured", self.name, conf.qidx, conf.dir);
            return Err(Error::AlreadyConfigured(conf.qidx));
        }

        let handle = self.engine.queue_add(self.handle, conf)?;
        debug!(
            "{} idx {}, {} {}, added, qhndl {:#x}",
            self.name,
            conf.qidx,
            conf.mode.name(),
            conf.dir,
            handle
        );

        // The character device is created whether or not one was asked for.
        let ep = match self.create_endpoint(&mut state.region, conf, handle) {
            Ok(ep) => ep,
            Err(e) => {
                if let Err(re) = self.engine.queue_remove(self.handle, handle) {
                    warn!("{} qhndl {:#x} release failed: {}", self.name, handle, re);
                }
                return Err(e);
            }
        };

        let slot = self.slot(state, conf.qidx, conf.dir, false)?;
        slot.handle = handle;
        slot.endpoint = Some(ep);
        slot.conf = Some(conf.clone());
        slot.started = false;
        Ok(Self::info(conf.qidx, conf.dir, slot))
    }

    /// Destroy the endpoint, release the hardware queue, empty the slot.
    ///
    /// The slot ends up empty even when the engine fails to release the
    /// queue; that failure is still returned.
    pub fn remove(&self, qidx: u32, dir: Direction) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = mem::take(self.slot(state, qidx, dir, true)?);

        if let Some(ep) = slot.endpoint {
            self.destroy_endpoint(&mut state.region, ep);
        }

        if slot.handle.is_valid() {
            self.engine.queue_remove(self.handle, slot.handle)?;
        } else {
            info!(
                "{} qidx {}/{}, {}, qhndl invalid",
                self.name, qidx, self.qmax, dir
            );
        }
        Ok(())
    }

    fn configured_handle(&self, slot: &QueueSlot, qidx: u32) -> Result<QueueHandle> {
        if !slot.handle.is_valid() {
            info!("{} QID {} has no hardware queue", self.name, qidx);
            return Err(Error::NotConfigured(qidx));
        }
        Ok(slot.handle)
    }

    pub fn start(&self, qidx: u32, dir: Direction) -> Result<()> {
        let mut state = self.state.lock();
        let slot = self.slot(&mut state, qidx, dir, true)?;
        let handle = self.configured_handle(slot, qidx)?;
        self.engine.queue_start(self.handle, handle)?;
        slot.started = true;
        Ok(())
    }

    pub fn stop(&self, qidx: u32, dir: Direction) -> Result<()> {
        let mut state = self.state.lock();
        let slot = self.slot(&mut state, qidx, dir, true)?;
        let handle = self.configured_handle(slot, qidx)?;
        self.engine.queue_stop(self.handle, handle)?;
        slot.started = false;
        Ok(())
    }

    pub fn dump(&self, qidx: u32, dir: Direction) -> Result<String> {
        let mut state = self.state.lock();
        let slot = self.slot(&mut state, qidx, dir, true)?;
        let handle = self.configured_handle(slot, qidx)?;
        let mut text = self.engine.queue_dump(self.handle, handle)?;
        if let Some(ep) = &slot.endpoint {
            let _ = writeln!(text, "cdev {}, {}:{}", ep.name(), ep.major(), ep.minor());
        }
        Ok(text)
    }

    /// Descriptor ring entries `start..=end`.
    pub fn dump_desc(&self, qidx: u32, dir: Direction, start: u32, end: u32) -> Result<String> {
        if end < start {
            return Err(Error::invalid(format!("range {}..{}", start, end)));
        }
        let mut state = self.state.lock();
        let slot = self.slot(&mut state, qidx, dir, true)?;
        let handle = self.configured_handle(slot, qidx)?;
        Ok(self.engine.queue_dump_desc(self.handle, handle, start, end)?)
    }

    /// Write-back ring entries `start..=end`.
    pub fn dump_wrb(&self, qidx: u32, dir: Direction, start: u32, end: u32) -> Result<String> {
        if end < start {
            return Err(Error::invalid(format!("range {}..{}", start, end)));
        }
        let mut state = self.state.lock();
        let slot = self.slot(&mut state, qidx, dir, true)?;
        let handle = self.configured_handle(slot, qidx)?;
        Ok(self.engine.queue_dump_wrb(self.handle, handle, start, end)?)
    }

    /// Every configured slot, in table order.
    pub fn queues(&self) -> Vec<SlotInfo> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_configured())
            .map(|(i, slot)| {
                let i = i as u32;
                let (qidx, dir) = if i < self.qmax {
                    (i, Direction::H2C)
                } else {
                    (i - self.qmax, Direction::C2H)
                };
                Self::info(qidx, dir, slot)
            })
            .collect()
    }

    /// One line per configured queue.
    pub fn list_queues(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for slot in state.slots.iter().filter(|s| s.is_configured()) {
            let name = slot
                .conf
                .as_ref()
                .map(|c| c.name(&self.name))
                .unwrap_or_else(|| self.name.clone());
            let _ = write!(
                out,
                "{} hndl {:#x}, {}",
                name,
                slot.handle,
                if slot.started { "started" } else { "stopped" }
            );
            if let Some(ep) = &slot.endpoint {
                let _ = write!(out, ", cdev {}", ep.name());
            }
            out.push('\n');
        }
        if out.is_empty() {
            let _ = writeln!(out, "{}: no queue configured", self.name);
        }
        out
    }

    pub fn register_read(&self, bar: u8, addr: u32) -> Result<u32> {
        Ok(self.engine.register_read(self.handle, bar, addr)?)
    }

    pub fn register_write(&self, bar: u8, addr: u32, val: u32) -> Result<()> {
        Ok(self.engine.register_write(self.handle, bar, addr, val)?)
    }

    /// User and config BAR dump through the engine.
    pub fn register_dump(&self) -> Result<String> {
        let user = EngineBar {
            device: self,
            bar: self.conf.user_bar,
        };
        let config = EngineBar {
            device: self,
            bar: self.conf.config_bar,
        };
        let title = format!(
            "{}, pci {:02x}:{:02x}.{:02x}",
            self.name, self.conf.pci_bus, self.conf.pci_dev, self.conf.pci_func
        );
        regs::dump_device(&title, user.bar, &user, config.bar, &config)
    }

    fn create_endpoint(
        &self,
        region: &mut CdevRegion,
        conf: &QueueConfig,
        handle: QueueHandle,
    ) -> Result<Arc<Endpoint>> {
        let name = conf.name(&self.name);
        let minor = region.alloc().map_err(|e| {
            info!("{}: no char dev. left", name);
            e
        })?;
        let ep = Arc::new(Endpoint::new(
            name,
            region.major(),
            minor,
            conf.qidx,
            conf.dir,
            conf.mode,
            self.handle,
            handle,
            self.engine.clone(),
            self.pages.clone(),
        ));
        if let Err(e) = self.class.add_node(&ep) {
            region.free(minor);
            return Err(e);
        }
        Ok(ep)
    }

    fn destroy_endpoint(&self, region: &mut CdevRegion, ep: Arc<Endpoint>) {
        self.class.remove_node(ep.name());
        region.free(ep.minor());
        if Arc::strong_count(&ep) > 1 {
            debug!("{}: transfer still in flight", ep.name());
        }
    }

    /// Destroy every endpoint and mark the device gone. Hardware queues are
    /// left for the engine's close.
    fn teardown(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.detached = true;
        for slot in state.slots.iter_mut() {
            if let Some(ep) = mem::take(slot).endpoint {
                self.destroy_endpoint(&mut state.region, ep);
            }
        }
    }
}

struct EngineBar<'a> {
    device: &'a Device,
    bar: u8,
}

impl RegisterSpace for EngineBar<'_> {
    fn read32(&self, addr: u32) -> Result<u32> {
        self.device.register_read(self.bar, addr)
    }
}

/// Process-wide set of attached devices.
pub struct DriverRegistry {
    engine: Arc<dyn Engine>,
    pages: Arc<dyn PageSource>,
    class: Arc<DeviceClass>,
    vf: bool,
    devices: Mutex<BTreeMap<u32, Arc<Device>>>,
}

impl DriverRegistry {
    pub fn init(engine: Arc<dyn Engine>, pages: Arc<dyn PageSource>, vf: bool) -> Self {
        DriverRegistry {
            engine,
            pages,
            class: Arc::new(DeviceClass::default()),
            vf,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_vf(&self) -> bool {
        self.vf
    }

    pub fn class(&self) -> &DeviceClass {
        &self.class
    }

    /// Open a device on the engine and start tracking it.
    pub fn attach(&self, conf: &DeviceConfig) -> Result<Arc<Device>> {
        let mut conf = conf.clone();
        conf.vf = self.vf;
        let (handle, resolved) = self.engine.open(&conf.bdf(), &conf)?;

        let qmax = resolved.qsets_max;
        let mut slots = Vec::new();
        let reserved = slots.try_reserve_exact(2 * qmax as usize);
        if qmax == 0 || reserved.is_err() {
            if let Err(e) = self.engine.close(handle) {
                warn!("{}: close failed: {}", conf.bdf(), e);
            }
            return Err(if qmax == 0 {
                Error::invalid(format!("{}: no queue sets", conf.bdf()))
            } else {
                Error::OutOfMemory
            });
        }
        slots.resize_with(2 * qmax as usize, QueueSlot::default);

        let device = Arc::new(Device {
            name: resolved.name(),
            handle,
            qmax,
            engine: self.engine.clone(),
            pages: self.pages.clone(),
            class: self.class.clone(),
            state: Mutex::new(DeviceState {
                slots,
                region: self.class.alloc_region(),
                detached: false,
            }),
            conf: resolved,
        });

        let mut devices = self.devices.lock();
        if devices.contains_key(&device.idx()) {
            drop(devices);
            warn!("{}: index already attached", device.name);
            let _ = self.engine.close(handle);
            return Err(Error::invalid(format!("{} already attached", device.name)));
        }
        devices.insert(device.idx(), device.clone());
        info!(
            "{} {} attached, max QP {}",
            device.name,
            device.conf.bdf(),
            qmax
        );
        Ok(device)
    }

    /// Stop tracking a device, destroy its endpoints and close it.
    pub fn detach(&self, idx: u32) -> Result<()> {
        let device = self
            .devices
            .lock()
            .remove(&idx)
            .ok_or(Error::NoSuchDevice(idx))?;
        device.teardown();
        self.engine.close(device.handle)?;
        info!("{} detached", device.name);
        Ok(())
    }

    pub fn get(&self, idx: u32) -> Result<Arc<Device>> {
        self.devices
            .lock()
            .get(&idx)
            .cloned()
            .ok_or(Error::NoSuchDevice(idx))
    }

    /// Attached devices in index order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }

    /// `qdma<N>\t<bdf>\tmax QP: <n>` per device.
    pub fn list(&self) -> String {
        let mut out = String::new();
        for device in self.devices.lock().values() {
            let _ = writeln!(
                out,
                "{}\t{}\tmax QP: {}",
                device.name,
                device.conf.bdf(),
                device.qmax
            );
        }
        out
    }

    /// Detach everything.
    pub fn shutdown(&self) {
        let idxs: Vec<u32> = self.devices.lock().keys().copied().collect();
        for idx in idxs {
            if let Err(e) = self.detach(idx) {
                warn!("qdma{} detach: {}", idx, e);
            }
        }
    }
}

impl Drop for DriverRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
