//! DMA engine interface
//!
//! Everything below queue bookkeeping (descriptor rings, completion polling,
//! interrupts, register-level control) belongs to the engine. The core only
//! reaches it through [`Engine`], a narrow synchronous interface.

use std::fmt;

use qdma_nl::{QueueFlags, WrbDescSize};

use crate::error::{EngineError, Error, Result};
use crate::request::{Direction, TransferRequest};

pub type EngineResult<T> = core::result::Result<T, EngineError>;

/// Opaque device handle returned by [`Engine::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque hardware queue handle returned by [`Engine::queue_add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueHandle(pub u64);

impl QueueHandle {
    /// Handle of a slot with no hardware queue.
    pub const INVALID: QueueHandle = QueueHandle(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for QueueHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::LowerHex for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Memory mapped or streaming queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMode {
    MemoryMapped,
    Streaming,
}

impl QueueMode {
    pub fn name(self) -> &'static str {
        match self {
            QueueMode::MemoryMapped => "MM",
            QueueMode::Streaming => "ST",
        }
    }
}

/// Per-device configuration, as requested at open and as resolved by the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device index, assigned by the engine
    pub idx: u32,
    pub pci_bus: u8,
    pub pci_dev: u8,
    pub pci_func: u8,
    /// BAR holding the DMA configuration registers
    pub config_bar: u8,
    /// BAR holding user logic registers
    pub user_bar: u8,
    /// Queue sets the device may use
    pub qsets_max: u32,
    /// Virtual function
    pub vf: bool,
    /// Poll for completions instead of taking interrupts
    pub poll_mode: bool,
    pub indirect_interrupts: bool,
    /// Enable C2H descriptor prefetch
    pub prefetch: bool,
    /// Card memory behind MM queues
    pub card_mem_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            idx: 0,
            pci_bus: 0,
            pci_dev: 0,
            pci_func: 0,
            config_bar: 0,
            user_bar: 2,
            qsets_max: 64,
            vf: false,
            poll_mode: false,
            indirect_interrupts: false,
            prefetch: false,
            card_mem_size: 1 << 20,
        }
    }
}

impl DeviceConfig {
    /// Device name as shown to administrators: `qdma<N>` or `qdmavf<N>`.
    pub fn name(&self) -> String {
        if self.vf {
            format!("qdmavf{}", self.idx)
        } else {
            format!("qdma{}", self.idx)
        }
    }

    /// PCI location, `0000:BB:DD.F`.
    pub fn bdf(&self) -> String {
        format!(
            "0000:{:02x}:{:02x}.{:x}",
            self.pci_bus, self.pci_dev, self.pci_func
        )
    }
}

/// Hardware queue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub qidx: u32,
    pub mode: QueueMode,
    pub dir: Direction,
    /// Ring size; 0 selects the engine default
    pub ring_size: u32,
    /// C2H buffer size; 0 selects the engine default
    pub buf_size: u32,
    pub wrb_desc_size: Option<WrbDescSize>,
    /// Character device requested; one is created either way
    pub cdev: bool,
}

impl QueueConfig {
    pub fn new(qidx: u32, mode: QueueMode, dir: Direction) -> Self {
        QueueConfig {
            qidx,
            mode,
            dir,
            ring_size: 0,
            buf_size: 0,
            wrb_desc_size: None,
            cdev: true,
        }
    }

    /// Build from wire flags; exactly one mode and one direction must be set.
    pub fn from_flags(qidx: u32, flags: QueueFlags) -> Result<Self> {
        let mode = match (
            flags.contains(QueueFlags::MODE_MM),
            flags.contains(QueueFlags::MODE_ST),
        ) {
            (true, false) => QueueMode::MemoryMapped,
            (false, true) => QueueMode::Streaming,
            _ => return Err(Error::invalid(format!("qflag {:#x}: mode", flags.bits()))),
        };
        let dir = match (
            flags.contains(QueueFlags::DIR_H2C),
            flags.contains(QueueFlags::DIR_C2H),
        ) {
            (true, false) => Direction::H2C,
            (false, true) => Direction::C2H,
            _ => return Err(Error::invalid(format!("qflag {:#x}: dir", flags.bits()))),
        };
        let mut conf = Self::new(qidx, mode, dir);
        conf.cdev = flags.contains(QueueFlags::CDEV);
        Ok(conf)
    }

    /// Queue name, also the name of its character-device node.
    pub fn name(&self, dev_name: &str) -> String {
        format!(
            "{}-{}-{}-{}",
            dev_name,
            self.mode.name(),
            self.dir.name(),
            self.qidx
        )
    }
}

/// The DMA engine collaborator.
///
/// Every call is synchronous. `submit` blocks for at most the request's
/// timeout and reports expiry as [`EngineError::timeout`].
pub trait Engine: Send + Sync {
    /// Open a device; the engine assigns the index and resolves the rest of
    /// the configuration.
    fn open(&self, name: &str, conf: &DeviceConfig) -> EngineResult<(DeviceHandle, DeviceConfig)>;

    /// Close a device, releasing any hardware queue still allocated on it.
    fn close(&self, dev: DeviceHandle) -> EngineResult<()>;

    fn get_config(&self, dev: DeviceHandle) -> EngineResult<DeviceConfig>;

    fn queue_add(&self, dev: DeviceHandle, conf: &QueueConfig) -> EngineResult<QueueHandle>;

    fn queue_start(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<()>;

    fn queue_stop(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<()>;

    fn queue_remove(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<()>;

    /// Text dump of the queue's state.
    fn queue_dump(&self, dev: DeviceHandle, q: QueueHandle) -> EngineResult<String>;

    /// Text dump of descriptor ring entries `start..=end`.
    fn queue_dump_desc(
        &self,
        dev: DeviceHandle,
        q: QueueHandle,
        start: u32,
        end: u32,
    ) -> EngineResult<String>;

    /// Text dump of write-back ring entries `start..=end`.
    fn queue_dump_wrb(
        &self,
        dev: DeviceHandle,
        q: QueueHandle,
        start: u32,
        end: u32,
    ) -> EngineResult<String>;

    /// Run one transfer; returns bytes moved.
    fn submit(
        &self,
        dev: DeviceHandle,
        q: QueueHandle,
        req: &TransferRequest<'_>,
    ) -> EngineResult<usize>;

    fn register_read(&self, dev: DeviceHandle, bar: u8, addr: u32) -> EngineResult<u32>;

    fn register_write(&self, dev: DeviceHandle, bar: u8, addr: u32, val: u32) -> EngineResult<()>;
}
