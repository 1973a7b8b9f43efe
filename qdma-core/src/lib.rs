//! QDMA driver glue
//!
//! Everything between an administrator (or an application doing file I/O)
//! and the DMA engine that drives the hardware queues:
//!
//! ```text
//!   control socket            file I/O on qdma<N>-<MODE>-<DIR>-<Q>
//!         │                                  │
//! ┌───────▼────────┐                 ┌───────▼────────┐
//! │ ControlServer  │                 │   CdevFile     │
//! └───────┬────────┘                 └───────┬────────┘
//!         │                                  │ BufferMapper -> TransferRequest
//! ┌───────▼──────────────────────────────────▼────────┐
//! │ DriverRegistry -> Device -> queue slots            │
//! └───────────────────────┬───────────────────────────┘
//!                         │
//!                 ┌───────▼────────┐
//!                 │  dyn Engine    │
//!                 └────────────────┘
//! ```
//!
//! The engine itself is behind the [`Engine`] trait; [`SoftEngine`] is a
//! software model of it with card memory and streaming packet queues.

pub mod cdev;
pub mod control;
pub mod engine;
pub mod error;
pub mod page;
pub mod registry;
pub mod regs;
pub mod request;
pub mod sg;
pub mod soft_engine;

pub use cdev::{CdevFile, CdevOps, DeviceClass, Endpoint};
pub use control::ControlServer;
pub use engine::{
    DeviceConfig, DeviceHandle, Engine, EngineResult, QueueConfig, QueueHandle, QueueMode,
};
pub use error::{EngineError, Error, Result};
pub use page::{HostPages, LockedPages, PageRef, PageSource};
pub use registry::{Device, DriverRegistry, SlotInfo};
pub use request::{Direction, TransferRequest, SUBMIT_TIMEOUT};
pub use sg::{BufferMapper, SgEntry};
pub use soft_engine::SoftEngine;
