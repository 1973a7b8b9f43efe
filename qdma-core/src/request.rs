//! Transfer requests

use std::fmt;
use std::time::Duration;

use qdma_nl::QueueFlags;

use crate::sg::SgEntry;

/// Bound on every synchronous character-device transfer.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transfer direction, named from the host's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to card
    H2C,
    /// Card to host
    C2H,
}

impl Direction {
    pub fn from_flags(flags: QueueFlags) -> Self {
        if flags.is_c2h() {
            Direction::C2H
        } else {
            Direction::H2C
        }
    }

    pub fn from_c2h(c2h: bool) -> Self {
        if c2h {
            Direction::C2H
        } else {
            Direction::H2C
        }
    }

    /// Device writes into host memory.
    pub fn writes_host(self) -> bool {
        self == Direction::C2H
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::H2C => "H2C",
            Direction::C2H => "C2H",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One synchronous transfer handed to the engine.
///
/// Borrows the scatter-gather list of a live mapping, so it cannot outlive
/// the pins it describes.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub dir: Direction,
    /// Card-side address (MM) or 0 (ST)
    pub ep_addr: u64,
    /// Bytes to move
    pub count: usize,
    pub timeout: Duration,
    pub sgl: &'a [SgEntry],
}

impl<'a> TransferRequest<'a> {
    pub fn new(dir: Direction, ep_addr: u64, sgl: &'a [SgEntry]) -> Self {
        TransferRequest {
            dir,
            ep_addr,
            count: sgl.iter().map(|e| e.len).sum(),
            timeout: SUBMIT_TIMEOUT,
            sgl,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Host to card.
    pub fn is_write(&self) -> bool {
        self.dir == Direction::H2C
    }
}
