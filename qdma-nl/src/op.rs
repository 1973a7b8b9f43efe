//! Command opcodes and queue flags

use bitflags::bitflags;

use crate::attr::AttrType;
use crate::{XNL_RESP_BUFLEN_MAX, XNL_RESP_BUFLEN_MIN};

/// Number of defined opcodes; anything at or above is rejected.
pub const OP_MAX: u8 = 13;

/// Administrative command. The numbering is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    DevList = 0,
    DevInfo,
    RegDump,
    RegRead,
    RegWrite,
    QList,
    QAdd,
    QStart,
    QStop,
    QDel,
    QDump,
    QDesc,
    QWrb,
}

impl Op {
    pub const ALL: [Op; OP_MAX as usize] = [
        Op::DevList,
        Op::DevInfo,
        Op::RegDump,
        Op::RegRead,
        Op::RegWrite,
        Op::QList,
        Op::QAdd,
        Op::QStart,
        Op::QStop,
        Op::QDel,
        Op::QDump,
        Op::QDesc,
        Op::QWrb,
    ];

    pub fn from_u8(cmd: u8) -> Option<Self> {
        Self::ALL.get(cmd as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::DevList => "DEV_LIST",
            Op::DevInfo => "DEV_INFO",
            Op::RegDump => "REG_DUMP",
            Op::RegRead => "REG_RD",
            Op::RegWrite => "REG_WRT",
            Op::QList => "Q_LIST",
            Op::QAdd => "Q_ADD",
            Op::QStart => "Q_START",
            Op::QStop => "Q_STOP",
            Op::QDel => "Q_DEL",
            Op::QDump => "Q_DUMP",
            Op::QDesc => "Q_DESC",
            Op::QWrb => "Q_WRB",
        }
    }

    /// Receive buffer a client allocates for the reply.
    ///
    /// Listing and dump replies carry a text block and get the large tier.
    pub fn response_buflen(self) -> usize {
        match self {
            Op::DevList | Op::QList | Op::QDump | Op::QDesc | Op::QWrb | Op::RegDump => {
                XNL_RESP_BUFLEN_MAX
            }
            _ => XNL_RESP_BUFLEN_MIN,
        }
    }

    /// Attributes a request must carry before a handler runs.
    pub fn required_attrs(self) -> &'static [AttrType] {
        use AttrType::*;
        match self {
            Op::DevList => &[],
            Op::DevInfo | Op::RegDump | Op::QList => &[DevIdx],
            Op::RegRead => &[DevIdx, RegAddr],
            Op::RegWrite => &[DevIdx, RegAddr, RegVal],
            Op::QAdd | Op::QStart | Op::QStop | Op::QDel | Op::QDump => {
                &[DevIdx, QIdx, QFlag]
            }
            Op::QDesc | Op::QWrb => &[DevIdx, QIdx, QFlag, RangeStart, RangeEnd],
        }
    }
}

bitflags! {
    /// Queue selector flags carried in `QFLAG`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        /// Streaming
        const MODE_ST = 0x1;
        /// Memory mapped
        const MODE_MM = 0x2;
        /// Host to card
        const DIR_H2C = 0x4;
        /// Card to host
        const DIR_C2H = 0x8;
        /// Expose a character device for the queue
        const CDEV = 0x10;
    }
}

impl QueueFlags {
    pub fn is_st(self) -> bool {
        self.contains(QueueFlags::MODE_ST)
    }

    pub fn is_c2h(self) -> bool {
        self.contains(QueueFlags::DIR_C2H)
    }
}

/// Completion (write-back) descriptor size for streaming C2H queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WrbDescSize {
    Bytes8 = 0,
    Bytes16 = 1,
    Bytes32 = 2,
    Reserved = 3,
}

impl WrbDescSize {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(WrbDescSize::Bytes8),
            1 => Some(WrbDescSize::Bytes16),
            2 => Some(WrbDescSize::Bytes32),
            3 => Some(WrbDescSize::Reserved),
            _ => None,
        }
    }
}
