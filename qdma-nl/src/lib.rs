//! QDMA control protocol
//!
//! Administrative messages are framed the way generic netlink frames them: a
//! fixed message header, a generic header carrying the command opcode and
//! protocol version, then a stream of 4-byte aligned `{len, type, payload}`
//! attributes.
//!
//! ```text
//! 0        4      6      8        12       16   17   18       20
//! ┌────────┬──────┬──────┬────────┬────────┬────┬────┬────────┬──────────────
//! │  len   │ type │flags │  seq   │  pid   │cmd │ver │  rsvd  │ attributes...
//! └────────┴──────┴──────┴────────┴────────┴────┴────┴────────┴──────────────
//! ```
//!
//! `type` is the routing key: the family id resolved once through the
//! generic controller (see [`ctrl`]), or `NLMSG_ERROR` on error replies.

pub mod attr;
pub mod ctrl;
pub mod error;
pub mod msg;
pub mod op;

pub use attr::{AttrType, AttrValue, Attrs, ATTR_MAX};
pub use error::{Error, Result};
pub use msg::{ErrorReply, Frame, Header, Message, RawMessage};
pub use op::{Op, QueueFlags, WrbDescSize, OP_MAX};

/// Family name served by a physical-function driver instance.
pub const XNL_NAME_PF: &str = "xnl_pf";
/// Family name served by a virtual-function driver instance.
pub const XNL_NAME_VF: &str = "xnl_vf";
/// Protocol version carried in every generic header.
pub const XNL_VERSION: u8 = 0x1;

/// Receive buffer for point commands.
pub const XNL_RESP_BUFLEN_MIN: usize = 256;
/// Receive buffer for list and dump commands.
pub const XNL_RESP_BUFLEN_MAX: usize = 1024;
/// Longest diagnostic a handler is expected to produce.
pub const XNL_ERR_BUFLEN: usize = 64;

/// Queue index placeholder used before `idx` has been parsed.
pub const XNL_QIDX_INVALID: u32 = 0xFFFF;

/// Family name for a driver instance.
pub fn family_name(vf: bool) -> &'static str {
    if vf {
        XNL_NAME_VF
    } else {
        XNL_NAME_PF
    }
}
