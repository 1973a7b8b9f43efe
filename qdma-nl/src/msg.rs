//! Message framing

use log::warn;

use crate::attr::{decode_u32, nla_align, AttrType, AttrValue, Attrs, NLA_HDRLEN};
use crate::ctrl::{self, Family};
use crate::error::{Error, Result};
use crate::op::Op;
use crate::XNL_VERSION;

/// Fixed message header size.
pub const NLMSG_HDRLEN: usize = 16;
/// Generic header size: cmd, version and two reserved bytes.
pub const GENL_HDRLEN: usize = 4;
/// Message type of an error reply.
pub const NLMSG_ERROR: u16 = 0x2;
/// Set on every request.
pub const NLM_F_REQUEST: u16 = 0x1;

const ERRNO_LEN: usize = 4;

/// Fixed message header. Fields are host byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Total frame length, this header included
    pub len: u32,
    /// Family id, `GENL_ID_CTRL` or `NLMSG_ERROR`
    pub msg_type: u16,
    pub flags: u16,
    /// Request sequence number, echoed in the reply
    pub seq: u32,
    /// Sender port id
    pub pid: u32,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NLMSG_HDRLEN {
            return Err(Error::Truncated {
                need: NLMSG_HDRLEN,
                have: bytes.len(),
            });
        }
        let u32_at = |off: usize| {
            u32::from_ne_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        let header = Header {
            len: u32_at(0),
            msg_type: u16::from_ne_bytes([bytes[4], bytes[5]]),
            flags: u16::from_ne_bytes([bytes[6], bytes[7]]),
            seq: u32_at(8),
            pid: u32_at(12),
        };
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > bytes.len() {
            return Err(Error::BadLength(len));
        }
        Ok(header)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.len.to_ne_bytes());
        buf.extend_from_slice(&self.msg_type.to_ne_bytes());
        buf.extend_from_slice(&self.flags.to_ne_bytes());
        buf.extend_from_slice(&self.seq.to_ne_bytes());
        buf.extend_from_slice(&self.pid.to_ne_bytes());
    }
}

fn put_genl(buf: &mut Vec<u8>, cmd: u8, version: u8) {
    buf.extend_from_slice(&[cmd, version, 0, 0]);
}

fn patch_len(buf: &mut [u8]) {
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
}

/// A generic message whose command and attributes are not interpreted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage<'a> {
    pub header: Header,
    pub cmd: u8,
    pub version: u8,
    pub payload: &'a [u8],
}

impl<'a> RawMessage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = Header::parse(bytes)?;
        Self::parse_after(header, bytes, NLMSG_HDRLEN)
    }

    fn parse_after(header: Header, bytes: &'a [u8], off: usize) -> Result<Self> {
        let end = header.len as usize;
        if end < off + GENL_HDRLEN {
            return Err(Error::Truncated {
                need: off + GENL_HDRLEN,
                have: end,
            });
        }
        Ok(RawMessage {
            header,
            cmd: bytes[off],
            version: bytes[off + 1],
            payload: &bytes[off + GENL_HDRLEN..end],
        })
    }
}

/// Request or successful reply of the QDMA family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Resolved family id
    pub family: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub op: Op,
    pub version: u8,
    pub attrs: Attrs,
}

impl Message {
    pub fn request(family: u16, op: Op, attrs: Attrs) -> Self {
        Message {
            family,
            flags: NLM_F_REQUEST,
            seq: 0,
            pid: 0,
            op,
            version: XNL_VERSION,
            attrs,
        }
    }

    /// Reply carrying `attrs`, addressed back to the sender of `self`.
    pub fn reply(&self, attrs: Attrs) -> Self {
        Message {
            family: self.family,
            flags: 0,
            seq: self.seq,
            pid: self.pid,
            op: self.op,
            version: XNL_VERSION,
            attrs,
        }
    }

    pub fn encoded_len(&self) -> usize {
        NLMSG_HDRLEN + GENL_HDRLEN + self.attrs.encoded_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        Header {
            len: 0,
            msg_type: self.family,
            flags: self.flags,
            seq: self.seq,
            pid: self.pid,
        }
        .encode_into(&mut buf);
        put_genl(&mut buf, self.op as u8, self.version);
        self.attrs.encode_into(&mut buf);
        patch_len(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = RawMessage::parse(bytes)?;
        if raw.header.msg_type == NLMSG_ERROR || raw.header.msg_type == ctrl::GENL_ID_CTRL {
            return Err(Error::UnexpectedType(raw.header.msg_type));
        }
        Self::from_raw(&raw)
    }

    pub fn from_raw(raw: &RawMessage<'_>) -> Result<Self> {
        let op = Op::from_u8(raw.cmd).ok_or(Error::UnknownCommand(raw.cmd))?;
        let attrs = Attrs::decode(raw.payload)?;
        Ok(Message {
            family: raw.header.msg_type,
            flags: raw.header.flags,
            seq: raw.header.seq,
            pid: raw.header.pid,
            op,
            version: raw.version,
            attrs,
        })
    }

    /// Shorten the `GENMSG` text until the encoded frame fits `max_len`.
    ///
    /// Drops the text entirely when not even an empty string fits. Returns
    /// whether the frame fits afterwards.
    pub fn fit_to(&mut self, max_len: usize) -> bool {
        let len = self.encoded_len();
        if len <= max_len {
            return true;
        }
        let Some(AttrValue::Str(text)) = self.attrs.get(AttrType::GenMsg) else {
            warn!("{} reply of {} bytes exceeds {}", self.op.name(), len, max_len);
            return false;
        };

        let text_attr = nla_align(NLA_HDRLEN + text.len() + 1);
        let budget = (max_len + text_attr).saturating_sub(len) & !3;
        if budget < NLA_HDRLEN + 1 + 3 {
            self.attrs.remove(AttrType::GenMsg);
        } else {
            let mut keep = budget - NLA_HDRLEN - 1;
            while !text.is_char_boundary(keep) {
                keep -= 1;
            }
            let truncated = text[..keep].to_owned();
            self.attrs.set_str(AttrType::GenMsg, truncated);
        }
        self.encoded_len() <= max_len
    }
}

/// Error reply: an errno, and optionally the failing command with a short
/// diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub seq: u32,
    pub pid: u32,
    /// Positive errno
    pub errno: i32,
    pub cmd: u8,
    pub message: Option<String>,
}

impl ErrorReply {
    pub fn new(seq: u32, pid: u32, errno: i32) -> Self {
        ErrorReply {
            seq,
            pid,
            errno,
            cmd: 0,
            message: None,
        }
    }

    pub fn with_message(mut self, cmd: u8, message: impl Into<String>) -> Self {
        self.cmd = cmd;
        self.message = Some(message.into());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NLMSG_HDRLEN + ERRNO_LEN);
        Header {
            len: 0,
            msg_type: NLMSG_ERROR,
            flags: 0,
            seq: self.seq,
            pid: self.pid,
        }
        .encode_into(&mut buf);
        buf.extend_from_slice(&(-self.errno).to_ne_bytes());
        if let Some(message) = &self.message {
            put_genl(&mut buf, self.cmd, XNL_VERSION);
            Attrs::new()
                .with_str(AttrType::GenMsg, message.as_str())
                .encode_into(&mut buf);
        }
        patch_len(&mut buf);
        buf
    }

    fn decode_after(header: Header, bytes: &[u8]) -> Result<Self> {
        let end = header.len as usize;
        if end < NLMSG_HDRLEN + ERRNO_LEN {
            return Err(Error::Truncated {
                need: NLMSG_HDRLEN + ERRNO_LEN,
                have: end,
            });
        }
        let errno = decode_u32(0, &bytes[NLMSG_HDRLEN..NLMSG_HDRLEN + ERRNO_LEN])? as i32;
        let mut reply = ErrorReply::new(header.seq, header.pid, errno.wrapping_neg());
        if end > NLMSG_HDRLEN + ERRNO_LEN {
            let raw = RawMessage::parse_after(header, bytes, NLMSG_HDRLEN + ERRNO_LEN)?;
            let attrs = Attrs::decode(raw.payload)?;
            reply.cmd = raw.cmd;
            reply.message = attrs.str(AttrType::GenMsg).map(str::to_owned);
        }
        Ok(reply)
    }
}

/// Any frame a peer can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Message),
    Control(Family),
    Error(ErrorReply),
}

impl Frame {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = Header::parse(bytes)?;
        match header.msg_type {
            NLMSG_ERROR => ErrorReply::decode_after(header, bytes).map(Frame::Error),
            ctrl::GENL_ID_CTRL => {
                let raw = RawMessage::parse_after(header, bytes, NLMSG_HDRLEN)?;
                Family::from_raw(&raw).map(Frame::Control)
            }
            _ => {
                let raw = RawMessage::parse_after(header, bytes, NLMSG_HDRLEN)?;
                Message::from_raw(&raw).map(Frame::Message)
            }
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            Frame::Message(m) => m.seq,
            Frame::Control(c) => c.seq,
            Frame::Error(e) => e.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let msg = Message::request(0x20, Op::DevList, Attrs::new());
        let buf = msg.encode();
        assert_eq!(buf.len(), NLMSG_HDRLEN + GENL_HDRLEN);
        assert_eq!(u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]), 20);
        assert_eq!(u16::from_ne_bytes([buf[4], buf[5]]), 0x20);
        assert_eq!(buf[16], Op::DevList as u8);
        assert_eq!(buf[17], XNL_VERSION);
    }

    #[test]
    fn test_short_frame() {
        assert_eq!(
            Message::decode(&[0u8; 8]),
            Err(Error::Truncated { need: 16, have: 8 })
        );
    }

    #[test]
    fn test_length_beyond_buffer() {
        let mut buf = Message::request(0x20, Op::DevList, Attrs::new()).encode();
        buf[0..4].copy_from_slice(&100u32.to_ne_bytes());
        assert_eq!(Message::decode(&buf), Err(Error::BadLength(100)));
    }

    #[test]
    fn test_unknown_command() {
        let mut buf = Message::request(0x20, Op::DevList, Attrs::new()).encode();
        buf[16] = 42;
        assert_eq!(Message::decode(&buf), Err(Error::UnknownCommand(42)));
    }

    #[test]
    fn test_error_reply_without_text() {
        let reply = ErrorReply::new(9, 77, libc::ENODEV);
        let buf = reply.encode();
        assert_eq!(buf.len(), NLMSG_HDRLEN + ERRNO_LEN);
        assert_eq!(Frame::decode(&buf), Ok(Frame::Error(reply)));
    }

    #[test]
    fn test_error_reply_with_text() {
        let reply = ErrorReply::new(3, 1, libc::EINVAL).with_message(Op::QAdd as u8, "bad qidx");
        match Frame::decode(&reply.encode()) {
            Ok(Frame::Error(e)) => {
                assert_eq!(e.errno, libc::EINVAL);
                assert_eq!(e.message.as_deref(), Some("bad qidx"));
                assert_eq!(e.seq, 3);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_fit_to_truncates_text() {
        let request = Message::request(0x20, Op::QDump, Attrs::new());
        let mut reply = request.reply(Attrs::new().with_str(AttrType::GenMsg, "x".repeat(2000)));
        assert!(reply.fit_to(1024));
        assert!(reply.encode().len() <= 1024);
        let text = reply.attrs.str(AttrType::GenMsg).unwrap();
        assert!(text.len() > 900);
    }

    #[test]
    fn test_fit_to_leaves_short_reply() {
        let request = Message::request(0x20, Op::QAdd, Attrs::new());
        let mut reply = request.reply(Attrs::new().with_str(AttrType::GenMsg, "ok"));
        assert!(reply.fit_to(256));
        assert_eq!(reply.attrs.str(AttrType::GenMsg), Some("ok"));
    }
}
