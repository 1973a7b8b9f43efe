//! Family discovery through the generic controller
//!
//! Clients never hard-code the family id. They send `CTRL_CMD_GETFAMILY`
//! with the family name to [`GENL_ID_CTRL`] and read `CTRL_ATTR_FAMILY_ID`
//! from the reply.

use crate::attr::{decode_str, put_attr, put_str_attr, RawAttrs};
use crate::error::{Error, Result};
use crate::msg::{Header, RawMessage, NLM_F_REQUEST};

/// Fixed id of the generic controller.
pub const GENL_ID_CTRL: u16 = 0x10;

pub const CTRL_CMD_NEWFAMILY: u8 = 1;
pub const CTRL_CMD_GETFAMILY: u8 = 3;

pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const CTRL_VERSION: u8 = 1;

/// A controller request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    pub cmd: u8,
    pub seq: u32,
    pub pid: u32,
    pub name: Option<String>,
    pub id: Option<u16>,
}

impl Family {
    /// Resolve `name` to its id.
    pub fn lookup(name: &str) -> Self {
        Family {
            cmd: CTRL_CMD_GETFAMILY,
            seq: 0,
            pid: 0,
            name: Some(name.to_owned()),
            id: None,
        }
    }

    /// Answer a lookup with the family id.
    pub fn reply(&self, id: u16) -> Self {
        Family {
            cmd: CTRL_CMD_NEWFAMILY,
            seq: self.seq,
            pid: self.pid,
            name: self.name.clone(),
            id: Some(id),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        Header {
            len: 0,
            msg_type: GENL_ID_CTRL,
            flags: if self.cmd == CTRL_CMD_GETFAMILY {
                NLM_F_REQUEST
            } else {
                0
            },
            seq: self.seq,
            pid: self.pid,
        }
        .encode_into(&mut buf);
        buf.extend_from_slice(&[self.cmd, CTRL_VERSION, 0, 0]);
        if let Some(name) = &self.name {
            put_str_attr(&mut buf, CTRL_ATTR_FAMILY_NAME, name);
        }
        if let Some(id) = self.id {
            put_attr(&mut buf, CTRL_ATTR_FAMILY_ID, &id.to_ne_bytes());
        }
        let len = buf.len() as u32;
        buf[0..4].copy_from_slice(&len.to_ne_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = RawMessage::parse(bytes)?;
        if raw.header.msg_type != GENL_ID_CTRL {
            return Err(Error::UnexpectedType(raw.header.msg_type));
        }
        Self::from_raw(&raw)
    }

    /// Controller attributes outside id and name are skipped.
    pub fn from_raw(raw: &RawMessage<'_>) -> Result<Self> {
        let mut family = Family {
            cmd: raw.cmd,
            seq: raw.header.seq,
            pid: raw.header.pid,
            name: None,
            id: None,
        };
        for attr in RawAttrs::new(raw.payload) {
            let (ty, payload) = attr?;
            match ty {
                CTRL_ATTR_FAMILY_ID => {
                    let bytes: [u8; 2] = payload
                        .get(..2)
                        .and_then(|b| b.try_into().ok())
                        .ok_or(Error::BadPayload(ty))?;
                    family.id = Some(u16::from_ne_bytes(bytes));
                }
                CTRL_ATTR_FAMILY_NAME => family.name = Some(decode_str(ty, payload)?),
                _ => {}
            }
        }
        Ok(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_reply() {
        let mut lookup = Family::lookup("xnl_pf");
        lookup.seq = 11;
        let decoded = Family::decode(&lookup.encode()).unwrap();
        assert_eq!(decoded.cmd, CTRL_CMD_GETFAMILY);
        assert_eq!(decoded.name.as_deref(), Some("xnl_pf"));
        assert_eq!(decoded.id, None);

        let reply = Family::decode(&decoded.reply(0x21).encode()).unwrap();
        assert_eq!(reply.cmd, CTRL_CMD_NEWFAMILY);
        assert_eq!(reply.id, Some(0x21));
        assert_eq!(reply.seq, 11);
    }

    #[test]
    fn test_short_family_id() {
        let mut buf = Family::lookup("xnl_vf").encode();
        let mut attr = Vec::new();
        put_attr(&mut attr, CTRL_ATTR_FAMILY_ID, &[7]);
        buf.extend_from_slice(&attr);
        let len = buf.len() as u32;
        buf[0..4].copy_from_slice(&len.to_ne_bytes());
        assert_eq!(
            Family::decode(&buf),
            Err(Error::BadPayload(CTRL_ATTR_FAMILY_ID))
        );
    }
}
