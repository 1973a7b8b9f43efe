//! Typed attributes
//!
//! Every attribute is `{len: u16, type: u16}` followed by its payload, padded
//! to a 4-byte boundary. `len` counts the 4-byte attribute header and the
//! payload but not the padding.

use crate::error::{Error, Result};

/// Attribute header size.
pub const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;

/// Number of defined attribute types; anything at or above is rejected.
pub const ATTR_MAX: u16 = 19;

pub(crate) const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Attribute identifiers. The numbering is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum AttrType {
    /// Free-form text: diagnostics, listings, dumps
    GenMsg = 0,
    DrvInfo,
    DevIdx,
    PciBus,
    PciDev,
    PciFunc,
    DevCfgBar,
    DevUsrBar,
    DevQsetMax,
    RegBarNum,
    RegAddr,
    RegVal,
    QIdx,
    QFlag,
    QRngSz,
    QBufSz,
    WrbDescSize,
    RangeStart,
    RangeEnd,
}

impl AttrType {
    pub const ALL: [AttrType; ATTR_MAX as usize] = [
        AttrType::GenMsg,
        AttrType::DrvInfo,
        AttrType::DevIdx,
        AttrType::PciBus,
        AttrType::PciDev,
        AttrType::PciFunc,
        AttrType::DevCfgBar,
        AttrType::DevUsrBar,
        AttrType::DevQsetMax,
        AttrType::RegBarNum,
        AttrType::RegAddr,
        AttrType::RegVal,
        AttrType::QIdx,
        AttrType::QFlag,
        AttrType::QRngSz,
        AttrType::QBufSz,
        AttrType::WrbDescSize,
        AttrType::RangeStart,
        AttrType::RangeEnd,
    ];

    pub fn from_u16(ty: u16) -> Option<Self> {
        Self::ALL.get(ty as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            AttrType::GenMsg => "GENMSG",
            AttrType::DrvInfo => "DRV_INFO",
            AttrType::DevIdx => "DEV_IDX",
            AttrType::PciBus => "PCI_BUS",
            AttrType::PciDev => "PCI_DEV",
            AttrType::PciFunc => "PCI_FUNC",
            AttrType::DevCfgBar => "DEV_CFG_BAR",
            AttrType::DevUsrBar => "DEV_USR_BAR",
            AttrType::DevQsetMax => "DEV_QSET_MAX",
            AttrType::RegBarNum => "REG_BAR_NUM",
            AttrType::RegAddr => "REG_ADDR",
            AttrType::RegVal => "REG_VAL",
            AttrType::QIdx => "QIDX",
            AttrType::QFlag => "QFLAG",
            AttrType::QRngSz => "QRNGSZ",
            AttrType::QBufSz => "QBUFSZ",
            AttrType::WrbDescSize => "WRB_DESC_SIZE",
            AttrType::RangeStart => "RANGE_START",
            AttrType::RangeEnd => "RANGE_END",
        }
    }

    /// Text attributes carry a NUL-terminated string, the rest a `u32`.
    pub fn is_string(self) -> bool {
        matches!(self, AttrType::GenMsg | AttrType::DrvInfo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    U32(u32),
    Str(String),
}

impl AttrValue {
    fn payload_len(&self) -> usize {
        match self {
            AttrValue::U32(_) => 4,
            AttrValue::Str(s) => s.len() + 1,
        }
    }
}

/// Attribute set of one message, kept in insertion order.
///
/// Each type appears at most once; setting a type again replaces the value,
/// which is also how a repeated attribute on the wire decodes (last wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs {
    entries: Vec<(AttrType, AttrValue)>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, ty: AttrType, value: AttrValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(t, _)| *t == ty) {
            slot.1 = value;
        } else {
            self.entries.push((ty, value));
        }
    }

    pub fn set_u32(&mut self, ty: AttrType, value: u32) {
        self.set(ty, AttrValue::U32(value));
    }

    pub fn set_str(&mut self, ty: AttrType, value: impl Into<String>) {
        self.set(ty, AttrValue::Str(value.into()));
    }

    /// Builder form of [`Attrs::set_u32`].
    pub fn with_u32(mut self, ty: AttrType, value: u32) -> Self {
        self.set_u32(ty, value);
        self
    }

    /// Builder form of [`Attrs::set_str`].
    pub fn with_str(mut self, ty: AttrType, value: impl Into<String>) -> Self {
        self.set_str(ty, value);
        self
    }

    pub fn remove(&mut self, ty: AttrType) -> Option<AttrValue> {
        let pos = self.entries.iter().position(|(t, _)| *t == ty)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn get(&self, ty: AttrType) -> Option<&AttrValue> {
        self.entries.iter().find(|(t, _)| *t == ty).map(|(_, v)| v)
    }

    pub fn contains(&self, ty: AttrType) -> bool {
        self.get(ty).is_some()
    }

    pub fn u32(&self, ty: AttrType) -> Option<u32> {
        match self.get(ty)? {
            AttrValue::U32(v) => Some(*v),
            AttrValue::Str(_) => None,
        }
    }

    pub fn str(&self, ty: AttrType) -> Option<&str> {
        match self.get(ty)? {
            AttrValue::Str(s) => Some(s),
            AttrValue::U32(_) => None,
        }
    }

    pub fn require_u32(&self, ty: AttrType) -> Result<u32> {
        self.u32(ty).ok_or(Error::MissingAttribute(ty))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttrType, &AttrValue)> {
        self.entries.iter().map(|(t, v)| (*t, v))
    }

    /// Bytes this set occupies on the wire, padding included.
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, v)| nla_align(NLA_HDRLEN + v.payload_len()))
            .sum()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for (ty, value) in &self.entries {
            match value {
                AttrValue::U32(v) => put_attr(buf, *ty as u16, &v.to_ne_bytes()),
                AttrValue::Str(s) => put_str_attr(buf, *ty as u16, s),
            }
        }
    }

    /// Strict decode: an attribute type outside the table fails the whole
    /// stream, and nothing decoded before it is returned.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut attrs = Attrs::new();
        for raw in RawAttrs::new(bytes) {
            let (ty, payload) = raw?;
            let attr = AttrType::from_u16(ty).ok_or(Error::UnknownAttribute(ty))?;
            let value = if attr.is_string() {
                AttrValue::Str(decode_str(ty, payload)?)
            } else {
                AttrValue::U32(decode_u32(ty, payload)?)
            };
            attrs.set(attr, value);
        }
        Ok(attrs)
    }
}

/// Append one attribute with a raw payload.
pub fn put_attr(buf: &mut Vec<u8>, ty: u16, payload: &[u8]) {
    let len = NLA_HDRLEN + payload.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&ty.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(buf.len() + nla_align(len) - len, 0);
}

/// Append a NUL-terminated string attribute.
pub fn put_str_attr(buf: &mut Vec<u8>, ty: u16, s: &str) {
    let mut payload = Vec::with_capacity(s.len() + 1);
    payload.extend_from_slice(s.as_bytes());
    payload.push(0);
    put_attr(buf, ty, &payload);
}

pub(crate) fn decode_u32(ty: u16, payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| Error::BadPayload(ty))?;
    Ok(u32::from_ne_bytes(bytes))
}

pub(crate) fn decode_str(ty: u16, payload: &[u8]) -> Result<String> {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    core::str::from_utf8(&payload[..end])
        .map(str::to_owned)
        .map_err(|_| Error::BadPayload(ty))
}

/// Iterator over `(type, payload)` pairs of an attribute stream, without
/// interpreting the type.
pub struct RawAttrs<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> RawAttrs<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            rest: bytes,
            failed: false,
        }
    }
}

impl<'a> Iterator for RawAttrs<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < NLA_HDRLEN {
            self.failed = true;
            return Some(Err(Error::Truncated {
                need: NLA_HDRLEN,
                have: self.rest.len(),
            }));
        }

        let len = u16::from_ne_bytes([self.rest[0], self.rest[1]]) as usize;
        let ty = u16::from_ne_bytes([self.rest[2], self.rest[3]]);
        if len < NLA_HDRLEN || len > self.rest.len() {
            self.failed = true;
            return Some(Err(Error::BadLength(len)));
        }

        let payload = &self.rest[NLA_HDRLEN..len];
        let advance = nla_align(len).min(self.rest.len());
        self.rest = &self.rest[advance..];
        Some(Ok((ty, payload)))
    }
}
