//! Decode errors

use core::fmt;

use crate::attr::AttrType;

/// Protocol result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Malformed or incomplete control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes than the fixed headers need
    Truncated { need: usize, have: usize },
    /// Length field disagrees with the buffer
    BadLength(usize),
    /// Attribute type outside the known range
    UnknownAttribute(u16),
    /// Attribute payload has the wrong size or encoding
    BadPayload(u16),
    /// Opcode outside the known range
    UnknownCommand(u8),
    /// Message type is not what the caller expected
    UnexpectedType(u16),
    /// Required attribute absent
    MissingAttribute(AttrType),
}

impl Error {
    /// Errno returned to a peer when its request does not decode.
    pub fn errno(&self) -> i32 {
        match self {
            Error::UnknownCommand(_) => libc::EOPNOTSUPP,
            _ => libc::EINVAL,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Truncated { need, have } => {
                write!(f, "message truncated: need {} bytes, have {}", need, have)
            }
            Error::BadLength(len) => write!(f, "bad length {}", len),
            Error::UnknownAttribute(ty) => write!(f, "unknown attribute type {}", ty),
            Error::BadPayload(ty) => write!(f, "bad payload for attribute {}", ty),
            Error::UnknownCommand(cmd) => write!(f, "unknown command {}", cmd),
            Error::UnexpectedType(ty) => write!(f, "unexpected message type {:#x}", ty),
            Error::MissingAttribute(ty) => write!(f, "missing attribute {}", ty.name()),
        }
    }
}

impl std::error::Error for Error {}
