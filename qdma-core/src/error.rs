//! Error types for queue, buffer and device operations

use core::fmt;

use qdma_nl::AttrType;

/// Core result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure reported by the DMA engine, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Positive errno
    pub errno: i32,
    /// Engine's own diagnostic
    pub message: String,
}

impl EngineError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        EngineError {
            errno,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(libc::ETIMEDOUT, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.errno == libc::ETIMEDOUT
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.errno)
    }
}

impl std::error::Error for EngineError {}

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad index, size or flag
    InvalidArgument(String),
    /// Allocation failed
    OutOfMemory,
    /// Page pinning failed outright (errno)
    PinFailed(i32),
    /// Fewer pages pinned than requested
    PartialPin { pinned: usize, requested: usize },
    /// Two consecutive page references alias (index of the second)
    DuplicatePage(usize),
    /// Queue index at or beyond the device's queue count
    IndexOutOfRange { qidx: u32, qmax: u32 },
    /// Slot has no hardware queue and no endpoint
    NotConfigured(u32),
    /// Slot already holds a hardware queue
    AlreadyConfigured(u32),
    /// Minor numbers exhausted
    NoSpace,
    /// No attached device with this index
    NoSuchDevice(u32),
    /// No character-device node with this name
    NoSuchNode(String),
    /// Malformed control message
    Protocol(qdma_nl::Error),
    /// Required attribute absent from a request
    MissingAttribute(AttrType),
    /// Hook not bound, or operation not provided by the endpoint
    NotSupported,
    /// Engine failure, timeouts included
    Engine(EngineError),
}

impl Error {
    /// Positive errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_)
            | Error::IndexOutOfRange { .. }
            | Error::NotConfigured(_)
            | Error::MissingAttribute(_)
            | Error::NotSupported => libc::EINVAL,
            Error::OutOfMemory => libc::ENOMEM,
            Error::PinFailed(errno) => *errno,
            Error::PartialPin { .. } | Error::DuplicatePage(_) => libc::EFAULT,
            Error::AlreadyConfigured(_) => libc::EEXIST,
            Error::NoSpace => libc::ENOSPC,
            Error::NoSuchDevice(_) => libc::ENODEV,
            Error::NoSuchNode(_) => libc::ENOENT,
            Error::Protocol(e) => e.errno(),
            Error::Engine(e) => e.errno,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::PinFailed(errno) => write!(f, "unable to pin user pages, {}", errno),
            Error::PartialPin { pinned, requested } => {
                write!(f, "pinned {} of {} user pages", pinned, requested)
            }
            Error::DuplicatePage(i) => write!(f, "duplicate pages, {}, {}", i - 1, i),
            Error::IndexOutOfRange { qidx, qmax } => {
                write!(f, "QID {} too big, {}", qidx, qmax)
            }
            Error::NotConfigured(qidx) => write!(f, "QID {} NOT configured", qidx),
            Error::AlreadyConfigured(qidx) => write!(f, "QID {} already configured", qidx),
            Error::NoSpace => write!(f, "no char dev. left"),
            Error::NoSuchDevice(idx) => write!(f, "NO match found with idx {}", idx),
            Error::NoSuchNode(name) => write!(f, "no device node {}", name),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::MissingAttribute(ty) => write!(f, "missing attribute {}", ty.name()),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::Engine(e) => write!(f, "{}", e.message),
        }
    }
}

impl std::error::Error for Error {}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        Error::Engine(e)
    }
}

impl From<qdma_nl::Error> for Error {
    fn from(e: qdma_nl::Error) -> Self {
        match e {
            qdma_nl::Error::MissingAttribute(ty) => Error::MissingAttribute(ty),
            other => Error::Protocol(other),
        }
    }
}
